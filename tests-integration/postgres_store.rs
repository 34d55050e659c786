//! Services against a real PostgreSQL catalog.
//!
//! Requires `TEST_DATABASE_URL` or `VARIANTGUARD_TESTCONTAINERS=1`;
//! otherwise every test returns early.

use rust_decimal::Decimal;
use serde_json::json;
use variantguard::config::{LockingConfig, VariantguardConfig};
use variantguard::executor::SqlExecutor;
use variantguard::lock::{acquire_scoped, external_id_key, ExternalIdLocks, LockPolicy};
use variantguard::metrics::LockCounters;
use variantguard::model::{ExternalIdentity, NewVariant, VariantAttributes, VariantChanges, VariantStatus};
use variantguard::store::{with_savepoint, CatalogStore, PgCatalogStore, StoreError};
use variantguard::{
    Action, AdminMappingService, BulkMutationService, ConflictKind, ExternalFeedSyncCoordinator, FeedItem,
    ProductArchiver, VariantError, VariantIdentityResolver, VariantOptionsUpdater,
};
use variantguard_integration_tests::TestDatabase;
use std::sync::Arc;

fn attrs(sku: &str) -> VariantAttributes {
    VariantAttributes {
        sku: Some(sku.to_string()),
        price: Some(Decimal::new(1999, 2)),
        stock: Some(3),
        ..Default::default()
    }
}

#[test]
fn test_resolve_created_linked_and_reordered() {
    let Some(db) = TestDatabase::start() else { return };
    let executor = db.executor();
    let tee = db.seed_tee(&executor);
    let mut store = PgCatalogStore::autocommit(&executor);
    let resolver = VariantIdentityResolver::default();

    let created = resolver
        .resolve(&mut store, tee.product, vec![tee.red, tee.medium], &attrs("TEE-RED-M"))
        .unwrap();
    assert_eq!(created.action, Action::Created);
    let linked = resolver
        .resolve(&mut store, tee.product, vec![tee.medium, tee.red], &attrs("TEE-RED-M"))
        .unwrap();
    assert_eq!(linked.action, Action::Linked);
    assert_eq!(linked.entity.unwrap().id, created.entity.unwrap().id);
    assert!(!store.in_transaction());

    let invalid = resolver
        .resolve(&mut store, tee.product, vec![tee.red, tee.blue], &attrs("TEE-X"))
        .unwrap();
    assert_eq!(invalid.action, Action::Invalid);
}

#[test]
fn test_reactivation_restores_the_same_row() {
    let Some(db) = TestDatabase::start() else { return };
    let executor = db.executor();
    let tee = db.seed_tee(&executor);
    let mut store = PgCatalogStore::autocommit(&executor);
    let resolver = VariantIdentityResolver::default();

    let variant = resolver
        .resolve(&mut store, tee.product, vec![tee.blue], &attrs("TEE-BLUE"))
        .unwrap()
        .entity
        .unwrap();
    store
        .update_variant(
            variant.id,
            &VariantChanges {
                status: Some(VariantStatus::Inactive),
                ..Default::default()
            },
        )
        .unwrap();

    let result = resolver
        .resolve(&mut store, tee.product, vec![tee.blue], &VariantAttributes::default())
        .unwrap();
    assert_eq!(result.action, Action::Reactivated);
    assert_eq!(result.entity.unwrap().id, variant.id);
    assert_eq!(
        db.count(&executor, "SELECT COUNT(*) FROM variants WHERE product_id = $1", &[&tee.product]),
        1
    );
}

#[test]
fn test_conflict_does_not_abort_outer_transaction() {
    let Some(db) = TestDatabase::start() else { return };
    let executor = db.executor();
    let tee = db.seed_tee(&executor);
    let resolver = VariantIdentityResolver::default();

    let mut outer = executor.begin().unwrap();
    {
        let mut store = PgCatalogStore::within(&mut outer);
        let first = resolver
            .resolve(&mut store, tee.product, vec![tee.red], &attrs("TEE"))
            .unwrap();
        assert_eq!(first.action, Action::Created);

        let clash = resolver
            .resolve(&mut store, tee.product, vec![tee.blue], &attrs("TEE"))
            .unwrap();
        assert_eq!(clash.action, Action::Conflict);
        assert_eq!(clash.error.as_deref(), Some(ConflictKind::DuplicateSku.message()));

        let after = resolver
            .resolve(&mut store, tee.product, vec![tee.blue], &attrs("TEE-BLUE"))
            .unwrap();
        assert_eq!(after.action, Action::Created);
    }
    outer.commit().unwrap();

    assert_eq!(
        db.count(&executor, "SELECT COUNT(*) FROM variants WHERE product_id = $1", &[&tee.product]),
        2
    );
}

#[test]
fn test_constraint_violations_carry_constraint_names() {
    let Some(db) = TestDatabase::start() else { return };
    let executor = db.executor();
    let product = db.seed_product(&executor, "Mug", None);
    let mut store = PgCatalogStore::autocommit(&executor);

    let new = |sku: &str, stock: i32| NewVariant {
        product_id: product,
        sku: sku.to_string(),
        external_sku: None,
        price: Decimal::new(500, 2),
        stock,
        status: VariantStatus::Active,
        options_digest: None,
    };
    store.insert_variant(&new("MUG", 1), &[]).unwrap();

    let err = store.insert_variant(&new("MUG-2", 1), &[]).unwrap_err();
    assert_eq!(err.conflict_kind(), Some(ConflictKind::DuplicateDefaultVariant));

    let err = store.insert_variant(&new("MUG", 1), &[]).unwrap_err();
    assert_eq!(err.conflict_kind(), Some(ConflictKind::DuplicateSku));

    let err = store.insert_variant(&new("MUG-3", -1), &[]).unwrap_err();
    match err {
        StoreError::CheckViolation { constraint } => {
            assert_eq!(constraint.as_deref(), Some(variantguard::schema::VARIANTS_STOCK_CHECK));
        }
        other => panic!("expected check violation, got {other:?}"),
    }
}

#[test]
fn test_advisory_lock_requires_transaction_and_is_transaction_scoped() {
    let Some(db) = TestDatabase::start() else { return };
    let executor = db.executor();
    let other = db.executor();
    let mut store = PgCatalogStore::autocommit(&executor);

    let err = acquire_scoped(&mut store, "orders", &["42"]).unwrap_err();
    assert!(matches!(err, VariantError::PreconditionFailed(_)));

    let try_lock = |key: variantguard::lock::LockKey| -> bool {
        let rows = other
            .query_all("SELECT pg_try_advisory_xact_lock($1, $2)", &[&key.scope, &key.key])
            .unwrap();
        rows[0].get(0)
    };

    let mut outer = executor.begin().unwrap();
    let key = {
        let mut store = PgCatalogStore::within(&mut outer);
        with_savepoint(&mut store, |s| acquire_scoped(s, "orders", &["42"])).unwrap()
    };
    assert!(!try_lock(key), "lock must outlive the savepoint");
    outer.commit().unwrap();
    assert!(try_lock(key), "lock must be released at commit");

    let locking: LockingConfig = VariantguardConfig::from_toml("[locking]\nadvisory_locks_enabled = false")
        .unwrap()
        .locking;
    let mut outer = executor.begin().unwrap();
    {
        let mut store = PgCatalogStore::within(&mut outer).configured(&locking);
        assert!(!store.supports_advisory_locks());
        with_savepoint(&mut store, |s| acquire_scoped(s, "orders", &["42"])).unwrap();
    }
    assert!(try_lock(key), "disabled advisory locks must not be taken");
    outer.rollback().unwrap();
}

#[test]
fn test_feed_sync_and_admin_mapping_share_identity() {
    let Some(db) = TestDatabase::start() else { return };
    let executor = db.executor();
    let tee = db.seed_tee(&executor);
    let counters = Arc::new(LockCounters::new());
    let locks = ExternalIdLocks::new(LockPolicy { dual_lock_enabled: true }, counters.clone());
    let coordinator = ExternalFeedSyncCoordinator::new(locks.clone());
    let admin = AdminMappingService::new(locks);
    let mut store = PgCatalogStore::autocommit(&executor);

    let item = FeedItem {
        source: "Shopify".to_string(),
        source_account: "ACME".to_string(),
        product_id: tee.product,
        external_id: "gid://shopify/ProductVariant/1".to_string(),
        option_value_ids: vec![json!(tee.red), json!(tee.medium.to_string())],
        attributes: attrs("TEE-RED-M"),
    };
    let created = coordinator.sync(&mut store, &item).unwrap();
    assert_eq!(created.action, Action::Created);
    let variant_id = created.entity.unwrap().id;

    let again = coordinator.sync(&mut store, &item).unwrap();
    assert_eq!(again.action, Action::Updated);

    let relink = admin
        .link(&mut store, variant_id, "shopify", "acme", "gid://shopify/ProductVariant/1", None)
        .unwrap();
    assert_eq!(relink.action, Action::AlreadyLinked);

    let snapshot = counters.snapshot();
    assert_eq!((snapshot.legacy, snapshot.current, snapshot.dual), (3, 3, 3));

    let identity = ExternalIdentity::normalize("shopify", "acme", "gid://shopify/ProductVariant/1").unwrap();
    assert_ne!(external_id_key(&identity).key, 0);
    assert_eq!(
        db.count(&executor, "SELECT COUNT(*) FROM variant_external_ids", &[]),
        1
    );

    let unlinked = admin
        .unlink(&mut store, variant_id, "shopify", "acme", "gid://shopify/ProductVariant/1")
        .unwrap();
    assert_eq!(unlinked.action, Action::Unlinked);
}

#[test]
fn test_options_update_self_exclusion() {
    let Some(db) = TestDatabase::start() else { return };
    let executor = db.executor();
    let tee = db.seed_tee(&executor);
    let mut store = PgCatalogStore::autocommit(&executor);

    let variant = VariantIdentityResolver::default()
        .resolve(&mut store, tee.product, vec![tee.red, tee.medium], &attrs("TEE-RED-M"))
        .unwrap()
        .entity
        .unwrap();
    let result = VariantOptionsUpdater::default()
        .update(&mut store, variant.id, vec![tee.medium, tee.red])
        .unwrap();
    assert_eq!(result.action, Action::Updated);
    assert_eq!(store.variant_option_value_ids(variant.id).unwrap(), {
        let mut ids = vec![tee.red, tee.medium];
        ids.sort_unstable();
        ids
    });
}

#[test]
fn test_bulk_stock_and_archive() {
    let Some(db) = TestDatabase::start() else { return };
    let executor = db.executor();
    let tee = db.seed_tee(&executor);
    let mut store = PgCatalogStore::autocommit(&executor);
    let resolver = VariantIdentityResolver::default();
    let red = resolver
        .resolve(&mut store, tee.product, vec![tee.red], &attrs("TEE-RED"))
        .unwrap()
        .entity
        .unwrap();
    let blue = resolver
        .resolve(&mut store, tee.product, vec![tee.blue], &attrs("TEE-BLUE"))
        .unwrap()
        .entity
        .unwrap();

    let report = BulkMutationService::new()
        .bulk_update_stock(&mut store, [(blue.id, "9"), (red.id, "3")])
        .unwrap();
    assert_eq!(report.unchanged, vec![red.id]);
    assert_eq!(report.updated, vec![blue.id]);

    let archiver = ProductArchiver::new();
    assert_eq!(archiver.archive(&mut store, tee.product).unwrap().action, Action::Archived);
    assert_eq!(archiver.archive(&mut store, tee.product).unwrap().action, Action::Unchanged);
    assert_eq!(
        db.count(
            &executor,
            "SELECT COUNT(*) FROM variants WHERE product_id = $1 AND status = 'active'",
            &[&tee.product]
        ),
        0
    );
}
