//! Racing coroutines, each on its own connection.

use rust_decimal::Decimal;
use variantguard::model::VariantAttributes;
use variantguard::store::PgCatalogStore;
use variantguard::{
    Action, BulkMutationService, ExternalFeedSyncCoordinator, ExternalIdLocks, FeedItem, LockPolicy,
    ProductArchiver, VariantIdentityResolver,
};
use variantguard_integration_tests::TestDatabase;

const RACERS: usize = 4;

fn attrs() -> VariantAttributes {
    VariantAttributes {
        sku: Some("TEE-RED-M".to_string()),
        price: Some(Decimal::new(2500, 2)),
        stock: Some(1),
        ..Default::default()
    }
}

#[test]
fn test_concurrent_resolve_creates_one_active_variant() {
    let Some(db) = TestDatabase::start() else { return };
    let setup = db.executor();
    let tee = db.seed_tee(&setup);

    let handles: Vec<_> = (0..RACERS)
        .map(|i| {
            let connector = db.connector();
            // alternate input order; the digest must not care
            let ids = if i % 2 == 0 {
                vec![tee.red, tee.medium]
            } else {
                vec![tee.medium, tee.red]
            };
            may::go!(move || {
                let executor = connector.executor();
                let mut store = PgCatalogStore::autocommit(&executor);
                VariantIdentityResolver::default()
                    .resolve(&mut store, tee.product, ids, &attrs())
                    .expect("resolve")
                    .action
            })
        })
        .collect();
    let actions: Vec<Action> = handles
        .into_iter()
        .map(|h| h.join().expect("racer panicked"))
        .collect();

    assert_eq!(actions.iter().filter(|a| **a == Action::Created).count(), 1, "{actions:?}");
    assert!(actions
        .iter()
        .all(|a| matches!(a, Action::Created | Action::Linked | Action::Conflict)));
    assert_eq!(
        db.count(
            &setup,
            "SELECT COUNT(*) FROM variants WHERE product_id = $1 AND status = 'active'",
            &[&tee.product]
        ),
        1
    );
}

#[test]
fn test_concurrent_feed_sync_creates_one_mapping() {
    let Some(db) = TestDatabase::start() else { return };
    let setup = db.executor();
    let tee = db.seed_tee(&setup);
    let coordinator = ExternalFeedSyncCoordinator::new(ExternalIdLocks::new(
        LockPolicy { dual_lock_enabled: true },
        std::sync::Arc::new(variantguard::metrics::NoopLockMetrics),
    ));

    let item = FeedItem {
        source: "shopify".to_string(),
        source_account: "acme".to_string(),
        product_id: tee.product,
        external_id: "gid-race".to_string(),
        option_value_ids: vec![serde_json::json!(tee.red)],
        attributes: attrs(),
    };

    let handles: Vec<_> = (0..RACERS)
        .map(|_| {
            let connector = db.connector();
            let coordinator = coordinator.clone();
            let item = item.clone();
            may::go!(move || {
                let executor = connector.executor();
                let mut store = PgCatalogStore::autocommit(&executor);
                coordinator.sync(&mut store, &item).expect("sync").action
            })
        })
        .collect();
    let actions: Vec<Action> = handles
        .into_iter()
        .map(|h| h.join().expect("racer panicked"))
        .collect();

    assert_eq!(actions.iter().filter(|a| **a == Action::Created).count(), 1, "{actions:?}");
    assert!(actions.iter().all(|a| matches!(a, Action::Created | Action::Updated)));
    assert_eq!(
        db.count(&setup, "SELECT COUNT(*) FROM variant_external_ids", &[]),
        1
    );
}

#[test]
fn test_opposite_bulk_orders_do_not_deadlock() {
    let Some(db) = TestDatabase::start() else { return };
    let setup = db.executor();
    let tee = db.seed_tee(&setup);
    let mut store = PgCatalogStore::autocommit(&setup);
    let resolver = VariantIdentityResolver::default();
    let mut ids = Vec::new();
    for (sku, option) in [("TEE-RED", tee.red), ("TEE-BLUE", tee.blue)] {
        let attrs = VariantAttributes {
            sku: Some(sku.to_string()),
            ..attrs()
        };
        ids.push(resolver.resolve(&mut store, tee.product, vec![option], &attrs).unwrap().entity.unwrap().id);
    }

    let handles: Vec<_> = [ids.clone(), ids.iter().rev().copied().collect::<Vec<_>>()]
        .into_iter()
        .map(|order| {
            let connector = db.connector();
            may::go!(move || {
                let executor = connector.executor();
                let mut store = PgCatalogStore::autocommit(&executor);
                for round in 0..20 {
                    let entries: Vec<(i64, i64)> = order.iter().map(|id| (*id, round)).collect();
                    BulkMutationService::new()
                        .bulk_update_stock(&mut store, entries)
                        .expect("bulk update");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("bulk worker panicked");
    }
}

#[test]
fn test_archive_racing_bulk_update_does_not_deadlock() {
    let Some(db) = TestDatabase::start() else { return };
    let setup = db.executor();
    let tee = db.seed_tee(&setup);
    let mut store = PgCatalogStore::autocommit(&setup);
    let resolver = VariantIdentityResolver::default();
    let mut variants = Vec::new();
    for (sku, option) in [("TEE-RED", tee.red), ("TEE-BLUE", tee.blue), ("TEE-M", tee.medium)] {
        let attrs = VariantAttributes {
            sku: Some(sku.to_string()),
            ..attrs()
        };
        let id = resolver.resolve(&mut store, tee.product, vec![option], &attrs).unwrap().entity.unwrap().id;
        variants.push((id, option, attrs));
    }
    let descending: Vec<i64> = variants.iter().rev().map(|(id, _, _)| *id).collect();
    const ROUNDS: i64 = 15;

    let archiver = {
        let connector = db.connector();
        let product = tee.product;
        may::go!(move || {
            let executor = connector.executor();
            let mut store = PgCatalogStore::autocommit(&executor);
            let resolver = VariantIdentityResolver::default();
            for _ in 0..ROUNDS {
                ProductArchiver::new().restore(&mut store, product).expect("restore");
                for (_, option, attrs) in &variants {
                    let result = resolver.resolve(&mut store, product, vec![*option], attrs).expect("resolve");
                    assert!(result.success, "{:?}", result.error);
                }
                let archived = ProductArchiver::new().archive(&mut store, product).expect("archive");
                assert_eq!(archived.action, Action::Archived);
            }
        })
    };
    let bulk = {
        let connector = db.connector();
        may::go!(move || {
            let executor = connector.executor();
            let mut store = PgCatalogStore::autocommit(&executor);
            for round in 0..ROUNDS * 2 {
                let entries: Vec<(i64, i64)> = descending.iter().map(|id| (*id, round)).collect();
                BulkMutationService::new()
                    .bulk_update_stock(&mut store, entries)
                    .expect("bulk update");
            }
        })
    };
    archiver.join().expect("archive worker panicked");
    bulk.join().expect("bulk worker panicked");

    let active = db.count(
        &setup,
        "SELECT COUNT(*) FROM variants WHERE product_id = $1 AND status = 'active'",
        &[&tee.product],
    );
    assert_eq!(active, 0);
}
