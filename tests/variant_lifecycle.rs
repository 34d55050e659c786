//! End-to-end scenarios over the in-memory catalog.

use fake::faker::lorem::en::Word;
use fake::Fake;
use rand::seq::SliceRandom;
use rand::Rng;
use rust_decimal::Decimal;
use variantguard::ids::{normalize_ids, IdError};
use variantguard::lock::LockKey;
use variantguard::metrics::LockCounters;
use variantguard::model::{
    ExternalIdentity, NewVariant, OptionValue, Product, ProductStatus, Variant, VariantAttributes,
    VariantChanges, VariantExternalId, VariantStatus,
};
use variantguard::store::{CatalogStore, MemoryCatalogStore, StoreError};
use variantguard::{
    Action, BulkMutationService, ConflictKind, ProductArchiver, VariantIdentityResolver, VariantOptionsUpdater,
};
use std::sync::Arc;

struct Catalog {
    store: MemoryCatalogStore,
    product: i64,
    colors: Vec<i64>,
    sizes: Vec<i64>,
}

fn catalog() -> Catalog {
    let mut store = MemoryCatalogStore::new();
    let product = store.seed_product("Tee", Some(Decimal::new(1999, 2))).id;
    let color = store.seed_option_type("Color").id;
    let size = store.seed_option_type("Size").id;
    let colors = ["Red", "Blue", "Green"]
        .iter()
        .map(|name| store.seed_option_value(color, name).id)
        .collect();
    let sizes = ["S", "M", "L"]
        .iter()
        .map(|name| store.seed_option_value(size, name).id)
        .collect();
    store.enable_option_type(product, color);
    store.enable_option_type(product, size);
    Catalog {
        store,
        product,
        colors,
        sizes,
    }
}

fn fake_sku() -> String {
    let word: String = Word().fake();
    format!("{}-{}", word.to_uppercase(), rand::thread_rng().gen_range(1000..9999))
}

fn attrs(sku: &str) -> VariantAttributes {
    VariantAttributes {
        sku: Some(sku.to_string()),
        stock: Some(2),
        ..Default::default()
    }
}

#[test]
fn test_normalizer_output_is_sorted_unique_positive() {
    let mut rng = rand::thread_rng();
    for _ in 0..50 {
        let mut tokens: Vec<String> = (0..20).map(|_| rng.gen_range(1..40).to_string()).collect();
        tokens.extend(["".to_string(), "   ".to_string()]);
        tokens.shuffle(&mut rng);

        let ids = normalize_ids(&tokens).unwrap();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert!(ids.iter().all(|id| *id > 0));
    }
    for bad in ["01", "0x10", "1_000", "abc"] {
        assert!(matches!(normalize_ids([bad]), Err(IdError::InvalidIdFormat(_))), "{bad}");
    }
    assert!(matches!(normalize_ids(["-4"]), Err(IdError::NonPositiveId(-4))));
}

#[test]
fn test_every_combination_resolves_order_independently() {
    let mut c = catalog();
    let resolver = VariantIdentityResolver::default();
    let mut rng = rand::thread_rng();
    let mut created = Vec::new();

    for color in c.colors.clone() {
        for size in c.sizes.clone() {
            let result = resolver
                .resolve(&mut c.store, c.product, vec![color, size], &attrs(&fake_sku()))
                .unwrap();
            assert_eq!(result.action, Action::Created);
            created.push((vec![color, size], result.entity.unwrap().id));
        }
    }

    for (mut ids, id) in created {
        ids.shuffle(&mut rng);
        let raw: Vec<String> = ids.iter().map(|i| format!("  {i} ")).collect();
        let result = resolver
            .resolve(&mut c.store, c.product, &raw, &VariantAttributes::default())
            .unwrap();
        assert_eq!(result.action, Action::Linked);
        assert_eq!(result.entity.unwrap().id, id);
    }
    assert_eq!(c.store.variants_for_product(c.product).unwrap().len(), 9);
}

#[test]
fn test_lifecycle_create_archive_restore_reactivate() {
    let mut c = catalog();
    let resolver = VariantIdentityResolver::default();
    let ids = vec![c.colors[0], c.sizes[1]];
    let sku = fake_sku();

    let created = resolver.resolve(&mut c.store, c.product, ids.clone(), &attrs(&sku)).unwrap();
    assert_eq!(created.action, Action::Created);
    let variant = created.entity.unwrap();
    assert_eq!(variant.price, Decimal::new(1999, 2));

    let archiver = ProductArchiver::new();
    assert_eq!(archiver.archive(&mut c.store, c.product).unwrap().action, Action::Archived);
    assert_eq!(archiver.archive(&mut c.store, c.product).unwrap().action, Action::Unchanged);
    assert!(!c.store.find_variant(variant.id).unwrap().unwrap().is_active());

    archiver.restore(&mut c.store, c.product).unwrap();
    let back = resolver
        .resolve(&mut c.store, c.product, ids, &VariantAttributes::default())
        .unwrap();
    assert_eq!(back.action, Action::Reactivated);
    assert_eq!(back.entity.unwrap().id, variant.id);
    assert_eq!(c.store.find_product(c.product).unwrap().unwrap().status, ProductStatus::Active);
}

#[test]
fn test_options_updater_swaps_and_rejects_taken_combinations() {
    let mut c = catalog();
    let resolver = VariantIdentityResolver::default();
    let updater = VariantOptionsUpdater::default();
    let a = resolver
        .resolve(&mut c.store, c.product, vec![c.colors[0]], &attrs("A"))
        .unwrap()
        .entity
        .unwrap();
    let b = resolver
        .resolve(&mut c.store, c.product, vec![c.colors[1]], &attrs("B"))
        .unwrap()
        .entity
        .unwrap();

    assert_eq!(updater.update(&mut c.store, a.id, vec![c.colors[0]]).unwrap().action, Action::Updated);
    assert_eq!(updater.update(&mut c.store, a.id, vec![c.colors[1]]).unwrap().action, Action::Conflict);
    assert_eq!(updater.update(&mut c.store, a.id, vec![c.colors[2]]).unwrap().action, Action::Updated);
    assert_eq!(updater.update(&mut c.store, b.id, vec![c.colors[0]]).unwrap().action, Action::Updated);
}

#[test]
fn test_bulk_stock_touches_only_listed_variants() {
    let mut c = catalog();
    let resolver = VariantIdentityResolver::default();
    let mut ids = Vec::new();
    for color in c.colors.clone() {
        let v = resolver
            .resolve(&mut c.store, c.product, vec![color], &attrs(&fake_sku()))
            .unwrap()
            .entity
            .unwrap();
        ids.push(v.id);
    }
    c.store.clear_variant_writes();

    let report = BulkMutationService::new()
        .bulk_update_stock(&mut c.store, [(ids[2], "10"), (ids[0], "2")])
        .unwrap();
    assert_eq!(report.unchanged, vec![ids[0]]);
    assert_eq!(report.updated, vec![ids[2]]);
    assert_eq!(c.store.variant_writes(), &[ids[2]]);
    assert_eq!(c.store.find_variant(ids[1]).unwrap().unwrap().stock, 2);
}

/// Store whose duplicate pre-checks see nothing, as a connection racing
/// another one would before that one commits.
struct StaleReads<'a>(&'a mut MemoryCatalogStore);

impl CatalogStore for StaleReads<'_> {
    fn in_transaction(&self) -> bool {
        self.0.in_transaction()
    }
    fn supports_advisory_locks(&self) -> bool {
        self.0.supports_advisory_locks()
    }
    fn begin_savepoint(&mut self) -> Result<(), StoreError> {
        self.0.begin_savepoint()
    }
    fn release_savepoint(&mut self) -> Result<(), StoreError> {
        self.0.release_savepoint()
    }
    fn rollback_savepoint(&mut self) -> Result<(), StoreError> {
        self.0.rollback_savepoint()
    }
    fn advisory_xact_lock(&mut self, key: LockKey) -> Result<(), StoreError> {
        self.0.advisory_xact_lock(key)
    }
    fn find_product(&mut self, product_id: i64) -> Result<Option<Product>, StoreError> {
        self.0.find_product(product_id)
    }
    fn lock_product(&mut self, product_id: i64) -> Result<Option<Product>, StoreError> {
        self.0.lock_product(product_id)
    }
    fn set_product_status(&mut self, product_id: i64, status: ProductStatus) -> Result<(), StoreError> {
        self.0.set_product_status(product_id, status)
    }
    fn find_option_values(&mut self, ids: &[i64]) -> Result<Vec<OptionValue>, StoreError> {
        self.0.find_option_values(ids)
    }
    fn enabled_option_type_ids(&mut self, product_id: i64) -> Result<Vec<i64>, StoreError> {
        self.0.enabled_option_type_ids(product_id)
    }
    fn find_variant(&mut self, variant_id: i64) -> Result<Option<Variant>, StoreError> {
        self.0.find_variant(variant_id)
    }
    fn variants_for_product(&mut self, product_id: i64) -> Result<Vec<Variant>, StoreError> {
        self.0.variants_for_product(product_id)
    }
    fn find_variant_by_digest(&mut self, _: i64, _: Option<&str>) -> Result<Option<Variant>, StoreError> {
        Ok(None)
    }
    fn active_digest_holder(&mut self, _: i64, _: Option<&str>, _: i64) -> Result<Option<i64>, StoreError> {
        Ok(None)
    }
    fn sku_in_use(&mut self, _: i64, _: &str, _: Option<i64>) -> Result<bool, StoreError> {
        Ok(false)
    }
    fn insert_variant(&mut self, new: &NewVariant, option_value_ids: &[i64]) -> Result<Variant, StoreError> {
        self.0.insert_variant(new, option_value_ids)
    }
    fn update_variant(&mut self, variant_id: i64, changes: &VariantChanges) -> Result<Variant, StoreError> {
        self.0.update_variant(variant_id, changes)
    }
    fn variant_option_value_ids(&mut self, variant_id: i64) -> Result<Vec<i64>, StoreError> {
        self.0.variant_option_value_ids(variant_id)
    }
    fn replace_variant_options(
        &mut self,
        variant_id: i64,
        option_value_ids: &[i64],
        digest: Option<&str>,
    ) -> Result<Variant, StoreError> {
        self.0.replace_variant_options(variant_id, option_value_ids, digest)
    }
    fn lock_variants(&mut self, ids: &[i64]) -> Result<Vec<Variant>, StoreError> {
        self.0.lock_variants(ids)
    }
    fn deactivate_variants(&mut self, product_id: i64) -> Result<u64, StoreError> {
        self.0.deactivate_variants(product_id)
    }
    fn find_external_id(&mut self, _: &ExternalIdentity) -> Result<Option<VariantExternalId>, StoreError> {
        Ok(None)
    }
    fn insert_external_id(
        &mut self,
        variant_id: i64,
        identity: &ExternalIdentity,
        external_sku: Option<&str>,
    ) -> Result<VariantExternalId, StoreError> {
        self.0.insert_external_id(variant_id, identity, external_sku)
    }
    fn delete_external_id(&mut self, mapping_id: i64) -> Result<bool, StoreError> {
        self.0.delete_external_id(mapping_id)
    }
}

#[test]
fn test_lost_race_is_classified_by_constraint() {
    let mut c = catalog();
    let counters = Arc::new(LockCounters::new());
    let resolver = VariantIdentityResolver::new(counters.clone());
    let ids = vec![c.colors[0], c.sizes[0]];

    let winner = resolver.resolve(&mut c.store, c.product, ids.clone(), &attrs("WIN")).unwrap();
    assert_eq!(winner.action, Action::Created);

    let cases = [
        (ids.clone(), "LOSE", ConflictKind::DuplicateOptionCombination),
        (vec![c.colors[1]], "WIN", ConflictKind::DuplicateSku),
    ];
    for (selection, sku, expected) in cases {
        let loser = resolver
            .resolve(&mut StaleReads(&mut c.store), c.product, selection, &attrs(sku))
            .unwrap();
        assert_eq!(loser.action, Action::Conflict);
        assert_eq!(loser.error.as_deref(), Some(expected.message()));
    }

    let snapshot = counters.snapshot();
    assert_eq!(snapshot.conflicts.get(&ConflictKind::DuplicateOptionCombination), Some(&1));
    assert_eq!(snapshot.conflicts.get(&ConflictKind::DuplicateSku), Some(&1));
    let active: Vec<Variant> = c
        .store
        .variants_for_product(c.product)
        .unwrap()
        .into_iter()
        .filter(|v| v.status == VariantStatus::Active)
        .collect();
    assert_eq!(active.len(), 1);
}

#[test]
fn test_lost_default_variant_race() {
    let mut store = MemoryCatalogStore::new();
    let product = store.seed_product("Poster", Some(Decimal::new(800, 2))).id;
    let resolver = VariantIdentityResolver::default();
    resolver
        .resolve(&mut store, product, Vec::<i64>::new(), &attrs("POSTER"))
        .unwrap();
    let loser = resolver
        .resolve(&mut StaleReads(&mut store), product, Vec::<i64>::new(), &attrs("POSTER-2"))
        .unwrap();
    assert_eq!(loser.action, Action::Conflict);
    assert_eq!(loser.error.as_deref(), Some(ConflictKind::DuplicateDefaultVariant.message()));
}

#[test]
fn test_lost_mapping_race_rolls_back_created_variant() {
    let mut c = catalog();
    let coordinator = variantguard::ExternalFeedSyncCoordinator::default();
    let item = variantguard::FeedItem {
        source: "etsy".to_string(),
        source_account: String::new(),
        product_id: c.product,
        external_id: "listing-1".to_string(),
        option_value_ids: vec![serde_json::json!(c.colors[0])],
        attributes: attrs("ETSY-1"),
    };
    assert_eq!(coordinator.sync(&mut c.store, &item).unwrap().action, Action::Created);

    // the racing importer misses the mapping and creates its own variant
    let mut racer = item.clone();
    racer.option_value_ids = vec![serde_json::json!(c.colors[1])];
    racer.attributes = attrs("ETSY-2");
    let result = coordinator.sync(&mut StaleReads(&mut c.store), &racer).unwrap();
    assert_eq!(result.action, Action::Conflict);
    assert_eq!(result.error.as_deref(), Some(ConflictKind::DuplicateExternalId.message()));
    assert_eq!(c.store.variants_for_product(c.product).unwrap().len(), 1);
    assert_eq!(c.store.external_id_count(), 1);
}
