//! In-process [`CatalogStore`].
//!
//! Enforces the catalog's unique and check constraints under the same
//! constraint names as the PostgreSQL schema, implements savepoints by
//! snapshotting, and records every lock it grants so tests can assert lock
//! ordering. It never blocks: a single store models a single connection.

use super::{CatalogStore, StoreError};
use crate::lock::LockKey;
use crate::model::{
    ExternalIdentity, NewVariant, OptionType, OptionValue, Product, ProductStatus, Variant,
    VariantChanges, VariantExternalId, VariantStatus,
};
use crate::schema;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};

/// A lock granted by the store, in grant order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    Advisory(LockKey),
    Product(i64),
    Variants(Vec<i64>),
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    next_id: i64,
    products: BTreeMap<i64, Product>,
    option_types: BTreeMap<i64, OptionType>,
    option_values: BTreeMap<i64, OptionValue>,
    product_option_types: BTreeSet<(i64, i64)>,
    variants: BTreeMap<i64, Variant>,
    /// (variant_id, option_value_id)
    option_value_variants: BTreeSet<(i64, i64)>,
    external_ids: BTreeMap<i64, VariantExternalId>,
}

impl MemoryState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_variant(&self, candidate: &Variant) -> Result<(), StoreError> {
        if candidate.price < Decimal::ZERO {
            return Err(check_violation(schema::VARIANTS_PRICE_CHECK));
        }
        if candidate.stock < 0 {
            return Err(check_violation(schema::VARIANTS_STOCK_CHECK));
        }
        for other in self.variants.values().filter(|v| v.id != candidate.id) {
            if other.product_id == candidate.product_id && other.sku == candidate.sku {
                return Err(unique_violation(schema::VARIANTS_SKU_UNIQUE));
            }
            if other.product_id == candidate.product_id && other.is_active() && candidate.is_active() {
                match (&other.options_digest, &candidate.options_digest) {
                    (None, None) => {
                        return Err(unique_violation(schema::VARIANTS_DEFAULT_ACTIVE_UNIQUE))
                    }
                    (Some(a), Some(b)) if a == b => {
                        return Err(unique_violation(schema::VARIANTS_DIGEST_ACTIVE_UNIQUE))
                    }
                    _ => {}
                }
            }
            if candidate.external_sku.is_some() && other.external_sku == candidate.external_sku {
                return Err(unique_violation(schema::VARIANTS_EXTERNAL_SKU_UNIQUE));
            }
        }
        Ok(())
    }

    fn link_options(&mut self, variant_id: i64, option_value_ids: &[i64]) -> Result<(), StoreError> {
        for id in option_value_ids {
            if !self.option_values.contains_key(id) {
                return Err(StoreError::RowNotFound {
                    table: "option_values",
                    id: *id,
                });
            }
            if !self.option_value_variants.insert((variant_id, *id)) {
                return Err(unique_violation(schema::OPTION_VALUE_VARIANTS_UNIQUE));
            }
        }
        Ok(())
    }
}

fn unique_violation(constraint: &str) -> StoreError {
    StoreError::UniqueViolation {
        constraint: Some(constraint.to_string()),
    }
}

fn check_violation(constraint: &str) -> StoreError {
    StoreError::CheckViolation {
        constraint: Some(constraint.to_string()),
    }
}

#[derive(Debug)]
pub struct MemoryCatalogStore {
    state: MemoryState,
    /// Snapshot taken by `begin()`, restored by `rollback()`.
    outer: Option<MemoryState>,
    savepoints: Vec<MemoryState>,
    advisory_locks: bool,
    held_locks: Vec<LockKey>,
    events: Vec<LockEvent>,
    variant_writes: Vec<i64>,
}

impl Default for MemoryCatalogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self {
            state: MemoryState::default(),
            outer: None,
            savepoints: Vec::new(),
            advisory_locks: true,
            held_locks: Vec::new(),
            events: Vec::new(),
            variant_writes: Vec::new(),
        }
    }

    /// A store modelling a backend with no advisory-lock primitive.
    pub fn without_advisory_locks() -> Self {
        Self {
            advisory_locks: false,
            ..Self::new()
        }
    }

    /// Open a caller-owned transaction.
    pub fn begin(&mut self) {
        if self.outer.is_none() {
            self.outer = Some(self.state.clone());
        }
    }

    pub fn commit(&mut self) {
        self.outer = None;
        self.savepoints.clear();
        self.end_transaction();
    }

    pub fn rollback(&mut self) {
        if let Some(snapshot) = self.outer.take() {
            self.state = snapshot;
        }
        self.savepoints.clear();
        self.end_transaction();
    }

    fn end_transaction(&mut self) {
        if !self.in_transaction() {
            self.held_locks.clear();
        }
    }

    /// Locks granted so far, in order.
    pub fn lock_events(&self) -> &[LockEvent] {
        &self.events
    }

    pub fn clear_lock_events(&mut self) {
        self.events.clear();
    }

    /// Advisory locks held by the current transaction.
    pub fn held_advisory_locks(&self) -> Vec<LockKey> {
        self.held_locks.clone()
    }

    /// Ids of variants written (insert, update, option change), in order.
    pub fn variant_writes(&self) -> &[i64] {
        &self.variant_writes
    }

    pub fn clear_variant_writes(&mut self) {
        self.variant_writes.clear();
    }

    pub fn seed_product(&mut self, name: &str, price: Option<Decimal>) -> Product {
        let product = Product {
            id: self.state.allocate_id(),
            name: name.to_string(),
            price,
            status: ProductStatus::Active,
        };
        self.state.products.insert(product.id, product.clone());
        product
    }

    pub fn seed_option_type(&mut self, name: &str) -> OptionType {
        let option_type = OptionType {
            id: self.state.allocate_id(),
            name: name.to_string(),
            position: self.state.option_types.len() as i32,
        };
        self.state.option_types.insert(option_type.id, option_type.clone());
        option_type
    }

    pub fn seed_option_value(&mut self, option_type_id: i64, name: &str) -> OptionValue {
        let value = OptionValue {
            id: self.state.allocate_id(),
            option_type_id,
            name: name.to_string(),
        };
        self.state.option_values.insert(value.id, value.clone());
        value
    }

    pub fn enable_option_type(&mut self, product_id: i64, option_type_id: i64) {
        self.state.product_option_types.insert((product_id, option_type_id));
    }

    /// Number of external-id mappings currently stored.
    pub fn external_id_count(&self) -> usize {
        self.state.external_ids.len()
    }
}

impl CatalogStore for MemoryCatalogStore {
    fn in_transaction(&self) -> bool {
        self.outer.is_some() || !self.savepoints.is_empty()
    }

    fn supports_advisory_locks(&self) -> bool {
        self.advisory_locks
    }

    fn begin_savepoint(&mut self) -> Result<(), StoreError> {
        self.savepoints.push(self.state.clone());
        Ok(())
    }

    fn release_savepoint(&mut self) -> Result<(), StoreError> {
        self.savepoints.pop();
        self.end_transaction();
        Ok(())
    }

    fn rollback_savepoint(&mut self) -> Result<(), StoreError> {
        if let Some(snapshot) = self.savepoints.pop() {
            self.state = snapshot;
        }
        self.end_transaction();
        Ok(())
    }

    fn advisory_xact_lock(&mut self, key: LockKey) -> Result<(), StoreError> {
        self.events.push(LockEvent::Advisory(key));
        if !self.held_locks.contains(&key) {
            self.held_locks.push(key);
        }
        Ok(())
    }

    fn find_product(&mut self, product_id: i64) -> Result<Option<Product>, StoreError> {
        Ok(self.state.products.get(&product_id).cloned())
    }

    fn lock_product(&mut self, product_id: i64) -> Result<Option<Product>, StoreError> {
        let product = self.state.products.get(&product_id).cloned();
        if product.is_some() {
            self.events.push(LockEvent::Product(product_id));
        }
        Ok(product)
    }

    fn set_product_status(&mut self, product_id: i64, status: ProductStatus) -> Result<(), StoreError> {
        let product = self
            .state
            .products
            .get_mut(&product_id)
            .ok_or(StoreError::RowNotFound {
                table: "products",
                id: product_id,
            })?;
        product.status = status;
        Ok(())
    }

    fn find_option_values(&mut self, ids: &[i64]) -> Result<Vec<OptionValue>, StoreError> {
        Ok(ids
            .iter()
            .filter_map(|id| self.state.option_values.get(id).cloned())
            .collect())
    }

    fn enabled_option_type_ids(&mut self, product_id: i64) -> Result<Vec<i64>, StoreError> {
        Ok(self
            .state
            .product_option_types
            .iter()
            .filter(|(p, _)| *p == product_id)
            .map(|(_, t)| *t)
            .collect())
    }

    fn find_variant(&mut self, variant_id: i64) -> Result<Option<Variant>, StoreError> {
        Ok(self.state.variants.get(&variant_id).cloned())
    }

    fn variants_for_product(&mut self, product_id: i64) -> Result<Vec<Variant>, StoreError> {
        Ok(self
            .state
            .variants
            .values()
            .filter(|v| v.product_id == product_id)
            .cloned()
            .collect())
    }

    fn find_variant_by_digest(
        &mut self,
        product_id: i64,
        digest: Option<&str>,
    ) -> Result<Option<Variant>, StoreError> {
        Ok(self
            .state
            .variants
            .values()
            .filter(|v| v.product_id == product_id && v.options_digest.as_deref() == digest)
            .max_by_key(|v| (v.is_active(), v.id))
            .cloned())
    }

    fn active_digest_holder(
        &mut self,
        product_id: i64,
        digest: Option<&str>,
        excluding: i64,
    ) -> Result<Option<i64>, StoreError> {
        Ok(self
            .state
            .variants
            .values()
            .find(|v| {
                v.product_id == product_id
                    && v.id != excluding
                    && v.is_active()
                    && v.options_digest.as_deref() == digest
            })
            .map(|v| v.id))
    }

    fn sku_in_use(&mut self, product_id: i64, sku: &str, excluding: Option<i64>) -> Result<bool, StoreError> {
        Ok(self
            .state
            .variants
            .values()
            .any(|v| v.product_id == product_id && v.sku == sku && Some(v.id) != excluding))
    }

    fn insert_variant(&mut self, new: &NewVariant, option_value_ids: &[i64]) -> Result<Variant, StoreError> {
        if !self.state.products.contains_key(&new.product_id) {
            return Err(StoreError::RowNotFound {
                table: "products",
                id: new.product_id,
            });
        }
        let mut state = self.state.clone();
        let variant = Variant {
            id: state.allocate_id(),
            product_id: new.product_id,
            sku: new.sku.clone(),
            external_sku: new.external_sku.clone(),
            price: new.price,
            stock: new.stock,
            status: new.status,
            options_digest: new.options_digest.clone(),
            updated_at: Utc::now(),
        };
        state.check_variant(&variant)?;
        state.variants.insert(variant.id, variant.clone());
        state.link_options(variant.id, option_value_ids)?;
        self.state = state;
        self.variant_writes.push(variant.id);
        Ok(variant)
    }

    fn update_variant(&mut self, variant_id: i64, changes: &VariantChanges) -> Result<Variant, StoreError> {
        let mut variant = self
            .state
            .variants
            .get(&variant_id)
            .cloned()
            .ok_or(StoreError::RowNotFound {
                table: "variants",
                id: variant_id,
            })?;
        changes.apply_to(&mut variant);
        variant.updated_at = Utc::now();
        self.state.check_variant(&variant)?;
        self.state.variants.insert(variant_id, variant.clone());
        self.variant_writes.push(variant_id);
        Ok(variant)
    }

    fn variant_option_value_ids(&mut self, variant_id: i64) -> Result<Vec<i64>, StoreError> {
        Ok(self
            .state
            .option_value_variants
            .iter()
            .filter(|(v, _)| *v == variant_id)
            .map(|(_, ov)| *ov)
            .collect())
    }

    fn replace_variant_options(
        &mut self,
        variant_id: i64,
        option_value_ids: &[i64],
        digest: Option<&str>,
    ) -> Result<Variant, StoreError> {
        let mut state = self.state.clone();
        let mut variant = state
            .variants
            .get(&variant_id)
            .cloned()
            .ok_or(StoreError::RowNotFound {
                table: "variants",
                id: variant_id,
            })?;
        state.option_value_variants.retain(|(v, _)| *v != variant_id);
        state.link_options(variant_id, option_value_ids)?;
        variant.options_digest = digest.map(str::to_string);
        variant.updated_at = Utc::now();
        state.check_variant(&variant)?;
        state.variants.insert(variant_id, variant.clone());
        self.state = state;
        self.variant_writes.push(variant_id);
        Ok(variant)
    }

    fn lock_variants(&mut self, ids: &[i64]) -> Result<Vec<Variant>, StoreError> {
        let rows: Vec<Variant> = ids
            .iter()
            .filter_map(|id| self.state.variants.get(id).cloned())
            .collect();
        self.events
            .push(LockEvent::Variants(rows.iter().map(|v| v.id).collect()));
        Ok(rows)
    }

    fn deactivate_variants(&mut self, product_id: i64) -> Result<u64, StoreError> {
        let ids: Vec<i64> = self
            .state
            .variants
            .values()
            .filter(|v| v.product_id == product_id && v.status == VariantStatus::Active)
            .map(|v| v.id)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        self.events.push(LockEvent::Variants(ids.clone()));
        let now = Utc::now();
        for id in &ids {
            if let Some(variant) = self.state.variants.get_mut(id) {
                variant.status = VariantStatus::Inactive;
                variant.updated_at = now;
                self.variant_writes.push(*id);
            }
        }
        Ok(ids.len() as u64)
    }

    fn find_external_id(&mut self, identity: &ExternalIdentity) -> Result<Option<VariantExternalId>, StoreError> {
        Ok(self
            .state
            .external_ids
            .values()
            .find(|m| {
                m.source == identity.source()
                    && m.source_account == identity.source_account()
                    && m.external_id == identity.external_id()
            })
            .cloned())
    }

    fn insert_external_id(
        &mut self,
        variant_id: i64,
        identity: &ExternalIdentity,
        external_sku: Option<&str>,
    ) -> Result<VariantExternalId, StoreError> {
        if !self.state.variants.contains_key(&variant_id) {
            return Err(StoreError::RowNotFound {
                table: "variants",
                id: variant_id,
            });
        }
        if self.find_external_id(identity)?.is_some() {
            return Err(unique_violation(schema::EXTERNAL_IDS_IDENTITY_UNIQUE));
        }
        let mapping = VariantExternalId {
            id: self.state.allocate_id(),
            variant_id,
            source: identity.source().to_string(),
            source_account: identity.source_account().to_string(),
            external_id: identity.external_id().to_string(),
            external_sku: external_sku.map(str::to_string),
        };
        self.state.external_ids.insert(mapping.id, mapping.clone());
        Ok(mapping)
    }

    fn delete_external_id(&mut self, mapping_id: i64) -> Result<bool, StoreError> {
        Ok(self.state.external_ids.remove(&mapping_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_variant(product_id: i64, sku: &str, digest: Option<&str>, status: VariantStatus) -> NewVariant {
        NewVariant {
            product_id,
            sku: sku.to_string(),
            external_sku: None,
            price: Decimal::new(1000, 2),
            stock: 1,
            status,
            options_digest: digest.map(str::to_string),
        }
    }

    #[test]
    fn test_default_variant_uniqueness_binds_active_rows_only() {
        let mut store = MemoryCatalogStore::new();
        let product = store.seed_product("Mug", None);

        store
            .insert_variant(&new_variant(product.id, "A", None, VariantStatus::Active), &[])
            .unwrap();
        store
            .insert_variant(&new_variant(product.id, "B", None, VariantStatus::Inactive), &[])
            .unwrap();
        store
            .insert_variant(&new_variant(product.id, "C", None, VariantStatus::Inactive), &[])
            .unwrap();

        let err = store
            .insert_variant(&new_variant(product.id, "D", None, VariantStatus::Active), &[])
            .unwrap_err();
        assert_eq!(err.conflict_kind(), Some(crate::outcome::ConflictKind::DuplicateDefaultVariant));
    }

    #[test]
    fn test_sku_uniqueness_binds_all_statuses() {
        let mut store = MemoryCatalogStore::new();
        let product = store.seed_product("Mug", None);
        store
            .insert_variant(&new_variant(product.id, "A", Some("x"), VariantStatus::Inactive), &[])
            .unwrap();
        let err = store
            .insert_variant(&new_variant(product.id, "A", Some("y"), VariantStatus::Active), &[])
            .unwrap_err();
        assert_eq!(err.conflict_kind(), Some(crate::outcome::ConflictKind::DuplicateSku));

        // same SKU on another product is fine
        let other = store.seed_product("Cup", None);
        store
            .insert_variant(&new_variant(other.id, "A", Some("x"), VariantStatus::Active), &[])
            .unwrap();
    }

    #[test]
    fn test_check_constraints() {
        let mut store = MemoryCatalogStore::new();
        let product = store.seed_product("Mug", None);
        let mut new = new_variant(product.id, "A", None, VariantStatus::Active);
        new.stock = -1;
        let err = store.insert_variant(&new, &[]).unwrap_err();
        assert!(matches!(
            err,
            StoreError::CheckViolation { constraint: Some(ref c) } if c == schema::VARIANTS_STOCK_CHECK
        ));
        assert!(store.variants_for_product(product.id).unwrap().is_empty());
    }

    #[test]
    fn test_failed_insert_leaves_no_option_links() {
        let mut store = MemoryCatalogStore::new();
        let product = store.seed_product("Mug", None);
        let err = store
            .insert_variant(&new_variant(product.id, "A", Some("d"), VariantStatus::Active), &[999])
            .unwrap_err();
        assert!(matches!(err, StoreError::RowNotFound { table: "option_values", .. }));
        assert!(store.variants_for_product(product.id).unwrap().is_empty());
    }

    #[test]
    fn test_find_by_digest_prefers_active_then_newest() {
        let mut store = MemoryCatalogStore::new();
        let product = store.seed_product("Mug", None);
        let old = store
            .insert_variant(&new_variant(product.id, "A", Some("d"), VariantStatus::Inactive), &[])
            .unwrap();
        let newer = store
            .insert_variant(&new_variant(product.id, "B", Some("d"), VariantStatus::Inactive), &[])
            .unwrap();
        assert_eq!(
            store.find_variant_by_digest(product.id, Some("d")).unwrap().map(|v| v.id),
            Some(newer.id)
        );

        store
            .update_variant(
                old.id,
                &VariantChanges {
                    status: Some(VariantStatus::Active),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(
            store.find_variant_by_digest(product.id, Some("d")).unwrap().map(|v| v.id),
            Some(old.id)
        );
    }

    #[test]
    fn test_rollback_restores_outer_snapshot_and_releases_locks() {
        let mut store = MemoryCatalogStore::new();
        let product = store.seed_product("Mug", None);
        store.begin();
        store.advisory_xact_lock(LockKey { scope: 1, key: 2 }).unwrap();
        store
            .insert_variant(&new_variant(product.id, "A", None, VariantStatus::Active), &[])
            .unwrap();
        store.rollback();

        assert!(!store.in_transaction());
        assert!(store.held_advisory_locks().is_empty());
        assert!(store.variants_for_product(product.id).unwrap().is_empty());
    }
}
