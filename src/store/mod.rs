//! Storage-access port.
//!
//! [`CatalogStore`] is the only way the services touch persistent state.
//! Failures come back as [`StoreError`] kinds carrying the violated
//! constraint's name, so callers classify by identity rather than by message.

use crate::executor::ExecError;
use crate::lock::LockKey;
use crate::model::{
    ExternalIdentity, NewVariant, OptionValue, Product, ProductStatus, Variant, VariantChanges,
    VariantExternalId,
};
use crate::outcome::ConflictKind;
use std::fmt;

pub mod memory;
pub mod postgres;

pub use memory::{LockEvent, MemoryCatalogStore};
pub use postgres::PgCatalogStore;

#[derive(Debug)]
pub enum StoreError {
    /// A unique index rejected the write
    UniqueViolation { constraint: Option<String> },
    /// A check constraint rejected the write
    CheckViolation { constraint: Option<String> },
    /// Application-level uniqueness check failed before the write
    Validation(ConflictKind),
    /// Row addressed by id does not exist
    RowNotFound { table: &'static str, id: i64 },
    /// Transport, decoding or any other backend failure
    Backend(ExecError),
}

impl StoreError {
    /// Conflict classification for uniqueness failures; `None` for all other kinds.
    pub fn conflict_kind(&self) -> Option<ConflictKind> {
        match self {
            StoreError::UniqueViolation { constraint } => {
                Some(ConflictKind::from_constraint(constraint.as_deref()))
            }
            StoreError::Validation(kind) => Some(*kind),
            _ => None,
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::UniqueViolation { constraint } => write!(
                f,
                "Unique violation on {}",
                constraint.as_deref().unwrap_or("<unnamed constraint>")
            ),
            StoreError::CheckViolation { constraint } => write!(
                f,
                "Check violation on {}",
                constraint.as_deref().unwrap_or("<unnamed constraint>")
            ),
            StoreError::Validation(kind) => write!(f, "Validation failed: {kind}"),
            StoreError::RowNotFound { table, id } => write!(f, "{table} row {id} not found"),
            StoreError::Backend(e) => write!(f, "Store backend error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<ExecError> for StoreError {
    fn from(err: ExecError) -> Self {
        if let Some(constraint) = err.unique_violation() {
            return StoreError::UniqueViolation {
                constraint: constraint.map(str::to_string),
            };
        }
        if let Some(constraint) = err.check_violation() {
            return StoreError::CheckViolation {
                constraint: constraint.map(str::to_string),
            };
        }
        StoreError::Backend(err)
    }
}

/// Persistence, locking and transaction nesting for the catalog.
///
/// Implementations are bound to a single connection; every lock taken
/// through a store lives in that connection's current transaction.
pub trait CatalogStore {
    /// Whether a transaction (top-level or nested) is open on this connection.
    fn in_transaction(&self) -> bool;

    /// Whether [`CatalogStore::advisory_xact_lock`] provides real mutual exclusion.
    fn supports_advisory_locks(&self) -> bool;

    /// Open a savepoint, or a top-level transaction when none is open.
    fn begin_savepoint(&mut self) -> Result<(), StoreError>;

    /// Release the innermost savepoint (commit if it was top-level).
    fn release_savepoint(&mut self) -> Result<(), StoreError>;

    /// Roll back to the innermost savepoint (full rollback if top-level).
    fn rollback_savepoint(&mut self) -> Result<(), StoreError>;

    /// Transaction-scoped advisory lock; blocks until granted.
    fn advisory_xact_lock(&mut self, key: LockKey) -> Result<(), StoreError>;

    fn find_product(&mut self, product_id: i64) -> Result<Option<Product>, StoreError>;

    /// `SELECT … FOR UPDATE` on the product row.
    fn lock_product(&mut self, product_id: i64) -> Result<Option<Product>, StoreError>;

    fn set_product_status(&mut self, product_id: i64, status: ProductStatus) -> Result<(), StoreError>;

    fn find_option_values(&mut self, ids: &[i64]) -> Result<Vec<OptionValue>, StoreError>;

    fn enabled_option_type_ids(&mut self, product_id: i64) -> Result<Vec<i64>, StoreError>;

    fn find_variant(&mut self, variant_id: i64) -> Result<Option<Variant>, StoreError>;

    fn variants_for_product(&mut self, product_id: i64) -> Result<Vec<Variant>, StoreError>;

    /// Variant for `(product, digest)` in any status, preferring the active
    /// row and then the most recently created one.
    fn find_variant_by_digest(
        &mut self,
        product_id: i64,
        digest: Option<&str>,
    ) -> Result<Option<Variant>, StoreError>;

    /// Id of an active variant other than `excluding` holding `digest`.
    fn active_digest_holder(
        &mut self,
        product_id: i64,
        digest: Option<&str>,
        excluding: i64,
    ) -> Result<Option<i64>, StoreError>;

    fn sku_in_use(&mut self, product_id: i64, sku: &str, excluding: Option<i64>) -> Result<bool, StoreError>;

    /// Insert the row together with its option-value links.
    fn insert_variant(&mut self, new: &NewVariant, option_value_ids: &[i64]) -> Result<Variant, StoreError>;

    /// Plain column update, no other side effects.
    fn update_variant(&mut self, variant_id: i64, changes: &VariantChanges) -> Result<Variant, StoreError>;

    fn variant_option_value_ids(&mut self, variant_id: i64) -> Result<Vec<i64>, StoreError>;

    /// Replace all option links and store the new digest.
    fn replace_variant_options(
        &mut self,
        variant_id: i64,
        option_value_ids: &[i64],
        digest: Option<&str>,
    ) -> Result<Variant, StoreError>;

    /// Lock existing rows among `ids` (already ascending) in id order.
    fn lock_variants(&mut self, ids: &[i64]) -> Result<Vec<Variant>, StoreError>;

    /// Deactivate every active variant of the product, locking the rows in
    /// ascending id order first; returns rows changed.
    fn deactivate_variants(&mut self, product_id: i64) -> Result<u64, StoreError>;

    fn find_external_id(&mut self, identity: &ExternalIdentity) -> Result<Option<VariantExternalId>, StoreError>;

    fn insert_external_id(
        &mut self,
        variant_id: i64,
        identity: &ExternalIdentity,
        external_sku: Option<&str>,
    ) -> Result<VariantExternalId, StoreError>;

    fn delete_external_id(&mut self, mapping_id: i64) -> Result<bool, StoreError>;
}

/// Run `f` inside a savepoint (or a fresh transaction when none is open).
///
/// `Ok` releases the savepoint; `Err` rolls back to it and returns the error
/// unchanged, leaving any enclosing transaction usable.
pub fn with_savepoint<S, T, E, F>(store: &mut S, f: F) -> Result<T, E>
where
    S: CatalogStore + ?Sized,
    E: From<StoreError>,
    F: FnOnce(&mut S) -> Result<T, E>,
{
    store.begin_savepoint()?;
    match f(store) {
        Ok(value) => {
            store.release_savepoint()?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = store.rollback_savepoint() {
                log::warn!("savepoint rollback failed: {rollback_err}");
            }
            Err(err)
        }
    }
}
