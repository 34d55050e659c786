//! Find-or-create of a variant by `(product, option combination)`.
//!
//! The product row lock serializes every identity decision for a product;
//! the partial unique indexes on `variants` catch whatever slips past a
//! stale read, and the resulting violation is reported as a `conflict`.

use crate::digest::options_digest;
use crate::error::VariantError;
use crate::ids::{normalize_ids, RawToken};
use crate::metrics::{LockMetrics, NoopLockMetrics};
use crate::model::{NewVariant, Product, ProductStatus, Variant, VariantAttributes, VariantStatus};
use crate::outcome::{Action, ConflictKind, OperationResult};
use crate::selection;
use crate::store::{with_savepoint, CatalogStore, StoreError};
use std::sync::Arc;

#[cfg(feature = "tracing")]
use tracing::info_span;

/// Turn a failed savepoint body into the result callers expect.
///
/// Uniqueness failures become `conflict` (classified by constraint name),
/// check-constraint failures become `invalid`; everything else propagates.
pub(crate) fn settle<T>(
    metrics: &dyn LockMetrics,
    operation: &str,
    result: Result<OperationResult<T>, VariantError>,
) -> Result<OperationResult<T>, VariantError> {
    let err = match result {
        Err(VariantError::Store(err)) => err,
        other => return other,
    };
    if let Some(kind) = err.conflict_kind() {
        metrics.record_conflict(kind);
        log::warn!("{operation} lost a uniqueness race: {err}");
        return Ok(OperationResult::conflict(kind));
    }
    match err {
        StoreError::CheckViolation { constraint } => Ok(OperationResult::invalid(format!(
            "Value rejected by {}",
            constraint.as_deref().unwrap_or("a check constraint")
        ))),
        other => Err(VariantError::Store(other)),
    }
}

/// Resolves an option combination to exactly one active variant per product.
#[derive(Clone)]
pub struct VariantIdentityResolver {
    metrics: Arc<dyn LockMetrics>,
}

impl Default for VariantIdentityResolver {
    fn default() -> Self {
        Self::new(Arc::new(NoopLockMetrics))
    }
}

impl VariantIdentityResolver {
    pub fn new(metrics: Arc<dyn LockMetrics>) -> Self {
        Self { metrics }
    }

    /// Create, reactivate, update or discover the variant for the selection.
    ///
    /// Runs in a savepoint, so a conflict leaves an enclosing transaction
    /// usable. Only store failures outside the conflict taxonomy are `Err`.
    ///
    /// ```
    /// use rust_decimal::Decimal;
    /// use variantguard::model::VariantAttributes;
    /// use variantguard::outcome::Action;
    /// use variantguard::resolver::VariantIdentityResolver;
    /// use variantguard::store::MemoryCatalogStore;
    ///
    /// let mut store = MemoryCatalogStore::new();
    /// let product = store.seed_product("Tee", None);
    /// let attrs = VariantAttributes {
    ///     sku: Some("TEE".to_string()),
    ///     price: Some(Decimal::new(1500, 2)),
    ///     ..Default::default()
    /// };
    ///
    /// let resolver = VariantIdentityResolver::default();
    /// let first = resolver.resolve(&mut store, product.id, Vec::<i64>::new(), &attrs).unwrap();
    /// let second = resolver.resolve(&mut store, product.id, Vec::<i64>::new(), &attrs).unwrap();
    /// assert_eq!(first.action, Action::Created);
    /// assert_eq!(second.action, Action::Linked);
    /// ```
    pub fn resolve<'a, S, I, T>(
        &self,
        store: &mut S,
        product_id: i64,
        option_value_ids: I,
        attributes: &VariantAttributes,
    ) -> Result<OperationResult<Variant>, VariantError>
    where
        S: CatalogStore + ?Sized,
        I: IntoIterator<Item = T>,
        T: Into<RawToken<'a>>,
    {
        #[cfg(feature = "tracing")]
        let _span = info_span!("variantguard.resolve", product_id).entered();

        let ids = match normalize_ids(option_value_ids) {
            Ok(ids) => ids,
            Err(e) => return Ok(OperationResult::invalid(e.to_string())),
        };
        if let Some(message) = attributes.range_error() {
            return Ok(OperationResult::invalid(message));
        }
        let digest = options_digest(&ids);

        let result = with_savepoint(store, |s| {
            self.resolve_in_savepoint(s, product_id, &ids, digest.as_deref(), attributes)
        });
        settle(self.metrics.as_ref(), "resolve", result)
    }

    fn resolve_in_savepoint<S: CatalogStore + ?Sized>(
        &self,
        store: &mut S,
        product_id: i64,
        ids: &[i64],
        digest: Option<&str>,
        attributes: &VariantAttributes,
    ) -> Result<OperationResult<Variant>, VariantError> {
        let problems = selection::violations(store, product_id, ids)?;
        if !problems.is_empty() {
            return Ok(OperationResult::invalid(selection::describe(&problems)));
        }

        let Some(product) = store.lock_product(product_id)? else {
            return Ok(OperationResult::invalid(format!("Product {product_id} not found")));
        };

        if attributes.desired_status() == VariantStatus::Inactive {
            return insert(store, &product, ids, digest, attributes);
        }
        if product.status == ProductStatus::Archived {
            return Ok(OperationResult::invalid(format!(
                "Product {product_id} is archived; restore it before activating variants"
            )));
        }

        let Some(existing) = store.find_variant_by_digest(product_id, digest)? else {
            return insert(store, &product, ids, digest, attributes);
        };

        let mut changes = attributes.changes_for(&existing);
        if let Some(sku) = &changes.sku {
            if store.sku_in_use(product_id, sku, Some(existing.id))? {
                return Err(StoreError::Validation(ConflictKind::DuplicateSku).into());
            }
        }

        if !existing.is_active() {
            changes.status = Some(VariantStatus::Active);
            store.update_variant(existing.id, &changes)?;
            let variant = store.replace_variant_options(existing.id, ids, digest)?;
            log::info!("reactivated variant {} of product {product_id}", variant.id);
            return Ok(OperationResult::ok(Action::Reactivated, variant));
        }

        if changes.is_empty() {
            log::debug!("variant {} already matches; linked", existing.id);
            return Ok(OperationResult::ok(Action::Linked, existing));
        }
        let variant = store.update_variant(existing.id, &changes)?;
        log::debug!("updated variant {} of product {product_id}", variant.id);
        Ok(OperationResult::ok(Action::Updated, variant))
    }
}

fn insert<S: CatalogStore + ?Sized>(
    store: &mut S,
    product: &Product,
    ids: &[i64],
    digest: Option<&str>,
    attributes: &VariantAttributes,
) -> Result<OperationResult<Variant>, VariantError> {
    let Some(sku) = attributes
        .sku
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    else {
        return Ok(OperationResult::invalid("SKU is required to create a variant"));
    };
    let Some(price) = attributes.price.or(product.price) else {
        return Ok(OperationResult::invalid("Price is required to create a variant"));
    };

    if store.sku_in_use(product.id, sku, None)? {
        return Err(StoreError::Validation(ConflictKind::DuplicateSku).into());
    }

    let new = NewVariant {
        product_id: product.id,
        sku: sku.to_string(),
        external_sku: attributes
            .external_sku
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        price,
        stock: attributes.stock.unwrap_or(0),
        status: attributes.desired_status(),
        options_digest: digest.map(str::to_string),
    };
    let variant = store.insert_variant(&new, ids)?;
    log::info!(
        "created {} variant {} of product {}",
        variant.status,
        variant.id,
        product.id
    );
    Ok(OperationResult::ok(Action::Created, variant))
}
