//! Changing which option values identify an existing variant.

use crate::digest::options_digest;
use crate::error::VariantError;
use crate::executor::ExecError;
use crate::ids::{normalize_ids, RawToken};
use crate::metrics::{LockMetrics, NoopLockMetrics};
use crate::model::Variant;
use crate::outcome::{Action, ConflictKind, OperationResult};
use crate::resolver::settle;
use crate::selection;
use crate::store::{with_savepoint, CatalogStore, StoreError};
use std::sync::Arc;

#[derive(Clone)]
pub struct VariantOptionsUpdater {
    metrics: Arc<dyn LockMetrics>,
}

impl Default for VariantOptionsUpdater {
    fn default() -> Self {
        Self::new(Arc::new(NoopLockMetrics))
    }
}

impl VariantOptionsUpdater {
    pub fn new(metrics: Arc<dyn LockMetrics>) -> Self {
        Self { metrics }
    }

    /// Replace the variant's option values.
    ///
    /// The duplicate check ignores the variant itself, so re-applying its
    /// current selection is an `updated` no-op rather than a conflict.
    pub fn update<'a, S, I, T>(
        &self,
        store: &mut S,
        variant_id: i64,
        option_value_ids: I,
    ) -> Result<OperationResult<Variant>, VariantError>
    where
        S: CatalogStore + ?Sized,
        I: IntoIterator<Item = T>,
        T: Into<RawToken<'a>>,
    {
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!("variantguard.update_options", variant_id).entered();

        let ids = match normalize_ids(option_value_ids) {
            Ok(ids) => ids,
            Err(e) => return Ok(OperationResult::invalid(e.to_string())),
        };
        let result = with_savepoint(store, |s| update_in_savepoint(s, variant_id, &ids));
        settle(self.metrics.as_ref(), "options update", result)
    }
}

fn update_in_savepoint<S: CatalogStore + ?Sized>(
    store: &mut S,
    variant_id: i64,
    ids: &[i64],
) -> Result<OperationResult<Variant>, VariantError> {
    let Some(current) = store.find_variant(variant_id)? else {
        return Ok(OperationResult::not_found(format!("Variant {variant_id} not found")));
    };
    let product_id = current.product_id;

    let problems = selection::violations(store, product_id, ids)?;
    if !problems.is_empty() {
        return Ok(OperationResult::invalid(selection::describe(&problems)));
    }

    if store.lock_product(product_id)?.is_none() {
        return Ok(OperationResult::invalid(format!("Product {product_id} not found")));
    }
    let Some(variant) = store.lock_variants(&[variant_id])?.into_iter().next() else {
        return Ok(OperationResult::not_found(format!("Variant {variant_id} not found")));
    };

    let digest = options_digest(ids);
    if variant.is_active() {
        if let Some(holder) = store.active_digest_holder(product_id, digest.as_deref(), variant.id)? {
            log::debug!("variant {holder} already holds the requested options");
            let kind = if digest.is_none() {
                ConflictKind::DuplicateDefaultVariant
            } else {
                ConflictKind::DuplicateOptionCombination
            };
            return Err(StoreError::Validation(kind).into());
        }
    }

    let updated = store.replace_variant_options(variant.id, ids, digest.as_deref())?;
    let stored = store.variant_option_value_ids(variant.id)?;
    if options_digest(&stored) != updated.options_digest {
        return Err(StoreError::Backend(ExecError::Other(format!(
            "variant {} digest does not match its option links",
            variant.id
        )))
        .into());
    }
    Ok(OperationResult::ok(Action::Updated, updated))
}
