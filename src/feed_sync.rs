//! Idempotent upsert of variants from external feeds.
//!
//! A feed item is keyed by `(source, source_account, external_id)`. The
//! advisory lock for that identity is taken before any row lock, so two
//! importers seeing the same item serialize even when no row exists yet.

use crate::error::VariantError;
use crate::lock::ExternalIdLocks;
use crate::metrics::LockMetrics;
use crate::model::{ExternalIdentity, Variant, VariantAttributes};
use crate::outcome::{Action, ConflictKind, OperationResult};
use crate::resolver::{settle, VariantIdentityResolver};
use crate::store::{with_savepoint, CatalogStore, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// One item of an external catalog feed.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FeedItem {
    pub source: String,
    #[serde(default)]
    pub source_account: String,
    pub product_id: i64,
    pub external_id: String,
    /// Raw payload tokens; normalized before use.
    #[serde(default)]
    pub option_value_ids: Vec<Value>,
    #[serde(default)]
    pub attributes: VariantAttributes,
}

/// Action counts for a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub created: usize,
    pub reactivated: usize,
    pub updated: usize,
    pub linked: usize,
    pub invalid: usize,
    pub conflict: usize,
}

impl SyncSummary {
    fn record(&mut self, action: Action) {
        match action {
            Action::Created => self.created += 1,
            Action::Reactivated => self.reactivated += 1,
            Action::Updated => self.updated += 1,
            Action::Linked => self.linked += 1,
            Action::Conflict => self.conflict += 1,
            _ => self.invalid += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.created + self.reactivated + self.updated + self.linked + self.invalid + self.conflict
    }

    pub fn failed(&self) -> usize {
        self.invalid + self.conflict
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncBatch {
    pub results: Vec<OperationResult<Variant>>,
    pub summary: SyncSummary,
}

#[derive(Clone)]
pub struct ExternalFeedSyncCoordinator {
    locks: ExternalIdLocks,
    resolver: VariantIdentityResolver,
    metrics: Arc<dyn LockMetrics>,
}

impl Default for ExternalFeedSyncCoordinator {
    fn default() -> Self {
        Self::new(ExternalIdLocks::default())
    }
}

impl ExternalFeedSyncCoordinator {
    pub fn new(locks: ExternalIdLocks) -> Self {
        let metrics = locks.metrics();
        Self {
            resolver: VariantIdentityResolver::new(Arc::clone(&metrics)),
            locks,
            metrics,
        }
    }

    /// Upsert the variant behind `item` and its external-id mapping.
    ///
    /// An existing mapping updates its variant in place; a new one goes
    /// through the identity resolver first. A mapping is never moved to a
    /// different product.
    pub fn sync<S: CatalogStore + ?Sized>(
        &self,
        store: &mut S,
        item: &FeedItem,
    ) -> Result<OperationResult<Variant>, VariantError> {
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!(
            "variantguard.feed_sync",
            source = item.source.as_str(),
            external_id = item.external_id.as_str()
        )
        .entered();

        let Some(identity) =
            ExternalIdentity::normalize(&item.source, &item.source_account, &item.external_id)
        else {
            return Ok(OperationResult::invalid("Source and external ID must not be blank"));
        };
        if let Some(message) = item.attributes.range_error() {
            return Ok(OperationResult::invalid(message));
        }

        let result = with_savepoint(store, |s| self.sync_in_savepoint(s, &identity, item));
        settle(self.metrics.as_ref(), "feed sync", result)
    }

    fn sync_in_savepoint<S: CatalogStore + ?Sized>(
        &self,
        store: &mut S,
        identity: &ExternalIdentity,
        item: &FeedItem,
    ) -> Result<OperationResult<Variant>, VariantError> {
        self.locks.acquire(store, identity)?;

        if let Some(mapping) = store.find_external_id(identity)? {
            let Some(variant) = store.lock_variants(&[mapping.variant_id])?.into_iter().next() else {
                return Err(StoreError::RowNotFound {
                    table: "variants",
                    id: mapping.variant_id,
                }
                .into());
            };
            if variant.product_id != item.product_id {
                return Ok(OperationResult::invalid(format!(
                    "External ID {identity} belongs to variant {} of product {}, not product {}",
                    variant.id, variant.product_id, item.product_id
                )));
            }
            return update_mapped(store, variant, &item.attributes);
        }

        let resolved = self
            .resolver
            .resolve(store, item.product_id, &item.option_value_ids, &item.attributes)?;
        let Some(variant) = resolved.entity.clone().filter(|_| resolved.success) else {
            return Ok(resolved);
        };
        store.insert_external_id(variant.id, identity, item.attributes.external_sku.as_deref())?;
        log::info!("mapped {identity} to variant {} ({})", variant.id, resolved.action);
        Ok(resolved)
    }

    /// Sync every item inside one transaction; each item has its own
    /// savepoint, so invalid or conflicting items do not undo the others.
    /// A store failure aborts the whole batch.
    pub fn sync_batch<S: CatalogStore + ?Sized>(
        &self,
        store: &mut S,
        items: &[FeedItem],
    ) -> Result<SyncBatch, VariantError> {
        with_savepoint(store, |s| {
            let mut summary = SyncSummary::default();
            let mut results = Vec::with_capacity(items.len());
            for item in items {
                let result = self.sync(s, item)?;
                summary.record(result.action);
                results.push(result);
            }
            log::info!(
                "feed batch: {} items, {} created, {} updated, {} failed",
                summary.total(),
                summary.created,
                summary.updated,
                summary.failed()
            );
            Ok(SyncBatch { results, summary })
        })
    }
}

fn update_mapped<S: CatalogStore + ?Sized>(
    store: &mut S,
    variant: Variant,
    attributes: &VariantAttributes,
) -> Result<OperationResult<Variant>, VariantError> {
    let changes = attributes.changes_for(&variant);
    if changes.is_empty() {
        return Ok(OperationResult::ok(Action::Updated, variant));
    }
    if let Some(sku) = &changes.sku {
        if store.sku_in_use(variant.product_id, sku, Some(variant.id))? {
            return Err(StoreError::Validation(ConflictKind::DuplicateSku).into());
        }
    }
    let updated = store.update_variant(variant.id, &changes)?;
    log::debug!("feed updated mapped variant {}", updated.id);
    Ok(OperationResult::ok(Action::Updated, updated))
}
