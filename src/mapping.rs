//! Manual linking of variants to external identities.
//!
//! Uses the same advisory keys as feed sync, so an admin edit and a feed
//! import on one external identity never interleave.

use crate::error::VariantError;
use crate::lock::ExternalIdLocks;
use crate::metrics::LockMetrics;
use crate::model::{ExternalIdentity, VariantExternalId};
use crate::outcome::{Action, ConflictKind, OperationResult};
use crate::resolver::settle;
use crate::store::{with_savepoint, CatalogStore};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct AdminMappingService {
    locks: ExternalIdLocks,
}

impl AdminMappingService {
    pub fn new(locks: ExternalIdLocks) -> Self {
        Self { locks }
    }

    fn metrics(&self) -> Arc<dyn LockMetrics> {
        self.locks.metrics()
    }

    /// Map `(source, source_account, external_id)` to the variant.
    ///
    /// Re-linking to the same variant is `already_linked`; an identity held
    /// by another variant is a `conflict`.
    pub fn link<S: CatalogStore + ?Sized>(
        &self,
        store: &mut S,
        variant_id: i64,
        source: &str,
        source_account: &str,
        external_id: &str,
        external_sku: Option<&str>,
    ) -> Result<OperationResult<VariantExternalId>, VariantError> {
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!("variantguard.link", variant_id, source, external_id).entered();

        let Some(identity) = ExternalIdentity::normalize(source, source_account, external_id) else {
            return Ok(OperationResult::invalid("Source and external ID must not be blank"));
        };
        let external_sku = external_sku.map(str::trim).filter(|s| !s.is_empty());
        let metrics = self.metrics();

        let result: Result<_, VariantError> = with_savepoint(store, |s| {
            self.locks.acquire(s, &identity)?;

            if let Some(existing) = s.find_external_id(&identity)? {
                if existing.variant_id == variant_id {
                    return Ok(OperationResult::ok(Action::AlreadyLinked, existing));
                }
                metrics.record_conflict(ConflictKind::DuplicateExternalId);
                return Ok(OperationResult::conflict_with(format!(
                    "External ID {identity} is already linked to variant {}",
                    existing.variant_id
                )));
            }

            if s.lock_variants(&[variant_id])?.is_empty() {
                return Ok(OperationResult::not_found(format!("Variant {variant_id} not found")));
            }
            let mapping = s.insert_external_id(variant_id, &identity, external_sku)?;
            log::info!("linked {identity} to variant {variant_id}");
            Ok(OperationResult::ok(Action::Linked, mapping))
        });
        settle(metrics.as_ref(), "link", result)
    }

    /// Remove the variant's mapping for the identity. A missing mapping is
    /// `not_found`; a mapping owned by another variant is a `conflict`.
    pub fn unlink<S: CatalogStore + ?Sized>(
        &self,
        store: &mut S,
        variant_id: i64,
        source: &str,
        source_account: &str,
        external_id: &str,
    ) -> Result<OperationResult<VariantExternalId>, VariantError> {
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!("variantguard.unlink", variant_id, source, external_id).entered();

        let Some(identity) = ExternalIdentity::normalize(source, source_account, external_id) else {
            return Ok(OperationResult::invalid("Source and external ID must not be blank"));
        };
        let metrics = self.metrics();

        let result: Result<_, VariantError> = with_savepoint(store, |s| {
            self.locks.acquire(s, &identity)?;

            let Some(existing) = s.find_external_id(&identity)? else {
                return Ok(OperationResult::not_found(format!("No mapping for {identity}")));
            };
            if existing.variant_id != variant_id {
                return Ok(OperationResult::conflict_with(format!(
                    "External ID {identity} is linked to variant {}, not {variant_id}",
                    existing.variant_id
                )));
            }
            if !s.delete_external_id(existing.id)? {
                return Ok(OperationResult::not_found(format!("No mapping for {identity}")));
            }
            log::info!("unlinked {identity} from variant {variant_id}");
            Ok(OperationResult::ok(Action::Unlinked, existing))
        });
        settle(metrics.as_ref(), "unlink", result)
    }
}
