//! Product archival.
//!
//! Archiving retires every variant of the product while the product row is
//! locked. The variant rows are locked in ascending id order, the same order
//! the bulk operations use. Variants are never deleted, so the resolver can
//! later reactivate them.

use crate::error::VariantError;
use crate::model::{Product, ProductStatus};
use crate::outcome::{Action, OperationResult};
use crate::store::{with_savepoint, CatalogStore};

#[derive(Debug, Clone, Copy, Default)]
pub struct ProductArchiver;

impl ProductArchiver {
    pub fn new() -> Self {
        Self
    }

    /// Mark the product archived and deactivate all of its variants.
    ///
    /// Archiving an archived product with no active variants is `unchanged`.
    pub fn archive<S: CatalogStore + ?Sized>(
        &self,
        store: &mut S,
        product_id: i64,
    ) -> Result<OperationResult<Product>, VariantError> {
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!("variantguard.archive", product_id).entered();

        with_savepoint(store, |s| {
            let Some(mut product) = s.lock_product(product_id)? else {
                return Ok(OperationResult::not_found(format!("Product {product_id} not found")));
            };
            let deactivated = s.deactivate_variants(product_id)?;
            if product.status == ProductStatus::Archived && deactivated == 0 {
                return Ok(OperationResult::ok(Action::Unchanged, product));
            }
            if product.status != ProductStatus::Archived {
                s.set_product_status(product_id, ProductStatus::Archived)?;
                product.status = ProductStatus::Archived;
            }
            log::info!("archived product {product_id}, deactivated {deactivated} variants");
            Ok(OperationResult::ok(Action::Archived, product))
        })
    }

    /// Return an archived product to active. Its variants stay inactive
    /// until resolved again.
    pub fn restore<S: CatalogStore + ?Sized>(
        &self,
        store: &mut S,
        product_id: i64,
    ) -> Result<OperationResult<Product>, VariantError> {
        with_savepoint(store, |s| {
            let Some(mut product) = s.lock_product(product_id)? else {
                return Ok(OperationResult::not_found(format!("Product {product_id} not found")));
            };
            if product.status == ProductStatus::Active {
                return Ok(OperationResult::ok(Action::Unchanged, product));
            }
            s.set_product_status(product_id, ProductStatus::Active)?;
            product.status = ProductStatus::Active;
            log::info!("restored product {product_id}");
            Ok(OperationResult::ok(Action::Reactivated, product))
        })
    }
}
