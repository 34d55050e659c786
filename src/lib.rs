//! # Variantguard
//!
//! Variant identity resolution and lock-ordered concurrency control for
//! PostgreSQL product catalogs on the `may` runtime.
//!
//! Every mutating service runs in a savepoint of the caller's transaction
//! (or a fresh one) and answers with an [`outcome::OperationResult`] tagged
//! by [`outcome::Action`]. Lock ordering across services:
//!
//! 1. advisory locks before row locks;
//! 2. several rows of one table in ascending id order;
//! 3. a product before any of its variants.
//!
//! ```
//! use rust_decimal::Decimal;
//! use variantguard::model::VariantAttributes;
//! use variantguard::outcome::Action;
//! use variantguard::store::MemoryCatalogStore;
//! use variantguard::VariantIdentityResolver;
//!
//! let mut store = MemoryCatalogStore::new();
//! let product = store.seed_product("Tee", Some(Decimal::new(1999, 2)));
//! let color = store.seed_option_type("Color");
//! let red = store.seed_option_value(color.id, "Red");
//! store.enable_option_type(product.id, color.id);
//!
//! let attrs = VariantAttributes { sku: Some("TEE-RED".into()), ..Default::default() };
//! let result = VariantIdentityResolver::default()
//!     .resolve(&mut store, product.id, [red.id], &attrs)
//!     .unwrap();
//! assert_eq!(result.action, Action::Created);
//! ```

pub mod bulk;
pub mod config;
pub mod connection;
pub mod digest;
pub mod error;
pub mod executor;
pub mod feed_sync;
pub mod ids;
pub mod lock;
pub mod mapping;
pub mod metrics;
pub mod model;
pub mod options_updater;
pub mod outcome;
pub mod product;
pub mod resolver;
pub mod schema;
pub mod selection;
pub mod store;
pub mod transaction;

pub use bulk::BulkMutationService;
pub use config::VariantguardConfig;
pub use error::VariantError;
pub use feed_sync::{ExternalFeedSyncCoordinator, FeedItem};
pub use lock::{ExternalIdLocks, LockPolicy};
pub use mapping::AdminMappingService;
pub use options_updater::VariantOptionsUpdater;
pub use outcome::{Action, ConflictKind, OperationResult};
pub use product::ProductArchiver;
pub use resolver::VariantIdentityResolver;
pub use store::{CatalogStore, MemoryCatalogStore, PgCatalogStore};
