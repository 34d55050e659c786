//! Advisory locks keyed by logical identity.
//!
//! Advisory locks serialize work on an identity (for example
//! `source|account|external_id`) before any row for it exists. Keys are two
//! signed 32-bit words, as `pg_advisory_xact_lock(int4, int4)` expects:
//! the CRC-32 of the scope and the CRC-32 of the joined parts.
//!
//! Lock ordering rules shared by every service:
//! 1. advisory locks before row locks;
//! 2. multiple rows of one table in ascending id order;
//! 3. a product before any of its variants.

use crate::config::LockingConfig;
use crate::error::VariantError;
use crate::metrics::{LockMetrics, LockUsage, NoopLockMetrics};
use crate::model::ExternalIdentity;
use crate::store::CatalogStore;
use std::fmt;
use std::sync::{Arc, Once};

/// Scope shared by the feed coordinator and the admin mapping service.
pub const EXTERNAL_ID_SCOPE: &str = "variant_external_ids";

static DEGRADED_WARNING: Once = Once::new();

/// Two-word advisory lock key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey {
    pub scope: i32,
    pub key: i32,
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.scope, self.key)
    }
}

/// Reinterpret an unsigned checksum as a signed 4-byte integer.
///
/// Values at or above 2^31 wrap to negative (two's complement).
pub fn to_signed_i32(value: u32) -> i32 {
    if value >= 1 << 31 {
        (i64::from(value) - (1_i64 << 32)) as i32
    } else {
        value as i32
    }
}

fn checksum(text: &str) -> i32 {
    to_signed_i32(crc32fast::hash(text.as_bytes()))
}

fn canonical_scope(scope: &str) -> String {
    scope.trim().to_lowercase()
}

/// Deterministic key for `scope` and `parts` joined with `|`.
pub fn lock_key(scope: &str, parts: &[&str]) -> LockKey {
    let joined = parts.iter().map(|p| p.trim()).collect::<Vec<_>>().join("|");
    LockKey {
        scope: checksum(&canonical_scope(scope)),
        key: checksum(&joined),
    }
}

/// Pre-rollout key format: `source:external_id`, without the account.
pub fn legacy_external_id_key(identity: &ExternalIdentity) -> LockKey {
    LockKey {
        scope: checksum(EXTERNAL_ID_SCOPE),
        key: checksum(&format!("{}:{}", identity.source(), identity.external_id())),
    }
}

pub fn external_id_key(identity: &ExternalIdentity) -> LockKey {
    lock_key(
        EXTERNAL_ID_SCOPE,
        &[identity.source(), identity.source_account(), identity.external_id()],
    )
}

/// Acquire a transaction-scoped advisory lock on `key`.
///
/// The lock is released when the connection's transaction ends. Calling this
/// without an open transaction is a caller bug and fails with
/// [`VariantError::PreconditionFailed`]: the lock would be released before
/// it serialized anything. On stores without advisory locks this is a no-op
/// and mutual exclusion falls back to unique indexes alone.
pub fn acquire_key<S: CatalogStore + ?Sized>(store: &mut S, key: LockKey) -> Result<(), VariantError> {
    if !store.in_transaction() {
        return Err(VariantError::PreconditionFailed(format!(
            "advisory lock {key} requested outside an open transaction"
        )));
    }
    if !store.supports_advisory_locks() {
        DEGRADED_WARNING.call_once(|| {
            log::warn!("store has no advisory locks; identity serialization relies on unique indexes only");
        });
        return Ok(());
    }
    log::debug!("acquiring advisory lock {key}");
    store.advisory_xact_lock(key)?;
    Ok(())
}

/// [`acquire_key`] for `lock_key(scope, parts)`.
pub fn acquire_scoped<S: CatalogStore + ?Sized>(
    store: &mut S,
    scope: &str,
    parts: &[&str],
) -> Result<LockKey, VariantError> {
    let key = lock_key(scope, parts);
    acquire_key(store, key)?;
    Ok(key)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockPolicy {
    pub dual_lock_enabled: bool,
}

impl From<&LockingConfig> for LockPolicy {
    fn from(config: &LockingConfig) -> Self {
        Self {
            dual_lock_enabled: config.dual_lock_enabled,
        }
    }
}

/// External-identity locking shared by feed sync and admin mapping.
#[derive(Clone)]
pub struct ExternalIdLocks {
    policy: LockPolicy,
    metrics: Arc<dyn LockMetrics>,
}

impl ExternalIdLocks {
    pub fn new(policy: LockPolicy, metrics: Arc<dyn LockMetrics>) -> Self {
        Self { policy, metrics }
    }

    pub fn policy(&self) -> LockPolicy {
        self.policy
    }

    /// Keys in acquisition order: legacy first in dual mode, then current.
    pub fn keys_for(&self, identity: &ExternalIdentity) -> Vec<(LockUsage, LockKey)> {
        let mut keys = Vec::with_capacity(2);
        if self.policy.dual_lock_enabled {
            keys.push((LockUsage::Legacy, legacy_external_id_key(identity)));
        }
        keys.push((LockUsage::Current, external_id_key(identity)));
        keys
    }

    pub fn acquire<S: CatalogStore + ?Sized>(
        &self,
        store: &mut S,
        identity: &ExternalIdentity,
    ) -> Result<(), VariantError> {
        for (usage, key) in self.keys_for(identity) {
            acquire_key(store, key)?;
            self.metrics.record_lock(usage);
        }
        if self.policy.dual_lock_enabled {
            self.metrics.record_lock(LockUsage::Dual);
        }
        Ok(())
    }

    pub(crate) fn metrics(&self) -> Arc<dyn LockMetrics> {
        Arc::clone(&self.metrics)
    }
}

impl Default for ExternalIdLocks {
    fn default() -> Self {
        Self::new(LockPolicy::default(), Arc::new(NoopLockMetrics))
    }
}

impl fmt::Debug for ExternalIdLocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalIdLocks")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
