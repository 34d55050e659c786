//! Lock-usage and conflict counters.
//!
//! Services receive a [`LockMetrics`] implementation at construction time.
//! [`LockCounters`] keeps in-process totals; with the `metrics` feature
//! [`OtelLockMetrics`] forwards to the OpenTelemetry global meter.

use crate::outcome::ConflictKind;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[cfg(feature = "metrics")]
use opentelemetry::{global, metrics::Counter, KeyValue};

/// Which external-identity lock key format was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockUsage {
    /// Key without the account component (pre-rollout format)
    Legacy,
    /// `source|account|external_id` key
    Current,
    /// Both of the above in one acquisition
    Dual,
}

impl LockUsage {
    pub fn as_str(self) -> &'static str {
        match self {
            LockUsage::Legacy => "legacy",
            LockUsage::Current => "current",
            LockUsage::Dual => "dual",
        }
    }
}

pub trait LockMetrics: Send + Sync {
    fn record_lock(&self, usage: LockUsage);

    fn record_conflict(&self, kind: ConflictKind);
}

#[derive(Debug, Default)]
pub struct NoopLockMetrics;

impl LockMetrics for NoopLockMetrics {
    fn record_lock(&self, _usage: LockUsage) {}

    fn record_conflict(&self, _kind: ConflictKind) {}
}

/// Point-in-time copy of [`LockCounters`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockCountersSnapshot {
    pub legacy: u64,
    pub current: u64,
    pub dual: u64,
    pub conflicts: HashMap<ConflictKind, u64>,
}

#[derive(Debug, Default)]
pub struct LockCounters {
    legacy: AtomicU64,
    current: AtomicU64,
    dual: AtomicU64,
    conflicts: Mutex<HashMap<ConflictKind, u64>>,
}

impl LockCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> LockCountersSnapshot {
        let conflicts = match self.conflicts.lock() {
            Ok(map) => map.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        LockCountersSnapshot {
            legacy: self.legacy.load(Ordering::Relaxed),
            current: self.current.load(Ordering::Relaxed),
            dual: self.dual.load(Ordering::Relaxed),
            conflicts,
        }
    }
}

impl LockMetrics for LockCounters {
    fn record_lock(&self, usage: LockUsage) {
        let counter = match usage {
            LockUsage::Legacy => &self.legacy,
            LockUsage::Current => &self.current,
            LockUsage::Dual => &self.dual,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_conflict(&self, kind: ConflictKind) {
        let mut map = match self.conflicts.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        *map.entry(kind).or_insert(0) += 1;
    }
}

#[cfg(feature = "metrics")]
pub struct OtelLockMetrics {
    locks_total: Counter<u64>,
    conflicts_total: Counter<u64>,
}

#[cfg(feature = "metrics")]
impl OtelLockMetrics {
    pub fn init() -> Self {
        let meter = global::meter("variantguard");

        let locks_total = meter
            .u64_counter("variantguard_advisory_locks_total")
            .with_description("External-identity advisory locks acquired, by key format")
            .build();

        let conflicts_total = meter
            .u64_counter("variantguard_conflicts_total")
            .with_description("Uniqueness conflicts returned to callers, by kind")
            .build();

        Self {
            locks_total,
            conflicts_total,
        }
    }
}

#[cfg(feature = "metrics")]
impl LockMetrics for OtelLockMetrics {
    fn record_lock(&self, usage: LockUsage) {
        self.locks_total
            .add(1, &[KeyValue::new("format", usage.as_str())]);
    }

    fn record_conflict(&self, kind: ConflictKind) {
        self.conflicts_total
            .add(1, &[KeyValue::new("kind", kind.as_str())]);
    }
}
