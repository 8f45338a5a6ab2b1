use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Opaque, totally-ordered cluster time. Serializes as a single 64-bit
/// timestamp on the wire (spec §3) — any internal node/counter disambiguation
/// collapses away, unlike a full Lamport-style realm time, because every
/// client of this value only ever compares or serializes it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ClusterTime(i64);

impl ClusterTime {
    pub const ZERO: ClusterTime = ClusterTime(0);

    pub fn from_raw(ts: i64) -> Self {
        ClusterTime(ts)
    }

    pub fn as_raw(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for ClusterTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A source of cluster time. Implementations must guarantee the value never
/// decreases across calls (spec §2 item 1).
pub trait ClockSource: Send + Sync {
    fn now(&self) -> ClusterTime;

    /// Folds in an observed time from elsewhere in the cluster, advancing
    /// the local clock if the observed value is ahead.
    fn observe(&self, observed: ClusterTime);
}

/// An atomically-advancing clock, monotonic under concurrent `now()`/`observe()`
/// calls from multiple session threads.
#[derive(Default)]
pub struct AtomicClock {
    raw: AtomicI64,
}

impl AtomicClock {
    pub fn new(start: ClusterTime) -> Self {
        AtomicClock {
            raw: AtomicI64::new(start.as_raw()),
        }
    }

    fn advance_to_at_least(&self, candidate: i64) -> ClusterTime {
        let mut current = self.raw.load(Ordering::SeqCst);
        loop {
            if current >= candidate {
                return ClusterTime::from_raw(current);
            }
            match self
                .raw
                .compare_exchange_weak(current, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return ClusterTime::from_raw(candidate),
                Err(actual) => current = actual,
            }
        }
    }
}

impl ClockSource for AtomicClock {
    fn now(&self) -> ClusterTime {
        self.advance_to_at_least(self.raw.load(Ordering::SeqCst) + 1)
    }

    fn observe(&self, observed: ClusterTime) {
        self.advance_to_at_least(observed.as_raw());
    }
}
