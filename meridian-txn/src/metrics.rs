use crate::commit::CommitType;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Per-transaction timing, frozen the moment the transaction terminates
/// (spec §4.3: "a transaction's duration freezes at commit/abort; a new
/// Start resets it").
#[derive(Debug)]
pub struct TimingStats {
    start: Instant,
    commit_start: Option<Instant>,
    end: Option<Instant>,
}

impl TimingStats {
    pub fn new() -> Self {
        TimingStats {
            start: Instant::now(),
            commit_start: None,
            end: None,
        }
    }

    pub fn mark_commit_start(&mut self) {
        if self.commit_start.is_none() {
            self.commit_start = Some(Instant::now());
        }
    }

    /// Freezes the timing at termination. Idempotent so a retried commit
    /// that eventually resolves doesn't re-freeze an already-terminated
    /// transaction.
    pub fn mark_terminated(&mut self) {
        if self.end.is_none() {
            self.end = Some(Instant::now());
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.end.is_some()
    }

    pub fn duration(&self) -> Duration {
        self.end.unwrap_or_else(Instant::now) - self.start
    }

    pub fn commit_duration(&self) -> Option<Duration> {
        self.commit_start
            .map(|cs| self.end.unwrap_or_else(Instant::now) - cs)
    }
}

impl Default for TimingStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct CommitTypeCounters {
    initiated: AtomicU64,
    successful: AtomicU64,
    successful_duration_micros: AtomicU64,
}

/// Process-wide router counters (spec §4.3). All fields are atomics so the
/// metrics object can be shared across sessions without its own mutex.
#[derive(Debug, Default)]
pub struct RouterMetrics {
    total_started: AtomicU64,
    total_committed: AtomicU64,
    total_aborted: AtomicU64,
    total_contacted_participants: AtomicU64,
    total_requests_targeted: AtomicU64,
    total_participants_at_commit: AtomicU64,

    no_shards: CommitTypeCounters,
    single_shard: CommitTypeCounters,
    read_only: CommitTypeCounters,
    single_write_shard: CommitTypeCounters,
    two_phase_commit: CommitTypeCounters,
    recover_with_token: CommitTypeCounters,
}

impl RouterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_started(&self) {
        self.total_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_participant_contacted(&self) {
        self.total_contacted_participants.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one *distinct* participant-targeting event, not a transport
    /// retry of the same event (spec §4.3).
    pub fn record_request_targeted(&self) {
        self.total_requests_targeted.fetch_add(1, Ordering::Relaxed);
    }

    /// Credited once when commit begins, never again on a retry of the same
    /// commit attempt (spec §4.3).
    pub fn record_participants_at_commit(&self, count: u64) {
        self.total_participants_at_commit.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_commit_initiated(&self, commit_type: CommitType) {
        self.counters_for(commit_type).initiated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit_successful(&self, commit_type: CommitType, duration: Duration) {
        let counters = self.counters_for(commit_type);
        counters.successful.fetch_add(1, Ordering::Relaxed);
        counters
            .successful_duration_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.total_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_aborted(&self) {
        self.total_aborted.fetch_add(1, Ordering::Relaxed);
    }

    fn counters_for(&self, commit_type: CommitType) -> &CommitTypeCounters {
        match commit_type {
            CommitType::None => &self.no_shards,
            CommitType::NoShards => &self.no_shards,
            CommitType::SingleShard => &self.single_shard,
            CommitType::ReadOnly => &self.read_only,
            CommitType::SingleWriteShard => &self.single_write_shard,
            CommitType::TwoPhaseCommit => &self.two_phase_commit,
            CommitType::RecoverWithToken => &self.recover_with_token,
        }
    }

    pub fn total_started(&self) -> u64 {
        self.total_started.load(Ordering::Relaxed)
    }
    pub fn total_committed(&self) -> u64 {
        self.total_committed.load(Ordering::Relaxed)
    }
    pub fn total_aborted(&self) -> u64 {
        self.total_aborted.load(Ordering::Relaxed)
    }
    pub fn total_contacted_participants(&self) -> u64 {
        self.total_contacted_participants.load(Ordering::Relaxed)
    }
    pub fn total_requests_targeted(&self) -> u64 {
        self.total_requests_targeted.load(Ordering::Relaxed)
    }
    pub fn total_participants_at_commit(&self) -> u64 {
        self.total_participants_at_commit.load(Ordering::Relaxed)
    }
}
