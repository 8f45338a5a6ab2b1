use crate::majority::MajorityCommittedChecker;
use crate::state::State;
use futures::future::BoxFuture;
use meridian_base::{fatal, OpTime, RouterError};
use meridian_net::{race, race_with_deadline, CancellationToken, ClusterTime, RaceOutcome};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

const MAJORITY_WAIT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAJORITY_WAIT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Majority-wait retry timing (spec §4.1), overridable from
/// `meridian::Config` (spec §4.8) rather than hardcoded at the call site.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            initial: MAJORITY_WAIT_INITIAL_BACKOFF,
            max: MAJORITY_WAIT_MAX_BACKOFF,
        }
    }
}

struct Inner {
    state: State,
    block_timestamp: Option<ClusterTime>,
    commit_or_abort_op_time: Option<OpTime>,
}

#[derive(Clone, Copy, Debug)]
enum Outcome {
    Commit,
    Abort,
}

/// Per-tenant write/read gate during a live migration hand-off (spec §4.1).
/// Always held behind `Arc` — the background majority-wait task keeps a
/// [`std::sync::Weak`] back-reference to it rather than owning it outright
/// (spec §9 design note on the blocker/continuation cycle).
pub struct AccessBlocker {
    tenant_id: String,
    recipient_conn_string: String,
    inner: Mutex<Inner>,
    notify: Notify,
    completion: watch::Sender<Option<Result<(), RouterError>>>,
    shutdown: CancellationToken,
    checker: Arc<dyn MajorityCommittedChecker>,
    backoff: BackoffPolicy,
}

impl AccessBlocker {
    pub fn new(
        tenant_id: impl Into<String>,
        recipient_conn_string: impl Into<String>,
        checker: Arc<dyn MajorityCommittedChecker>,
    ) -> Arc<Self> {
        Self::with_backoff_policy(tenant_id, recipient_conn_string, checker, BackoffPolicy::default())
    }

    pub fn with_backoff_policy(
        tenant_id: impl Into<String>,
        recipient_conn_string: impl Into<String>,
        checker: Arc<dyn MajorityCommittedChecker>,
        backoff: BackoffPolicy,
    ) -> Arc<Self> {
        let (tx, _rx) = watch::channel(None);
        Arc::new(AccessBlocker {
            tenant_id: tenant_id.into(),
            recipient_conn_string: recipient_conn_string.into(),
            inner: Mutex::new(Inner {
                state: State::Allow,
                block_timestamp: None,
                commit_or_abort_op_time: None,
            }),
            notify: Notify::new(),
            completion: tx,
            shutdown: CancellationToken::new(),
            checker,
            backoff,
        })
    }

    /// Reconstructs a blocker directly in a recovered state (spec §6
    /// recovery path), bypassing the live-transition guards in
    /// [`Self::start_blocking_writes`] and friends since the donor state
    /// document has already been validated by the caller.
    pub(crate) fn from_recovered_state(
        tenant_id: impl Into<String>,
        recipient_conn_string: impl Into<String>,
        checker: Arc<dyn MajorityCommittedChecker>,
        state: State,
        block_timestamp: Option<ClusterTime>,
        commit_or_abort_op_time: Option<OpTime>,
        backoff: BackoffPolicy,
    ) -> Arc<Self> {
        let tenant_id = tenant_id.into();
        let recipient_conn_string = recipient_conn_string.into();
        let completion_seed = match state {
            State::Reject => Some(Err(RouterError::TenantMigrationCommitted {
                tenant_id: tenant_id.clone(),
                recipient_conn_string: recipient_conn_string.clone(),
            })),
            State::Aborted => Some(Ok(())),
            _ => None,
        };
        let (tx, _rx) = watch::channel(completion_seed);
        Arc::new(AccessBlocker {
            tenant_id,
            recipient_conn_string,
            inner: Mutex::new(Inner {
                state,
                block_timestamp,
                commit_or_abort_op_time,
            }),
            notify: Notify::new(),
            completion: tx,
            shutdown: CancellationToken::new(),
            checker,
            backoff,
        })
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn recipient_conn_string(&self) -> &str {
        &self.recipient_conn_string
    }

    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    pub fn block_timestamp(&self) -> Option<ClusterTime> {
        self.inner.lock().block_timestamp
    }

    /// Synchronous write gate (spec §4.1 `checkCanWriteOrFail`). A
    /// `BlockWrites*` state surfaces `TenantMigrationConflict`, an internal
    /// signal the routing node catches to wait on [`Self::wait_until_committed_or_aborted`]
    /// before retrying the write, never meant to reach a client directly
    /// (spec §7).
    pub fn check_can_write_or_fail(&self) -> Result<(), RouterError> {
        match self.state() {
            State::Allow | State::Aborted => Ok(()),
            State::BlockWrites | State::BlockWritesAndReads => Err(RouterError::TenantMigrationConflict {
                tenant_id: self.tenant_id.clone(),
            }),
            State::Reject => Err(RouterError::TenantMigrationCommitted {
                tenant_id: self.tenant_id.clone(),
                recipient_conn_string: self.recipient_conn_string.clone(),
            }),
        }
    }

    /// Synchronous linearizable-read gate (spec §4.1
    /// `checkLinearizableReadOrFail`): bypasses `BlockWritesAndReads` because
    /// a linearizable read has not yet chosen a snapshot.
    pub fn check_linearizable_read_or_fail(&self) -> Result<(), RouterError> {
        if self.state() == State::Reject {
            Err(RouterError::TenantMigrationCommitted {
                tenant_id: self.tenant_id.clone(),
                recipient_conn_string: self.recipient_conn_string.clone(),
            })
        } else {
            Ok(())
        }
    }

    /// Async read gate (spec §4.1 `canReadOrWaitFuture`). Immediately ready
    /// in `Allow`/`Aborted`, or when `read_timestamp` is absent or strictly
    /// before `BlockTimestamp`. Otherwise waits for the blocker to leave
    /// `BlockWritesAndReads`, re-checking the predicate on every wake since a
    /// notifier wake can be spurious relative to any one waiter (spec §5).
    pub async fn can_read_or_wait(
        &self,
        read_timestamp: Option<ClusterTime>,
        caller_token: CancellationToken,
    ) -> Result<(), RouterError> {
        loop {
            let wait_handle = {
                let guard = self.inner.lock();
                match guard.state {
                    State::Allow | State::Aborted | State::BlockWrites => return Ok(()),
                    State::Reject => {
                        return Err(RouterError::TenantMigrationCommitted {
                            tenant_id: self.tenant_id.clone(),
                            recipient_conn_string: self.recipient_conn_string.clone(),
                        })
                    }
                    State::BlockWritesAndReads => {
                        let admitted = match (read_timestamp, guard.block_timestamp) {
                            (None, _) => true,
                            (Some(ts), Some(block_ts)) => ts < block_ts,
                            (Some(_), None) => fatal("BlockWritesAndReads with no block timestamp"),
                        };
                        if admitted {
                            return Ok(());
                        }
                        self.notify.notified()
                    }
                }
            };
            let branches: Vec<BoxFuture<'_, u8>> = vec![
                Box::pin(async {
                    self.shutdown.cancelled().await;
                    0u8
                }),
                Box::pin(async {
                    caller_token.cancelled().await;
                    1u8
                }),
                Box::pin(async {
                    wait_handle.await;
                    2u8
                }),
            ];
            let (_, which) = race(branches).await;
            if which != 2 {
                return Err(RouterError::BlockerShuttingDown);
            }
        }
    }

    /// `Allow -> BlockWrites` (spec §4.1 `startBlockingWrites`).
    pub fn start_blocking_writes(&self) {
        let mut guard = self.inner.lock();
        if guard.state != State::Allow {
            fatal(format!("startBlockingWrites called from state {}", guard.state));
        }
        guard.state = State::BlockWrites;
        drop(guard);
        self.log_transition(State::BlockWrites);
        self.notify.notify_waiters();
    }

    /// `BlockWrites -> BlockWritesAndReads` (spec §4.1
    /// `startBlockingReadsAfter`).
    pub fn start_blocking_reads_after(&self, ts: ClusterTime) {
        let mut guard = self.inner.lock();
        if guard.state != State::BlockWrites {
            fatal(format!("startBlockingReadsAfter called from state {}", guard.state));
        }
        guard.state = State::BlockWritesAndReads;
        guard.block_timestamp = Some(ts);
        drop(guard);
        self.log_transition(State::BlockWritesAndReads);
        self.notify.notify_waiters();
    }

    /// Any `BlockWrites*` -> `Allow` (spec §4.1 `rollBackStartBlocking`).
    pub fn roll_back_start_blocking(&self) {
        let mut guard = self.inner.lock();
        if !matches!(guard.state, State::BlockWrites | State::BlockWritesAndReads) {
            fatal(format!("rollBackStartBlocking called from state {}", guard.state));
        }
        guard.state = State::Allow;
        guard.block_timestamp = None;
        drop(guard);
        self.log_transition(State::Allow);
        self.notify.notify_waiters();
    }

    /// Records `op_time` and, once it is majority-committed, transitions
    /// `BlockWritesAndReads -> Reject` and breaks the completion promise
    /// with the redirect error (spec §4.1 `commit`).
    pub fn commit(self: &Arc<Self>, op_time: OpTime) {
        {
            let mut guard = self.inner.lock();
            if guard.state != State::BlockWritesAndReads {
                fatal(format!("commit called from state {}", guard.state));
            }
            guard.commit_or_abort_op_time = Some(op_time);
        }
        self.spawn_majority_wait(op_time, Outcome::Commit);
    }

    /// Records `op_time` and, once it is majority-committed, transitions to
    /// `Aborted` and fulfils the completion promise with success (spec §4.1
    /// `abort`). Callable from `Allow` (pure abort path) as well as the
    /// blocking states.
    pub fn abort(self: &Arc<Self>, op_time: OpTime) {
        {
            let mut guard = self.inner.lock();
            if guard.state.is_terminal() {
                fatal(format!("abort called from terminal state {}", guard.state));
            }
            guard.commit_or_abort_op_time = Some(op_time);
        }
        self.spawn_majority_wait(op_time, Outcome::Abort);
    }

    fn spawn_majority_wait(self: &Arc<Self>, op_time: OpTime, outcome: Outcome) {
        let weak = Arc::downgrade(self);
        let checker = self.checker.clone();
        let shutdown = self.shutdown.clone();
        let policy = self.backoff;
        tokio::spawn(async move {
            let mut backoff = policy.initial;
            loop {
                if shutdown.is_cancelled() {
                    return;
                }
                if checker.is_majority_committed(&op_time).await {
                    if let Some(blocker) = weak.upgrade() {
                        blocker.complete_majority_wait(outcome);
                    }
                    return;
                }
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(policy.max);
                if weak.upgrade().is_none() {
                    return;
                }
            }
        });
    }

    fn complete_majority_wait(&self, outcome: Outcome) {
        let new_state = {
            let mut guard = self.inner.lock();
            match outcome {
                Outcome::Commit if guard.state == State::BlockWritesAndReads => {
                    guard.state = State::Reject;
                    Some(State::Reject)
                }
                Outcome::Abort if !guard.state.is_terminal() => {
                    guard.state = State::Aborted;
                    Some(State::Aborted)
                }
                _ => None,
            }
        };
        let Some(new_state) = new_state else { return };
        self.log_transition(new_state);
        let result = match outcome {
            Outcome::Commit => Err(RouterError::TenantMigrationCommitted {
                tenant_id: self.tenant_id.clone(),
                recipient_conn_string: self.recipient_conn_string.clone(),
            }),
            Outcome::Abort => Ok(()),
        };
        let _ = self.completion.send(Some(result));
        self.notify.notify_waiters();
    }

    /// Blocks until the completion promise settles or `deadline` elapses
    /// (spec §4.1 `waitUntilCommittedOrAborted`). A timeout surfaces without
    /// disturbing blocker state.
    pub async fn wait_until_committed_or_aborted(&self, deadline: Duration) -> Result<(), RouterError> {
        let mut rx = self.completion.subscribe();
        if let Some(result) = rx.borrow().clone() {
            return result;
        }
        let wait: BoxFuture<'_, Option<Result<(), RouterError>>> = Box::pin(async move {
            loop {
                if rx.changed().await.is_err() {
                    return None;
                }
                if let Some(result) = rx.borrow().clone() {
                    return Some(result);
                }
            }
        });
        match race_with_deadline(wait, deadline, CancellationToken::new()).await {
            RaceOutcome::Settled(Some(result)) => result,
            RaceOutcome::Settled(None) => Err(RouterError::BlockerShuttingDown),
            RaceOutcome::TimedOut => Err(RouterError::ExceededTimeLimit),
            RaceOutcome::Cancelled => Err(RouterError::BlockerShuttingDown),
        }
    }

    /// Cancels the background majority wait and breaks the completion
    /// promise for anyone still waiting, without touching `State` (spec §5:
    /// "blocker shutdown cancels its internal waits but leaves outstanding
    /// external waits to observe `BlockerShuttingDown`").
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let _ = self.completion.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(Err(RouterError::BlockerShuttingDown));
                true
            } else {
                false
            }
        });
        self.notify.notify_waiters();
    }

    /// Read-only diagnostic snapshot (spec §4.1 `appendServerStatus`).
    pub fn server_status(&self) -> BlockerStatus {
        let guard = self.inner.lock();
        BlockerStatus {
            tenant_id: self.tenant_id.clone(),
            state: guard.state,
            block_timestamp: guard.block_timestamp,
            commit_or_abort_op_time: guard.commit_or_abort_op_time,
        }
    }

    fn log_transition(&self, new_state: State) {
        tracing::info!(
            target: "meridian::migrate",
            tenant_id = %self.tenant_id,
            new_state = %new_state,
            "tenant migration blocker transitioned",
        );
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockerStatus {
    pub tenant_id: String,
    pub state: State,
    pub block_timestamp: Option<ClusterTime>,
    pub commit_or_abort_op_time: Option<OpTime>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::majority::ThresholdChecker;

    fn blocker() -> (Arc<AccessBlocker>, Arc<ThresholdChecker>) {
        let checker = Arc::new(ThresholdChecker::new());
        let blocker = AccessBlocker::new("tenantA", "recipient.example:27017", checker.clone());
        (blocker, checker)
    }

    #[test]
    fn write_is_allowed_then_must_block_then_must_redirect() {
        let (blocker, _checker) = blocker();
        assert!(blocker.check_can_write_or_fail().is_ok());
        blocker.start_blocking_writes();
        assert!(matches!(
            blocker.check_can_write_or_fail(),
            Err(RouterError::TenantMigrationConflict { .. })
        ));
        blocker.start_blocking_reads_after(ClusterTime::from_raw(100));
        assert!(matches!(
            blocker.check_can_write_or_fail(),
            Err(RouterError::TenantMigrationConflict { .. })
        ));
    }

    #[test]
    fn rollback_returns_to_allow_and_clears_block_timestamp() {
        let (blocker, _checker) = blocker();
        blocker.start_blocking_writes();
        blocker.start_blocking_reads_after(ClusterTime::from_raw(100));
        blocker.roll_back_start_blocking();
        assert_eq!(blocker.state(), State::Allow);
        assert_eq!(blocker.block_timestamp(), None);
    }

    #[tokio::test]
    async fn read_before_block_timestamp_is_admitted_immediately() {
        let (blocker, _checker) = blocker();
        blocker.start_blocking_writes();
        blocker.start_blocking_reads_after(ClusterTime::from_raw(100));
        let result = blocker
            .can_read_or_wait(Some(ClusterTime::from_raw(50)), CancellationToken::new())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn read_after_block_timestamp_waits_then_sees_commit_redirect() {
        let (blocker, checker) = blocker();
        blocker.start_blocking_writes();
        blocker.start_blocking_reads_after(ClusterTime::from_raw(100));

        let waiter = {
            let blocker = blocker.clone();
            tokio::spawn(async move {
                blocker
                    .can_read_or_wait(Some(ClusterTime::from_raw(150)), CancellationToken::new())
                    .await
            })
        };

        tokio::task::yield_now().await;
        let op_time = OpTime::new(1, 1);
        blocker.commit(op_time);
        checker.advance_to(op_time);

        let result = waiter.await.unwrap();
        assert_eq!(
            result,
            Err(RouterError::TenantMigrationCommitted {
                tenant_id: "tenantA".to_string(),
                recipient_conn_string: "recipient.example:27017".to_string(),
            })
        );
        assert_eq!(blocker.state(), State::Reject);
    }

    #[tokio::test]
    async fn abort_fulfils_completion_promise_with_success() {
        let (blocker, checker) = blocker();
        blocker.start_blocking_writes();
        let op_time = OpTime::new(1, 1);
        blocker.abort(op_time);
        checker.advance_to(op_time);

        let result = blocker.wait_until_committed_or_aborted(Duration::from_secs(5)).await;
        assert_eq!(result, Ok(()));
        assert_eq!(blocker.state(), State::Aborted);
    }

    #[tokio::test]
    async fn shutdown_while_waiting_surfaces_blocker_shutting_down() {
        let (blocker, _checker) = blocker();
        blocker.start_blocking_writes();
        blocker.shutdown();
        let result = blocker.wait_until_committed_or_aborted(Duration::from_secs(5)).await;
        assert_eq!(result, Err(RouterError::BlockerShuttingDown));
    }

    #[tokio::test]
    async fn wait_until_committed_times_out_without_mutating_state() {
        let (blocker, _checker) = blocker();
        blocker.start_blocking_writes();
        let result = blocker.wait_until_committed_or_aborted(Duration::from_millis(10)).await;
        assert_eq!(result, Err(RouterError::ExceededTimeLimit));
        assert_eq!(blocker.state(), State::BlockWrites);
    }
}
