use crate::commit::{self, CommitType};
use crate::metrics::{RouterMetrics, TimingStats};
use crate::participant::Participant;
use crate::read_concern::{ReadConcern, ReadConcernLevel};
use meridian_base::{fatal, RecoveryToken, RouterError, ShardId};
use futures::future::BoxFuture;
use meridian_net::{
    race_with_deadline, CancellationToken, Command, CommandBody, CommandResponse, ClockSource, ClusterTime,
    ExecutorError, RaceOutcome, RemoteExecutor, TransportError, WriteConcern,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const ADMIN_DB: &str = "admin";
const DEFAULT_ABORT_RETRIES: u32 = 3;
const DEFAULT_SLOW_TXN_THRESHOLD: Duration = Duration::from_millis(100);
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// The three forms a statement can take against an in-flight (or not yet
/// started) transaction (spec §4.2 `beginOrContinue`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxnAction {
    Start,
    Continue,
    Commit,
}

/// Per-session router state. One instance lives for the lifetime of a single
/// client transaction; a new `TxnAction::Start` resets it in place rather
/// than allocating a new one.
pub struct TransactionRouter<E: RemoteExecutor> {
    txn_number: Option<i64>,
    latest_stmt_id: u64,
    participants: BTreeMap<ShardId, Participant>,
    coordinator_id: Option<ShardId>,
    recovery_shard_id: Option<ShardId>,
    at_cluster_time: Option<ClusterTime>,
    at_cluster_time_chosen_at_stmt: Option<u64>,
    read_concern: Option<ReadConcern>,
    commit_type: CommitType,
    termination_initiated: bool,
    metrics_recorded_at_commit: bool,
    timing: TimingStats,
    executor: Arc<E>,
    clock: Arc<dyn ClockSource>,
    metrics: Arc<RouterMetrics>,
    abort_retries: u32,
    slow_txn_threshold: Duration,
    call_timeout: Duration,
    write_concern: Option<WriteConcern>,
}

impl<E: RemoteExecutor> TransactionRouter<E> {
    pub fn new(executor: Arc<E>, clock: Arc<dyn ClockSource>, metrics: Arc<RouterMetrics>) -> Self {
        TransactionRouter {
            txn_number: None,
            latest_stmt_id: 0,
            participants: BTreeMap::new(),
            coordinator_id: None,
            recovery_shard_id: None,
            at_cluster_time: None,
            at_cluster_time_chosen_at_stmt: None,
            read_concern: None,
            commit_type: CommitType::None,
            termination_initiated: false,
            metrics_recorded_at_commit: false,
            timing: TimingStats::new(),
            executor,
            clock,
            metrics,
            abort_retries: DEFAULT_ABORT_RETRIES,
            slow_txn_threshold: DEFAULT_SLOW_TXN_THRESHOLD,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            write_concern: None,
        }
    }

    /// Sets the write concern the client supplied on `commitTransaction` /
    /// `abortTransaction`, forwarded unchanged to every participant (spec
    /// §4.4).
    pub fn set_write_concern(&mut self, write_concern: Option<WriteConcern>) {
        self.write_concern = write_concern;
    }

    pub fn with_slow_txn_threshold(mut self, threshold: Duration) -> Self {
        self.slow_txn_threshold = threshold;
        self
    }

    pub fn with_abort_retries(mut self, retries: u32) -> Self {
        self.abort_retries = retries;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn txn_number(&self) -> Option<i64> {
        self.txn_number
    }

    pub fn latest_stmt_id(&self) -> u64 {
        self.latest_stmt_id
    }

    pub fn participants(&self) -> &BTreeMap<ShardId, Participant> {
        &self.participants
    }

    pub fn commit_type(&self) -> CommitType {
        self.commit_type
    }

    /// Admits a statement into the router, per spec §4.2's three-way
    /// dispatch on `action`.
    pub fn begin_or_continue(
        &mut self,
        txn_number: i64,
        action: TxnAction,
        requested_read_concern: Option<ReadConcernLevel>,
    ) -> Result<(), RouterError> {
        match action {
            TxnAction::Start => {
                if let Some(current) = self.txn_number {
                    if txn_number <= current {
                        fatal(format!(
                            "Start with txnNumber {txn_number} does not exceed in-progress {current}"
                        ));
                    }
                    if !self.timing.is_terminated() {
                        tracing::warn!(
                            target: "meridian",
                            abandoned_txn_number = current,
                            new_txn_number = txn_number,
                            "starting a new transaction before the previous one ever committed or aborted",
                        );
                    }
                }
                *self = TransactionRouter {
                    txn_number: Some(txn_number),
                    latest_stmt_id: 0,
                    participants: BTreeMap::new(),
                    coordinator_id: None,
                    recovery_shard_id: None,
                    at_cluster_time: None,
                    at_cluster_time_chosen_at_stmt: None,
                    read_concern: Some(ReadConcern::new(requested_read_concern.unwrap_or(ReadConcernLevel::Local))),
                    commit_type: CommitType::None,
                    termination_initiated: false,
                    metrics_recorded_at_commit: false,
                    timing: TimingStats::new(),
                    executor: self.executor.clone(),
                    clock: self.clock.clone(),
                    metrics: self.metrics.clone(),
                    abort_retries: self.abort_retries,
                    slow_txn_threshold: self.slow_txn_threshold,
                    call_timeout: self.call_timeout,
                    write_concern: None,
                };
                self.metrics.record_started();
                Ok(())
            }
            TxnAction::Continue => {
                self.require_matching_txn_number(txn_number)?;
                if let (Some(requested), Some(current)) = (requested_read_concern, &self.read_concern) {
                    if requested != current.level {
                        return Err(RouterError::NoSuchTransaction);
                    }
                }
                self.latest_stmt_id += 1;
                Ok(())
            }
            TxnAction::Commit => self.require_matching_txn_number(txn_number),
        }
    }

    fn require_matching_txn_number(&self, txn_number: i64) -> Result<(), RouterError> {
        match self.txn_number {
            Some(current) if current == txn_number => Ok(()),
            _ => Err(RouterError::NoSuchTransaction),
        }
    }

    /// Selects `AtClusterTime` for a `snapshot` read concern the first time
    /// it's needed within a statement, and freezes it once a later statement
    /// has begun (spec §4.2).
    pub fn set_default_at_cluster_time(&mut self) {
        let level = match &self.read_concern {
            Some(rc) => rc.level,
            None => return,
        };
        if level != ReadConcernLevel::Snapshot {
            return;
        }
        match self.at_cluster_time_chosen_at_stmt {
            None => {
                self.at_cluster_time = Some(self.clock.now());
                self.at_cluster_time_chosen_at_stmt = Some(self.latest_stmt_id);
            }
            Some(chosen_at) if chosen_at == self.latest_stmt_id => {
                self.at_cluster_time = Some(self.clock.now());
            }
            Some(_) => {}
        }
    }

    /// Stamps a command bound for `shard` with the transaction-scoped fields
    /// a participant needs (spec §4.2). Mutates router-side bookkeeping the
    /// first time a given shard is contacted.
    pub fn attach_txn_fields_if_needed(&mut self, shard: &ShardId, mut body: CommandBody) -> CommandBody {
        let txn_number = self
            .txn_number
            .unwrap_or_else(|| fatal("attach_txn_fields_if_needed called without an active transaction"));
        let read_concern = self
            .read_concern
            .clone()
            .unwrap_or_else(|| fatal("attach_txn_fields_if_needed called before a read concern was seeded"));

        if let Some(existing) = body.get("txnNumber") {
            if existing.as_i64() != Some(txn_number) {
                fatal(format!(
                    "txnNumber mismatch: body carries {existing:?}, transaction is {txn_number}"
                ));
            }
        }

        if let Some(existing_rc) = body.get("readConcern").cloned() {
            let existing_level = existing_rc.get("level").and_then(Value::as_str);
            if let Some(existing_level) = existing_level {
                if existing_level != read_concern.level.as_str() {
                    fatal(format!(
                        "readConcern level mismatch: body carries {existing_level}, transaction is {}",
                        read_concern.level.as_str()
                    ));
                }
            }
            let mut merged = existing_rc.as_object().cloned().unwrap_or_default();
            merged.insert("level".into(), json!(read_concern.level.as_str()));
            if let Some(act) = self.at_cluster_time {
                merged.insert("atClusterTime".into(), json!(act.as_raw()));
            }
            body.0.insert("readConcern".into(), Value::Object(merged));
        }

        let is_new = !self.participants.contains_key(shard);
        if is_new {
            let is_coordinator = self.participants.is_empty();
            let participant = Participant::new(shard.clone(), self.latest_stmt_id, is_coordinator, read_concern.level);
            self.participants.insert(shard.clone(), participant);
            if is_coordinator {
                self.coordinator_id = Some(shard.clone());
            }
            self.metrics.record_participant_contacted();
        }
        self.metrics.record_request_targeted();

        let is_coordinator = self.participants.get(shard).expect("just inserted").is_coordinator;

        body.insert("txnNumber", txn_number);
        body.insert("autocommit", false);
        if is_coordinator {
            body.insert("coordinator", true);
        }

        if is_new {
            body.insert("startTransaction", true);
            if !body.contains_key("readConcern") {
                let mut rc_obj = serde_json::Map::new();
                rc_obj.insert("level".into(), json!(read_concern.level.as_str()));
                if let Some(act) = self.at_cluster_time {
                    rc_obj.insert("atClusterTime".into(), json!(act.as_raw()));
                }
                body.0.insert("readConcern".into(), Value::Object(rc_obj));
            }
        }

        body
    }

    /// Folds a participant's response into its read/write classification
    /// (spec §4.2). Ignored once termination has begun. Classifying a
    /// participant on a later statement after it already returned a
    /// non-`ok` response is a protocol violation (fatal).
    pub fn process_participant_response(&mut self, shard: &ShardId, response: &CommandResponse) {
        if self.termination_initiated {
            return;
        }
        let latest_stmt_id = self.latest_stmt_id;
        let participant = self
            .participants
            .get_mut(shard)
            .unwrap_or_else(|| fatal(format!("response from untracked participant {shard}")));

        if let Some(failed_at) = participant.failed_at_stmt {
            if latest_stmt_id > failed_at {
                fatal(format!(
                    "participant {shard} reclassified on stmt {latest_stmt_id} after failing on stmt {failed_at}"
                ));
            }
        }

        if !response.ok {
            participant.failed_at_stmt = Some(latest_stmt_id);
            return;
        }

        if let Some(read_only) = response.read_only() {
            if participant.observe_read_only(read_only).is_err() {
                fatal(format!(
                    "participant {shard} regressed from not-read-only to read-only"
                ));
            }
            if !read_only && self.recovery_shard_id.is_none() {
                self.recovery_shard_id = Some(shard.clone());
            }
        }
    }

    pub fn can_continue_on_snapshot_error(&self) -> bool {
        self.latest_stmt_id == 0
    }

    pub fn can_continue_on_stale_shard_or_db_error(&self, is_write_command: bool) -> bool {
        self.latest_stmt_id == 0 || !is_write_command
    }

    /// A snapshot-establishment failure on the first statement: discard every
    /// participant and let a later statement choose a fresh `AtClusterTime`
    /// (spec §4.2).
    pub async fn on_snapshot_error(&mut self) -> Result<(), RouterError> {
        if !self.can_continue_on_snapshot_error() {
            return Err(RouterError::NoSuchTransaction);
        }
        let shards: Vec<ShardId> = self.participants.keys().cloned().collect();
        self.best_effort_abort(&shards).await;
        self.participants.clear();
        self.coordinator_id = None;
        self.recovery_shard_id = None;
        self.at_cluster_time = None;
        self.at_cluster_time_chosen_at_stmt = None;
        Ok(())
    }

    /// A stale shard-version or stale-database error: evict only the
    /// participants this statement is the first to have contacted, leaving
    /// earlier-confirmed participants alone (spec §4.2).
    pub async fn on_stale_shard_or_db_error(&mut self, is_write_command: bool) -> Result<(), RouterError> {
        if !self.can_continue_on_stale_shard_or_db_error(is_write_command) {
            return Err(RouterError::NoSuchTransaction);
        }
        self.evict_pending_participants().await;
        Ok(())
    }

    /// A view-resolution error is always retryable and always only evicts
    /// the pending participants of the current statement (spec §4.2).
    pub async fn on_view_resolution_error(&mut self) {
        self.evict_pending_participants().await;
    }

    async fn evict_pending_participants(&mut self) {
        let pending: Vec<ShardId> = self
            .participants
            .iter()
            .filter(|(_, p)| p.is_pending(self.latest_stmt_id))
            .map(|(s, _)| s.clone())
            .collect();
        self.best_effort_abort(&pending).await;
        for s in &pending {
            if Some(s) == self.coordinator_id.as_ref() {
                self.coordinator_id = None;
            }
            if Some(s) == self.recovery_shard_id.as_ref() {
                self.recovery_shard_id = None;
            }
            self.participants.remove(s);
        }
    }

    /// Bounds a single remote call to `call_timeout` (spec §4.8), sharing the
    /// same deadline-race combinator the migration blocker uses for its own
    /// waits (spec §9's "one `when-any` combinator" note).
    async fn send_with_timeout(&self, shard: &ShardId, command: Command) -> Result<CommandResponse, ExecutorError> {
        call_with_timeout(self.executor.clone(), shard.clone(), command, self.call_timeout).await
    }

    /// Best-effort abort of a set of shards: errors are swallowed, a
    /// `NoSuchTransaction` response counts as success, and each attempt gets
    /// a bounded number of retries (spec §4.2).
    async fn best_effort_abort(&self, shards: &[ShardId]) {
        let txn_number = match self.txn_number {
            Some(n) => n,
            None => return,
        };
        let abort_retries = self.abort_retries;
        let call_timeout = self.call_timeout;
        let futures = shards.iter().map(|shard| {
            let shard = shard.clone();
            let executor = self.executor.clone();
            async move {
                for _ in 0..=abort_retries {
                    let mut body = CommandBody::new();
                    body.insert("abortTransaction", true);
                    body.insert("txnNumber", txn_number);
                    body.insert("autocommit", false);
                    let command = Command::new("abortTransaction", ADMIN_DB, body);
                    match call_with_timeout(executor.clone(), shard.clone(), command, call_timeout).await {
                        Ok(resp) if resp.ok || resp.is_no_such_transaction() => return,
                        Ok(_) => return,
                        Err(ExecutorError::Transport(t)) if t.retryable => continue,
                        Err(_) => return,
                    }
                }
            }
        });
        futures::future::join_all(futures).await;
    }

    /// Runs the commit path chosen by [`commit::choose_commit_type`] (spec
    /// §4.2). Metrics for the commit attempt are credited exactly once, even
    /// across an unknown-result retry that calls this again with the same
    /// state.
    pub async fn commit_transaction(&mut self, recovery_token: Option<RecoveryToken>) -> Result<(), RouterError> {
        self.timing.mark_commit_start();
        let (commit_type, recover_target) =
            commit::choose_commit_type(&self.participants, recovery_token.as_ref(), self.recovery_shard_id.as_ref())?;
        self.commit_type = commit_type;
        self.termination_initiated = true;

        if !self.metrics_recorded_at_commit {
            self.metrics.record_commit_initiated(commit_type);
            if commit_type == CommitType::RecoverWithToken {
                self.metrics.record_request_targeted();
            } else {
                self.metrics.record_participants_at_commit(self.participants.len() as u64);
            }
            self.metrics_recorded_at_commit = true;
        }

        let result = self.dispatch_commit(commit_type, recover_target).await;

        if result.is_ok() {
            self.timing.mark_terminated();
            let duration = self.timing.commit_duration().unwrap_or_default();
            self.metrics.record_commit_successful(commit_type, duration);
            self.log_if_slow();
        }

        result
    }

    async fn dispatch_commit(
        &self,
        commit_type: CommitType,
        recover_target: Option<ShardId>,
    ) -> Result<(), RouterError> {
        match commit_type {
            CommitType::None => unreachable!("choose_commit_type never returns None"),
            CommitType::NoShards => Ok(()),
            CommitType::SingleShard => {
                let shard = self.participants.keys().next().expect("single shard commit needs one participant").clone();
                self.send_commit(&shard).await
            }
            CommitType::ReadOnly => {
                let shards: Vec<ShardId> = self.participants.keys().cloned().collect();
                self.send_commit_parallel(&shards).await
            }
            CommitType::SingleWriteShard => {
                let (read_shards, write_shard) = self.split_read_and_write_shards();
                self.send_commit_parallel(&read_shards).await?;
                self.send_commit(&write_shard).await
            }
            CommitType::TwoPhaseCommit => {
                let coordinator = self.coordinator_id.clone().expect("two-phase commit requires a coordinator");
                let participants: Vec<ShardId> = self.participants.keys().cloned().collect();
                self.send_coordinate_commit(&coordinator, &participants).await
            }
            CommitType::RecoverWithToken => {
                let target = recover_target.expect("RecoverWithToken always carries a target shard");
                self.send_coordinate_commit(&target, &[]).await
            }
        }
    }

    fn split_read_and_write_shards(&self) -> (Vec<ShardId>, ShardId) {
        use crate::participant::ReadOnly;
        let mut read_shards = Vec::new();
        let mut write_shard = None;
        for (shard, p) in &self.participants {
            if p.read_only == ReadOnly::NotReadOnly {
                write_shard = Some(shard.clone());
            } else {
                read_shards.push(shard.clone());
            }
        }
        (read_shards, write_shard.expect("single write shard commit needs exactly one write participant"))
    }

    async fn send_commit(&self, shard: &ShardId) -> Result<(), RouterError> {
        let txn_number = self.txn_number.expect("commit requires an active transaction");
        let mut body = CommandBody::new();
        body.insert("commitTransaction", true);
        body.insert("txnNumber", txn_number);
        body.insert("autocommit", false);
        let mut command = Command::new("commitTransaction", ADMIN_DB, body);
        if let Some(wc) = &self.write_concern {
            command = command.with_write_concern(wc.clone());
        }
        classify_commit_response(self.send_with_timeout(shard, command).await)
    }

    async fn send_commit_parallel(&self, shards: &[ShardId]) -> Result<(), RouterError> {
        let results = futures::future::join_all(shards.iter().map(|s| self.send_commit(s))).await;
        for r in results {
            r?;
        }
        Ok(())
    }

    async fn send_coordinate_commit(&self, coordinator: &ShardId, participants: &[ShardId]) -> Result<(), RouterError> {
        let txn_number = self.txn_number.expect("commit requires an active transaction");
        let mut body = CommandBody::new();
        body.insert("coordinateCommitTransaction", true);
        body.insert("txnNumber", txn_number);
        body.insert("autocommit", false);
        let shard_list: Vec<Value> = participants
            .iter()
            .map(|s| json!({ "shardId": s.to_string() }))
            .collect();
        body.0.insert("participants".into(), Value::Array(shard_list));
        let mut command = Command::new("coordinateCommitTransaction", ADMIN_DB, body);
        if let Some(wc) = &self.write_concern {
            command = command.with_write_concern(wc.clone());
        }
        classify_commit_response(self.send_with_timeout(coordinator, command).await)
    }

    /// Client-initiated abort of every current participant (spec §4.2).
    /// Aggregation policy: if every response is ok, succeed; otherwise
    /// surface the first non-`NoSuchTransaction` command failure, or a
    /// transport error unchanged if that's all there was.
    pub async fn abort_transaction(&mut self) -> Result<(), RouterError> {
        if self.participants.is_empty() {
            return Err(RouterError::NoSuchTransaction);
        }
        self.implicitly_abort_transaction().await
    }

    /// Same aggregation as [`Self::abort_transaction`] but callable even with
    /// no participants (used when the router itself decides to tear a
    /// transaction down, e.g. on an unrecoverable mid-statement error).
    pub async fn implicitly_abort_transaction(&mut self) -> Result<(), RouterError> {
        self.termination_initiated = true;
        let txn_number = match self.txn_number {
            Some(n) => n,
            None => return Err(RouterError::NoSuchTransaction),
        };
        let shards: Vec<ShardId> = self.participants.keys().cloned().collect();
        let write_concern = self.write_concern.clone();
        let call_timeout = self.call_timeout;
        let responses = futures::future::join_all(shards.iter().map(|shard| {
            let shard = shard.clone();
            let executor = self.executor.clone();
            let write_concern = write_concern.clone();
            async move {
                let mut body = CommandBody::new();
                body.insert("abortTransaction", true);
                body.insert("txnNumber", txn_number);
                body.insert("autocommit", false);
                let mut command = Command::new("abortTransaction", ADMIN_DB, body);
                if let Some(wc) = write_concern {
                    command = command.with_write_concern(wc);
                }
                call_with_timeout(executor, shard, command, call_timeout).await
            }
        }))
        .await;

        self.timing.mark_terminated();
        self.metrics.record_aborted();
        aggregate_abort_responses(responses)
    }

    fn log_if_slow(&self) {
        let duration = self.timing.duration();
        if duration >= self.slow_txn_threshold {
            tracing::warn!(
                target: "meridian::slow_txn",
                txn_number = self.txn_number,
                commit_type = ?self.commit_type,
                duration_ms = duration.as_millis() as u64,
                "slow transaction"
            );
        }
    }
}

/// Races one remote call against `call_timeout`, folding a timeout into the
/// same `ExecutorError` shape a transport failure would produce.
async fn call_with_timeout<E: RemoteExecutor>(
    executor: Arc<E>,
    shard: ShardId,
    command: Command,
    call_timeout: Duration,
) -> Result<CommandResponse, ExecutorError> {
    let fut: BoxFuture<'_, Result<CommandResponse, ExecutorError>> =
        Box::pin(async move { executor.send(&shard, command).await });
    match race_with_deadline(fut, call_timeout, CancellationToken::new()).await {
        RaceOutcome::Settled(result) => result,
        RaceOutcome::TimedOut => Err(ExecutorError::Transport(TransportError::new("executor call timed out", true))),
        RaceOutcome::Cancelled => Err(ExecutorError::Cancelled),
    }
}

fn classify_commit_response(response: Result<CommandResponse, ExecutorError>) -> Result<(), RouterError> {
    match response {
        Ok(resp) if resp.ok => Ok(()),
        Ok(resp) => {
            let unknown = matches!(resp.code_name(), Some("MaxTimeMSExpired") | Some("UnsatisfiableWriteConcern"))
                || resp.body.contains_key("writeConcernError");
            if unknown {
                Err(RouterError::UnknownCommitResult)
            } else {
                Err(RouterError::CommandFailed(
                    resp.code_name().unwrap_or("unknown error").to_string(),
                ))
            }
        }
        Err(ExecutorError::Transport(_)) => Err(RouterError::UnknownCommitResult),
        Err(ExecutorError::Cancelled) => Err(RouterError::ExceededTimeLimit),
    }
}

fn aggregate_abort_responses(responses: Vec<Result<CommandResponse, ExecutorError>>) -> Result<(), RouterError> {
    if responses.iter().all(|r| matches!(r, Ok(resp) if resp.ok)) {
        return Ok(());
    }
    for r in &responses {
        if let Ok(resp) = r {
            if !resp.ok && !resp.is_no_such_transaction() {
                return Err(RouterError::CommandFailed(
                    resp.code_name().unwrap_or("unknown error").to_string(),
                ));
            }
        }
    }
    for r in &responses {
        if let Err(ExecutorError::Transport(t)) = r {
            return Err(RouterError::Transport(t.message.clone()));
        }
    }
    // Every non-ok response is NoSuchTransaction: the aggregate reply is
    // that reply, not success (spec §4.2, §8 scenario 5).
    Err(RouterError::NoSuchTransaction)
}

/// Parses a write-concern body field into the write concern forwarded to
/// participants on commit (spec §4.4).
pub fn write_concern_from_value(value: Option<&Value>) -> Option<WriteConcern> {
    let obj = value?.as_object()?;
    Some(WriteConcern {
        w: obj.get("w").and_then(Value::as_str).map(str::to_string),
        wtimeout_ms: obj.get("wtimeout").and_then(Value::as_u64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_net::{AtomicClock, SimulatedExecutor};

    fn router() -> TransactionRouter<SimulatedExecutor> {
        TransactionRouter::new(
            Arc::new(SimulatedExecutor::new()),
            Arc::new(AtomicClock::new(ClusterTime::ZERO)),
            Arc::new(RouterMetrics::new()),
        )
    }

    #[test]
    fn start_then_continue_advances_statement_id() {
        let mut r = router();
        r.begin_or_continue(1, TxnAction::Start, Some(ReadConcernLevel::Snapshot)).unwrap();
        assert_eq!(r.latest_stmt_id(), 0);
        r.begin_or_continue(1, TxnAction::Continue, None).unwrap();
        assert_eq!(r.latest_stmt_id(), 1);
    }

    #[test]
    fn continue_on_unknown_transaction_is_no_such_transaction() {
        let mut r = router();
        let err = r.begin_or_continue(5, TxnAction::Continue, None).unwrap_err();
        assert_eq!(err, RouterError::NoSuchTransaction);
    }

    #[test]
    fn continue_with_mismatched_read_concern_is_rejected_not_fatal() {
        let mut r = router();
        r.begin_or_continue(1, TxnAction::Start, Some(ReadConcernLevel::Snapshot)).unwrap();
        let err = r
            .begin_or_continue(1, TxnAction::Continue, Some(ReadConcernLevel::Local))
            .unwrap_err();
        assert_eq!(err, RouterError::NoSuchTransaction);
    }

    #[tokio::test(start_paused = true)]
    async fn commit_past_the_call_timeout_surfaces_as_unknown_result() {
        use meridian_net::TokioExecutor;

        let executor = Arc::new(TokioExecutor::new(|_shard, _command| async move {
            futures::future::pending().await
        }));
        let mut r = TransactionRouter::new(executor, Arc::new(AtomicClock::new(ClusterTime::ZERO)), Arc::new(RouterMetrics::new()))
            .with_call_timeout(Duration::from_millis(50));
        r.begin_or_continue(1, TxnAction::Start, Some(ReadConcernLevel::Local)).unwrap();
        r.attach_txn_fields_if_needed(&ShardId::new("s1"), CommandBody::new());
        r.process_participant_response(&ShardId::new("s1"), &CommandResponse::ok({
            let mut b = CommandBody::new();
            b.insert("readOnly", false);
            b
        }));
        r.begin_or_continue(1, TxnAction::Commit, None).unwrap();

        let result = r.commit_transaction(None).await;
        assert_eq!(result, Err(RouterError::UnknownCommitResult));
    }

    #[test]
    fn second_start_with_higher_number_resets_participants() {
        let mut r = router();
        r.begin_or_continue(1, TxnAction::Start, Some(ReadConcernLevel::Local)).unwrap();
        r.attach_txn_fields_if_needed(&ShardId::new("s1"), CommandBody::new());
        assert_eq!(r.participants().len(), 1);
        r.begin_or_continue(2, TxnAction::Start, Some(ReadConcernLevel::Local)).unwrap();
        assert!(r.participants().is_empty());
        assert_eq!(r.txn_number(), Some(2));
    }

    #[tokio::test]
    async fn no_shards_commit_contacts_nobody() {
        let mut r = router();
        r.begin_or_continue(1, TxnAction::Start, Some(ReadConcernLevel::Local)).unwrap();
        r.begin_or_continue(1, TxnAction::Commit, None).unwrap();
        r.commit_transaction(None).await.unwrap();
        assert_eq!(r.commit_type(), CommitType::NoShards);
    }

    #[test]
    fn first_contact_attaches_start_transaction_and_read_concern() {
        let mut r = router();
        r.begin_or_continue(1, TxnAction::Start, Some(ReadConcernLevel::Snapshot)).unwrap();
        r.set_default_at_cluster_time();
        let body = r.attach_txn_fields_if_needed(&ShardId::new("s1"), CommandBody::new());
        assert_eq!(body.get("startTransaction"), Some(&Value::Bool(true)));
        assert_eq!(body.get("txnNumber"), Some(&json!(1)));
        assert!(body.get("readConcern").is_some());
    }

    #[test]
    fn second_contact_with_same_shard_omits_start_transaction() {
        let mut r = router();
        r.begin_or_continue(1, TxnAction::Start, Some(ReadConcernLevel::Local)).unwrap();
        let shard = ShardId::new("s1");
        r.attach_txn_fields_if_needed(&shard, CommandBody::new());
        r.begin_or_continue(1, TxnAction::Continue, None).unwrap();
        let body = r.attach_txn_fields_if_needed(&shard, CommandBody::new());
        assert_eq!(body.get("startTransaction"), None);
        assert_eq!(body.get("readConcern"), None);
        assert_eq!(body.get("txnNumber"), Some(&json!(1)));
    }
}
