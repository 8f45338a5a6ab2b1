use meridian_base::{RecoveryToken, RouterError, ShardId};
use meridian_net::{AtomicClock, ClusterTime, CommandBody, CommandResponse, SimulatedExecutor};
use meridian_txn::{CommitType, ReadConcernLevel, RouterMetrics, TransactionRouter, TxnAction};
use std::sync::Arc;

fn new_router() -> (TransactionRouter<SimulatedExecutor>, Arc<SimulatedExecutor>) {
    let (router, executor, _metrics) = new_router_with_metrics();
    (router, executor)
}

fn new_router_with_metrics() -> (TransactionRouter<SimulatedExecutor>, Arc<SimulatedExecutor>, Arc<RouterMetrics>) {
    let executor = Arc::new(SimulatedExecutor::new());
    let clock = Arc::new(AtomicClock::new(ClusterTime::ZERO));
    let metrics = Arc::new(RouterMetrics::new());
    (TransactionRouter::new(executor.clone(), clock, metrics.clone()), executor, metrics)
}

fn ok_with(field: &str, value: impl Into<serde_json::Value>) -> CommandResponse {
    let mut body = CommandBody::new();
    body.insert(field, value);
    CommandResponse::ok(body)
}

#[tokio::test]
async fn single_shard_transaction_commits_with_one_remote_call() {
    let (mut router, executor) = new_router();
    router
        .begin_or_continue(1, TxnAction::Start, Some(ReadConcernLevel::Snapshot))
        .unwrap();
    let shard = ShardId::new("shard1");
    router.attach_txn_fields_if_needed(&shard, CommandBody::new());
    router.process_participant_response(&shard, &ok_with("readOnly", false));

    router.begin_or_continue(1, TxnAction::Commit, None).unwrap();
    router.commit_transaction(None).await.unwrap();

    assert_eq!(router.commit_type(), CommitType::SingleShard);
    assert_eq!(executor.calls_named("commitTransaction").await.len(), 1);
}

#[tokio::test]
async fn read_only_two_shard_transaction_commits_to_both_in_parallel() {
    let (mut router, executor) = new_router();
    router
        .begin_or_continue(1, TxnAction::Start, Some(ReadConcernLevel::Snapshot))
        .unwrap();
    for name in ["shard1", "shard2"] {
        let shard = ShardId::new(name);
        router.attach_txn_fields_if_needed(&shard, CommandBody::new());
        router.process_participant_response(&shard, &ok_with("readOnly", true));
    }

    router.begin_or_continue(1, TxnAction::Commit, None).unwrap();
    router.commit_transaction(None).await.unwrap();

    assert_eq!(router.commit_type(), CommitType::ReadOnly);
    assert_eq!(executor.calls_named("commitTransaction").await.len(), 2);
}

#[tokio::test]
async fn single_write_shard_commits_reads_before_the_write_shard() {
    let (mut router, executor) = new_router();
    router
        .begin_or_continue(1, TxnAction::Start, Some(ReadConcernLevel::Snapshot))
        .unwrap();
    let read_shard = ShardId::new("shard1");
    let write_shard = ShardId::new("shard2");
    router.attach_txn_fields_if_needed(&read_shard, CommandBody::new());
    router.process_participant_response(&read_shard, &ok_with("readOnly", true));
    router.attach_txn_fields_if_needed(&write_shard, CommandBody::new());
    router.process_participant_response(&write_shard, &ok_with("readOnly", false));

    router.begin_or_continue(1, TxnAction::Commit, None).unwrap();
    router.commit_transaction(None).await.unwrap();

    assert_eq!(router.commit_type(), CommitType::SingleWriteShard);
    let commits = executor.calls_named("commitTransaction").await;
    assert_eq!(commits.len(), 2);
}

#[tokio::test]
async fn two_phase_commit_dispatches_through_the_coordinator() {
    let (mut router, executor) = new_router();
    router
        .begin_or_continue(1, TxnAction::Start, Some(ReadConcernLevel::Snapshot))
        .unwrap();
    let s1 = ShardId::new("shard1");
    let s2 = ShardId::new("shard2");
    router.attach_txn_fields_if_needed(&s1, CommandBody::new());
    router.process_participant_response(&s1, &ok_with("readOnly", false));
    router.attach_txn_fields_if_needed(&s2, CommandBody::new());
    router.process_participant_response(&s2, &ok_with("readOnly", false));

    router.begin_or_continue(1, TxnAction::Commit, None).unwrap();
    router.commit_transaction(None).await.unwrap();

    assert_eq!(router.commit_type(), CommitType::TwoPhaseCommit);
    let coordinated = executor.calls_named("coordinateCommitTransaction").await;
    assert_eq!(coordinated.len(), 1);
    assert_eq!(coordinated[0].0, s1, "first-contacted shard is the coordinator");
    let participants = coordinated[0].1.body.get("participants").unwrap().as_array().unwrap();
    assert_eq!(participants.len(), 2);
}

#[tokio::test]
async fn first_statement_attaches_start_transaction_and_read_concern_only_once() {
    let (mut router, _executor) = new_router();
    router
        .begin_or_continue(5, TxnAction::Start, Some(ReadConcernLevel::Snapshot))
        .unwrap();
    router.set_default_at_cluster_time();
    let shard1 = ShardId::new("shard1");

    let body = router.attach_txn_fields_if_needed(&shard1, CommandBody::new());
    assert_eq!(body.get("startTransaction"), Some(&serde_json::json!(true)));
    assert_eq!(body.get("txnNumber"), Some(&serde_json::json!(5)));
    assert!(body.get("readConcern").unwrap().get("atClusterTime").is_some());

    router.begin_or_continue(5, TxnAction::Continue, None).unwrap();
    let second = router.attach_txn_fields_if_needed(&shard1, CommandBody::new());
    assert_eq!(second.get("startTransaction"), None);
    assert_eq!(second.get("readConcern"), None);
}

#[tokio::test]
async fn recovery_commit_for_unknown_shard_surfaces_as_recovery_dispatch() {
    let (mut router, executor) = new_router();
    router
        .begin_or_continue(9, TxnAction::Start, Some(ReadConcernLevel::Local))
        .unwrap();
    router.begin_or_continue(9, TxnAction::Commit, None).unwrap();

    let token = RecoveryToken {
        recovery_shard_id: Some(ShardId::new("otherShard")),
    };
    router.commit_transaction(Some(token)).await.unwrap();

    assert_eq!(router.commit_type(), CommitType::RecoverWithToken);
    let coordinated = executor.calls_named("coordinateCommitTransaction").await;
    assert_eq!(coordinated.len(), 1);
    assert_eq!(coordinated[0].0, ShardId::new("otherShard"));
}

#[tokio::test]
async fn abort_aggregate_reflects_no_such_transaction_reply() {
    let (mut router, executor) = new_router();
    router
        .begin_or_continue(1, TxnAction::Start, Some(ReadConcernLevel::Local))
        .unwrap();
    let s1 = ShardId::new("shard1");
    let s2 = ShardId::new("shard2");
    let s3 = ShardId::new("shard3");
    for s in [&s1, &s2, &s3] {
        router.attach_txn_fields_if_needed(s, CommandBody::new());
    }

    let mut nst_body = CommandBody::new();
    nst_body.insert("codeName", "NoSuchTransaction");
    executor.program(s2.clone(), Ok(CommandResponse::err(251, nst_body))).await;

    let result = router.abort_transaction().await;
    assert!(matches!(result, Err(RouterError::NoSuchTransaction)));
}

#[tokio::test]
async fn abort_surfaces_first_non_no_such_transaction_command_failure() {
    let (mut router, executor) = new_router();
    router
        .begin_or_continue(1, TxnAction::Start, Some(ReadConcernLevel::Local))
        .unwrap();
    let s1 = ShardId::new("shard1");
    let s2 = ShardId::new("shard2");
    router.attach_txn_fields_if_needed(&s1, CommandBody::new());
    router.attach_txn_fields_if_needed(&s2, CommandBody::new());

    let mut failure_body = CommandBody::new();
    failure_body.insert("codeName", "WriteConflict");
    executor.program(s2.clone(), Ok(CommandResponse::err(112, failure_body))).await;

    let result = router.abort_transaction().await;
    assert_eq!(result, Err(RouterError::CommandFailed("WriteConflict".to_string())));
}

#[test]
#[should_panic(expected = "reclassified")]
fn reclassifying_a_participant_after_an_earlier_failure_is_fatal() {
    let (mut router, _executor) = new_router();
    router
        .begin_or_continue(1, TxnAction::Start, Some(ReadConcernLevel::Local))
        .unwrap();
    let shard = ShardId::new("shard1");
    router.attach_txn_fields_if_needed(&shard, CommandBody::new());

    let mut failure_body = CommandBody::new();
    failure_body.insert("codeName", "WriteConflict");
    router.process_participant_response(&shard, &CommandResponse::err(112, failure_body));

    router.begin_or_continue(1, TxnAction::Continue, None).unwrap();
    router.attach_txn_fields_if_needed(&shard, CommandBody::new());
    router.process_participant_response(&shard, &ok_with("readOnly", false));
}

#[tokio::test]
async fn transport_error_on_commit_is_reported_as_unknown_result() {
    use meridian_net::{ExecutorError, TransportError};
    let (mut router, executor) = new_router();
    router
        .begin_or_continue(1, TxnAction::Start, Some(ReadConcernLevel::Local))
        .unwrap();
    let shard = ShardId::new("shard1");
    router.attach_txn_fields_if_needed(&shard, CommandBody::new());
    router.process_participant_response(&shard, &ok_with("readOnly", false));

    executor
        .program(shard.clone(), Err(ExecutorError::Transport(TransportError::new("reset", true))))
        .await;

    router.begin_or_continue(1, TxnAction::Commit, None).unwrap();
    let result = router.commit_transaction(None).await;
    assert_eq!(result, Err(RouterError::UnknownCommitResult));
}

#[tokio::test]
async fn commit_retry_after_unknown_result_increments_metrics_once() {
    use meridian_net::{ExecutorError, TransportError};
    let (mut router, executor, metrics) = new_router_with_metrics();
    router
        .begin_or_continue(1, TxnAction::Start, Some(ReadConcernLevel::Local))
        .unwrap();
    let shard = ShardId::new("shard1");
    router.attach_txn_fields_if_needed(&shard, CommandBody::new());
    router.process_participant_response(&shard, &ok_with("readOnly", false));
    router.begin_or_continue(1, TxnAction::Commit, None).unwrap();

    executor
        .program(shard.clone(), Err(ExecutorError::Transport(TransportError::new("reset", true))))
        .await;
    let first = router.commit_transaction(None).await;
    assert_eq!(first, Err(RouterError::UnknownCommitResult));
    assert_eq!(metrics.total_committed(), 0);

    executor.program(shard.clone(), Ok(CommandResponse::ok(CommandBody::new()))).await;
    let second = router.commit_transaction(None).await;
    assert!(second.is_ok());
    assert_eq!(metrics.total_committed(), 1);
}
