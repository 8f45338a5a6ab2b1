use crate::config::Config;
use crate::shard_registry::ShardRegistry;
use meridian_base::{RecoveryToken, RouterError};
use meridian_migrate::{AccessBlocker, AccessBlockerRegistry, BackoffPolicy, DonorStateDocument, MajorityCommittedChecker};
use meridian_net::{CancellationToken, ClockSource, ClusterTime, RemoteExecutor};
use meridian_txn::{write_concern_from_value, RouterMetrics, TransactionRouter};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Exclusive hold on one session's router (spec §5: "per-session exclusivity
/// ... removes intra-router locking" — `TransactionRouter`'s own methods
/// assume the checkout already happened and take `&mut self` freely).
pub struct SessionCheckout<E: RemoteExecutor> {
    guard: OwnedMutexGuard<TransactionRouter<E>>,
}

impl<E: RemoteExecutor> SessionCheckout<E> {
    pub fn router(&self) -> &TransactionRouter<E> {
        &self.guard
    }

    pub fn router_mut(&mut self) -> &mut TransactionRouter<E> {
        &mut self.guard
    }
}

/// Top-level facade wiring the registry, the shard table, and a map of live
/// per-session routers (spec §2's control-flow paragraph). This is the
/// mediation point between TMAB write-gating and TR statement admission.
pub struct RoutingNode<E: RemoteExecutor> {
    executor: Arc<E>,
    clock: Arc<dyn ClockSource>,
    metrics: Arc<RouterMetrics>,
    config: Config,
    shard_registry: Arc<ShardRegistry>,
    blocker_registry: Arc<AccessBlockerRegistry>,
    sessions: RwLock<HashMap<String, Arc<Mutex<TransactionRouter<E>>>>>,
}

impl<E: RemoteExecutor> RoutingNode<E> {
    pub fn new(executor: Arc<E>, clock: Arc<dyn ClockSource>, config: Config) -> Self {
        Self::with_registries(
            executor,
            clock,
            config,
            Arc::new(ShardRegistry::new()),
            Arc::new(AccessBlockerRegistry::new()),
        )
    }

    pub fn with_registries(
        executor: Arc<E>,
        clock: Arc<dyn ClockSource>,
        config: Config,
        shard_registry: Arc<ShardRegistry>,
        blocker_registry: Arc<AccessBlockerRegistry>,
    ) -> Self {
        RoutingNode {
            executor,
            clock,
            metrics: Arc::new(RouterMetrics::new()),
            config,
            shard_registry,
            blocker_registry,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn metrics(&self) -> &Arc<RouterMetrics> {
        &self.metrics
    }

    pub fn shard_registry(&self) -> &Arc<ShardRegistry> {
        &self.shard_registry
    }

    pub fn blocker_registry(&self) -> &Arc<AccessBlockerRegistry> {
        &self.blocker_registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Hands out exclusive access to `session_id`'s router, creating it
    /// lazily on first use (spec §3: "created lazily on first request for the
    /// session").
    pub async fn checkout_session(&self, session_id: &str) -> SessionCheckout<E> {
        let handle = {
            let sessions = self.sessions.read().expect("session map lock poisoned");
            sessions.get(session_id).cloned()
        };
        let handle = match handle {
            Some(handle) => handle,
            None => {
                let mut sessions = self.sessions.write().expect("session map lock poisoned");
                sessions
                    .entry(session_id.to_string())
                    .or_insert_with(|| {
                        let router = TransactionRouter::new(self.executor.clone(), self.clock.clone(), self.metrics.clone())
                            .with_slow_txn_threshold(self.config.slow_txn_threshold())
                            .with_abort_retries(self.config.idempotent_retries)
                            .with_call_timeout(self.config.executor_call_timeout());
                        Arc::new(Mutex::new(router))
                    })
                    .clone()
            }
        };
        SessionCheckout {
            guard: handle.lock_owned().await,
        }
    }

    /// Destroys a session's router (spec §3: "destroyed with the session").
    pub fn drop_session(&self, session_id: &str) {
        self.sessions.write().expect("session map lock poisoned").remove(session_id);
    }

    /// Write-side half of spec §2's control flow: if `database_name` names a
    /// tenant under an active TMAB, waits out any `TenantMigrationConflict`
    /// before admitting the write, surfacing the blocker's terminal outcome
    /// unchanged (spec §7's "caught centrally" note on this variant).
    pub async fn admit_write(&self, database_name: &str, deadline: Duration) -> Result<(), RouterError> {
        loop {
            let blocker = match self.blocker_registry.get(database_name) {
                Some(blocker) => blocker,
                None => return Ok(()),
            };
            match blocker.check_can_write_or_fail() {
                Ok(()) => return Ok(()),
                Err(RouterError::TenantMigrationConflict { .. }) => {
                    blocker.wait_until_committed_or_aborted(deadline).await?;
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Read-side half of spec §2's control flow (non-linearizable reads):
    /// admits immediately, fails with a redirect, or waits on the blocker's
    /// per-read future (spec §4.1 `canReadOrWaitFuture`).
    pub async fn admit_read(
        &self,
        database_name: &str,
        read_timestamp: Option<ClusterTime>,
        caller_token: CancellationToken,
    ) -> Result<(), RouterError> {
        match self.blocker_registry.get(database_name) {
            Some(blocker) => blocker.can_read_or_wait(read_timestamp, caller_token).await,
            None => Ok(()),
        }
    }

    /// Linearizable reads bypass the timestamp-based admission entirely
    /// (spec §4.1 `checkLinearizableReadOrFail`).
    pub fn admit_linearizable_read(&self, database_name: &str) -> Result<(), RouterError> {
        match self.blocker_registry.get(database_name) {
            Some(blocker) => blocker.check_linearizable_read_or_fail(),
            None => Ok(()),
        }
    }

    /// Read-only diagnostic snapshot of `database_name`'s active blocker, if
    /// any (spec §4.1 `appendServerStatus`).
    pub fn blocker_status(&self, database_name: &str) -> Option<meridian_migrate::BlockerStatus> {
        self.blocker_registry.get(database_name).map(|blocker| blocker.server_status())
    }

    fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: self.config.majority_wait_initial_backoff(),
            max: self.config.majority_wait_max_backoff(),
        }
    }

    /// Starts a fresh migration blocker for `tenant_id`, seeded from this
    /// node's configured majority-wait backoff (spec §4.8), and registers it.
    pub fn register_migration_blocker(
        &self,
        tenant_id: impl Into<String>,
        recipient_conn_string: impl Into<String>,
        checker: Arc<dyn MajorityCommittedChecker>,
    ) -> Result<Arc<AccessBlocker>, RouterError> {
        let tenant_id = tenant_id.into();
        let blocker = AccessBlocker::with_backoff_policy(tenant_id.clone(), recipient_conn_string, checker, self.backoff_policy());
        self.blocker_registry
            .register(tenant_id, blocker.clone())
            .map_err(|_| RouterError::CommandFailed("migration blocker already active for this tenant".to_string()))?;
        Ok(blocker)
    }

    /// Reconstructs and registers a blocker from a donor state document on
    /// startup recovery (spec §6), using this node's configured backoff.
    pub fn recover_migration_blocker(
        &self,
        doc: DonorStateDocument,
        checker: Arc<dyn MajorityCommittedChecker>,
    ) -> Result<Option<Arc<AccessBlocker>>, RouterError> {
        self.blocker_registry
            .recover_from_state_document_with_backoff(doc, checker, self.backoff_policy())
            .map_err(|e| RouterError::CommandFailed(format!("{e:?}")))
    }

    /// Garbage-collects `tenant_id`'s blocker once it has reached a terminal
    /// state (spec §2 item 3). A no-op if no blocker is registered.
    pub fn garbage_collect_migration_blocker(&self, tenant_id: &str) -> Result<(), RouterError> {
        self.blocker_registry
            .remove_if_terminal(tenant_id)
            .map_err(|e| RouterError::CommandFailed(format!("{e:?}")))
    }

    /// Commits `checkout`'s transaction, first resolving a recovery token's
    /// shard against the live participant list and the shard registry
    /// (spec.md §8 scenario 3: an unrecognized recovery shard is
    /// `ShardNotFound` before the router ever dispatches a command), and
    /// applying any write concern carried on the raw commit body (spec §4.4)
    /// before dispatch.
    pub async fn commit_transaction(
        &self,
        checkout: &mut SessionCheckout<E>,
        recovery_token: Option<RecoveryToken>,
        raw_command_body: Option<&Value>,
    ) -> Result<(), RouterError> {
        if let Some(token) = &recovery_token {
            if let Some(shard) = &token.recovery_shard_id {
                let known = checkout.router().participants().contains_key(shard) || self.shard_registry.contains(shard);
                if !known {
                    return Err(RouterError::ShardNotFound(shard.clone()));
                }
            }
        }
        let write_concern = raw_command_body.and_then(|body| write_concern_from_value(body.get("writeConcern")));
        if write_concern.is_some() {
            checkout.router_mut().set_write_concern(write_concern);
        }
        let result = checkout.router_mut().commit_transaction(recovery_token).await;
        if let Err(ref error) = result {
            if error.is_retryable_commit_outcome() {
                tracing::debug!(target: "meridian", %error, "commit outcome unknown, safe for caller to retry");
            }
        }
        result
    }
}
