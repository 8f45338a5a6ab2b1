use crate::ids::ShardId;
use thiserror::Error;

/// Client-visible outcomes of a transaction statement. These are expected,
/// protocol-level results the caller is meant to branch on — distinct from
/// [`crate::Error`], which represents a bug-trap invariant violation that is
/// never supposed to reach a client (spec §7).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    /// Continuation of an unknown transaction, abort with no participants,
    /// or a recovery token naming no shard.
    #[error("no such transaction")]
    NoSuchTransaction,

    /// The donor committed the migration; the client should redirect to
    /// `recipient_conn_string`.
    #[error("tenant {tenant_id} migration committed, redirect to {recipient_conn_string}")]
    TenantMigrationCommitted {
        tenant_id: String,
        recipient_conn_string: String,
    },

    /// The donor aborted the migration. Informational only.
    #[error("tenant {tenant_id} migration aborted")]
    TenantMigrationAborted { tenant_id: String },

    /// Internal signal caught centrally by the router and translated into a
    /// wait on the blocker's completion (spec §7); never meant to escape to
    /// a client directly.
    #[error("tenant migration conflict for {tenant_id}")]
    TenantMigrationConflict { tenant_id: String },

    /// A blocking-state wait exceeded its deadline.
    #[error("exceeded time limit waiting on migration blocker")]
    ExceededTimeLimit,

    /// A read wait timed out without the blocker's state ever changing.
    #[error("timed out awaiting migration blocker")]
    ReadTimedOutAwaitingMigrationBlocker,

    /// The blocker was torn down while a caller was waiting on it.
    #[error("migration blocker is shutting down")]
    BlockerShuttingDown,

    /// A recovery token named a shard this router has no routing entry for.
    #[error("shard not found: {0}")]
    ShardNotFound(ShardId),

    /// A commit attempt returned a transport error, a retryable code, a
    /// write-concern error, `MaxTimeMSExpired`, or `UnsatisfiableWriteConcern`
    /// — outcome unknown, safe for the client to retry (spec §4.2/§7).
    #[error("unknown commit result, retry is safe")]
    UnknownCommitResult,

    /// A transport-level failure surfaced unchanged rather than folded into
    /// one of the other variants (spec §4.2 abort aggregation policy).
    #[error("transport error: {0}")]
    Transport(String),

    /// A participant returned a definite, non-retryable command failure.
    #[error("command failed: {0}")]
    CommandFailed(String),
}

impl RouterError {
    pub fn is_retryable_commit_outcome(&self) -> bool {
        matches!(self, RouterError::UnknownCommitResult)
    }
}
