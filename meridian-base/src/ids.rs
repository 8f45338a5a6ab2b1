use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque shard identifier. The router never interprets the contents beyond
/// equality and ordering; routing-table maintenance is an external
/// collaborator (see spec §1).
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ShardId(pub String);

impl ShardId {
    pub fn new(id: impl Into<String>) -> Self {
        ShardId(id.into())
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ShardId {
    fn from(s: &str) -> Self {
        ShardId(s.to_string())
    }
}

/// Replication position within a single replica set's oplog. Totally ordered
/// lexicographically by `(term, counter)`, which is all the majority-wait
/// logic in the access blocker needs.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct OpTime {
    pub term: i64,
    pub counter: i64,
}

impl OpTime {
    pub fn new(term: i64, counter: i64) -> Self {
        OpTime { term, counter }
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.term, self.counter)
    }
}

/// The payload a client hands back on a commit retry or a recovery attempt.
/// No other fields, per spec §6.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct RecoveryToken {
    pub recovery_shard_id: Option<ShardId>,
}
