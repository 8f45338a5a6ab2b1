use meridian_base::ShardId;
use std::collections::HashSet;
use std::sync::RwLock;

/// The set of shards this node currently knows how to address. Maintaining
/// the routing table itself — discovering shards, tracking primaries — is an
/// external collaborator's job (spec §1); this is just the membership test a
/// recovery commit needs before it can dispatch to a shard outside the
/// current transaction's participant list (spec.md §8 scenario 3).
#[derive(Default)]
pub struct ShardRegistry {
    known: RwLock<HashSet<ShardId>>,
}

impl ShardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shards(shards: impl IntoIterator<Item = ShardId>) -> Self {
        ShardRegistry {
            known: RwLock::new(shards.into_iter().collect()),
        }
    }

    pub fn insert(&self, shard: ShardId) {
        self.known.write().expect("shard registry lock poisoned").insert(shard);
    }

    pub fn remove(&self, shard: &ShardId) {
        self.known.write().expect("shard registry lock poisoned").remove(shard);
    }

    pub fn contains(&self, shard: &ShardId) -> bool {
        self.known.read().expect("shard registry lock poisoned").contains(shard)
    }
}
