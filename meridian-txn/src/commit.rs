use crate::participant::{Participant, ReadOnly};
use meridian_base::{RecoveryToken, RouterError, ShardId};
use std::collections::BTreeMap;

/// Tagged variant for the five commit paths plus the degenerate no-op case,
/// dispatched from a single table rather than a class hierarchy (spec §9
/// design note: "model commit-type dispatch as a tagged variant plus a
/// dispatch table, not a class tower").
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CommitType {
    #[default]
    None,
    NoShards,
    SingleShard,
    ReadOnly,
    SingleWriteShard,
    TwoPhaseCommit,
    RecoverWithToken,
}

/// Decides which commit path applies, per the table in spec §4.2.
///
/// `recovery_shard_id` is this router's own recollection of the write
/// participant (spec §3); it is used to tell a recovery token that names
/// *this* session's transaction apart from one naming a foreign shard.
pub fn choose_commit_type(
    participants: &BTreeMap<ShardId, Participant>,
    recovery_token: Option<&RecoveryToken>,
    recovery_shard_id: Option<&ShardId>,
) -> Result<(CommitType, Option<ShardId>), RouterError> {
    if let Some(token) = recovery_token {
        match &token.recovery_shard_id {
            None => return Err(RouterError::NoSuchTransaction),
            Some(shard) if !participants.contains_key(shard) && Some(shard) != recovery_shard_id => {
                return Ok((CommitType::RecoverWithToken, Some(shard.clone())));
            }
            _ => {}
        }
    }

    if participants.is_empty() {
        return Ok((CommitType::NoShards, None));
    }

    for (shard, p) in participants {
        if p.read_only == ReadOnly::Unset {
            panic!("commit requested with unresolved participant {shard}");
        }
    }

    if participants.len() == 1 {
        return Ok((CommitType::SingleShard, None));
    }

    let not_read_only = participants
        .values()
        .filter(|p| p.read_only == ReadOnly::NotReadOnly)
        .count();

    match not_read_only {
        0 => Ok((CommitType::ReadOnly, None)),
        1 => Ok((CommitType::SingleWriteShard, None)),
        _ => Ok((CommitType::TwoPhaseCommit, None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read_concern::ReadConcernLevel;

    fn shard(name: &str) -> ShardId {
        ShardId::new(name)
    }

    fn participant(name: &str, ro: ReadOnly) -> Participant {
        let mut p = Participant::new(shard(name), 0, false, ReadConcernLevel::Snapshot);
        p.read_only = ro;
        p
    }

    #[test]
    fn zero_participants_is_no_shards() {
        let participants = BTreeMap::new();
        let (t, _) = choose_commit_type(&participants, None, None).unwrap();
        assert_eq!(t, CommitType::NoShards);
    }

    #[test]
    fn one_participant_is_single_shard_regardless_of_classification() {
        for ro in [ReadOnly::ReadOnly, ReadOnly::NotReadOnly] {
            let mut participants = BTreeMap::new();
            participants.insert(shard("s1"), participant("s1", ro));
            let (t, _) = choose_commit_type(&participants, None, None).unwrap();
            assert_eq!(t, CommitType::SingleShard);
        }
    }

    #[test]
    fn two_read_only_participants_is_read_only_commit() {
        let mut participants = BTreeMap::new();
        participants.insert(shard("s1"), participant("s1", ReadOnly::ReadOnly));
        participants.insert(shard("s2"), participant("s2", ReadOnly::ReadOnly));
        let (t, _) = choose_commit_type(&participants, None, None).unwrap();
        assert_eq!(t, CommitType::ReadOnly);
    }

    #[test]
    fn one_write_one_read_is_single_write_shard() {
        let mut participants = BTreeMap::new();
        participants.insert(shard("s1"), participant("s1", ReadOnly::ReadOnly));
        participants.insert(shard("s2"), participant("s2", ReadOnly::NotReadOnly));
        let (t, _) = choose_commit_type(&participants, None, None).unwrap();
        assert_eq!(t, CommitType::SingleWriteShard);
    }

    #[test]
    fn two_write_participants_is_two_phase_commit() {
        let mut participants = BTreeMap::new();
        participants.insert(shard("s1"), participant("s1", ReadOnly::NotReadOnly));
        participants.insert(shard("s2"), participant("s2", ReadOnly::NotReadOnly));
        let (t, _) = choose_commit_type(&participants, None, None).unwrap();
        assert_eq!(t, CommitType::TwoPhaseCommit);
    }

    #[test]
    fn recovery_token_with_no_shard_is_fatal() {
        let participants = BTreeMap::new();
        let token = RecoveryToken { recovery_shard_id: None };
        let err = choose_commit_type(&participants, Some(&token), None).unwrap_err();
        assert_eq!(err, RouterError::NoSuchTransaction);
    }

    #[test]
    fn recovery_token_for_unknown_shard_is_recover_with_token() {
        let participants = BTreeMap::new();
        let token = RecoveryToken {
            recovery_shard_id: Some(shard("magicShard")),
        };
        let (t, target) = choose_commit_type(&participants, Some(&token), None).unwrap();
        assert_eq!(t, CommitType::RecoverWithToken);
        assert_eq!(target, Some(shard("magicShard")));
    }

    #[test]
    fn recovery_token_for_local_recovery_shard_uses_normal_table() {
        let mut participants = BTreeMap::new();
        participants.insert(shard("s1"), participant("s1", ReadOnly::NotReadOnly));
        let token = RecoveryToken {
            recovery_shard_id: Some(shard("s1")),
        };
        let (t, _) = choose_commit_type(&participants, Some(&token), Some(&shard("s1"))).unwrap();
        assert_eq!(t, CommitType::SingleShard);
    }
}
