use crate::read_concern::ReadConcernLevel;
use meridian_base::ShardId;

/// Read/write classification of a participant. Transitions are monotone:
/// `Unset -> ReadOnly -> NotReadOnly` is allowed, the reverse is a protocol
/// violation (spec §3 invariants).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadOnly {
    Unset,
    ReadOnly,
    NotReadOnly,
}

/// A shard that has received at least one statement of the transaction.
#[derive(Clone, Debug)]
pub struct Participant {
    pub shard_id: ShardId,
    pub read_only: ReadOnly,
    pub is_coordinator: bool,
    /// The statement index at which this participant was first contacted.
    /// Distinguishes a participant targeted by the *current* statement
    /// (pending) from one confirmed by an earlier statement.
    pub stmt_id_created_at: u64,
    pub read_concern_level: ReadConcernLevel,
    /// Statement index at which this participant last returned a non-`ok`
    /// response, if any. A later statement classifying this participant
    /// again is a protocol violation (spec §4.2).
    pub failed_at_stmt: Option<u64>,
}

impl Participant {
    pub fn new(
        shard_id: ShardId,
        stmt_id_created_at: u64,
        is_coordinator: bool,
        read_concern_level: ReadConcernLevel,
    ) -> Self {
        Participant {
            shard_id,
            read_only: ReadOnly::Unset,
            is_coordinator,
            stmt_id_created_at,
            read_concern_level,
            failed_at_stmt: None,
        }
    }

    pub fn is_pending(&self, latest_stmt_id: u64) -> bool {
        self.stmt_id_created_at == latest_stmt_id
    }

    /// Applies an observed `readOnly` flag from a participant response.
    /// Returns `Err` iff this would regress `NotReadOnly -> ReadOnly`, a
    /// fatal protocol violation (spec §4.2 `processParticipantResponse`).
    pub fn observe_read_only(&mut self, read_only: bool) -> Result<(), ()> {
        match (self.read_only, read_only) {
            (ReadOnly::NotReadOnly, true) => Err(()),
            (_, true) => {
                self.read_only = ReadOnly::ReadOnly;
                Ok(())
            }
            (_, false) => {
                self.read_only = ReadOnly::NotReadOnly;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant() -> Participant {
        Participant::new(ShardId::new("shard1"), 0, true, ReadConcernLevel::Snapshot)
    }

    #[test]
    fn unset_to_read_only_to_not_read_only_is_allowed() {
        let mut p = participant();
        assert!(p.observe_read_only(true).is_ok());
        assert_eq!(p.read_only, ReadOnly::ReadOnly);
        assert!(p.observe_read_only(false).is_ok());
        assert_eq!(p.read_only, ReadOnly::NotReadOnly);
    }

    #[test]
    fn not_read_only_to_read_only_is_rejected() {
        let mut p = participant();
        p.observe_read_only(false).unwrap();
        assert!(p.observe_read_only(true).is_err());
    }
}
