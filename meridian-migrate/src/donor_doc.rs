use meridian_base::{err, OpTime, Result};
use meridian_net::ClusterTime;

/// Donor-side decision state, as persisted in the state document this crate
/// consumes on recovery (spec §6). The donor's own state machine that moves
/// between these values is an external collaborator (spec §1).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DonorState {
    DataSync,
    Blocking,
    Committed,
    Aborted,
}

/// A recovery-time snapshot of one tenant's migration (spec §6). Well-formed
/// documents satisfy [`DonorStateDocument::validate`]; a malformed document
/// is a data-integrity problem in the collaborator, not something this crate
/// can repair, so validation returns an error rather than guessing.
#[derive(Clone, Debug, PartialEq)]
pub struct DonorStateDocument {
    pub tenant_id: String,
    pub state: DonorState,
    pub block_timestamp: Option<ClusterTime>,
    pub commit_or_abort_op_time: Option<OpTime>,
    pub abort_reason: Option<String>,
    pub expire_at: Option<i64>,
    pub recipient_connection_string: String,
}

impl DonorStateDocument {
    pub fn validate(&self) -> Result<()> {
        match self.state {
            DonorState::DataSync => {}
            DonorState::Blocking => {
                if self.block_timestamp.is_none() {
                    return Err(err("Blocking donor state document is missing blockTimestamp"));
                }
                if self.commit_or_abort_op_time.is_some() {
                    return Err(err("Blocking donor state document must not carry an op-time"));
                }
            }
            DonorState::Committed => {
                if self.block_timestamp.is_none() || self.commit_or_abort_op_time.is_none() {
                    return Err(err(
                        "Committed donor state document requires both blockTimestamp and commitOrAbortOpTime",
                    ));
                }
            }
            DonorState::Aborted => {
                if self.abort_reason.is_none() {
                    return Err(err("Aborted donor state document is missing abortReason"));
                }
            }
        }
        if self.expire_at.is_some() && !matches!(self.state, DonorState::Committed | DonorState::Aborted) {
            return Err(err("expireAt present on a non-terminal donor state document"));
        }
        Ok(())
    }

    /// A record with `expireAt` set while `Aborted` has already been
    /// garbage-collected by the donor and is skipped at recovery (spec §6).
    pub fn should_skip_at_recovery(&self) -> bool {
        self.state == DonorState::Aborted && self.expire_at.is_some()
    }
}
