use async_trait::async_trait;
use meridian_base::OpTime;
use parking_lot::Mutex;

/// External collaborator the blocker polls while waiting for a recorded
/// `OpTime` to become majority-committed (spec §2 item 1's "consume its
/// notifications" boundary — replication itself is out of scope).
#[async_trait]
pub trait MajorityCommittedChecker: Send + Sync {
    async fn is_majority_committed(&self, op_time: &OpTime) -> bool;
}

/// A test double: majority point advances only when the test calls
/// [`ThresholdChecker::advance_to`].
#[derive(Default)]
pub struct ThresholdChecker {
    committed_up_to: Mutex<Option<OpTime>>,
}

impl ThresholdChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance_to(&self, op_time: OpTime) {
        let mut guard = self.committed_up_to.lock();
        if guard.as_ref().map_or(true, |current| *current < op_time) {
            *guard = Some(op_time);
        }
    }
}

#[async_trait]
impl MajorityCommittedChecker for ThresholdChecker {
    async fn is_majority_committed(&self, op_time: &OpTime) -> bool {
        self.committed_up_to.lock().as_ref().map_or(false, |c| c >= op_time)
    }
}
