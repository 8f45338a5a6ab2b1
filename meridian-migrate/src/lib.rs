mod blocker;
mod donor_doc;
mod majority;
mod registry;
mod state;

pub use blocker::{AccessBlocker, BackoffPolicy, BlockerStatus};
pub use donor_doc::{DonorState, DonorStateDocument};
pub use majority::{MajorityCommittedChecker, ThresholdChecker};
pub use registry::AccessBlockerRegistry;
pub use state::State;
