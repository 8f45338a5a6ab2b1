mod commit;
mod metrics;
mod participant;
mod read_concern;
mod router;

pub use commit::CommitType;
pub use metrics::{RouterMetrics, TimingStats};
pub use participant::{Participant, ReadOnly};
pub use read_concern::{ReadConcern, ReadConcernLevel};
pub use router::{write_concern_from_value, TransactionRouter, TxnAction};
