mod clock;
mod executor;
mod race;

pub use clock::{AtomicClock, ClockSource, ClusterTime};
pub use executor::{
    codes, Command, CommandBody, CommandResponse, ExecutorError, RemoteExecutor, SimulatedExecutor, TokioExecutor,
    TransportError, WriteConcern,
};
pub use race::{race, race_with_deadline, RaceOutcome};

pub use tokio_util::sync::CancellationToken;
