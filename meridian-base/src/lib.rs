mod client_error;
mod error;
mod ids;
mod invariant;

pub use client_error::RouterError;
pub use error::{err, Error, Result};
pub use ids::{OpTime, RecoveryToken, ShardId};
pub use invariant::fatal;
