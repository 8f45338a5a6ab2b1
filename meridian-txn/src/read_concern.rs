use meridian_base::RouterError;
use meridian_net::ClusterTime;
use serde::{Deserialize, Serialize};

/// Read concern levels a transaction may request. `Available` and
/// `Linearizable` are accepted by the wire protocol in general but are
/// rejected for multi-statement transactions (spec §4.2, `beginOrContinue`
/// *Start*).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ReadConcernLevel {
    Local,
    Majority,
    Snapshot,
}

impl ReadConcernLevel {
    pub fn parse(raw: &str) -> Result<ReadConcernLevel, RouterError> {
        match raw {
            "local" => Ok(ReadConcernLevel::Local),
            "majority" => Ok(ReadConcernLevel::Majority),
            "snapshot" => Ok(ReadConcernLevel::Snapshot),
            "available" | "linearizable" => Err(RouterError::NoSuchTransaction),
            _ => Err(RouterError::NoSuchTransaction),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReadConcernLevel::Local => "local",
            ReadConcernLevel::Majority => "majority",
            ReadConcernLevel::Snapshot => "snapshot",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReadConcern {
    pub level: ReadConcernLevel,
    pub after_cluster_time: Option<ClusterTime>,
}

impl ReadConcern {
    pub fn new(level: ReadConcernLevel) -> Self {
        ReadConcern {
            level,
            after_cluster_time: None,
        }
    }
}
