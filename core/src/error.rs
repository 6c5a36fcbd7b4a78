use std::time::Duration;

use thiserror::Error;

/// Failure taxonomy for the ranking pipeline.
///
/// Per-candidate variants (`MalformedUri`, `PortAllocation`, `EngineLaunch`,
/// `ProbeTimeout`, `ProbeNetwork`) remove exactly one candidate from a batch;
/// `Fetch` removes one subscription source. Nothing here aborts a run on its
/// own.
#[derive(Error, Debug)]
pub enum RankError {
    #[error("fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("malformed endpoint uri: {0}")]
    MalformedUri(String),

    #[error("no free local port after {attempts} attempts")]
    PortAllocation { attempts: u32 },

    #[error("engine launch failed: {0}")]
    EngineLaunch(String),

    #[error("probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    #[error("probe transport failure: {0}")]
    ProbeNetwork(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for tunnelrank operations.
pub type Result<T> = std::result::Result<T, RankError>;

impl RankError {
    /// Short stable tag for summaries and structured output.
    pub fn kind(&self) -> &'static str {
        match self {
            RankError::Fetch { .. } => "fetch",
            RankError::MalformedUri(_) => "malformed-uri",
            RankError::PortAllocation { .. } => "port-allocation",
            RankError::EngineLaunch(_) => "engine-launch",
            RankError::ProbeTimeout(_) => "timeout",
            RankError::ProbeNetwork(_) => "network",
            RankError::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(RankError::MalformedUri("x".into()).kind(), "malformed-uri");
        assert_eq!(
            RankError::ProbeTimeout(Duration::from_secs(1)).kind(),
            "timeout"
        );
        assert_eq!(RankError::PortAllocation { attempts: 3 }.kind(), "port-allocation");
    }
}
