use thiserror::Error;

/// Errors raised by the orchestration core.
///
/// The split follows the recovery policy: configuration and checkpoint-save
/// errors abort the run, sync timeouts degrade the engine pool, generation
/// errors terminate a single trajectory.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration, detected before any process starts.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// One engine failed to acknowledge a weight sync within its timeout.
    /// Recoverable: the engine is marked unhealthy and skipped by dispatch.
    #[error("Weight sync timed out for engine {engine}")]
    SyncTimeout { engine: String },

    /// No engine acknowledged the sync. The pool cannot serve the current
    /// policy, so the run must abort.
    #[error("Weight sync failed on all {attempted} engines")]
    SyncFailed { attempted: usize },

    /// A generation request failed or timed out on one engine.
    /// Recoverable: only the owning trajectory is terminated.
    #[error("Generation failed on engine {engine}: {reason}")]
    Generation { engine: String, reason: String },

    /// A request carried a weight version the engine has not acknowledged.
    #[error("Weight version mismatch: request v{requested}, engine serves v{current}")]
    VersionMismatch { requested: u64, current: u64 },

    /// The engine cannot take requests right now (asleep or unreachable).
    #[error("Engine {engine} unavailable: {reason}")]
    EngineUnavailable { engine: String, reason: String },

    /// Checkpoint persistence failure. Fatal on save; on load the run
    /// falls back to a cold start instead of surfacing this.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// A structural invariant was violated, e.g. a training batch with a
    /// split group. Always a bug, never recoverable.
    #[error("Invariant violation: {0}")]
    Invariant(String),

    /// IO error (file operations, sockets).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Encode/decode failure (CBOR payloads, JSON configs).
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for orchestration operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for Error {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<ciborium::de::Error<std::io::Error>> for Error {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Configuration("policy GPUs exceed budget".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: policy GPUs exceed budget"
        );

        let err = Error::VersionMismatch {
            requested: 3,
            current: 5,
        };
        assert_eq!(
            err.to_string(),
            "Weight version mismatch: request v3, engine serves v5"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such checkpoint");
        let err: Error = io_err.into();
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn test_json_error_conversion() {
        let bad = serde_json::from_str::<serde_json::Value>("{not json");
        let err: Error = bad.unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_result() -> Result<u64> {
            Ok(7)
        }

        assert_eq!(returns_result().unwrap(), 7);
    }
}
