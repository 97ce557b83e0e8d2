use thiserror::Error;

/// Errors raised inside the engine.
///
/// None of these reach dashboard readers: validation failures are dropped at
/// the ingestion boundary, transient store failures are retried and then
/// counted, superseded recomputes are reported as a status and lookups of
/// unknown IDs return empty results.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid event: {0}")]
    Validation(String),

    #[error("store `{store}` unavailable after {attempts} attempts")]
    TransientStore { store: &'static str, attempts: u32 },

    #[error("correlation run {generation} superseded by a newer run")]
    RecomputeAborted { generation: u64 },

    #[error("{kind} `{id}` not found")]
    NotFound { kind: &'static str, id: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("ingestion pipeline is not running")]
    PipelineClosed,
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    /// Short label used as a metrics dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::TransientStore { .. } => "transient_store",
            EngineError::RecomputeAborted { .. } => "recompute_aborted",
            EngineError::NotFound { .. } => "not_found",
            EngineError::Config(_) => "config",
            EngineError::PipelineClosed => "pipeline_closed",
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_and_kind() {
        let err = EngineError::TransientStore { store: "aggregator", attempts: 3 };
        assert_eq!(err.to_string(), "store `aggregator` unavailable after 3 attempts");
        assert_eq!(err.kind(), "transient_store");

        let err = EngineError::validation("missing timestamp");
        assert_eq!(err.kind(), "validation");
        assert!(err.to_string().contains("missing timestamp"));
    }
}
