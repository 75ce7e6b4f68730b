// stagecraft-core/src/error.rs
// Error taxonomy shared by the compiler, the builder and the in-memory sink

use thiserror::Error;

/// Errors raised while building or executing a pipeline.
///
/// Every builder error is a programmer error surfaced at the call that
/// caused it. Call sites match on the variant, never on the message.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A referenced field is absent from the current schema view
    #[error("Field '{0}' does not exist in the current schema")]
    InvalidField(String),

    /// Unknown operator suffix, or an operator used where it is not defined
    #[error("Operator '{0}' does not exist, please refer to documentation to see all supported operators")]
    InvalidOperator(String),

    /// Root replacement requested on a field that is not an embedded document
    #[error("Field '{0}' is not an embedded document")]
    InvalidEmbeddedField(String),

    /// Inclusion and exclusion mixed in one projection
    #[error("Invalid projection: {0}")]
    InvalidProjection(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A synthesized or joined field collides with an existing one
    #[error("Field '{0}' already exists")]
    AlreadyExistsField(String),

    #[error("Annotation error: {0}")]
    AnnotationError(String),

    /// A stage was appended after `$out`; carries the attempted operation
    #[error("You cannot use '{0}' after an $out stage, $out must be the last stage of the pipeline")]
    OutStageError(String),

    #[error("Index error: use a non-negative index or a slice without step where start < stop")]
    IndexError,

    #[error("Schema error: {0}")]
    SchemaError(String),

    #[error("Aggregation error: {0}")]
    AggregationError(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_stage_error_names_operation() {
        let err = PipelineError::OutStageError("filter".to_string());
        assert!(err.to_string().contains("'filter'"));
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{nope");
        let err: PipelineError = parse.unwrap_err().into();
        assert!(matches!(err, PipelineError::Serialization(_)));
    }
}
