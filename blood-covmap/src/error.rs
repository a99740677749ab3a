//! Error types.
//!
//! Each stage reports its own error enum; [`Error`] is what the pipeline
//! orchestrator hands back to the caller.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure to build the optimization pipeline from its textual description,
/// or failure reported by the pipeline while it runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("unknown pass name '{name}'")]
    UnknownPass { name: String },

    #[error("invalid pipeline '{text}': {reason}")]
    Malformed { text: String, reason: String },

    #[error("invalid parameters '{params}' for pass '{pass}'")]
    InvalidParams { pass: String, params: String },

    #[error("module verification failed: {message}")]
    Verification { message: String },

    #[error("pass pipeline failed: {message}")]
    Backend { message: String },
}

/// A coverage region or expression the mapping encoder cannot represent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("counter refers to expression #{id}, but only {count} expressions exist")]
    UnknownExpression { id: u32, count: usize },

    #[error("region uses file id {file_id}, but the virtual file mapping has {count} entries")]
    FileIdOutOfRange { file_id: u32, count: usize },

    #[error("expansion region expands file id {file_id}, but the virtual file mapping has {count} entries")]
    ExpansionOutOfRange { file_id: u32, count: usize },

    #[error("invalid region span {line_start}:{column_start}-{line_end}:{column_end}: {reason}")]
    InvalidSpan {
        line_start: u32,
        column_start: u32,
        line_end: u32,
        column_end: u32,
        reason: &'static str,
    },

    #[error("malformed mapping data at byte {offset}: {reason}")]
    Malformed { offset: usize, reason: &'static str },
}

/// Failure while instrumenting a function or emitting coverage records.
#[derive(Debug, Error)]
pub enum CoverageError {
    #[error("intrinsic `{name}` is not available in this LLVM")]
    MissingIntrinsic { name: String },

    #[error("no function named `{name}` in the module")]
    UnknownFunction { name: String },

    #[error("symbol `{name}` referenced from a data object does not exist")]
    UnknownSymbol { name: String },

    #[error("mapping data for `{function}` is {len} bytes, larger than a record can describe")]
    MappingTooLarge { function: String, len: usize },

    #[error("failed to compress the filenames table: {0}")]
    Compression(#[from] io::Error),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error("host rejected the operation: {message}")]
    Host { message: String },
}

/// Failure to load a [`crate::config::PipelineConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level error of a pipeline invocation.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Coverage(#[from] CoverageError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Whether this is a construction error (bad pipeline text).
    ///
    /// Construction errors are fatal for the current compilation unit and
    /// cannot be retried without changing the pipeline description.
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            Error::Pipeline(
                PipelineError::UnknownPass { .. }
                    | PipelineError::Malformed { .. }
                    | PipelineError::InvalidParams { .. }
            )
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_error_messages() {
        let err = PipelineError::UnknownPass {
            name: "not a real pass".into(),
        };
        assert_eq!(err.to_string(), "unknown pass name 'not a real pass'");
    }

    #[test]
    fn test_construction_error_classification() {
        let err: Error = PipelineError::UnknownPass { name: "x".into() }.into();
        assert!(err.is_construction_error());

        let err: Error = PipelineError::Verification {
            message: "bad".into(),
        }
        .into();
        assert!(!err.is_construction_error());

        let err: Error = CoverageError::Host {
            message: "nope".into(),
        }
        .into();
        assert!(!err.is_construction_error());
    }

    #[test]
    fn test_mapping_error_wraps_into_coverage_error() {
        let err: CoverageError = MappingError::FileIdOutOfRange {
            file_id: 3,
            count: 1,
        }
        .into();
        assert!(err.to_string().contains("file id 3"));
    }
}
