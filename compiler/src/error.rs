//! Compile-unit failures.
//!
//! Every variant aborts the current compile unit; there is no partially
//! lowered result. The surrounding runtime decides whether to fall back to
//! host execution.

use crate::error_codes::{self, ErrorCode};
use crate::ir::NodeId;
use thiserror::Error;

pub type CompileResult<T> = Result<T, CompileError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// A node, operator/kind combination or control pattern has no lowering
    /// rule at `stage` (a target name or a phase name).
    #[error("operation not supported on {stage}: {what}")]
    Unsupported { stage: String, what: String },

    /// A memory access could not be attributed to exactly one region.
    #[error("invalid region resolution for {node}: {reason}")]
    InvalidRegion { node: NodeId, reason: String },

    #[error("malformed kernel graph: {0}")]
    Malformed(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("internal compiler error: {0}")]
    Internal(String),
}

impl CompileError {
    pub fn unsupported(stage: impl Into<String>, what: impl Into<String>) -> Self {
        CompileError::Unsupported {
            stage: stage.into(),
            what: what.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        CompileError::Malformed(message.into())
    }

    pub fn invalid_region(node: NodeId, reason: impl Into<String>) -> Self {
        CompileError::InvalidRegion {
            node,
            reason: reason.into(),
        }
    }

    /// Numeric diagnostic code for this failure.
    pub fn code(&self) -> u16 {
        match self {
            CompileError::Unsupported { what, .. } if what.starts_with("kind ") => {
                error_codes::UNSUPPORTED_KIND
            }
            CompileError::Unsupported { .. } => error_codes::UNSUPPORTED_CONSTRUCT,
            CompileError::InvalidRegion { reason, .. } if reason.contains("constant region") => {
                error_codes::WRITE_TO_CONSTANT_REGION
            }
            CompileError::InvalidRegion { .. } => error_codes::INVALID_REGION,
            CompileError::Malformed(_) => error_codes::MALFORMED_GRAPH,
            CompileError::Config(message) if message.starts_with("unknown target") => {
                error_codes::UNKNOWN_TARGET
            }
            CompileError::Config(_) => error_codes::INVALID_OPTIONS,
            CompileError::Internal(_) => error_codes::INTERNAL_ERROR,
        }
    }

    /// Registry entry for [`CompileError::code`].
    pub fn error_code(&self) -> Option<&'static ErrorCode> {
        error_codes::get_error_code(self.code())
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, CompileError::Unsupported { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_registered() {
        let errors = [
            CompileError::unsupported("ptx", "sin on f64"),
            CompileError::unsupported("ptx", "kind f64 on device gpu0"),
            CompileError::malformed("lane select on scalar"),
            CompileError::Config("unknown target `cuda`".into()),
            CompileError::Config("address_bits must be 32 or 64".into()),
            CompileError::Internal("schedule missing".into()),
        ];
        for error in &errors {
            assert!(error.error_code().is_some(), "unregistered: {}", error);
        }
        assert_eq!(errors[1].code(), error_codes::UNSUPPORTED_KIND);
        assert_eq!(errors[3].code(), error_codes::UNKNOWN_TARGET);
    }

    #[test]
    fn test_display_mentions_stage() {
        let error = CompileError::unsupported("opencl", "barrier scope");
        assert_eq!(
            error.to_string(),
            "operation not supported on opencl: barrier scope"
        );
        assert!(error.is_unsupported());
    }
}
