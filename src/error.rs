//! Error types for the Tiercel compiler

use std::fmt;
use thiserror::Error;

/// Source location in a compiled program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceLocation {
    /// Line number (1-indexed)
    pub line: u32,
    /// Column number (1-indexed)
    pub column: u32,
}

impl SourceLocation {
    /// Create a new source location
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Main error type for Tiercel
#[derive(Error, Debug)]
pub enum Error {
    /// Parser error - invalid syntax
    #[error("SyntaxError: {message} at {location}")]
    ParseError {
        message: String,
        location: SourceLocation,
    },

    /// Scope analysis error - unresolved name, malformed scope
    #[error("AnalysisError: {message} at {location}")]
    AnalysisError {
        message: String,
        location: SourceLocation,
    },

    /// Baseline compilation failed and no previously installed code exists
    /// to fall back to, so the failure is surfaced to the caller.
    #[error("CompileError: {0}")]
    CompileError(String),

    /// Resource exhaustion while traversing a deeply nested function tree.
    /// May originate on a background thread; it is captured as state and
    /// re-surfaced on the owning thread.
    #[error("StackOverflow: {0}")]
    StackOverflow(String),

    /// Internal compiler error
    #[error("InternalError: {0}")]
    InternalError(String),

    /// IO error
    #[error("IOError: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
}

impl Error {
    /// Create a new parse error
    pub fn parse_error(message: impl Into<String>, location: SourceLocation) -> Self {
        Error::ParseError {
            message: message.into(),
            location,
        }
    }

    /// Create a new analysis error
    pub fn analysis_error(message: impl Into<String>, location: SourceLocation) -> Self {
        Error::AnalysisError {
            message: message.into(),
            location,
        }
    }

    /// Create a stack exhaustion error for a nesting depth
    pub fn stack_overflow(depth: usize, limit: usize) -> Self {
        Error::StackOverflow(format!(
            "expression nesting depth {} exceeds limit {}",
            depth, limit
        ))
    }

    /// True for source-level failures that must propagate to the caller
    /// rather than being recovered by tier fallback.
    pub fn is_source_error(&self) -> bool {
        matches!(self, Error::ParseError { .. } | Error::AnalysisError { .. })
    }
}

/// Result type alias for Tiercel
pub type Result<T> = std::result::Result<T, Error>;

/// Reason an optimization attempt did not produce installed code.
///
/// Each variant is distinguishable so the orchestrator can decide between
/// aborting (never retry this function), retrying later, and silent
/// fallback to baseline code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BailoutReason {
    /// A debugger breakpoint is attached to the function
    FunctionBeingDebugged,
    /// Optimization was permanently disabled by a test directive
    OptimizationDisabledForTest,
    /// The optimizer is globally disabled, the function fails the name
    /// filter, or optimization was disabled after repeated failure
    OptimizationDisabled,
    /// The function has no compiled baseline representation
    NotCompiled,
    /// A speculative assumption was invalidated between prepare and finalize
    DependencyChange,
    /// The concurrent compilation queue is at capacity
    QueueFull,
    /// The heap reported high memory pressure
    HighMemoryPressure,
    /// The optimizing backend failed to generate code
    CodegenFailed,
    /// Numeric-subset module validation failed
    NumericModuleInvalid,
}

impl BailoutReason {
    /// Whether the orchestrator should leave the function eligible for a
    /// later attempt when a job fails with this reason.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            BailoutReason::DependencyChange
                | BailoutReason::QueueFull
                | BailoutReason::HighMemoryPressure
                | BailoutReason::OptimizationDisabled
        )
    }
}

impl fmt::Display for BailoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            BailoutReason::FunctionBeingDebugged => "function is being debugged",
            BailoutReason::OptimizationDisabledForTest => "optimization disabled for test",
            BailoutReason::OptimizationDisabled => "optimization disabled",
            BailoutReason::NotCompiled => "function has no baseline code",
            BailoutReason::DependencyChange => "bailed out due to dependency change",
            BailoutReason::QueueFull => "concurrent compilation queue full",
            BailoutReason::HighMemoryPressure => "high memory pressure",
            BailoutReason::CodegenFailed => "code generation failed",
            BailoutReason::NumericModuleInvalid => "numeric module validation failed",
        };
        write!(f, "{}", msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_location_display() {
        let loc = SourceLocation::new(3, 14);
        assert_eq!(format!("{}", loc), "3:14");
    }

    #[test]
    fn test_parse_error_format() {
        let err = Error::parse_error("unexpected token '}'", SourceLocation::new(1, 9));
        assert_eq!(format!("{}", err), "SyntaxError: unexpected token '}' at 1:9");
        assert!(err.is_source_error());
    }

    #[test]
    fn test_analysis_error_is_source_error() {
        let err = Error::analysis_error("'x' is not defined", SourceLocation::new(2, 1));
        assert!(err.is_source_error());
        assert!(!Error::CompileError("boom".into()).is_source_error());
    }

    #[test]
    fn test_stack_overflow_message() {
        let err = Error::stack_overflow(100, 64);
        let msg = format!("{}", err);
        assert!(msg.contains("100"));
        assert!(msg.contains("64"));
    }

    #[test]
    fn test_bailout_reason_display_distinct() {
        let reasons = [
            BailoutReason::FunctionBeingDebugged,
            BailoutReason::OptimizationDisabledForTest,
            BailoutReason::OptimizationDisabled,
            BailoutReason::NotCompiled,
            BailoutReason::DependencyChange,
            BailoutReason::QueueFull,
            BailoutReason::HighMemoryPressure,
            BailoutReason::CodegenFailed,
            BailoutReason::NumericModuleInvalid,
        ];
        let mut seen = std::collections::HashSet::new();
        for reason in reasons {
            assert!(
                seen.insert(format!("{}", reason)),
                "duplicate message for {:?}",
                reason
            );
        }
    }

    #[test]
    fn test_bailout_retryability() {
        assert!(BailoutReason::DependencyChange.is_retryable());
        assert!(BailoutReason::QueueFull.is_retryable());
        assert!(!BailoutReason::OptimizationDisabledForTest.is_retryable());
        assert!(!BailoutReason::CodegenFailed.is_retryable());
    }
}
