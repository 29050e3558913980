// Error surface shared by every Skizo runtime crate.
// Two layers coexist: typed host errors raised synchronously from API calls,
// and numeric abort codes baked into emitted machine code.

use colored::Colorize;
use std::fmt;

pub mod stack_trace;
pub use stack_trace::{render_stack_trace, StackFrameInfo};

/// Where a metadata entity was declared. Line 0 means "unknown".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceLoc {
    pub module: Option<String>,
    pub line: u32,
}

impl SourceLoc {
    pub fn new(module: impl Into<String>, line: u32) -> Self {
        Self {
            module: Some(module.into()),
            line,
        }
    }

    pub fn unknown() -> Self {
        Self::default()
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.module {
            Some(m) => write!(f, "{}:{}", m, self.line),
            None => write!(f, "<unknown>:{}", self.line),
        }
    }
}

/// Abort codes referenced by emitted C text. The numeric values are load
/// bearing: array accessors, failable unwrappers and null checks hardcode
/// them into generated bodies, so they must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    RangeCheck = 0,
    NullableNullCheck = 1,
    NullDereference = 2,
    AssertFailed = 3,
    FailableFailure = 4,
    OutOfMemory = 5,
    DisallowedCall = 6,
    StackOverflow = 7,
    TypeInitializationError = 8,
}

impl ErrorCode {
    pub fn from_i32(code: i32) -> Option<ErrorCode> {
        Some(match code {
            0 => ErrorCode::RangeCheck,
            1 => ErrorCode::NullableNullCheck,
            2 => ErrorCode::NullDereference,
            3 => ErrorCode::AssertFailed,
            4 => ErrorCode::FailableFailure,
            5 => ErrorCode::OutOfMemory,
            6 => ErrorCode::DisallowedCall,
            7 => ErrorCode::StackOverflow,
            8 => ErrorCode::TypeInitializationError,
            _ => return None,
        })
    }

    /// The user-visible message an abort with this code prints.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::RangeCheck => "Out of range.",
            ErrorCode::NullableNullCheck => "Nullable value is null.",
            ErrorCode::NullDereference => "Null dereference.",
            ErrorCode::AssertFailed => "Assert failed.",
            ErrorCode::FailableFailure => "Failable in a failed state.",
            ErrorCode::OutOfMemory => "Out of memory.",
            ErrorCode::DisallowedCall => "Disallowed call.",
            ErrorCode::StackOverflow => "Stack overflow.",
            ErrorCode::TypeInitializationError => "Type initialization error.",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

/// Host-level failures surfaced synchronously from the API that produced
/// them, as opposed to domain aborts which unwind emitted code.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum HostError {
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("bad format: {0}")]
    BadFormat(String),
    #[error("out of range: {0}")]
    OutOfRange(String),
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),
    #[error("contract unsatisfied: {0}")]
    ContractUnsatisfied(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl HostError {
    /// Attaches a source location to the message, the way parser-facing
    /// diagnostics are reported.
    pub fn at(self, loc: &SourceLoc) -> HostError {
        let attach = |msg: String| format!("{} (at {})", msg, loc);
        match self {
            HostError::FileNotFound(m) => HostError::FileNotFound(attach(m)),
            HostError::BadFormat(m) => HostError::BadFormat(attach(m)),
            HostError::OutOfRange(m) => HostError::OutOfRange(attach(m)),
            HostError::IllegalArgument(m) => HostError::IllegalArgument(attach(m)),
            HostError::Timeout(m) => HostError::Timeout(attach(m)),
            HostError::ConcurrentModification(m) => HostError::ConcurrentModification(attach(m)),
            HostError::ContractUnsatisfied(m) => HostError::ContractUnsatisfied(attach(m)),
            HostError::AccessDenied(m) => HostError::AccessDenied(attach(m)),
            HostError::TypeMismatch(m) => HostError::TypeMismatch(attach(m)),
            HostError::InvalidState(m) => HostError::InvalidState(attach(m)),
        }
    }
}

pub type HostResult<T> = Result<T, HostError>;

/// Severity of a reported diagnostic line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Note,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "{}", "error".red().bold()),
            Severity::Warning => write!(f, "{}", "warning".yellow().bold()),
            Severity::Note => write!(f, "{}", "note".cyan().bold()),
        }
    }
}

/// Renders a one-line report the way the embedder prints abort banners.
pub fn report_line(severity: Severity, message: &str, loc: Option<&SourceLoc>) -> String {
    match loc {
        Some(loc) => format!("{}: {} [{}]", severity, message, loc),
        None => format!("{}: {}", severity, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(ErrorCode::RangeCheck as i32, 0);
        assert_eq!(ErrorCode::FailableFailure as i32, 4);
        assert_eq!(ErrorCode::StackOverflow as i32, 7);
        assert_eq!(ErrorCode::TypeInitializationError as i32, 8);
        assert_eq!(ErrorCode::from_i32(4), Some(ErrorCode::FailableFailure));
        assert_eq!(ErrorCode::from_i32(9), None);
    }

    #[test]
    fn test_host_error_location() {
        let loc = SourceLoc::new("main.skizo", 12);
        let err = HostError::TypeMismatch("expected int".into()).at(&loc);
        assert_eq!(
            err.to_string(),
            "type mismatch: expected int (at main.skizo:12)"
        );
    }
}
