// The domain's single unwind mechanism. Aborts raised by emitted code or
// runtime helpers unwind to the nearest guarded boundary (`Domain.try`, a
// static-constructor invocation, or the domain's outermost frame), where
// the token is caught and normalized into a value.
//
// The unwind carrier is `std::panic::panic_any` with a typed token; guarded
// sections use `catch_unwind` and downcast. Where the original used host
// exceptions across compiler-generated frames, this port must only unwind
// across Rust frames; helpers called from C re-enter Rust before raising.

use std::panic::{self, AssertUnwindSafe};

use skizo_diagnostics::ErrorCode;

/// The token thrown by an abort.
#[derive(Debug, Clone)]
pub struct DomainAbort {
    pub code: Option<ErrorCode>,
    pub message: String,
    /// Snapshot rendered at the raise site when stack traces are enabled.
    pub stack_trace: Option<String>,
}

impl DomainAbort {
    pub fn from_code(code: ErrorCode) -> Self {
        Self {
            code: Some(code),
            message: code.message().to_string(),
            stack_trace: None,
        }
    }

    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            stack_trace: None,
        }
    }
}

pub fn abort_with_code(code: ErrorCode) -> ! {
    panic::panic_any(DomainAbort::from_code(code))
}

pub fn abort_with_message(message: impl Into<String>) -> ! {
    panic::panic_any(DomainAbort::from_message(message))
}

pub fn abort_raise(abort: DomainAbort) -> ! {
    panic::panic_any(abort)
}

/// Installed once: keeps the default report for genuine bugs but stays
/// silent for abort tokens, which are caught at a guard boundary anyway.
fn install_silent_hook() {
    static HOOK: std::sync::Once = std::sync::Once::new();
    HOOK.call_once(|| {
        let default_hook = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if info.payload().downcast_ref::<DomainAbort>().is_none() {
                default_hook(info);
            }
        }));
    });
}

/// Runs a guarded section, normalizing any unwind into an abort value.
/// Non-abort panics surface as the generic internal-error abort, matching
/// the catch-all behavior at guard boundaries.
pub fn catch_abort<R>(f: impl FnOnce() -> R) -> Result<R, DomainAbort> {
    install_silent_hook();
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    match result {
        Ok(value) => Ok(value),
        Err(payload) => match payload.downcast::<DomainAbort>() {
            Ok(abort) => Err(*abort),
            Err(other) => {
                let message = other
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| other.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "Unknown internal error.".to_string());
                Err(DomainAbort::from_message(message))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catch_abort_round_trip() {
        let err = catch_abort(|| abort_with_message("Division by zero.")).unwrap_err();
        assert_eq!(err.message, "Division by zero.");
        assert_eq!(err.code, None);
    }

    #[test]
    fn test_code_abort_carries_code() {
        let err = catch_abort(|| abort_with_code(ErrorCode::RangeCheck)).unwrap_err();
        assert_eq!(err.code, Some(ErrorCode::RangeCheck));
        assert_eq!(err.message, "Out of range.");
    }

    #[test]
    fn test_success_passes_through() {
        assert_eq!(catch_abort(|| 42).unwrap(), 42);
    }
}
