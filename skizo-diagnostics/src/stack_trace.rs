// Stack-trace snapshots captured at abort boundaries.

use crate::SourceLoc;
use colored::Colorize;
use std::fmt::Write as _;

/// One virtual frame as recorded by the frame-push helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrameInfo {
    pub class_name: String,
    pub method_name: String,
    pub source: SourceLoc,
}

impl StackFrameInfo {
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
            source: SourceLoc::unknown(),
        }
    }
}

/// Renders frames innermost-first, matching the order they are popped during
/// unwinding. Colors apply only when the consumer prints to a terminal;
/// `colored` strips them for non-tty sinks.
pub fn render_stack_trace(frames: &[StackFrameInfo]) -> String {
    let mut out = String::new();
    for frame in frames.iter().rev() {
        let qualified = format!("{}::{}", frame.class_name, frame.method_name);
        let _ = writeln!(out, "  at {} [{}]", qualified.as_str().bold(), frame.source);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_order_is_innermost_first() {
        colored::control::set_override(false);
        let frames = vec![
            StackFrameInfo::new("Program", "main"),
            StackFrameInfo::new("Counter", "inc"),
        ];
        let rendered = render_stack_trace(&frames);
        let first = rendered.lines().next().unwrap_or("");
        assert!(first.contains("Counter::inc"));
        assert!(rendered.contains("Program::main"));
    }
}
