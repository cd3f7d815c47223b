use std::fmt;

use ax_types::{StrategyError, ValidationError};
use thiserror::Error;

/// Tokenizer or parser failure with its source position
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}, column {col}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub col: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(line: usize, col: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            col,
            message: message.into(),
        }
    }
}

impl From<ParseError> for ValidationError {
    fn from(err: ParseError) -> Self {
        ValidationError::Syntax {
            line: err.line,
            column: err.col,
            message: err.message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Ordinary script exception (`TypeError`, `ZeroDivisionError`, ...)
    Runtime,
    /// Operation budget, wall-clock or recursion limit hit
    Limit,
}

/// One frame of a script traceback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub function: String,
    pub line: usize,
}

/// Error raised while executing a script
#[derive(Debug, Clone)]
pub struct ScriptError {
    pub kind: ErrorKind,
    /// Exception-style message, e.g. `NameError: name 'x' is not defined`
    pub message: String,
    /// Innermost frame first
    pub frames: Vec<TraceFrame>,
    pub(crate) pending_line: Option<usize>,
}

impl ScriptError {
    pub fn new(exception: &str, message: impl fmt::Display) -> Self {
        Self {
            kind: ErrorKind::Runtime,
            message: format!("{}: {}", exception, message),
            frames: Vec::new(),
            pending_line: None,
        }
    }

    pub fn limit(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Limit,
            message: message.into(),
            frames: Vec::new(),
            pending_line: None,
        }
    }

    pub fn type_error(message: impl fmt::Display) -> Self {
        Self::new("TypeError", message)
    }

    pub fn value_error(message: impl fmt::Display) -> Self {
        Self::new("ValueError", message)
    }

    pub fn name_error(name: &str) -> Self {
        Self::new("NameError", format!("name '{}' is not defined", name))
    }

    pub fn attribute_error(owner: &str, attr: &str) -> Self {
        Self::new("AttributeError", format!("'{}' object has no attribute '{}'", owner, attr))
    }

    pub fn index_error(message: impl fmt::Display) -> Self {
        Self::new("IndexError", message)
    }

    pub fn zero_division() -> Self {
        Self::new("ZeroDivisionError", "division by zero")
    }

    /// Record the statement line the error surfaced at, unless one is already set.
    pub(crate) fn at_line(mut self, line: usize) -> Self {
        if self.pending_line.is_none() {
            self.pending_line = Some(line);
        }
        self
    }

    /// Close the current frame as the error leaves a function.
    pub(crate) fn leave_frame(mut self, function: &str, fallback_line: usize) -> Self {
        let line = self.pending_line.take().unwrap_or(fallback_line);
        self.frames.push(TraceFrame {
            function: function.to_string(),
            line,
        });
        self
    }

    /// Python-style traceback, most recent call last.
    pub fn trace(&self) -> String {
        let mut out = String::from("Traceback (most recent call last):\n");
        for frame in self.frames.iter().rev() {
            out.push_str(&format!("  line {}, in {}\n", frame.line, frame.function));
        }
        out.push_str(&self.message);
        out
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ScriptError {}

impl From<ScriptError> for StrategyError {
    fn from(err: ScriptError) -> Self {
        StrategyError::ExecutionError {
            message: err.message.clone(),
            trace: err.trace(),
        }
    }
}

pub type ScriptResult<T> = Result<T, ScriptError>;
