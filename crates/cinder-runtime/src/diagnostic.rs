//! Error types for the compile and run pipeline
//!
//! The library reports failures as values; nothing in the runtime writes to
//! stderr or exits the process. The CLI renders these and maps them to exit
//! codes (65 compile, 70 runtime).

use std::fmt;
use thiserror::Error;

/// Where a compile error was reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorLocation {
    /// At a source token, quoting its lexeme
    Lexeme(String),
    /// At end of file
    Eof,
    /// A scanner error; the message already describes the character
    Source,
}

impl fmt::Display for ErrorLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorLocation::Lexeme(lexeme) => write!(f, " at '{}'", lexeme),
            ErrorLocation::Eof => write!(f, " at end"),
            ErrorLocation::Source => Ok(()),
        }
    }
}

/// A single compile-time error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[line {line}] Error{location}: {message}")]
pub struct CompileError {
    pub line: u32,
    pub location: ErrorLocation,
    pub message: String,
}

/// One frame of a runtime stack trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    /// Line of the instruction being executed in this frame
    pub line: u32,
    /// Function name; `None` for the top-level script
    pub function: Option<String>,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function {
            Some(name) => write!(f, "[line {}] in {}()", self.line, name),
            None => write!(f, "[line {}] in script", self.line),
        }
    }
}

/// A runtime error with its captured call-stack trace, innermost frame first
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}{}", render_trace(.trace))]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

fn render_trace(trace: &[TraceFrame]) -> String {
    trace.iter().map(|frame| format!("\n{}", frame)).collect()
}

/// Outcome of `VM::interpret` when the program does not complete
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InterpretError {
    /// The compiler reported one or more errors; no code ran
    #[error("{}", render_compile_errors(.0))]
    Compile(Vec<CompileError>),
    /// Execution failed; the VM stacks have been reset
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

fn render_compile_errors(errors: &[CompileError]) -> String {
    errors
        .iter()
        .map(CompileError::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}
