//! Error types for the tensor-to-fixed-point compiler

use std::path::PathBuf;

use thiserror::Error;

use crate::ast::Shape;
use crate::interval::Interval;
use crate::scale::Scale;

/// Result type for compilation operations
pub type CompileResult<T> = Result<T, CompileError>;

/// Compilation errors. Every variant aborts the current compilation.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Input file not found: {}", path.display())]
    InputNotFound { path: PathBuf },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Lexer error at position {position}: {message}")]
    LexerError { position: usize, message: String },

    #[error("Parser error: {message}")]
    ParseError { message: String },

    #[error("Type error: {message}")]
    TypeError { message: String },

    #[error("Shape mismatch in `{node}`: {left} vs {right}")]
    ShapeMismatch { node: String, left: Shape, right: Shape },

    #[error("Undeclared variable: {name}")]
    UndeclaredVariable { name: String },

    #[error("Overflow: `{name}` with bound [{lo}, {hi}] cannot be held in {bits} bits at scale {scale}")]
    OverflowBound {
        name: String,
        lo: f64,
        hi: f64,
        scale: Scale,
        bits: u32,
    },

    #[error("Loop-carried `{name}` changes scale across iterations: {first} then {second}")]
    LoopScaleInstability {
        name: String,
        first: Scale,
        second: Scale,
    },

    #[error("Unsupported target: {name} (expected `arduino` or `x86`)")]
    UnsupportedTarget { name: String },

    #[error("Profiling log error: {message}")]
    ProfileError { message: String },
}

impl CompileError {
    pub fn parse_error(msg: impl Into<String>) -> Self {
        CompileError::ParseError { message: msg.into() }
    }

    pub fn type_error(msg: impl Into<String>) -> Self {
        CompileError::TypeError { message: msg.into() }
    }

    pub fn undeclared(name: impl Into<String>) -> Self {
        CompileError::UndeclaredVariable { name: name.into() }
    }

    pub fn shape_mismatch(node: impl Into<String>, left: &Shape, right: &Shape) -> Self {
        CompileError::ShapeMismatch {
            node: node.into(),
            left: left.clone(),
            right: right.clone(),
        }
    }

    pub fn overflow(name: impl Into<String>, interval: &Interval, scale: Scale, bits: u32) -> Self {
        CompileError::OverflowBound {
            name: name.into(),
            lo: interval.lo,
            hi: interval.hi,
            scale,
            bits,
        }
    }

    pub fn profile(msg: impl Into<String>) -> Self {
        CompileError::ProfileError { message: msg.into() }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CompileError::Io {
            path: path.into(),
            source,
        }
    }
}
