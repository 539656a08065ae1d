//! Tensor Expression to Fixed-Point Compiler
//!
//! This library compiles a small tensor-expression language into
//! integer-only C for targets without floating-point hardware. Every
//! intermediate value gets a binary scale derived from a static bound on
//! its range, and nonlinear functions become interpolated lookup tables.
//!
//! # Example
//!
//! ```rust
//! use tensor_to_fixed::{compile_source, Algorithm, CompilerConfig, Target};
//!
//! let config = CompilerConfig::new(Algorithm::Bonsai, Target::X86);
//! let result = compile_source("let x : () in [-1, 1] in tanh(x) * 2", &config).unwrap();
//! assert!(result.code.contains("bonsai_fixed"));
//! println!("{}", result.code);
//! ```

pub mod analyzer;
pub mod ast;
pub mod builder;
pub mod codegen;
pub mod config;
pub mod error;
pub mod interval;
pub mod ir;
pub mod lexer;
pub mod parser;
pub mod profile;
pub mod scale;
pub mod tables;

use std::fs;
use std::path::PathBuf;

use tracing::info;

pub use analyzer::Analyzer;
pub use ast::*;
pub use builder::IrBuilder;
pub use codegen::{ArduinoCodegen, CodeGenerator, X86Codegen};
pub use config::{Algorithm, CompilerConfig, Target, WordSize};
pub use error::{CompileError, CompileResult};
pub use interval::Interval;
pub use ir::{Instr, IrExpr, IrProgram};
pub use parser::Parser;
pub use profile::ProfileData;
pub use scale::Scale;

/// Result of compiling one program
#[derive(Debug, Clone)]
pub struct Compilation {
    pub program: IrProgram,
    /// Rendered target source
    pub code: String,
}

/// Parse, type, and lower a program to IR
pub fn build_ir(source: &str, config: &CompilerConfig) -> CompileResult<IrProgram> {
    let mut parser = Parser::new(source);
    let program = parser.parse_program()?;
    info!("parsed program");

    let mut analyzer = Analyzer::new();
    let typed_program = analyzer.analyze(&program)?;
    info!(shape = %typed_program.ty.shape, "inferred types");

    let ir = IrBuilder::new(config).build(&typed_program)?;
    info!(
        instructions = ir.instructions.len(),
        constants = ir.constants.len(),
        tables = ir.tables.len(),
        "built IR"
    );
    Ok(ir)
}

/// Main compilation function: source text in, target source out
pub fn compile_source(source: &str, config: &CompilerConfig) -> CompileResult<Compilation> {
    let program = build_ir(source, config)?;
    let code = config.target.generate(&program, config);
    info!(target = %config.target, bytes = code.len(), "generated code");
    Ok(Compilation { program, code })
}

/// File-level driver: reads the program, compiles it, writes the result
#[derive(Debug)]
pub struct Compiler {
    config: CompilerConfig,
    input: Option<PathBuf>,
    output: PathBuf,
}

impl Compiler {
    /// Without an input path the algorithm's bundled program is compiled
    pub fn new(
        config: CompilerConfig,
        input: Option<PathBuf>,
        output: PathBuf,
    ) -> CompileResult<Self> {
        if let Some(path) = &input {
            if !path.is_file() {
                return Err(CompileError::InputNotFound { path: path.clone() });
            }
        }

        Ok(Self {
            config,
            input,
            output,
        })
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    fn read_source(&self) -> CompileResult<String> {
        match &self.input {
            Some(path) => fs::read_to_string(path).map_err(|e| CompileError::io(path, e)),
            None => Ok(self.config.algorithm.bundled_source().to_string()),
        }
    }

    /// Compile and write the output file. Nothing is written on error.
    pub fn run(&self) -> CompileResult<Compilation> {
        let source = self.read_source()?;
        let compilation = compile_source(&source, &self.config)?;

        fs::write(&self.output, &compilation.code)
            .map_err(|e| CompileError::io(&self.output, e))?;
        info!(path = %self.output.display(), "wrote output");

        Ok(compilation)
    }
}
