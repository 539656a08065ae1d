//! Compiler configuration
//!
//! A [`CompilerConfig`] is built once at the boundary (CLI or library caller)
//! and threaded by reference through inference, IR building, and code
//! generation. Nothing in the pipeline reads ambient settings.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CompileError;
use crate::profile::ProfileData;

/// Integer word size of the generated code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
pub enum WordSize {
    I8,
    I16,
    I32,
}

impl WordSize {
    pub fn bits(&self) -> u32 {
        match self {
            WordSize::I8 => 8,
            WordSize::I16 => 16,
            WordSize::I32 => 32,
        }
    }

    /// Bits of the double-width intermediate used for products and sums
    pub fn wide_bits(&self) -> u32 {
        2 * self.bits()
    }

    pub fn c_type(&self) -> &'static str {
        match self {
            WordSize::I8 => "int8_t",
            WordSize::I16 => "int16_t",
            WordSize::I32 => "int32_t",
        }
    }

    pub fn wide_c_type(&self) -> &'static str {
        match self {
            WordSize::I8 => "int16_t",
            WordSize::I16 => "int32_t",
            WordSize::I32 => "int64_t",
        }
    }
}

impl std::fmt::Display for WordSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "i{}", self.bits())
    }
}

/// Code generation target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    /// Microcontroller build: tables live in program memory
    Arduino,
    /// Desktop build used to validate the fixed-point program
    X86,
}

impl FromStr for Target {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "arduino" => Ok(Target::Arduino),
            "x86" => Ok(Target::X86),
            _ => Err(CompileError::UnsupportedTarget {
                name: s.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Arduino => write!(f, "arduino"),
            Target::X86 => write!(f, "x86"),
        }
    }
}

/// The bundled model whose program is compiled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum Algorithm {
    Bonsai,
    Protonn,
    Lenet,
}

impl Algorithm {
    /// Name of the generated routine
    pub fn routine_name(&self) -> &'static str {
        match self {
            Algorithm::Bonsai => "bonsai_fixed",
            Algorithm::Protonn => "protonn_fixed",
            Algorithm::Lenet => "lenet_fixed",
        }
    }

    /// Source of the bundled demo program for this algorithm
    pub fn bundled_source(&self) -> &'static str {
        match self {
            Algorithm::Bonsai => include_str!("../demos/bonsai.sd"),
            Algorithm::Protonn => include_str!("../demos/protonn.sd"),
            Algorithm::Lenet => include_str!("../demos/lenet.sd"),
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Algorithm::Bonsai => write!(f, "bonsai"),
            Algorithm::Protonn => write!(f, "protonn"),
            Algorithm::Lenet => write!(f, "lenet"),
        }
    }
}

/// Configuration for one compilation
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    pub algorithm: Algorithm,
    pub target: Target,
    pub word: WordSize,
    /// Maximum number of fractional bits any value may use
    pub max_exponent: u32,
    /// Measured input ranges, overriding declared ones
    pub profile: Option<ProfileData>,
}

impl CompilerConfig {
    pub fn new(algorithm: Algorithm, target: Target) -> Self {
        Self {
            algorithm,
            target,
            word: WordSize::I16,
            max_exponent: 14,
            profile: None,
        }
    }

    pub fn with_word(mut self, word: WordSize) -> Self {
        self.word = word;
        self
    }

    pub fn with_max_exponent(mut self, max_exponent: u32) -> Self {
        self.max_exponent = max_exponent;
        self
    }

    pub fn with_profile(mut self, profile: ProfileData) -> Self {
        self.profile = Some(profile);
        self
    }

    /// Number of segments used for lookup tables
    pub fn table_segments(&self) -> usize {
        1usize << self.max_exponent.clamp(2, 7)
    }
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self::new(Algorithm::Bonsai, Target::X86)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_widths() {
        assert_eq!(WordSize::I8.bits(), 8);
        assert_eq!(WordSize::I8.wide_bits(), 16);
        assert_eq!(WordSize::I16.wide_bits(), 32);
        assert_eq!(WordSize::I32.wide_c_type(), "int64_t");
    }

    #[test]
    fn test_target_parsing() {
        assert_eq!("arduino".parse::<Target>().unwrap(), Target::Arduino);
        assert_eq!("X86".parse::<Target>().unwrap(), Target::X86);
        let err = "riscv".parse::<Target>().unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedTarget { name } if name == "riscv"));
    }

    #[test]
    fn test_table_segments_follow_max_exponent() {
        let config = CompilerConfig::default();
        assert_eq!(config.clone().with_max_exponent(0).table_segments(), 4);
        assert_eq!(config.clone().with_max_exponent(5).table_segments(), 32);
        assert_eq!(config.with_max_exponent(14).table_segments(), 128);
    }
}
