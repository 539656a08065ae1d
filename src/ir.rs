//! Intermediate representation produced by the IR builder
//!
//! Instructions form a flat, ordered program. Scalar arithmetic is spelled
//! out as integer expressions with explicit widening and shifts; tensor
//! operations are calls into the fixed-point runtime library.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::ast::Type;
use crate::interval::Interval;
use crate::scale::Scale;
use crate::tables::{ConstantTable, LookupTables};

/// Integer expression in scaled form
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum IrExpr {
    Var(String),
    Int(i64),
    /// Convert to the double-width intermediate type
    Widen(Box<IrExpr>),
    /// Convert back to the word type
    Narrow(Box<IrExpr>),
    Shl(Box<IrExpr>, u32),
    /// Arithmetic right shift
    Shr(Box<IrExpr>, u32),
    Add(Box<IrExpr>, Box<IrExpr>),
    Sub(Box<IrExpr>, Box<IrExpr>),
    Mul(Box<IrExpr>, Box<IrExpr>),
    Neg(Box<IrExpr>),
    /// `test >= 0 ? then : otherwise`
    Select {
        test: Box<IrExpr>,
        then: Box<IrExpr>,
        otherwise: Box<IrExpr>,
    },
    /// Element of a flat tensor
    Index {
        base: String,
        offset: Box<IrExpr>,
    },
    /// Runtime routine returning a scalar
    Call { routine: String, args: Vec<IrExpr> },
}

impl IrExpr {
    pub fn var(name: impl Into<String>) -> Self {
        IrExpr::Var(name.into())
    }

    pub fn int(value: impl Into<i64>) -> Self {
        IrExpr::Int(value.into())
    }

    /// Multiply the stored integer by `2^k`; `k == 0` leaves the expression untouched
    pub fn shifted(self, k: i32) -> Self {
        match k {
            0 => self,
            k if k > 0 => IrExpr::Shl(Box::new(self), k as u32),
            k => IrExpr::Shr(Box::new(self), k.unsigned_abs()),
        }
    }

    pub fn widen(self) -> Self {
        IrExpr::Widen(Box::new(self))
    }

    pub fn narrow(self) -> Self {
        IrExpr::Narrow(Box::new(self))
    }
}

/// One IR instruction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Instr {
    /// Function-local variable
    Decl { name: String, ty: Type, scale: Scale },
    Assign { dest: String, value: IrExpr },
    /// Runtime routine operating on tensors in place
    Call { routine: String, args: Vec<IrExpr> },
    Comment(String),
    /// Instructions of one inlined function call
    Seq(Vec<Instr>),
    /// Counted loop with a static trip count
    Loop {
        index: String,
        start: usize,
        end: usize,
        body: Vec<Instr>,
    },
}

impl Instr {
    pub fn call(routine: &str, args: Vec<IrExpr>) -> Self {
        Instr::Call {
            routine: routine.to_string(),
            args,
        }
    }

    pub fn assign(dest: impl Into<String>, value: IrExpr) -> Self {
        Instr::Assign {
            dest: dest.into(),
            value,
        }
    }

    /// Number of instructions, counting nested ones
    pub fn count(&self) -> usize {
        match self {
            Instr::Seq(body) | Instr::Loop { body, .. } => {
                1 + body.iter().map(Instr::count).sum::<usize>()
            }
            _ => 1,
        }
    }
}

/// Immutable snapshot of everything the builder produced.
///
/// A backend renders target source from this value alone.
#[derive(Debug, Clone, Serialize)]
pub struct IrProgram {
    pub instructions: Vec<Instr>,
    pub decls: BTreeMap<String, Type>,
    pub scales: BTreeMap<String, Scale>,
    pub intervals: BTreeMap<String, Interval>,
    pub constants: ConstantTable,
    pub tables: LookupTables,
    pub globals: BTreeSet<String>,
    /// Program inputs in declaration order
    pub inputs: Vec<String>,
    /// Variable holding the program result
    pub output: String,
}

impl IrProgram {
    pub fn output_type(&self) -> Option<&Type> {
        self.decls.get(&self.output)
    }

    pub fn output_scale(&self) -> Option<Scale> {
        self.scales.get(&self.output).copied()
    }

    /// Export to JSON format
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl std::fmt::Display for IrProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "IR Program")?;
        writeln!(f, "==========")?;
        writeln!(f, "Inputs: {}", self.inputs.join(", "))?;
        writeln!(f, "Output: {}", self.output)?;
        writeln!(
            f,
            "Instructions: {}",
            self.instructions.iter().map(Instr::count).sum::<usize>()
        )?;
        writeln!(f, "Constants: {}", self.constants.len())?;
        writeln!(f, "Lookup tables: {}", self.tables.len())?;
        writeln!(f, "Globals: {}", self.globals.len())?;
        writeln!(f)?;

        for (name, ty) in &self.decls {
            let scale = self
                .scales
                .get(name)
                .map(|s| s.to_string())
                .unwrap_or_else(|| "?".to_string());
            let interval = self
                .intervals
                .get(name)
                .map(|i| i.to_string())
                .unwrap_or_else(|| "?".to_string());
            writeln!(f, "  {:<12} {:<10} scale {:<6} range {}", name, ty, scale, interval)?;
        }

        Ok(())
    }
}
