//! Scaled constants and nonlinear-function lookup tables
//!
//! Both tables are deduplicated: an identical literal or an identical
//! (function, domain, segment count, max exponent) request returns the
//! entry created the first time.

use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;

use crate::ast::{Nonlinear, Shape};
use crate::error::CompileResult;
use crate::interval::Interval;
use crate::scale::Scale;

/// Stored integer data of a constant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ConstValue {
    Scalar(i64),
    Tensor(Vec<i64>),
}

/// A literal lowered to fixed point
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Constant {
    pub name: String,
    pub shape: Shape,
    pub value: ConstValue,
    pub scale: Scale,
    pub interval: Interval,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstKey {
    Scalar(u64),
    Tensor(Vec<usize>, Vec<u64>),
}

/// Bit pattern used for keys; folds `-0.0` into `0.0`
fn key_bits(value: f64) -> u64 {
    (value + 0.0).to_bits()
}

/// Constants in order of first use
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConstantTable {
    entries: Vec<Constant>,
    #[serde(skip)]
    index: HashMap<ConstKey, usize>,
}

impl ConstantTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the constant for a scalar literal, creating it on first use
    pub fn intern_scalar(
        &mut self,
        value: f64,
        bits: u32,
        max_exponent: u32,
    ) -> CompileResult<&Constant> {
        let key = ConstKey::Scalar(key_bits(value));
        if let Some(&idx) = self.index.get(&key) {
            return Ok(&self.entries[idx]);
        }

        let name = format!("cst{}", self.entries.len());
        let interval = Interval::point(value);
        let scale = Scale::derive(&name, &interval, bits, max_exponent)?;
        let constant = Constant {
            name,
            shape: Shape::scalar(),
            value: ConstValue::Scalar(scale.quantize(value)),
            scale,
            interval,
        };
        Ok(self.push(key, constant))
    }

    /// Return the constant for a tensor literal, creating it on first use
    pub fn intern_tensor(
        &mut self,
        shape: &Shape,
        values: &[f64],
        bits: u32,
        max_exponent: u32,
    ) -> CompileResult<&Constant> {
        let key = ConstKey::Tensor(
            shape.dims().to_vec(),
            values.iter().map(|&v| key_bits(v)).collect(),
        );
        if let Some(&idx) = self.index.get(&key) {
            return Ok(&self.entries[idx]);
        }

        let name = format!("cst{}", self.entries.len());
        let interval = Interval::of_values(values);
        let scale = Scale::derive(&name, &interval, bits, max_exponent)?;
        let constant = Constant {
            name,
            shape: shape.clone(),
            value: ConstValue::Tensor(values.iter().map(|&v| scale.quantize(v)).collect()),
            scale,
            interval,
        };
        Ok(self.push(key, constant))
    }

    fn push(&mut self, key: ConstKey, constant: Constant) -> &Constant {
        debug!(constant = %constant.name, scale = %constant.scale, "new constant");
        self.index.insert(key, self.entries.len());
        self.entries.push(constant);
        &self.entries[self.entries.len() - 1]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Constant> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Sampled approximation of a nonlinear function
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LookupTable {
    pub name: String,
    pub func: Nonlinear,
    pub domain: Interval,
    pub segments: usize,
    pub max_exponent: u32,
    pub scale: Scale,
    /// Range of the sampled values; interpolation never leaves it
    pub range: Interval,
    /// `segments + 1` scaled samples at evenly spaced domain points
    pub samples: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TableKey {
    func: Nonlinear,
    lo: u64,
    hi: u64,
    segments: usize,
    max_exponent: u32,
}

/// Domain to sample for a call whose argument lies in `arg`
pub fn table_domain(func: Nonlinear, arg: &Interval) -> Interval {
    let (lo, hi) = match func.saturation() {
        Some((min, max)) => (arg.lo.clamp(min, max), arg.hi.clamp(min, max)),
        None => (arg.lo, arg.hi),
    };
    if hi - lo < f64::EPSILON {
        Interval::new(lo, lo + 1.0)
    } else {
        Interval::new(lo, hi)
    }
}

/// Sample `func` over `domain` and scale the samples to fit `bits`
pub fn generate_table(
    name: &str,
    func: Nonlinear,
    domain: Interval,
    segments: usize,
    bits: u32,
    max_exponent: u32,
) -> CompileResult<LookupTable> {
    let step = (domain.hi - domain.lo) / segments as f64;
    let reals: Vec<f64> = (0..=segments)
        .map(|i| func.eval(domain.lo + step * i as f64))
        .collect();

    let range = Interval::of_values(&reals);
    let scale = Scale::derive(name, &range, bits, max_exponent)?;

    Ok(LookupTable {
        name: name.to_string(),
        func,
        domain,
        segments,
        max_exponent,
        scale,
        range,
        samples: reals.iter().map(|&v| scale.quantize(v)).collect(),
    })
}

/// Generated tables in order of first use
#[derive(Debug, Clone, Default, Serialize)]
pub struct LookupTables {
    tables: Vec<LookupTable>,
    #[serde(skip)]
    index: HashMap<TableKey, usize>,
}

impl LookupTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the table for this request, generating it on first use
    pub fn get_or_generate(
        &mut self,
        func: Nonlinear,
        domain: Interval,
        segments: usize,
        bits: u32,
        max_exponent: u32,
    ) -> CompileResult<&LookupTable> {
        let key = TableKey {
            func,
            lo: key_bits(domain.lo),
            hi: key_bits(domain.hi),
            segments,
            max_exponent,
        };
        if let Some(&idx) = self.index.get(&key) {
            return Ok(&self.tables[idx]);
        }

        let name = format!("tbl_{}{}", func, self.tables.len());
        let table = generate_table(&name, func, domain, segments, bits, max_exponent)?;
        debug!(
            table = %table.name,
            domain = %table.domain,
            segments,
            scale = %table.scale,
            "generated lookup table"
        );

        self.index.insert(key, self.tables.len());
        self.tables.push(table);
        Ok(&self.tables[self.tables.len() - 1])
    }

    pub fn iter(&self) -> impl Iterator<Item = &LookupTable> {
        self.tables.iter()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
