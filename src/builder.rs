//! IR builder
//!
//! Lowers a typed AST to fixed-point IR in a single post-order traversal.
//! Every value receives an [`Interval`] bounding its real range and a
//! [`Scale`] chosen so the interval fits the configured word. Operators
//! re-scale their operands explicitly, so the resulting program performs
//! only integer arithmetic.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;

use tracing::{debug, trace};

use crate::ast::{BinaryOp, Nonlinear, Type, TypedExpr, TypedExprKind, TypedFunction, UnaryOp};
use crate::config::CompilerConfig;
use crate::error::{CompileError, CompileResult};
use crate::interval::Interval;
use crate::ir::{Instr, IrExpr, IrProgram};
use crate::scale::Scale;
use crate::tables::{table_domain, Constant, ConstantTable, LookupTables};

/// Prefixes used for generated names; source names starting with them are renamed
const RESERVED_PREFIXES: [&str; 3] = ["tmp", "cst", "tbl_"];

/// Everything the traversal accumulates. Cloned to roll back a loop pass.
#[derive(Debug, Clone, Default)]
struct BuilderState {
    decls: BTreeMap<String, Type>,
    scales: BTreeMap<String, Scale>,
    intervals: BTreeMap<String, Interval>,
    constants: ConstantTable,
    tables: LookupTables,
    globals: BTreeSet<String>,
    inputs: Vec<String>,
    counter: usize,
}

/// A function definition together with the scope it was defined in
#[derive(Debug)]
struct FunctionEntry {
    func: TypedFunction,
    env: HashMap<String, String>,
    funcs: HashMap<String, Rc<FunctionEntry>>,
}

/// Names involved in one `for ... fold` loop
struct LoopHeader<'e> {
    index: &'e str,
    index_ir: String,
    acc: &'e str,
    acc_ir: String,
    ty: &'e Type,
}

/// Outcome of one symbolic pass over a loop body
struct LoopPass {
    instrs: Vec<Instr>,
    result: String,
    scale: Scale,
    interval: Interval,
}

/// Builds an [`IrProgram`] from a typed program.
///
/// One builder lowers one program; all state is owned by the builder and
/// handed over as an immutable snapshot by [`IrBuilder::build`].
pub struct IrBuilder<'a> {
    config: &'a CompilerConfig,
    state: BuilderState,
    /// Source name to IR name for everything in scope
    env: HashMap<String, String>,
    funcs: HashMap<String, Rc<FunctionEntry>>,
}

impl<'a> IrBuilder<'a> {
    pub fn new(config: &'a CompilerConfig) -> Self {
        Self {
            config,
            state: BuilderState::default(),
            env: HashMap::new(),
            funcs: HashMap::new(),
        }
    }

    /// Lower `program` and return the finished IR
    pub fn build(mut self, program: &TypedExpr) -> CompileResult<IrProgram> {
        let mut instructions = Vec::new();
        let output = self.lower(program, &mut instructions)?;
        let state = self.state;

        debug!(
            output = %output,
            values = state.scales.len(),
            constants = state.constants.len(),
            tables = state.tables.len(),
            "IR built"
        );

        Ok(IrProgram {
            instructions,
            decls: state.decls,
            scales: state.scales,
            intervals: state.intervals,
            constants: state.constants,
            tables: state.tables,
            globals: state.globals,
            inputs: state.inputs,
            output,
        })
    }

    fn bits(&self) -> u32 {
        self.config.word.bits()
    }

    fn wide_bits(&self) -> u32 {
        self.config.word.wide_bits()
    }

    fn derive(&self, name: &str, interval: &Interval) -> CompileResult<Scale> {
        Scale::derive(name, interval, self.bits(), self.config.max_exponent)
    }

    fn is_taken(&self, name: &str) -> bool {
        self.state.scales.contains_key(name) || self.state.decls.contains_key(name)
    }

    /// IR name for a source name, renamed if it clashes with an existing value
    fn unique(&self, base: &str) -> String {
        let base = if RESERVED_PREFIXES.iter().any(|p| base.starts_with(p)) {
            format!("v_{}", base)
        } else {
            base.to_string()
        };
        if !self.is_taken(&base) {
            return base;
        }

        let mut k = 1;
        loop {
            let candidate = format!("{}_{}", base, k);
            if !self.is_taken(&candidate) {
                return candidate;
            }
            k += 1;
        }
    }

    /// Fresh temporary name
    fn fresh(&mut self) -> String {
        loop {
            let name = format!("tmp{}", self.state.counter);
            self.state.counter += 1;
            if !self.is_taken(&name) {
                return name;
            }
        }
    }

    fn register(&mut self, name: &str, ty: Type, scale: Scale, interval: Interval) {
        self.state.decls.insert(name.to_string(), ty);
        self.state.scales.insert(name.to_string(), scale);
        self.state.intervals.insert(name.to_string(), interval);
    }

    /// Register a computed value and emit its declaration
    fn declare(
        &mut self,
        name: &str,
        ty: &Type,
        scale: Scale,
        interval: Interval,
        out: &mut Vec<Instr>,
    ) -> CompileResult<()> {
        scale.check_fits(name, &interval, self.bits())?;
        debug!(value = name, %scale, %interval, "declare");

        out.push(Instr::Decl {
            name: name.to_string(),
            ty: ty.clone(),
            scale,
        });
        self.register(name, ty.clone(), scale, interval);
        Ok(())
    }

    fn value(&self, name: &str) -> CompileResult<(Scale, Interval)> {
        let scale = self.state.scales.get(name).copied();
        let interval = self.state.intervals.get(name).copied();
        scale
            .zip(interval)
            .ok_or_else(|| CompileError::undeclared(name))
    }

    /// Shift moving a value from `from` to `to`, rejected when it exceeds the wide word
    fn shift(&self, name: &str, interval: &Interval, from: Scale, to: Scale) -> CompileResult<i32> {
        let k = from.shift_to(to);
        if k.unsigned_abs() >= self.wide_bits() {
            return Err(CompileError::overflow(name, interval, to, self.wide_bits()));
        }
        trace!(value = name, %from, %to, shift = k, "rescale");
        Ok(k)
    }

    /// Run `f` with source name `name` bound to IR name `ir`
    fn with_binding<T>(
        &mut self,
        name: &str,
        ir: String,
        f: impl FnOnce(&mut Self) -> CompileResult<T>,
    ) -> CompileResult<T> {
        let shadowed = self.env.insert(name.to_string(), ir);
        let result = f(self);
        match shadowed {
            Some(prev) => self.env.insert(name.to_string(), prev),
            None => self.env.remove(name),
        };
        result
    }

    /// Lower one expression, appending its instructions to `out`.
    /// Returns the IR name holding the value.
    fn lower(&mut self, expr: &TypedExpr, out: &mut Vec<Instr>) -> CompileResult<String> {
        match &expr.expr {
            TypedExprKind::Number(n) => {
                let (bits, max_exponent) = (self.bits(), self.config.max_exponent);
                let constant = self
                    .state
                    .constants
                    .intern_scalar(*n, bits, max_exponent)?
                    .clone();
                Ok(self.register_constant(constant))
            }

            TypedExprKind::Tensor(values) => {
                let (bits, max_exponent) = (self.bits(), self.config.max_exponent);
                let constant = self
                    .state
                    .constants
                    .intern_tensor(&expr.ty.shape, values, bits, max_exponent)?
                    .clone();
                Ok(self.register_constant(constant))
            }

            TypedExprKind::Variable(name) => self
                .env
                .get(name)
                .cloned()
                .ok_or_else(|| CompileError::undeclared(name)),

            TypedExprKind::Binary { op, left, right } => {
                let a = self.lower(left, out)?;
                let b = self.lower(right, out)?;
                let operands = Operands {
                    a: &a,
                    a_ty: &left.ty,
                    b: &b,
                    b_ty: &right.ty,
                };

                match op {
                    BinaryOp::Add => self.lower_add_sub(false, operands, &expr.ty, out),
                    BinaryOp::Sub => self.lower_add_sub(true, operands, &expr.ty, out),
                    BinaryOp::Mul => self.lower_mul(operands, &expr.ty, out),
                    BinaryOp::MatMul | BinaryOp::Conv => {
                        self.lower_contraction(*op, operands, &expr.ty, out)
                    }
                }
            }

            TypedExprKind::Unary { op, operand } => {
                let a = self.lower(operand, out)?;
                self.lower_unary(*op, &a, &operand.ty, &expr.ty, out)
            }

            TypedExprKind::Nonlinear { func, arg } => {
                let a = self.lower(arg, out)?;
                self.lower_nonlinear(*func, &a, &expr.ty, out)
            }

            TypedExprKind::Input {
                name,
                ty,
                range,
                body,
            } => {
                let ir = self.declare_input(name, ty, *range)?;
                self.with_binding(name, ir, |b| b.lower(body, out))
            }

            TypedExprKind::Let { name, value, body } => {
                let ir = self.lower(value, out)?;
                self.with_binding(name, ir, |b| b.lower(body, out))
            }

            TypedExprKind::Cond {
                predicate,
                then_branch,
                else_branch,
            } => {
                let p = self.lower(predicate, out)?;
                let t = self.lower(then_branch, out)?;
                let e = self.lower(else_branch, out)?;
                self.lower_cond(&p, &t, &e, &expr.ty, out)
            }

            TypedExprKind::Loop {
                index,
                start,
                end,
                acc,
                init,
                body,
            } => {
                let init_ir = self.lower(init, out)?;
                let index_ir = self.unique(index);
                let index_interval = Interval::new(*start as f64, (*end - 1) as f64);
                Scale::INTEGER.check_fits(&index_ir, &index_interval, self.bits())?;
                self.register(&index_ir, Type::scalar(), Scale::INTEGER, index_interval);

                let header = LoopHeader {
                    index,
                    index_ir,
                    acc,
                    acc_ir: self.unique(acc),
                    ty: &expr.ty,
                };
                self.lower_loop(header, *start, *end, &init_ir, body, out)
            }

            TypedExprKind::FuncDef { func, rest } => {
                let entry = Rc::new(FunctionEntry {
                    func: (**func).clone(),
                    env: self.env.clone(),
                    funcs: self.funcs.clone(),
                });
                let shadowed = self.funcs.insert(func.name.clone(), entry);
                let result = self.lower(rest, out);
                match shadowed {
                    Some(prev) => self.funcs.insert(func.name.clone(), prev),
                    None => self.funcs.remove(&func.name),
                };
                result
            }

            TypedExprKind::FuncCall { name, args } => self.lower_call(name, args, out),

            TypedExprKind::Reshape { operand } => {
                let a = self.lower(operand, out)?;
                let (scale, interval) = self.value(&a)?;
                let dest = self.fresh();
                self.declare(&dest, &expr.ty, scale, interval, out)?;
                out.push(Instr::call(
                    "tensor_copy",
                    vec![
                        IrExpr::var(&a),
                        IrExpr::var(&dest),
                        len(&expr.ty),
                        IrExpr::int(0),
                    ],
                ));
                Ok(dest)
            }

            TypedExprKind::Index { operand, index } => {
                let a = self.lower(operand, out)?;
                self.lower_index(&a, &operand.ty, index, &expr.ty, out)
            }
        }
    }

    fn register_constant(&mut self, constant: Constant) -> String {
        self.register(
            &constant.name,
            Type::of(constant.shape),
            constant.scale,
            constant.interval,
        );
        constant.name
    }

    fn declare_input(&mut self, name: &str, ty: &Type, range: (f64, f64)) -> CompileResult<String> {
        let width = ty.width.unwrap_or(self.config.word);
        if width.bits() > self.bits() {
            return Err(CompileError::type_error(format!(
                "input `{}` declared as {} does not fit the {} word",
                name, width, self.config.word
            )));
        }

        let measured = self.config.profile.as_ref().and_then(|p| p.interval(name));
        let interval = match measured {
            Some(interval) => {
                debug!(input = name, %interval, "using profiled range");
                interval
            }
            None => Interval::new(range.0, range.1),
        };

        let ir = self.unique(name);
        let scale = Scale::derive(&ir, &interval, width.bits(), self.config.max_exponent)?;
        debug!(input = %ir, %scale, %interval, "input");

        self.register(&ir, ty.clone(), scale, interval);
        self.state.inputs.push(ir.clone());
        Ok(ir)
    }

    fn lower_add_sub(
        &mut self,
        subtract: bool,
        ops: Operands<'_>,
        ty: &Type,
        out: &mut Vec<Instr>,
    ) -> CompileResult<String> {
        let (sa, ia) = self.value(ops.a)?;
        let (sb, ib) = self.value(ops.b)?;
        let interval = if subtract { ia.sub(&ib) } else { ia.add(&ib) };
        let dest = self.fresh();

        // Both operands move to the finer scale, coarsened until operands and
        // sum fit the wide word
        let span = ia.hull(&ib).hull(&interval);
        let widest = Scale::derive(&dest, &span, self.wide_bits(), self.config.max_exponent)?;
        let common = sa.finer(sb).max(widest);
        let scale = self.derive(&dest, &interval)?.max(common);

        let shift_a = self.shift(&dest, &ia, sa, common)?;
        let shift_b = self.shift(&dest, &ib, sb, common)?;
        let normalize = self.shift(&dest, &interval, common, scale)?;
        self.declare(&dest, ty, scale, interval, out)?;

        let shifts = |first: i32, second: i32| {
            [IrExpr::int(first), IrExpr::int(second), IrExpr::int(normalize)]
        };

        let instr = match (ops.a_ty.is_scalar(), ops.b_ty.is_scalar()) {
            (true, true) => {
                let lhs = Box::new(IrExpr::var(ops.a).widen().shifted(shift_a));
                let rhs = Box::new(IrExpr::var(ops.b).widen().shifted(shift_b));
                let sum = if subtract {
                    IrExpr::Sub(lhs, rhs)
                } else {
                    IrExpr::Add(lhs, rhs)
                };
                Instr::assign(&dest, sum.shifted(normalize).narrow())
            }
            (false, false) => {
                let routine = if subtract { "tensor_sub" } else { "tensor_add" };
                tensor_call(routine, [ops.a, ops.b, &dest], len(ty), shifts(shift_a, shift_b))
            }
            (false, true) => {
                let routine = if subtract {
                    "tensor_sub_scalar"
                } else {
                    "tensor_add_scalar"
                };
                tensor_call(routine, [ops.a, ops.b, &dest], len(ty), shifts(shift_a, shift_b))
            }
            (true, false) if subtract => tensor_call(
                "scalar_sub_tensor",
                [ops.a, ops.b, &dest],
                len(ty),
                shifts(shift_a, shift_b),
            ),
            (true, false) => tensor_call(
                "tensor_add_scalar",
                [ops.b, ops.a, &dest],
                len(ty),
                shifts(shift_b, shift_a),
            ),
        };

        out.push(instr);
        Ok(dest)
    }

    fn lower_mul(&mut self, ops: Operands<'_>, ty: &Type, out: &mut Vec<Instr>) -> CompileResult<String> {
        let (sa, ia) = self.value(ops.a)?;
        let (sb, ib) = self.value(ops.b)?;
        let interval = ia.mul(&ib);
        let dest = self.fresh();

        let product = Scale(sa.0 + sb.0);
        product.check_fits(&dest, &interval, self.wide_bits())?;
        let scale = self.derive(&dest, &interval)?.max(product);
        let normalize = self.shift(&dest, &interval, product, scale)?;
        self.declare(&dest, ty, scale, interval, out)?;

        let instr = match (ops.a_ty.is_scalar(), ops.b_ty.is_scalar()) {
            (true, true) => {
                let mul = IrExpr::Mul(
                    Box::new(IrExpr::var(ops.a).widen()),
                    Box::new(IrExpr::var(ops.b).widen()),
                );
                Instr::assign(&dest, mul.shifted(normalize).narrow())
            }
            (false, false) => {
                tensor_call("tensor_mul", [ops.a, ops.b, &dest], len(ty), [IrExpr::int(normalize)])
            }
            (false, true) => {
                tensor_call("tensor_scale", [ops.a, ops.b, &dest], len(ty), [IrExpr::int(normalize)])
            }
            (true, false) => {
                tensor_call("tensor_scale", [ops.b, ops.a, &dest], len(ty), [IrExpr::int(normalize)])
            }
        };

        out.push(instr);
        Ok(dest)
    }

    /// Matrix product and convolution: `k` products summed in a wide accumulator
    fn lower_contraction(
        &mut self,
        op: BinaryOp,
        ops: Operands<'_>,
        ty: &Type,
        out: &mut Vec<Instr>,
    ) -> CompileResult<String> {
        let not_matrix = || CompileError::type_error(format!("`{}` needs 2-D operands", op));
        let (rows, cols) = ops.a_ty.shape.matrix().ok_or_else(not_matrix)?;
        let (k_rows, k_cols) = ops.b_ty.shape.matrix().ok_or_else(not_matrix)?;

        let (routine, terms, dims) = match op {
            BinaryOp::MatMul => ("mat_mul", cols, vec![rows, cols, k_cols]),
            _ => ("conv2d", k_rows * k_cols, vec![rows, cols, k_rows, k_cols]),
        };

        let (sa, ia) = self.value(ops.a)?;
        let (sb, ib) = self.value(ops.b)?;
        let interval = ia.dot(&ib, terms);
        let dest = self.fresh();

        // Smallest right shift per product that keeps the running sum in the wide word
        let product = Scale(sa.0 + sb.0);
        let wide = self.wide_bits();
        let pre = (0..wide as i32)
            .find(|&p| {
                Scale(product.0 + p)
                    .check_fits(&dest, &interval, wide)
                    .is_ok()
            })
            .ok_or_else(|| CompileError::overflow(&dest, &interval, product, wide))?;
        let accumulator = Scale(product.0 + pre);

        let scale = self.derive(&dest, &interval)?.max(accumulator);
        let post = self.shift(&dest, &interval, accumulator, scale)?;
        debug!(value = %dest, terms, pre, post, "contraction");
        self.declare(&dest, ty, scale, interval, out)?;

        let mut args = vec![IrExpr::var(ops.a), IrExpr::var(ops.b), IrExpr::var(&dest)];
        args.extend(dims.into_iter().map(|d| IrExpr::int(d as i64)));
        args.push(IrExpr::int(-pre));
        args.push(IrExpr::int(post));
        out.push(Instr::call(routine, args));
        Ok(dest)
    }

    fn lower_unary(
        &mut self,
        op: UnaryOp,
        a: &str,
        operand_ty: &Type,
        ty: &Type,
        out: &mut Vec<Instr>,
    ) -> CompileResult<String> {
        let (scale, interval) = self.value(a)?;
        let dest = self.fresh();
        let scalar = operand_ty.is_scalar();

        let instr = match op {
            UnaryOp::Neg => {
                self.declare(&dest, ty, scale, interval.neg(), out)?;
                if scalar {
                    Instr::assign(&dest, IrExpr::Neg(Box::new(IrExpr::var(a))))
                } else {
                    tensor_call("tensor_neg", [a, &dest], len(ty), [])
                }
            }
            UnaryOp::Relu => {
                self.declare(&dest, ty, scale, interval.relu(), out)?;
                if scalar {
                    Instr::assign(
                        &dest,
                        IrExpr::Select {
                            test: Box::new(IrExpr::var(a)),
                            then: Box::new(IrExpr::var(a)),
                            otherwise: Box::new(IrExpr::int(0)),
                        },
                    )
                } else {
                    tensor_call("tensor_relu", [a, &dest], len(ty), [])
                }
            }
            UnaryOp::ArgMax => {
                let count = operand_ty.shape.len();
                let positions = Interval::new(0.0, count.saturating_sub(1) as f64);
                self.declare(&dest, ty, Scale::INTEGER, positions, out)?;
                Instr::assign(
                    &dest,
                    IrExpr::Call {
                        routine: "arg_max".to_string(),
                        args: vec![IrExpr::var(a), IrExpr::int(count as i64)],
                    },
                )
            }
            UnaryOp::Transpose => {
                let (rows, cols) = operand_ty
                    .shape
                    .matrix()
                    .ok_or_else(|| CompileError::type_error("transpose needs a 2-D operand"))?;
                self.declare(&dest, ty, scale, interval, out)?;
                Instr::call(
                    "transpose",
                    vec![
                        IrExpr::var(a),
                        IrExpr::var(&dest),
                        IrExpr::int(rows as i64),
                        IrExpr::int(cols as i64),
                    ],
                )
            }
        };

        out.push(instr);
        Ok(dest)
    }

    /// Nonlinear functions become a table lookup with linear interpolation
    fn lower_nonlinear(
        &mut self,
        func: Nonlinear,
        a: &str,
        ty: &Type,
        out: &mut Vec<Instr>,
    ) -> CompileResult<String> {
        let (arg_scale, arg_interval) = self.value(a)?;
        let domain = table_domain(func, &arg_interval);
        let segments = self.config.table_segments();
        let (bits, max_exponent) = (self.bits(), self.config.max_exponent);

        let table = self
            .state
            .tables
            .get_or_generate(func, domain, segments, bits, max_exponent)?;
        let (table_name, scale, range) = (table.name.clone(), table.scale, table.range);

        // Domain expressed in the argument's stored units
        let lo_q = arg_scale.quantize(domain.lo);
        let span_q = (arg_scale.quantize(domain.hi) - lo_q).max(1);

        let dest = self.fresh();
        self.declare(&dest, ty, scale, range, out)?;

        let lookup = [
            IrExpr::var(&table_name),
            IrExpr::int(lo_q),
            IrExpr::int(span_q),
            IrExpr::int(segments as i64),
        ];

        let instr = if ty.is_scalar() {
            let mut args = vec![IrExpr::var(a)];
            args.extend(lookup);
            Instr::assign(
                &dest,
                IrExpr::Call {
                    routine: "table_interp".to_string(),
                    args,
                },
            )
        } else {
            tensor_call("tensor_table_interp", [a, &dest], len(ty), lookup)
        };

        out.push(instr);
        Ok(dest)
    }

    /// Both branches are evaluated; the result selects on the predicate's sign
    fn lower_cond(
        &mut self,
        p: &str,
        t: &str,
        e: &str,
        ty: &Type,
        out: &mut Vec<Instr>,
    ) -> CompileResult<String> {
        let (st, it) = self.value(t)?;
        let (se, ie) = self.value(e)?;
        let interval = it.hull(&ie);
        let dest = self.fresh();

        let scale = self.derive(&dest, &interval)?;
        let shift_t = self.shift(&dest, &it, st, scale)?;
        let shift_e = self.shift(&dest, &ie, se, scale)?;
        self.declare(&dest, ty, scale, interval, out)?;

        let instr = if ty.is_scalar() {
            Instr::assign(
                &dest,
                IrExpr::Select {
                    test: Box::new(IrExpr::var(p)),
                    then: Box::new(rescaled(t, shift_t)),
                    otherwise: Box::new(rescaled(e, shift_e)),
                },
            )
        } else {
            let mut args = vec![
                IrExpr::var(p),
                IrExpr::var(t),
                IrExpr::var(e),
                IrExpr::var(&dest),
            ];
            args.extend([len(ty), IrExpr::int(shift_t), IrExpr::int(shift_e)]);
            Instr::call("tensor_select", args)
        };

        out.push(instr);
        Ok(dest)
    }

    /// The accumulator's scale comes from the first pass over the body.
    /// Further passes widen its interval, one per iteration, until the
    /// interval stops growing or the trip count is covered; the scale must
    /// hold throughout. Only the last pass is kept and emitted as a loop.
    fn lower_loop(
        &mut self,
        header: LoopHeader<'_>,
        start: usize,
        end: usize,
        init_ir: &str,
        body: &TypedExpr,
        out: &mut Vec<Instr>,
    ) -> CompileResult<String> {
        let (init_scale, init_interval) = self.value(init_ir)?;
        let snapshot = self.state.clone();

        let first = self.loop_pass(&header, init_scale, init_interval, body)?;
        let mut reached = init_interval.hull(&first.interval);
        let s1 = self.derive(&header.acc_ir, &reached)?;

        let trips = end - start;
        let mut passes = 1;
        let last = loop {
            self.state = snapshot.clone();
            let pass = self.loop_pass(&header, s1, reached, body)?;
            passes += 1;

            let widened = reached.hull(&pass.interval);
            let scale = self.derive(&header.acc_ir, &widened)?;
            if scale != s1 {
                debug!(acc = %header.acc_ir, passes, %widened, "loop scale diverged");
                return Err(CompileError::LoopScaleInstability {
                    name: header.acc_ir,
                    first: s1,
                    second: scale,
                });
            }

            let converged = widened == reached;
            reached = widened;
            if converged || passes >= trips {
                break pass;
            }
        };
        debug!(acc = %header.acc_ir, scale = %s1, %reached, passes, "loop scale stable");

        let acc = header.acc_ir.clone();
        self.register(&acc, header.ty.clone(), s1, reached);
        self.state.globals.insert(acc.clone());

        let init_shift = self.shift(&acc, &init_interval, init_scale, s1)?;
        let back_shift = self.shift(&acc, &last.interval, last.scale, s1)?;
        let mut body_instrs = last.instrs;

        if header.ty.is_scalar() {
            out.push(Instr::assign(&acc, rescaled(init_ir, init_shift)));
            body_instrs.push(Instr::assign(&acc, rescaled(&last.result, back_shift)));
        } else {
            let count = len(header.ty);
            out.push(tensor_call("tensor_copy", [init_ir, &acc], count.clone(), [IrExpr::int(init_shift)]));
            body_instrs.push(tensor_call(
                "tensor_copy",
                [&last.result, &acc],
                count,
                [IrExpr::int(back_shift)],
            ));
        }

        out.push(Instr::Loop {
            index: header.index_ir,
            start,
            end,
            body: body_instrs,
        });
        Ok(acc)
    }

    fn loop_pass(
        &mut self,
        header: &LoopHeader<'_>,
        scale: Scale,
        interval: Interval,
        body: &TypedExpr,
    ) -> CompileResult<LoopPass> {
        self.register(&header.acc_ir, header.ty.clone(), scale, interval);
        trace!(acc = %header.acc_ir, %scale, %interval, "loop pass");

        let mut instrs = Vec::new();
        let result = self.with_binding(header.acc, header.acc_ir.clone(), |b| {
            b.with_binding(header.index, header.index_ir.clone(), |b| {
                b.lower(body, &mut instrs)
            })
        })?;
        let (scale, interval) = self.value(&result)?;

        Ok(LoopPass {
            instrs,
            result,
            scale,
            interval,
        })
    }

    /// Each call site is expanded with the callee's defining scope
    fn lower_call(&mut self, name: &str, args: &[TypedExpr], out: &mut Vec<Instr>) -> CompileResult<String> {
        let entry = self
            .funcs
            .get(name)
            .cloned()
            .ok_or_else(|| CompileError::undeclared(name))?;

        let mut arg_irs = Vec::with_capacity(args.len());
        for arg in args {
            arg_irs.push(self.lower(arg, out)?);
        }
        let mut expansion = vec![Instr::Comment(format!("{}({})", name, arg_irs.join(", ")))];

        let mut env = entry.env.clone();
        for ((param, _), arg) in entry.func.params.iter().zip(arg_irs) {
            env.insert(param.clone(), arg);
        }

        let saved_env = std::mem::replace(&mut self.env, env);
        let saved_funcs = std::mem::replace(&mut self.funcs, entry.funcs.clone());
        let result = self.lower(&entry.func.body, &mut expansion);
        self.env = saved_env;
        self.funcs = saved_funcs;

        out.push(Instr::Seq(expansion));
        result
    }

    fn lower_index(
        &mut self,
        a: &str,
        operand_ty: &Type,
        index: &TypedExpr,
        ty: &Type,
        out: &mut Vec<Instr>,
    ) -> CompileResult<String> {
        let leading = operand_ty
            .shape
            .dims()
            .first()
            .copied()
            .ok_or_else(|| CompileError::type_error(format!("cannot index scalar `{}`", a)))?;

        let offset = match &index.expr {
            TypedExprKind::Number(n) => IrExpr::int(*n as i64),
            _ => {
                let i = self.lower(index, out)?;
                let (scale, bounds) = self.value(&i)?;
                let in_range = bounds.lo >= 0.0 && bounds.hi <= (leading - 1) as f64;
                if scale != Scale::INTEGER || !in_range {
                    return Err(CompileError::type_error(format!(
                        "index `{}` must be an integer in [0, {}], got {} at scale {}",
                        i,
                        leading - 1,
                        bounds,
                        scale
                    )));
                }
                IrExpr::var(&i)
            }
        };

        let (scale, interval) = self.value(a)?;
        let dest = self.fresh();
        self.declare(&dest, ty, scale, interval, out)?;

        let instr = if ty.is_scalar() {
            Instr::assign(
                &dest,
                IrExpr::Index {
                    base: a.to_string(),
                    offset: Box::new(offset),
                },
            )
        } else {
            Instr::call(
                "tensor_slice",
                vec![IrExpr::var(a), IrExpr::var(&dest), offset, len(ty)],
            )
        };

        out.push(instr);
        Ok(dest)
    }
}

/// Lowered operands of a binary operator
#[derive(Clone, Copy)]
struct Operands<'o> {
    a: &'o str,
    a_ty: &'o Type,
    b: &'o str,
    b_ty: &'o Type,
}

fn len(ty: &Type) -> IrExpr {
    IrExpr::int(ty.shape.len() as i64)
}

/// A scalar moved by `2^k`, widened while it is shifted
fn rescaled(name: &str, k: i32) -> IrExpr {
    if k == 0 {
        IrExpr::var(name)
    } else {
        IrExpr::var(name).widen().shifted(k).narrow()
    }
}

/// Runtime call shaped `routine(tensors..., len, extra...)`
fn tensor_call<const N: usize, const M: usize>(
    routine: &str,
    tensors: [&str; N],
    count: IrExpr,
    extra: [IrExpr; M],
) -> Instr {
    let mut args: Vec<IrExpr> = tensors.iter().map(|t| IrExpr::var(*t)).collect();
    args.push(count);
    args.extend(extra);
    Instr::call(routine, args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Analyzer;
    use crate::config::{Algorithm, Target, WordSize};
    use crate::parser::parse;
    use pretty_assertions::assert_eq;

    fn build_with(source: &str, config: &CompilerConfig) -> CompileResult<IrProgram> {
        let typed = Analyzer::new().analyze(&parse(source)?)?;
        IrBuilder::new(config).build(&typed)
    }

    fn build(source: &str) -> CompileResult<IrProgram> {
        build_with(source, &CompilerConfig::default())
    }

    fn output_interval(program: &IrProgram) -> Interval {
        program.intervals[&program.output]
    }

    fn find_assign<'p>(program: &'p IrProgram, dest: &str) -> Option<&'p IrExpr> {
        program.instructions.iter().find_map(|i| match i {
            Instr::Assign { dest: d, value } if d == dest => Some(value),
            _ => None,
        })
    }

    #[test]
    fn test_add_interval_and_scale() {
        let config = CompilerConfig::new(Algorithm::Bonsai, Target::X86).with_max_exponent(0);
        let program = build_with(
            "let a : () in [0, 10] in let b : () in [0, 5] in a + b",
            &config,
        )
        .unwrap();

        assert_eq!(output_interval(&program), Interval::new(0.0, 15.0));
        let scale = program.output_scale().unwrap();
        assert!(15.0 * 2f64.powi(-scale.0) < 32768.0);
        assert_eq!(program.inputs, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_add_aligns_coarser_operand_to_finer() {
        // a: [0, 100] at 2^-8, b: [0, 1] at 2^-14
        let program = build("let a : () in [0, 100] in let b : () in [0, 1] in a + b").unwrap();
        assert_eq!(program.scales["a"], Scale(-8));
        assert_eq!(program.scales["b"], Scale(-14));

        let expected = IrExpr::Add(
            Box::new(IrExpr::var("a").widen().shifted(6)),
            Box::new(IrExpr::var("b").widen()),
        )
        .shifted(-6)
        .narrow();
        assert_eq!(find_assign(&program, &program.output), Some(&expected));
        assert_eq!(program.scales[&program.output], Scale(-8));
    }

    #[test]
    fn test_add_of_tiny_constant_coarsens_alignment() {
        let config = CompilerConfig::default().with_word(WordSize::I8);
        let program = build_with("let x : () in [0, 4] in x + 0.01", &config).unwrap();
        assert_eq!(program.scales["x"], Scale(-4));
        assert_eq!(program.scales["cst0"], Scale(-13));

        // Aligned at 2^-12, the finest scale holding [0, 4.01] in 16 bits
        let expected = IrExpr::Add(
            Box::new(IrExpr::var("x").widen().shifted(8)),
            Box::new(IrExpr::var("cst0").widen().shifted(-1)),
        )
        .shifted(-8)
        .narrow();
        assert_eq!(find_assign(&program, &program.output), Some(&expected));
        assert_eq!(program.scales[&program.output], Scale(-4));
    }

    /// Evaluate the shifts and casts of a rescaled scalar
    fn eval_rescaled(expr: &IrExpr, stored: i64) -> i64 {
        match expr {
            IrExpr::Var(_) => stored,
            IrExpr::Widen(inner) | IrExpr::Narrow(inner) => eval_rescaled(inner, stored),
            IrExpr::Shl(inner, k) => eval_rescaled(inner, stored) << k,
            IrExpr::Shr(inner, k) => eval_rescaled(inner, stored) >> k,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rescale_to_same_scale_emits_no_shift() {
        assert_eq!(rescaled("v", 0), IrExpr::var("v"));
    }

    #[test]
    fn test_rescale_finer_and_back_keeps_value() {
        let (coarse, fine) = (Scale(-4), Scale(-9));
        let down = rescaled("v", coarse.shift_to(fine));
        let up = rescaled("v", fine.shift_to(coarse));
        for stored in [-1234i64, -1, 0, 1, 999] {
            let finer = eval_rescaled(&down, stored);
            assert_eq!(finer as f64 * 2f64.powi(fine.0), stored as f64 * 2f64.powi(coarse.0));
            assert_eq!(eval_rescaled(&up, finer), stored);
        }
    }

    #[test]
    fn test_same_scale_add_has_no_shift() {
        let program = build("let a : () in [0, 1] in let b : () in [0, 1] in a + b").unwrap();
        // Sum [0, 2] needs one bit more than its operands
        let expected = IrExpr::Add(
            Box::new(IrExpr::var("a").widen()),
            Box::new(IrExpr::var("b").widen()),
        )
        .shifted(-1)
        .narrow();
        assert_eq!(find_assign(&program, &program.output), Some(&expected));
    }

    #[test]
    fn test_mul_uses_corner_products() {
        let program = build("let a : () in [-2, 2] in let b : () in [-3, 1] in a * b").unwrap();
        assert_eq!(output_interval(&program), Interval::new(-6.0, 6.0));
        let scale = program.output_scale().unwrap();
        scale
            .check_fits(&program.output, &Interval::new(-6.0, 6.0), 16)
            .unwrap();
    }

    #[test]
    fn test_matmul_accumulates_contraction() {
        let program = build(
            "let W : (2, 8) in [-1, 1] in let X : (8, 1) in [-1, 1] in W @ X",
        )
        .unwrap();
        assert_eq!(output_interval(&program), Interval::new(-8.0, 8.0));

        let call = program
            .instructions
            .iter()
            .find_map(|i| match i {
                Instr::Call { routine, args } if routine == "mat_mul" => Some(args.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(call.len(), 8);
        assert_eq!(
            call[3..6].to_vec(),
            vec![IrExpr::int(2), IrExpr::int(8), IrExpr::int(1)]
        );
    }

    #[test]
    fn test_constants_deduplicated() {
        let program = build("let x : () in [0, 1] in x * 0.5 + x * 0.5").unwrap();
        assert_eq!(program.constants.len(), 1);
    }

    #[test]
    fn test_nonlinear_calls_share_table() {
        let program =
            build("let x : (4,) in [-1, 1] in let y : (4,) in [-1, 1] in tanh(x) + tanh(y)")
                .unwrap();
        assert_eq!(program.tables.len(), 1);
        let table = program.tables.iter().next().unwrap();
        assert_eq!(table.samples.len(), 128 + 1);
    }

    #[test]
    fn test_exp_of_huge_range_overflows() {
        let err = build("let x : () in [0, 1000] in exp(x)").unwrap_err();
        assert!(matches!(err, CompileError::OverflowBound { .. }));
    }

    #[test]
    fn test_stable_loop_emits_single_loop() {
        let program = build(
            "let x : () in [0, 1] in for i in [0:4] fold acc = 0 in acc * 0.5 + x * 0.5",
        )
        .unwrap();

        let loops = program
            .instructions
            .iter()
            .filter(|i| matches!(i, Instr::Loop { .. }))
            .count();
        assert_eq!(loops, 1);
        assert_eq!(program.output, "acc");
        assert!(program.globals.contains("acc"));
    }

    #[test]
    fn test_growing_accumulator_is_unstable() {
        let err = build("let x : () in [0, 1] in for i in [0:4] fold acc = 0 in acc + x")
            .unwrap_err();
        assert!(matches!(err, CompileError::LoopScaleInstability { name, .. } if name == "acc"));
    }

    #[test]
    fn test_slow_accumulator_is_bounded_over_all_trips() {
        let program = build(
            "let x : () in [0, 0.01] in for i in [0:4] fold acc = 0 in acc + x",
        )
        .unwrap();
        let reached = program.intervals["acc"];
        assert_eq!(reached.lo, 0.0);
        assert!((reached.hi - 0.04).abs() < 1e-12);
        program.scales["acc"].check_fits("acc", &reached, 16).unwrap();
    }

    #[test]
    fn test_long_loop_outgrowing_its_scale_is_unstable() {
        let err = build("for i in [0:30000] fold acc = 0 in acc + 0.0001").unwrap_err();
        assert!(matches!(
            err,
            CompileError::LoopScaleInstability { name, first: Scale(-14), .. } if name == "acc"
        ));
    }

    #[test]
    fn test_loop_pass_is_rolled_back() {
        let program = build(
            "let x : () in [0, 1] in for i in [0:4] fold acc = 0 in acc * 0.5 + x * 0.25",
        )
        .unwrap();
        // Each constant interned once even though the body was visited twice
        assert_eq!(program.constants.len(), 3);
    }

    #[test]
    fn test_loop_index_reads_tensor() {
        let program = build(
            "let X : (4,) in [0, 0.25] in for i in [0:4] fold s = 0 in s + X[i]",
        )
        .unwrap();
        assert_eq!(program.scales["i"], Scale::INTEGER);
        assert_eq!(program.intervals["i"], Interval::new(0.0, 3.0));
    }

    #[test]
    fn test_function_calls_expand_per_site() {
        let program = build(
            "let a : () in [0, 1] in let b : () in [0, 100] in \
             def twice(v: ()) = v + v in twice(a) + twice(b)",
        )
        .unwrap();
        let expansions: Vec<_> = program
            .instructions
            .iter()
            .filter_map(|i| match i {
                Instr::Seq(body) => body.first().cloned(),
                _ => None,
            })
            .collect();
        assert_eq!(
            expansions,
            vec![
                Instr::Comment("twice(a)".into()),
                Instr::Comment("twice(b)".into())
            ]
        );
        assert_eq!(output_interval(&program), Interval::new(0.0, 202.0));
    }

    #[test]
    fn test_shadowed_names_are_renamed() {
        let program = build("let x : () in [0, 1] in let y = x in let x : () in [0, 2] in x + y")
            .unwrap();
        assert_eq!(program.inputs, vec!["x".to_string(), "x_1".to_string()]);
    }

    #[test]
    fn test_profile_overrides_input_range() {
        let mut profile = crate::profile::ProfileData::default();
        profile.insert("x", -0.5, 0.5);
        let config = CompilerConfig::default().with_profile(profile);
        let program = build_with("let x : () in [-100, 100] in relu(x)", &config).unwrap();
        assert_eq!(program.intervals["x"], Interval::new(-0.5, 0.5));
        assert_eq!(output_interval(&program), Interval::new(0.0, 0.5));
    }

    #[test]
    fn test_input_wider_than_word_rejected() {
        let config = CompilerConfig::default().with_word(WordSize::I8);
        let err = build_with("let x : () as i16 in [0, 1] in x", &config).unwrap_err();
        assert!(matches!(err, CompileError::TypeError { .. }));
    }

    #[test]
    fn test_argmax_is_integer() {
        let program = build("let X : (10,) in [-1, 1] in argmax(X)").unwrap();
        assert_eq!(program.output_scale(), Some(Scale::INTEGER));
        assert_eq!(output_interval(&program), Interval::new(0.0, 9.0));
    }

    #[test]
    fn test_every_declared_value_fits() {
        let program = build(
            "let W : (3, 4) in [-2, 2] in let X : (4, 1) in [0, 5] in \
             let h = relu(W @ X + 1.5) in sigmoid(h) * 3 - 1",
        )
        .unwrap();
        for (name, interval) in &program.intervals {
            program.scales[name].check_fits(name, interval, 16).unwrap();
        }
    }
}
