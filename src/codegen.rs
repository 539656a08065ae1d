//! Code generators for the supported targets
//!
//! Renders an [`IrProgram`] as a single C source file. Tensors are flat
//! row-major arrays; the runtime routines named by the IR (`tensor_add`,
//! `mat_mul`, `table_interp`, ...) come from `library.h`.

use crate::ast::Type;
use crate::config::{CompilerConfig, Target};
use crate::ir::{Instr, IrExpr, IrProgram};
use crate::tables::{ConstValue, LookupTable};

/// Values per line in emitted array initializers
const VALUES_PER_LINE: usize = 12;

/// Renders target source from a finished IR program
pub trait CodeGenerator {
    /// `#include` lines for the target
    fn includes(&self) -> &'static [&'static str];

    /// Attribute placed on lookup-table arrays
    fn table_attribute(&self) -> Option<&'static str> {
        None
    }

    /// Name of a runtime routine on this target
    fn routine(&self, name: &str) -> String {
        name.to_string()
    }

    fn generate(&self, program: &IrProgram, config: &CompilerConfig) -> String {
        let mut output = String::new();

        output.push_str(&header(program, config));
        for include in self.includes() {
            output.push_str(&format!("#include {}\n", include));
        }
        output.push('\n');
        output.push_str(&format!("typedef {} MYINT;\n", config.word.c_type()));
        output.push_str(&format!("typedef {} MYWIDE;\n\n", config.word.wide_c_type()));

        if !program.constants.is_empty() {
            output.push_str("// Constants\n");
            for constant in program.constants.iter() {
                let decl = match &constant.value {
                    ConstValue::Scalar(v) => {
                        format!("static const MYINT {} = {};", constant.name, v)
                    }
                    ConstValue::Tensor(values) => format!(
                        "static const MYINT {}[{}] = {};",
                        constant.name,
                        values.len(),
                        array_literal(values)
                    ),
                };
                output.push_str(&format!("{} // {}\n", decl, constant.scale));
            }
            output.push('\n');
        }

        for table in program.tables.iter() {
            output.push_str(&self.render_table(table));
        }

        if !program.globals.is_empty() {
            output.push_str("// Loop-carried state\n");
            for name in &program.globals {
                let ty = program.decls.get(name).cloned().unwrap_or_else(Type::scalar);
                output.push_str(&format!("static {};\n", declaration(name, &ty)));
            }
            output.push('\n');
        }

        output.push_str(&self.render_function(program, config));
        output
    }

    fn render_table(&self, table: &LookupTable) -> String {
        let attribute = self
            .table_attribute()
            .map(|a| format!(" {}", a))
            .unwrap_or_default();

        format!(
            "// {} over {}, {} segments, scale {}\nstatic const MYINT {}[{}]{} = {};\n\n",
            table.func,
            table.domain,
            table.segments,
            table.scale,
            table.name,
            table.samples.len(),
            attribute,
            array_literal(&table.samples)
        )
    }

    fn render_function(&self, program: &IrProgram, config: &CompilerConfig) -> String {
        let mut output = String::new();
        let routine = config.algorithm.routine_name();
        let output_ty = program.output_type().cloned().unwrap_or_else(Type::scalar);

        let mut params: Vec<String> = program
            .inputs
            .iter()
            .map(|name| {
                let ty = program.decls.get(name).cloned().unwrap_or_else(Type::scalar);
                format!("MYINT {}", dims_suffix(name, &ty))
            })
            .collect();

        let returns_scalar = output_ty.is_scalar();
        if !returns_scalar {
            params.push(format!("MYINT {}", dims_suffix("result", &output_ty)));
        }

        output.push_str(&format!(
            "{} {}({}) {{\n",
            if returns_scalar { "MYINT" } else { "void" },
            routine,
            params.join(", ")
        ));

        for instr in &program.instructions {
            self.render_instr(instr, 1, &mut output);
        }

        if returns_scalar {
            output.push_str(&format!("    return {};\n", program.output));
        } else {
            output.push_str(&format!(
                "    {}({}, result, {}, 0);\n",
                self.routine("tensor_copy"),
                program.output,
                output_ty.shape.len()
            ));
        }
        output.push_str("}\n");
        output
    }

    fn render_instr(&self, instr: &Instr, depth: usize, output: &mut String) {
        let indent = "    ".repeat(depth);

        match instr {
            Instr::Decl { name, ty, scale } => {
                output.push_str(&format!("{}{}; // {}\n", indent, declaration(name, ty), scale));
            }
            Instr::Assign { dest, value } => {
                output.push_str(&format!("{}{} = {};\n", indent, dest, self.render_expr(value)));
            }
            Instr::Call { routine, args } => {
                output.push_str(&format!(
                    "{}{}({});\n",
                    indent,
                    self.routine(routine),
                    self.render_args(args)
                ));
            }
            Instr::Comment(text) => {
                output.push_str(&format!("{}// {}\n", indent, text));
            }
            Instr::Seq(body) => {
                for instr in body {
                    self.render_instr(instr, depth, output);
                }
            }
            Instr::Loop {
                index,
                start,
                end,
                body,
            } => {
                output.push_str(&format!(
                    "{}for (int {i} = {}; {i} < {}; {i}++) {{\n",
                    indent,
                    start,
                    end,
                    i = index
                ));
                for instr in body {
                    self.render_instr(instr, depth + 1, output);
                }
                output.push_str(&format!("{}}}\n", indent));
            }
        }
    }

    fn render_args(&self, args: &[IrExpr]) -> String {
        args.iter()
            .map(|a| self.render_expr(a))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn render_expr(&self, expr: &IrExpr) -> String {
        match expr {
            IrExpr::Var(name) => name.clone(),
            IrExpr::Int(v) => v.to_string(),
            IrExpr::Widen(e) => format!("((MYWIDE){})", self.render_expr(e)),
            IrExpr::Narrow(e) => format!("((MYINT){})", self.render_expr(e)),
            IrExpr::Shl(e, k) => format!("({} << {})", self.render_expr(e), k),
            IrExpr::Shr(e, k) => format!("({} >> {})", self.render_expr(e), k),
            IrExpr::Add(a, b) => format!("({} + {})", self.render_expr(a), self.render_expr(b)),
            IrExpr::Sub(a, b) => format!("({} - {})", self.render_expr(a), self.render_expr(b)),
            IrExpr::Mul(a, b) => format!("({} * {})", self.render_expr(a), self.render_expr(b)),
            IrExpr::Neg(e) => format!("(-{})", self.render_expr(e)),
            IrExpr::Select {
                test,
                then,
                otherwise,
            } => format!(
                "({} >= 0 ? {} : {})",
                self.render_expr(test),
                self.render_expr(then),
                self.render_expr(otherwise)
            ),
            IrExpr::Index { base, offset } => format!("{}[{}]", base, self.render_expr(offset)),
            IrExpr::Call { routine, args } => {
                format!("{}({})", self.routine(routine), self.render_args(args))
            }
        }
    }
}

/// Microcontroller target: lookup tables are placed in flash
pub struct ArduinoCodegen;

impl CodeGenerator for ArduinoCodegen {
    fn includes(&self) -> &'static [&'static str] {
        &["<Arduino.h>", "\"library.h\""]
    }

    fn table_attribute(&self) -> Option<&'static str> {
        Some("PROGMEM")
    }

    // Table routines read their samples from program memory
    fn routine(&self, name: &str) -> String {
        match name {
            "table_interp" | "tensor_table_interp" => format!("{}_P", name),
            _ => name.to_string(),
        }
    }
}

/// Desktop target used to validate the fixed-point program
pub struct X86Codegen;

impl CodeGenerator for X86Codegen {
    fn includes(&self) -> &'static [&'static str] {
        &["<stdint.h>", "\"library.h\""]
    }
}

impl Target {
    /// Render `program` with this target's code generator
    pub fn generate(&self, program: &IrProgram, config: &CompilerConfig) -> String {
        match self {
            Target::Arduino => ArduinoCodegen.generate(program, config),
            Target::X86 => X86Codegen.generate(program, config),
        }
    }
}

fn header(program: &IrProgram, config: &CompilerConfig) -> String {
    let mut output = String::new();
    output.push_str(&format!(
        "// Generated by tensor2fixed: {} for {} ({} words, max exponent {})\n",
        config.algorithm, config.target, config.word, config.max_exponent
    ));

    for name in &program.inputs {
        output.push_str(&format!("// input  {}\n", describe(program, name)));
    }
    output.push_str(&format!("// output {}\n\n", describe(program, &program.output)));
    output
}

/// `name: scale 2^s, range [lo, hi]`
fn describe(program: &IrProgram, name: &str) -> String {
    match (program.scales.get(name), program.intervals.get(name)) {
        (Some(scale), Some(interval)) => {
            format!("{}: scale {}, range {}", name, scale, interval)
        }
        _ => name.to_string(),
    }
}

fn declaration(name: &str, ty: &Type) -> String {
    format!("MYINT {}", dims_suffix(name, ty))
}

/// Flat array declarator for tensors, plain name for scalars
fn dims_suffix(name: &str, ty: &Type) -> String {
    if ty.is_scalar() {
        name.to_string()
    } else {
        format!("{}[{}]", name, ty.shape.len())
    }
}

fn array_literal(values: &[i64]) -> String {
    let mut output = String::from("{");
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            output.push_str(", ");
        }
        if i % VALUES_PER_LINE == 0 {
            output.push_str("\n    ");
        }
        output.push_str(&v.to_string());
    }
    output.push_str("\n}");
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Analyzer;
    use crate::builder::IrBuilder;
    use crate::config::Algorithm;
    use crate::parser::parse;

    fn render(source: &str, target: Target) -> String {
        let config = CompilerConfig::new(Algorithm::Protonn, target);
        let typed = Analyzer::new().analyze(&parse(source).unwrap()).unwrap();
        let program = IrBuilder::new(&config).build(&typed).unwrap();
        target.generate(&program, &config)
    }

    #[test]
    fn test_scalar_program_returns_value() {
        let code = render("let a : () in [0, 1] in let b : () in [0, 1] in a + b", Target::X86);
        assert!(code.contains("typedef int16_t MYINT;"));
        assert!(code.contains("typedef int32_t MYWIDE;"));
        assert!(code.contains("MYINT protonn_fixed(MYINT a, MYINT b) {"));
        assert!(code.contains("tmp0 = ((MYINT)((((MYWIDE)a) + ((MYWIDE)b)) >> 1));"));
        assert!(code.contains("    return tmp0;"));
    }

    #[test]
    fn test_tensor_program_uses_out_parameter() {
        let code = render("let X : (2, 2) in [0, 1] in X.T", Target::X86);
        assert!(code.contains("void protonn_fixed(MYINT X[4], MYINT result[4]) {"));
        assert!(code.contains("transpose(X, tmp0, 2, 2);"));
        assert!(code.contains("tensor_copy(tmp0, result, 4, 0);"));
    }

    #[test]
    fn test_tables_in_program_memory_on_arduino() {
        let source = "let x : () in [-1, 1] in tanh(x)";
        let arduino = render(source, Target::Arduino);
        let x86 = render(source, Target::X86);

        assert!(arduino.contains("#include <Arduino.h>"));
        assert!(arduino.contains("static const MYINT tbl_tanh0[129] PROGMEM = {"));
        assert!(arduino.contains("table_interp_P(x, tbl_tanh0,"));

        assert!(x86.contains("static const MYINT tbl_tanh0[129] = {"));
        assert!(x86.contains("table_interp(x, tbl_tanh0,"));
        assert!(!x86.contains("PROGMEM"));
    }

    #[test]
    fn test_loop_rendered_with_global_accumulator() {
        let code = render(
            "let x : () in [0, 1] in for i in [0:4] fold acc = 0 in acc * 0.5 + x * 0.5",
            Target::X86,
        );
        assert!(code.contains("static MYINT acc;"));
        assert!(code.contains("for (int i = 0; i < 4; i++) {"));
        assert_eq!(code.matches("for (").count(), 1);
    }

    #[test]
    fn test_function_call_rendered_inline() {
        let code = render(
            "let a : () in [0, 1] in def twice(v: ()) = v + v in twice(a)",
            Target::X86,
        );
        assert!(code.contains("    // twice(a)\n    MYINT tmp0; // 2^-13\n    tmp0 = "));
    }

    #[test]
    fn test_array_literal_wraps() {
        let values: Vec<i64> = (0..14).collect();
        let text = array_literal(&values);
        assert!(text.starts_with("{\n    0, 1,"));
        assert!(text.contains("11, \n    12, 13\n}"));
    }
}
