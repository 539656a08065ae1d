//! End-to-end compilation tests

use std::fs;

use pretty_assertions::assert_eq;
use tempfile::tempdir;

use tensor_to_fixed::{
    build_ir, compile_source, Algorithm, CompileError, Compiler, CompilerConfig, Instr, Interval,
    ProfileData, Target, WordSize,
};

fn config() -> CompilerConfig {
    CompilerConfig::new(Algorithm::Bonsai, Target::X86)
}

#[test]
fn test_addition_bound_and_scale() {
    let config = config().with_word(WordSize::I16).with_max_exponent(0);
    let program = build_ir("let a : () in [0, 10] in let b : () in [0, 5] in a + b", &config).unwrap();

    assert_eq!(program.intervals[&program.output], Interval::new(0.0, 15.0));
    let scale = program.output_scale().unwrap();
    assert!(15.0 * 2f64.powi(-scale.0) < 32768.0);
}

#[test]
fn test_multiplication_uses_all_corners() {
    let program = build_ir("let a : () in [-2, 2] in let b : () in [-3, 1] in a * b", &config()).unwrap();
    assert_eq!(program.intervals[&program.output], Interval::new(-6.0, 6.0));
}

#[test]
fn test_stable_loop_is_not_unrolled() {
    let program = build_ir(
        "let x : () in [0, 1] in for i in [0:4] fold acc = 0 in acc * 0.5 + x * 0.5",
        &config(),
    )
    .unwrap();

    let loops: Vec<_> = program
        .instructions
        .iter()
        .filter_map(|i| match i {
            Instr::Loop { start, end, .. } => Some((*start, *end)),
            _ => None,
        })
        .collect();
    assert_eq!(loops, vec![(0, 4)]);
}

#[test]
fn test_unstable_loop_rejected() {
    let err = build_ir(
        "let x : () in [0, 1] in for i in [0:4] fold acc = 0 in acc + x",
        &config(),
    )
    .unwrap_err();
    assert!(matches!(err, CompileError::LoopScaleInstability { .. }));
}

#[test]
fn test_cli_rejects_unknown_target() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("out.c");

    let status = std::process::Command::new(env!("CARGO_BIN_EXE_tensor2fixed"))
        .args(["--target", "riscv", "-o"])
        .arg(&output)
        .output()
        .unwrap();

    assert_eq!(status.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&status.stderr).contains("Unsupported target"));
    assert!(!output.exists());
}

#[test]
fn test_repeated_literal_single_constant() {
    let program = build_ir("let x : () in [0, 1] in x * 0.75 + 0.75", &config()).unwrap();
    assert_eq!(program.constants.len(), 1);
}

#[test]
fn test_tables_identical_across_compilations() {
    let source = "let x : (4,) in [-3, 3] in sigmoid(x) + tanh(x)";
    let first = build_ir(source, &config()).unwrap();
    let second = build_ir(source, &config()).unwrap();

    let samples = |p: &tensor_to_fixed::IrProgram| {
        p.tables
            .iter()
            .map(|t| t.samples.clone())
            .collect::<Vec<_>>()
    };
    assert_eq!(samples(&first), samples(&second));
    assert_eq!(first.tables.len(), 2);
}

#[test]
fn test_undeclared_variable() {
    let err = build_ir("let x : () in [0, 1] in x + y", &config()).unwrap_err();
    assert!(matches!(err, CompileError::UndeclaredVariable { name } if name == "y"));
}

#[test]
fn test_shape_mismatch_names_node() {
    let err = build_ir(
        "let A : (2, 3) in [0, 1] in let B : (3, 2) in [0, 1] in A + B",
        &config(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("A + B"));
}

#[test]
fn test_exp_overflow() {
    let err = build_ir("let x : () in [0, 1000] in exp(x)", &config()).unwrap_err();
    assert!(matches!(err, CompileError::OverflowBound { .. }));
}

#[test]
fn test_parse_error_reported() {
    let err = build_ir("let x : () in [0, 1] in x +", &config()).unwrap_err();
    assert!(matches!(err, CompileError::ParseError { .. }));
}

#[test]
fn test_bundled_programs_compile() {
    for algorithm in [Algorithm::Bonsai, Algorithm::Protonn, Algorithm::Lenet] {
        for target in [Target::Arduino, Target::X86] {
            let config = CompilerConfig::new(algorithm, target);
            let result = compile_source(algorithm.bundled_source(), &config)
                .unwrap_or_else(|e| panic!("{} for {}: {}", algorithm, target, e));

            assert!(result.code.contains(algorithm.routine_name()));
            for (name, interval) in &result.program.intervals {
                result.program.scales[name]
                    .check_fits(name, interval, config.word.bits())
                    .unwrap();
            }
        }
    }
}

#[test]
fn test_bundled_programs_compile_for_every_word() {
    for word in [WordSize::I8, WordSize::I16, WordSize::I32] {
        for algorithm in [Algorithm::Bonsai, Algorithm::Protonn, Algorithm::Lenet] {
            let config = CompilerConfig::new(algorithm, Target::X86).with_word(word);
            let result = compile_source(algorithm.bundled_source(), &config);
            assert!(result.is_ok(), "{} with {}: {:?}", algorithm, word, result.err());
        }
    }
}

#[test]
fn test_compiler_writes_output() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("model.sd");
    let output = dir.path().join("model.c");
    fs::write(&input, "let X : (3, 1) in [-1, 1] in relu(X) * 0.5").unwrap();

    let compiler = Compiler::new(
        CompilerConfig::new(Algorithm::Lenet, Target::Arduino),
        Some(input),
        output.clone(),
    )
    .unwrap();
    let result = compiler.run().unwrap();

    let written = fs::read_to_string(&output).unwrap();
    assert_eq!(written, result.code);
    assert!(written.contains("void lenet_fixed(MYINT X[3], MYINT result[3])"));
}

#[test]
fn test_missing_input_file() {
    let dir = tempdir().unwrap();
    let err = Compiler::new(
        config(),
        Some(dir.path().join("missing.sd")),
        dir.path().join("out.c"),
    )
    .unwrap_err();
    assert!(matches!(err, CompileError::InputNotFound { .. }));
}

#[test]
fn test_failed_compilation_writes_nothing() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("bad.sd");
    let output = dir.path().join("bad.c");
    fs::write(&input, "let x : () in [0, 1000] in exp(x)").unwrap();

    let compiler = Compiler::new(config(), Some(input), output.clone()).unwrap();
    assert!(compiler.run().is_err());
    assert!(!output.exists());
}

#[test]
fn test_profile_log_narrows_input() {
    let profile = ProfileData::from_json(r#"{ "x": [-0.25, 0.5] }"#).unwrap();
    let config = config().with_profile(profile);
    let program = build_ir("let x : () in [-100, 100] in x * 2", &config).unwrap();

    assert_eq!(program.intervals["x"], Interval::new(-0.25, 0.5));
    assert_eq!(program.intervals[&program.output], Interval::new(-0.5, 1.0));
}
