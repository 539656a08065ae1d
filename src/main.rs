//! Tensor Expression to Fixed-Point Compiler CLI
//!
//! Usage:
//!   tensor2fixed --algo bonsai --target arduino -o bonsai.c
//!   tensor2fixed -i model.sd -o model.c --profile-log ranges.json --max-expnt 12
//!   tensor2fixed -i model.sd -o model.c --word i32 --emit-ir

use std::path::PathBuf;

use clap::Parser as ClapParser;
use colored::Colorize;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use tensor_to_fixed::{
    Algorithm, Compilation, CompileResult, Compiler, CompilerConfig, ProfileData, Target, WordSize,
};

#[derive(ClapParser, Debug)]
#[command(name = "tensor2fixed")]
#[command(author = "FPGA Team")]
#[command(version = "0.1.0")]
#[command(about = "Compiles tensor expressions to fixed-point C")]
struct Args {
    /// Bundled model to compile; also names the generated function
    #[arg(long = "algo", value_enum, default_value = "bonsai")]
    algorithm: Algorithm,

    /// Target platform (arduino or x86)
    #[arg(long = "target", default_value = "x86")]
    target: String,

    /// Program to compile instead of the bundled one
    #[arg(short = 'i', long = "input")]
    input: Option<PathBuf>,

    /// Output C file
    #[arg(short = 'o', long = "output")]
    output: PathBuf,

    /// JSON log of measured input ranges
    #[arg(long = "profile-log")]
    profile_log: Option<PathBuf>,

    /// Maximum number of fractional bits
    #[arg(long = "max-expnt", default_value = "14")]
    max_exponent: u32,

    /// Integer word size of the generated code
    #[arg(long = "word", value_enum, default_value = "i16")]
    word: WordSize,

    /// Print the IR as JSON
    #[arg(long = "emit-ir")]
    emit_ir: bool,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    let default_level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().without_time())
        .with(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .init();

    let result = match compile(&args) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("{}: {}", "Compilation error".red(), e);
            std::process::exit(1);
        }
    };

    if args.emit_ir {
        match result.program.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("{}: Failed to serialize IR: {}", "Error".red(), e);
                std::process::exit(1);
            }
        }
    }

    print_summary(&args, &result);
}

fn compile(args: &Args) -> CompileResult<Compilation> {
    // Validated before anything touches the filesystem
    let target: Target = args.target.parse()?;

    let mut config = CompilerConfig::new(args.algorithm, target)
        .with_word(args.word)
        .with_max_exponent(args.max_exponent);
    if let Some(path) = &args.profile_log {
        config = config.with_profile(ProfileData::load(path)?);
    }

    let compiler = Compiler::new(config, args.input.clone(), args.output.clone())?;
    compiler.run()
}

fn print_summary(args: &Args, result: &Compilation) {
    let program = &result.program;

    println!("{}", "Compilation Results".bold().green());
    println!("{}", "=".repeat(50));
    println!("{}: {}", "Target".cyan(), args.target);
    println!("{}: {}", "Routine".cyan(), args.algorithm.routine_name());
    println!("{}: {}", "Word".cyan(), args.word);
    println!("{}: {}", "Inputs".cyan(), program.inputs.join(", "));

    match (program.output_type(), program.output_scale()) {
        (Some(ty), Some(scale)) => {
            println!("{}: {} {} at scale {}", "Output".cyan(), program.output, ty, scale)
        }
        _ => println!("{}: {}", "Output".cyan(), program.output),
    }
    println!("{}: {}", "Constants".cyan(), program.constants.len());
    println!("{}: {}", "Lookup tables".cyan(), program.tables.len());
    println!("{}: {}", "Written to".cyan(), args.output.display());

    if args.verbose {
        println!();
        println!("{}", program);
    }
}
