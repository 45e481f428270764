//! Tiercel CLI
//!
//! A command-line interface for the Tiercel tiered compiler.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tiercel::code::BaselineCode;
use tiercel::parse::parse_program;
use tiercel::{Compiler, CompilerConfig, ConcurrencyMode, OptimizeStatus, VERSION};

#[derive(Parser)]
#[command(name = "tiercel")]
#[command(author, version, about = "A tiered function compiler written in Rust", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Compiler configuration file (JSON)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a program and call one of its functions
    Run {
        /// The program file
        file: PathBuf,
        /// Function to call
        #[arg(short, long, default_value = "main")]
        entry: String,
        /// Numeric arguments for the entry function
        #[arg(value_name = "ARGS")]
        args: Vec<f64>,
        /// Also run the optimizing tier before calling
        #[arg(short, long)]
        optimize: bool,
        /// Optimize concurrently and wait for the background result
        #[arg(long, requires = "optimize")]
        concurrent: bool,
    },

    /// Compile every function in a program and print the summary
    Compile {
        /// The program file
        file: PathBuf,
        /// Also run the optimizing tier
        #[arg(short, long)]
        optimize: bool,
    },

    /// Compile a program and display its baseline bytecode
    Bytecode {
        /// The program file
        file: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    if let Err(err) = run(cli) {
        eprintln!("error: {:#}", err);
        std::process::exit(1);
    }
}

fn setup_logging(verbose: u8) {
    use tracing_subscriber::EnvFilter;
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tiercel={}", default)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<CompilerConfig> {
    match path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            Ok(CompilerConfig::from_json(&text)?)
        }
        None => Ok(CompilerConfig::default()),
    }
}

/// Parse a program file and compile every function at the baseline tier
fn compile_program(
    compiler: &mut Compiler,
    file: &PathBuf,
) -> anyhow::Result<Vec<(String, tiercel::ClosureInstance)>> {
    let source =
        fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let literals = parse_program(&source)?;
    if literals.is_empty() {
        bail!("{} declares no functions", file.display());
    }
    let script = compiler.register_script(file.display().to_string());

    let mut closures = Vec::new();
    for literal in literals {
        let literal = Arc::new(literal);
        let id = compiler.get_or_create_descriptor(&literal, script);
        let mut closure = compiler.instantiate(id);
        compiler.compile_baseline(&mut closure)?;
        closures.push((literal.name.clone(), closure));
    }
    Ok(closures)
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_ref())?;
    let mut compiler = Compiler::new(config)?;

    match cli.command {
        Commands::Run {
            file,
            entry,
            args,
            optimize,
            concurrent,
        } => {
            let mut closures = compile_program(&mut compiler, &file)?;
            if optimize {
                let mode = if concurrent {
                    ConcurrencyMode::Concurrent
                } else {
                    ConcurrencyMode::Synchronous
                };
                for (_, closure) in closures.iter_mut() {
                    compiler.compile_optimized(closure, mode)?;
                }
                if concurrent {
                    for (_, closure) in closures.iter_mut() {
                        compiler.finish_optimization_now(closure)?;
                    }
                }
            }

            let (_, closure) = closures
                .iter()
                .find(|(name, _)| *name == entry)
                .with_context(|| format!("no function named '{}'", entry))?;
            let result = closure.call(&args)?;
            println!("{}", result);
        }

        Commands::Compile { file, optimize } => {
            let mut closures = compile_program(&mut compiler, &file)?;
            if optimize {
                for (name, closure) in closures.iter_mut() {
                    let status =
                        compiler.compile_optimized(closure, ConcurrencyMode::Synchronous)?;
                    if status != OptimizeStatus::Optimized {
                        println!("{}: not optimized", name);
                    }
                }
            }
            for (name, closure) in &closures {
                println!("{}: {}", name, closure.code().name());
            }
            print!("{}", compiler.stats());
        }

        Commands::Bytecode { file } => {
            let closures = compile_program(&mut compiler, &file)?;
            for (name, closure) in &closures {
                match compiler.table().get(closure.descriptor()).baseline_code() {
                    Some(BaselineCode::Bytecode(chunk)) => {
                        print!("{}", chunk.disassemble(name));
                    }
                    Some(BaselineCode::Legacy(code)) => {
                        println!("== {} == (legacy baseline, {} ops)", name, code.ops.len());
                    }
                    None => println!("== {} == (not compiled)", name),
                }
            }
        }
    }

    tracing::info!(version = VERSION, "done");
    Ok(())
}
