//! Selune CLI
//!
//! Compile, check, list, and run Selune chunks from the command line.

use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{Shell, generate};
use std::io;
use std::path::{Path, PathBuf};
use std::process;

use selune_core::opcode::{OpArg, OpMode};
use selune_core::proto::{Constant, ProtoDesc};
use selune_runtime::{HookEvent, MASK_COUNT, Runtime, Status};
use tracing_subscriber::EnvFilter;

mod config;
use config::Config;

#[derive(ClapParser)]
#[command(name = "selunec")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Selune compiler and runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a source file to a binary chunk
    Build {
        /// Input source file
        input: PathBuf,

        /// Output chunk path (defaults to the input with a .selb
        /// extension)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Strip debug information from the chunk
        #[arg(short, long)]
        strip: bool,
    },

    /// Parse files and report syntax errors without generating output
    Check {
        /// Input source files
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },

    /// Disassemble a source file or binary chunk
    List {
        /// Input file (source or compiled chunk)
        input: PathBuf,
    },

    /// Run a source file or binary chunk
    Run {
        /// Input file (source or compiled chunk)
        input: PathBuf,

        /// TOML config for GC tuning and run limits
        #[arg(long)]
        config: Option<PathBuf>,

        /// Abort after this many VM instructions (overrides config)
        #[arg(long)]
        max_steps: Option<u64>,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("SELUNE_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Build { input, output, strip } => build(&input, output, strip),
        Commands::Check { inputs } => check(&inputs),
        Commands::List { input } => list(&input),
        Commands::Run { input, config, max_steps } => run(&input, config, max_steps),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut io::stdout());
            0
        }
    };
    process::exit(code);
}

fn read_input(path: &Path) -> Result<Vec<u8>, String> {
    std::fs::read(path).map_err(|e| format!("cannot read {}: {e}", path.display()))
}

/// Compile a source file, or pass a binary chunk through undump.
fn compile_input(path: &Path) -> Result<ProtoDesc, String> {
    let bytes = read_input(path)?;
    if bytes.first() == Some(&0x1B) {
        return selune_core::undump_chunk(&bytes).map_err(|e| e.to_string());
    }
    let chunk_name = format!("@{}", path.display());
    selune_compiler::compile(&bytes, chunk_name.as_bytes()).map_err(|e| e.to_string())
}

fn build(input: &Path, output: Option<PathBuf>, strip: bool) -> i32 {
    let proto = match compile_input(input) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("selunec: {e}");
            return 1;
        }
    };
    let out = output.unwrap_or_else(|| input.with_extension("selb"));
    let bin = selune_core::dump_chunk(&proto, strip);
    if let Err(e) = std::fs::write(&out, bin) {
        eprintln!("selunec: cannot write {}: {e}", out.display());
        return 1;
    }
    0
}

fn check(inputs: &[PathBuf]) -> i32 {
    let mut failed = 0;
    for input in inputs {
        match compile_input(input) {
            Ok(_) => {}
            Err(e) => {
                eprintln!("{e}");
                failed += 1;
            }
        }
    }
    if failed > 0 { 1 } else { 0 }
}

fn constant_text(k: &Constant) -> String {
    match k {
        Constant::Nil => "nil".into(),
        Constant::Bool(b) => b.to_string(),
        Constant::Int(i) => i.to_string(),
        Constant::Float(f) => selune_core::numeric::float_to_display(*f),
        Constant::Str(s) => format!("{:?}", String::from_utf8_lossy(s)),
    }
}

fn list_proto(p: &ProtoDesc, what: &str) {
    let source = String::from_utf8_lossy(&p.source);
    println!(
        "\n{what} <{}:{},{}> ({} instructions)",
        source, p.line_defined, p.last_line_defined,
        p.code.len()
    );
    println!(
        "{} params, {} slots, {} upvalues, {} constants, {} functions",
        p.num_params,
        p.max_stack_size,
        p.upvalues.len(),
        p.constants.len(),
        p.protos.len()
    );
    for (pc, ins) in p.code.iter().enumerate() {
        let op = ins.opcode();
        let line = p.line_at(pc);
        let operands = match op.mode() {
            OpMode::Abc => {
                let mut s = format!("{}", ins.a());
                if op.b_arg() != OpArg::NotUsed {
                    s.push_str(&format!(" {}", ins.b()));
                }
                if op.c_arg() != OpArg::NotUsed {
                    s.push_str(&format!(" {}", ins.c()));
                }
                s
            }
            OpMode::Abx => format!("{} {}", ins.a(), ins.bx()),
            OpMode::Asbx => format!("{} {}", ins.a(), ins.sbx()),
            OpMode::Ax => format!("{}", ins.ax_arg()),
        };
        println!("\t{}\t[{}]\t{:<10}\t{}", pc + 1, line, op.name(), operands);
    }
    if !p.constants.is_empty() {
        println!("constants ({}):", p.constants.len());
        for (i, k) in p.constants.iter().enumerate() {
            println!("\t{}\t{}", i + 1, constant_text(k));
        }
    }
    for sub in &p.protos {
        list_proto(sub, "function");
    }
}

fn list(input: &Path) -> i32 {
    match compile_input(input) {
        Ok(p) => {
            list_proto(&p, "main");
            0
        }
        Err(e) => {
            eprintln!("selunec: {e}");
            1
        }
    }
}

fn step_budget_hook(rt: &mut Runtime, _event: HookEvent, _line: u32) -> selune_runtime::RtResult<()> {
    Err(selune_runtime::ldebug::run_error(
        rt,
        "instruction budget exhausted".into(),
    ))
}

fn run(input: &Path, config_path: Option<PathBuf>, max_steps: Option<u64>) -> i32 {
    let cfg = match config_path {
        Some(p) => match Config::load(&p) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("selunec: {e}");
                return 1;
            }
        },
        None => Config::default(),
    };
    let bytes = match read_input(input) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("selunec: {e}");
            return 1;
        }
    };
    let mut rt = Runtime::with_corelib();
    rt.gc.pause = cfg.gc.pause;
    rt.gc.stepmul = cfg.gc.stepmul;
    let budget = max_steps.unwrap_or(cfg.run.max_steps);
    if budget > 0 {
        let count = budget.min(u32::MAX as u64) as u32;
        rt.set_hook(Some(step_budget_hook), MASK_COUNT, count);
    }

    let chunk_name = format!("@{}", input.display());
    let status = rt.load_buffer(&bytes, chunk_name.as_bytes(), "bt");
    if status != Status::Ok {
        let msg = rt.to_rust_string(-1).unwrap_or_default();
        eprintln!("selunec: {msg}");
        return 1;
    }
    // A message handler captures the traceback before the unwind
    // discards the frames.
    rt.push_native(traceback_handler).expect("fresh stack has room");
    rt.insert(1);
    match rt.pcall(0, 0, 1) {
        Status::Ok => 0,
        _ => {
            let msg = rt.to_rust_string(-1).unwrap_or_default();
            eprintln!("selunec: {msg}");
            1
        }
    }
}

fn traceback_handler(rt: &mut Runtime) -> selune_runtime::RtResult<u32> {
    let msg = rt.to_rust_string(1).unwrap_or_else(|| "(non-string error)".into());
    let tb = rt.traceback_api(Some(&msg), 1);
    rt.push_str(&tb)?;
    Ok(1)
}
