use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use tracing::info;

use froth::bytecode::{DebugIndex, DebugInfo, EntryWord, Image, compile_source};
use froth::frontend::token_dumper::TokenDumper;
use froth::frontend::tokenize;
use froth::runtime::{Cpu, CpuConfig, SimulatedDevice, Step};

#[derive(Parser, Debug)]
#[command(name = "froth")]
#[command(about = "Compile, inspect and run Froth programs")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Source file to compile; writes <base>.bin and <base>.debug next to it
    source: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the token stream of a source file
    Tokens {
        file: PathBuf,

        #[arg(long)]
        no_color: bool,

        /// Show byte offsets next to line and column
        #[arg(long)]
        offsets: bool,
    },

    /// Print a listing from a .debug sidecar
    Disasm { file: PathBuf },

    /// Run a compiled program on the simulated machine
    Run {
        file: PathBuf,

        /// Entry word: RunShot, Idle or Halt
        #[arg(long, default_value = "RunShot")]
        word: String,

        #[arg(long)]
        max_steps: Option<usize>,

        /// Suspend before executing ADDR (decimal or 0x hex); repeatable
        #[arg(long = "break", value_name = "ADDR", value_parser = parse_address)]
        breakpoints: Vec<usize>,

        /// Write the final machine state here
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    froth::init_logging();
    let cli = Cli::parse();

    let result = match (cli.command, cli.source) {
        (Some(command), _) => dispatch(command),
        (None, Some(source)) => compile(&source),
        (None, None) => Err(anyhow!("no source file given (try --help)")),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn dispatch(command: Command) -> Result<ExitCode> {
    match command {
        Command::Tokens {
            file,
            no_color,
            offsets,
        } => tokens(&file, no_color, offsets),
        Command::Disasm { file } => disasm(&file),
        Command::Run {
            file,
            word,
            max_steps,
            breakpoints,
            snapshot,
        } => run(&file, &word, max_steps, &breakpoints, snapshot.as_deref()),
    }
}

fn read_source(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read '{}'", path.display()))
}

fn compile(path: &Path) -> Result<ExitCode> {
    let source = read_source(path)?;

    let program = match compile_source(&source) {
        Ok(program) => program,
        Err(errors) => {
            for diagnostic in errors.iter() {
                eprintln!("{}", diagnostic);
            }
            eprintln!("{}", errors.summary());
            return Ok(ExitCode::FAILURE);
        }
    };

    let bin = path.with_extension("bin");
    let debug = path.with_extension("debug");
    program
        .image
        .write_to(&bin)
        .with_context(|| format!("failed to write '{}'", bin.display()))?;
    program
        .debug
        .write_to(&debug)
        .with_context(|| format!("failed to write '{}'", debug.display()))?;

    info!(program = %program.name, rom = program.image.rom.len(), "compiled");
    println!(
        "{}: {} bytes, {} words -> {}",
        program.name,
        program.image.rom.len(),
        program.debug.words.len(),
        bin.display()
    );
    Ok(ExitCode::SUCCESS)
}

fn tokens(path: &Path, no_color: bool, offsets: bool) -> Result<ExitCode> {
    let source = read_source(path)?;
    let mut dumper = TokenDumper::new();
    if no_color {
        dumper = dumper.no_color();
    }
    if offsets {
        dumper = dumper.with_offsets();
    }
    dumper.dump(&tokenize(&source));
    Ok(ExitCode::SUCCESS)
}

fn disasm(path: &Path) -> Result<ExitCode> {
    let info = DebugInfo::read_from(path)
        .with_context(|| format!("failed to load '{}'", path.display()))?;
    print!("{}", DebugIndex::new(info).listing());
    Ok(ExitCode::SUCCESS)
}

fn run(
    path: &Path,
    word: &str,
    max_steps: Option<usize>,
    breakpoints: &[usize],
    snapshot: Option<&Path>,
) -> Result<ExitCode> {
    let image =
        Image::read_from(path).with_context(|| format!("failed to load '{}'", path.display()))?;
    let word = EntryWord::from_name(word)
        .ok_or_else(|| anyhow!("unknown entry word '{}' (expected RunShot, Idle or Halt)", word))?;

    let config = CpuConfig {
        max_steps,
        ..CpuConfig::default()
    };
    let mut cpu = Cpu::with_config(&image, SimulatedDevice::new(), config);
    for &addr in breakpoints {
        cpu.set_breakpoint(addr);
    }
    cpu.enter(word);

    let outcome = cpu.run();
    let code = match &outcome {
        Step::Stopped => {
            println!("stopped after {} ticks", cpu.time().ticks());
            ExitCode::SUCCESS
        }
        Step::Breakpoint(addr) => {
            println!("breakpoint at {:04X}", addr);
            ExitCode::SUCCESS
        }
        Step::Continue => {
            println!("step budget exhausted at {:04X}", cpu.pc());
            ExitCode::SUCCESS
        }
        Step::Faulted(fault) => {
            println!("fault: {}", fault);
            ExitCode::FAILURE
        }
    };

    let stack: Vec<String> = cpu.stack().iter().map(|v| v.to_string()).collect();
    println!("stack: [{}]", stack.join(" "));

    if let Some(path) = snapshot {
        cpu.snapshot()
            .write_to(path)
            .with_context(|| format!("failed to write '{}'", path.display()))?;
    }
    Ok(code)
}

fn parse_address(s: &str) -> Result<usize, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address '{}': {}", s, e))
}
