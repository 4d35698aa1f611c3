//! Shiori CLI - コマンドラインインターフェース
//!
//! Goバイナリ向けデバッガ shiori のREPLインターフェース

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use shiori_core::parse::{parse_breakpoint_ref, parse_location};
use shiori_core::{
    BreakpointRef, Command, DecodeConfig, Debugger, StopEvent, StopReason, TargetError, Variable,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Shiori - DWARF debugger for Go programs
#[derive(Parser)]
#[command(name = "shiori")]
#[command(version)]
#[command(about = "Interactive ptrace debugger with DWARF variable evaluation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: DebugCommand,

    /// REPL prompt
    #[arg(long, global = true, default_value = "(shiori)")]
    prompt: String,

    #[command(flatten)]
    limits: DecodeLimits,
}

/// 値の描画上限
#[derive(Args)]
struct DecodeLimits {
    /// Maximum nesting depth when printing values
    #[arg(long, global = true, default_value_t = 10)]
    max_depth: usize,

    /// Maximum number of array/slice elements to print
    #[arg(long, global = true, default_value_t = 64)]
    max_elements: usize,

    /// Maximum number of string bytes to print
    #[arg(long, global = true, default_value_t = 4096)]
    max_string_len: usize,
}

impl From<&DecodeLimits> for DecodeConfig {
    fn from(limits: &DecodeLimits) -> Self {
        DecodeConfig {
            max_depth: limits.max_depth,
            max_array_elements: limits.max_elements,
            max_string_len: limits.max_string_len,
        }
    }
}

#[derive(Subcommand)]
enum DebugCommand {
    /// Launch and debug an executable
    Run {
        /// Path to the executable binary
        binary: PathBuf,

        /// Arguments to pass to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Attach to an existing process
    Attach {
        /// Path to the executable binary (defaults to /proc/<pid>/exe)
        binary: Option<PathBuf>,

        /// Process ID to attach to
        #[arg(short, long)]
        pid: i32,
    },
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut debugger = init_debugger(cli.command, DecodeConfig::from(&cli.limits))?;
    run_repl(&mut debugger, &cli.prompt)?;

    Ok(())
}

/// `RUST_LOG` からログレベルを決める（既定は warn）
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// デバッガを初期化してプロセスにアタッチまたは起動する
fn init_debugger(command: DebugCommand, config: DecodeConfig) -> Result<Debugger> {
    let mut debugger = Debugger::with_config(config);

    match command {
        DebugCommand::Run { binary, args } => {
            debugger.load_binary(&binary)?;
            debugger.spawn(&binary, &args)?;
            println!(
                "Process {} started: {}",
                debugger.pid().unwrap_or_default(),
                binary.display()
            );
        }
        DebugCommand::Attach { binary, pid } => {
            let binary = binary.unwrap_or_else(|| process_exe(pid));
            debugger.load_binary(&binary)?;
            debugger.attach(pid)?;
            println!("Attached to process {}", pid);
            report_location(&debugger);
        }
    }

    Ok(debugger)
}

/// 実行中のプロセスの実行ファイル
fn process_exe(pid: i32) -> PathBuf {
    PathBuf::from(format!("/proc/{}/exe", pid))
}

/// 履歴ファイルのパス
fn history_path() -> Option<PathBuf> {
    home::home_dir().map(|home| home.join(".shiori_history"))
}

/// REPLループを実行する
fn run_repl(debugger: &mut Debugger, prompt: &str) -> Result<()> {
    println!("Type 'help' for available commands, 'quit' to exit.");

    let mut rl = DefaultEditor::new()?;
    let history = history_path();
    if let Some(path) = &history {
        // 初回起動時は履歴ファイルがない
        let _ = rl.load_history(path);
    }

    let prompt = format!("{} ", prompt);
    loop {
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                rl.add_history_entry(line)?;

                match Command::parse(line) {
                    Some(Command::Quit) => break,
                    Some(command) => {
                        if let Err(e) = handle_command(debugger, command) {
                            eprintln!("Error: {}", e);
                        }
                    }
                    None => {
                        println!("Unknown command: {}", line);
                        println!("Type 'help' for available commands.");
                    }
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    if let Some(path) = &history {
        if let Err(e) = rl.save_history(path) {
            tracing::warn!(error = %e, "could not save history");
        }
    }

    debugger.detach()?;
    Ok(())
}

fn handle_command(debugger: &mut Debugger, command: Command) -> Result<()> {
    match command {
        Command::Help => print_help(),
        Command::Break(location) => {
            let location = parse_location(&location)?;
            let bp = debugger.break_at_location(&location)?;
            println!("Breakpoint {} set at 0x{:x}", bp.id, bp.address);
        }
        Command::Clear(target) => {
            let bp = match parse_breakpoint_ref(&target)? {
                BreakpointRef::Id(id) => debugger.clear_breakpoint_id(id)?,
                BreakpointRef::Address(address) => debugger.clear_breakpoint(address)?,
            };
            println!("Breakpoint {} cleared at 0x{:x}", bp.id, bp.address);
        }
        Command::Breakpoints => print_breakpoints(debugger),
        Command::Continue => {
            let result = debugger.continue_execution();
            report_stop(debugger, result)?;
        }
        Command::Step => {
            let result = debugger.step();
            report_stop(debugger, result)?;
        }
        Command::Print(expr) => {
            let variable = debugger.eval_symbol(&expr)?;
            println!("{}", variable);
        }
        Command::Locals => print_variables(debugger.local_variables()?),
        Command::Args => print_variables(debugger.function_arguments()?),
        Command::Quit => {}
    }

    Ok(())
}

fn print_variables(mut variables: Vec<Variable>) {
    if variables.is_empty() {
        println!("(no variables)");
        return;
    }
    variables.sort_by(|a, b| a.name.cmp(&b.name));
    for variable in variables {
        println!("{}", variable);
    }
}

fn print_breakpoints(debugger: &Debugger) {
    let breakpoints = debugger.breakpoints();
    if breakpoints.is_empty() {
        println!("No breakpoints");
        return;
    }

    for bp in breakpoints {
        let location = bp.location.as_deref().unwrap_or("");
        println!(
            "  {:>3}  0x{:x}  {}  (hit {})",
            bp.id, bp.address, location, bp.hit_count
        );
    }
}

/// 停止を表示する。終了はエラーとして返ってくるので、ここで終了理由に直す
fn report_stop(debugger: &Debugger, result: anyhow::Result<StopEvent>) -> Result<()> {
    let event = match result {
        Ok(event) => event,
        Err(e) => match e.downcast_ref::<TargetError>() {
            Some(TargetError::ProcessExited(_)) => match debugger.stop_event() {
                Some(event) if event.is_exit() => event,
                _ => return Err(e),
            },
            _ => return Err(e),
        },
    };

    match event.reason {
        StopReason::Breakpoint => {
            print!("Breakpoint hit in thread {}: ", event.tid);
            report_location(debugger);
        }
        StopReason::Step => report_location(debugger),
        StopReason::Signal(signal) => {
            print!("Thread {} received {:?}: ", event.tid, signal);
            report_location(debugger);
        }
        StopReason::Exited(code) => println!("Process exited with status {}", code),
        StopReason::Killed(signal) => println!("Process killed by {:?}", signal),
    }
    Ok(())
}

/// 停止位置を `file:line (function)` で表示する
fn report_location(debugger: &Debugger) {
    let Ok(pc) = debugger.get_pc() else {
        println!();
        return;
    };

    match debugger.pc_to_line(pc) {
        Ok(Some(line)) => {
            let function = line.function.as_deref().unwrap_or("??");
            println!("{}:{} ({})", line.file, line.line, function);
        }
        _ => {
            let function = debugger
                .reverse_resolve(pc)
                .map(|s| s.demangled_name.as_str())
                .unwrap_or("??");
            println!("0x{:x} ({})", pc, function);
        }
    }
}

fn print_help() {
    println!("Available commands:");
    println!();
    println!("  break (b) <loc>     - Set breakpoint at address, file:line or function");
    println!("  clear <id|addr>     - Remove a breakpoint");
    println!("  breakpoints (bps)   - List breakpoints");
    println!("  continue (c)        - Continue execution");
    println!("  step (s)            - Execute one machine instruction");
    println!("  print (p) <expr>    - Evaluate a variable, member or substring");
    println!("  locals              - Show local variables");
    println!("  args                - Show function arguments");
    println!("  help                - Show this help message");
    println!("  quit (q)            - Detach and exit");
    println!();
    println!("Examples:");
    println!("  break testvariables.go:39");
    println!("  break main.foobar");
    println!("  print a6.Baz");
    println!("  print a1[2:5]");
}
