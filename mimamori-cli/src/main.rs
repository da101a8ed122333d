//! Mimamori CLI - コマンドラインインターフェース
//!
//! 実行中のプロセスのメモリアドレスにハードウェアウォッチポイントを設定し、
//! どの命令がアクセスしたかを継続的に記録する

use anyhow::Result;
use clap::{Parser, Subcommand};
use mimamori_core::parse::{parse_address, parse_size};
use mimamori_core::{AccessKind, InstallReport, WatchConfig, WatchSession};
use mimamori_target::{ProcThreadEnumerator, ThreadEnumerator};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;

/// Ctrl-Cで立つ停止フラグ
static STOP: AtomicBool = AtomicBool::new(false);

/// Mimamori - hardware watchpoint tracer
#[derive(Parser)]
#[command(name = "mimamori")]
#[command(version = "0.1.0")]
#[command(about = "Watch a memory address in a running process with self-re-arming hardware watchpoints", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: WatchCommand,
}

#[derive(Subcommand)]
enum WatchCommand {
    /// List the threads of a process
    Threads {
        /// Process ID
        #[arg(short, long)]
        pid: i32,

        /// Only show threads with this exact name
        #[arg(long)]
        thread_name: Option<String>,
    },

    /// Attach to a process and report every access to an address
    Watch {
        /// Process ID to attach to
        #[arg(short, long)]
        pid: i32,

        /// Address to watch (0x-prefixed hex or decimal)
        #[arg(short, long, value_parser = parse_address)]
        address: u64,

        /// Watched length in bytes (1, 2, 4 or 8)
        #[arg(short, long, default_value = "4", value_parser = parse_size)]
        size: usize,

        /// Access to watch: r, w, rw or x
        #[arg(short = 'c', long, default_value = "w")]
        access: AccessKind,

        /// Only watch threads with this exact name (e.g. GameThread)
        #[arg(long, conflicts_with = "thread_pattern")]
        thread_name: Option<String>,

        /// Only watch threads whose name matches this regular expression
        #[arg(long)]
        thread_pattern: Option<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        WatchCommand::Threads { pid, thread_name } => handle_threads(pid, thread_name.as_deref()),
        WatchCommand::Watch {
            pid,
            address,
            size,
            access,
            thread_name,
            thread_pattern,
        } => {
            let config = WatchConfig::new(pid, address, size, access, thread_name, thread_pattern)?;
            handle_watch(config)
        }
    }
}

/// Threadsコマンドを処理する
fn handle_threads(pid: i32, thread_name: Option<&str>) -> Result<()> {
    let threads = ProcThreadEnumerator::new(pid).list_threads(thread_name)?;

    if threads.is_empty() {
        println!("No threads found");
        return Ok(());
    }

    println!("Threads of process {} ({} found):", pid, threads.len());
    for thread in &threads {
        println!("  {:>8}  {}", thread.tid, thread.name);
    }
    Ok(())
}

/// Watchコマンドを処理する
fn handle_watch(config: WatchConfig) -> Result<()> {
    install_sigint_handler()?;

    println!("Attaching to process: {}", config.pid);
    println!(
        "Watching 0x{:x} (size: {}, access: {}) on {}",
        config.address, config.size, config.access, config.selection
    );
    println!();

    let session = WatchSession::attach(config)?;
    let report = session.install()?;
    print_install_report(&report);

    if report.is_empty() {
        println!("No thread could be armed, detaching");
        session.detach();
        return Ok(());
    }

    println!();
    println!("Press Ctrl-C to stop watching");
    println!();

    let summary = session.run(&STOP)?;

    println!();
    println!("Traps handled:   {}", summary.traps_handled);
    println!("Traps forwarded: {}", summary.traps_forwarded);
    println!("Re-arms:         {}", summary.rearms);
    if let Some(code) = summary.exit_code {
        println!("Process exited with code {}", code);
    }

    session.detach();
    Ok(())
}

fn print_install_report(report: &InstallReport) {
    println!("Armed {} thread(s)", report.armed.len());
    for tid in &report.armed {
        println!("  [*] {}", tid);
    }
    for (tid, e) in &report.failed {
        println!("  [!] {}: {}", tid, e);
    }
}

extern "C" fn on_sigint(_: nix::libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

/// SIGINTで待機中のwaitpidをEINTRで抜けさせる（SA_RESTARTを付けない）
fn install_sigint_handler() -> Result<()> {
    let action = SigAction::new(SigHandler::Handler(on_sigint), SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(Signal::SIGINT, &action) }?;
    Ok(())
}
