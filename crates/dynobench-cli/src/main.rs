//! `dynobench` command-line tool

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use dynobench_core::signal::CancelSignal;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod cmd;

#[derive(Parser, Debug)]
#[command(name = "dynobench", version, about = "Drive a dynamometer test bench")]
struct Cli {
    /// Telemetry CSV written when a test ends normally
    #[arg(long, global = true, default_value = "telemetry.csv")]
    csv: PathBuf,

    /// Log filter, e.g. `debug` or `dynobench_core=trace` (overrides RUST_LOG)
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a Lua test script against the bench
    Test(cmd::test::TestArgs),
    /// Stream telemetry to stdout
    Tele(cmd::tele::TeleArgs),
    /// Issue commands interactively
    Repl(cmd::repl::ReplArgs),
    /// List serial ports
    Ports,
}

fn init_logging(filter: Option<&str>) {
    let filter = match filter {
        Some(filter) => EnvFilter::new(filter),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log.as_deref());

    let session = CancelSignal::new();
    let interrupt = session.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted");
            interrupt.cancel();
        }
    });

    let result = match cli.command {
        Command::Test(args) => cmd::test::run(args, &cli.csv, session).await,
        Command::Tele(args) => cmd::tele::run(args, session).await,
        Command::Repl(args) => cmd::repl::run(args, session).await,
        Command::Ports => cmd::ports::run(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
