//! hodei-runner entrypoint.

mod compile_cmd;
mod daemon;
mod exec_cmd;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "hodei-runner",
    about = "CI pipeline runner for the docker engine",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Starts the runner daemon: pings the docker engine and serves the
    /// delegate control surface.
    Daemon(daemon::DaemonArgs),
    /// Starts the delegate server only.
    Delegate(daemon::DaemonArgs),
    /// Compiles and executes a local pipeline file.
    Exec(exec_cmd::ExecArgs),
    /// Compiles a local pipeline file and prints the execution plan.
    Compile(compile_cmd::CompileArgs),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Command::Daemon(args) | Command::Delegate(args) => daemon::run(args).await,
        Command::Exec(args) => exec_cmd::run(args).await,
        Command::Compile(args) => compile_cmd::run(args).await,
    };
    std::process::exit(code);
}
