//! forkd - server engine entry point.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

use forkd::backend::Registry;
use forkd::{Config, Server};

/// Embedded server engine with fork and pre-fork worker pools.
#[derive(Parser, Debug)]
#[command(name = "forkd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "FORKD_CONFIG")]
    config: PathBuf,

    /// Serve every backend iteratively in a single process.
    #[arg(short = 'F', long)]
    foreground: bool,

    /// Verbose engine diagnostics.
    #[arg(short, long)]
    debug: bool,
}

fn run(cli: &Cli) -> forkd::Result<()> {
    let config = Config::from_file(&cli.config)?;
    let mut server = Server::create(&config, &Registry::builtin(), cli.foreground)?;
    let result = server.run();
    server.close();
    result
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    forkd::observability::init_tracing(cli.debug);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "forkd stopped");
            eprintln!("forkd: {}", e);
            ExitCode::FAILURE
        }
    }
}
