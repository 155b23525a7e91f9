use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod app;
mod cli;
mod repl;
mod settings;

use cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match app::run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(stage = error.stage(), "{error}");
            eprintln!("murmur: {error}");
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr so they never interleave with streamed replies on stdout.
fn init_tracing(verbose: u8) {
    let default_directive = match verbose {
        0 => "murmur=info",
        1 => "murmur=debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
