//! Entry point. Parses flags, initialises structured logging and hands off
//! to the library runtime, mapping its exit classification to a process
//! exit code.

use clap::Parser;
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use cpu_shaper::cli::Args;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging();

    eprintln!(
        "{}",
        format!("cpu-shaper {}", cpu_shaper::shaper_version()).bright_cyan()
    );

    let status = cpu_shaper::run(args).await;
    std::process::exit(status.code());
}
