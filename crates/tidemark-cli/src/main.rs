//! Tidemark command-line interface.
//!
//! Schema migrations and time-windowed data backfills for analytical
//! databases.

mod commands;
mod exec;

use clap::Parser;
use commands::Args;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tidemark_cli=info".parse().unwrap())
                .add_directive("tidemark_backfill=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match commands::dispatch(args).await {
        Ok(code) => std::process::exit(i32::from(code)),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
