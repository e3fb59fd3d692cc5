pub mod audio;
pub mod cli;
pub mod commands;
pub mod error;
pub mod market;
pub mod state;

use clap::Parser;
use cli::{run_cli, Cli};
use error::AppError;
use tracing_subscriber::EnvFilter;

pub fn run() -> Result<(), AppError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_cli(cli))
}
