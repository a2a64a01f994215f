//! Kiln - buildpack image builder
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use kiln::cli::{Cli, Commands, LogFormat};
use kiln::config::ConfigManager;
use kiln::error::KilnResult;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8, format: LogFormat) {
    // 0 = warn, 1 = info, 2+ = debug
    let filter = match verbose {
        0 => EnvFilter::new("kiln=warn"),
        1 => EnvFilter::new("kiln=info"),
        _ => EnvFilter::new("kiln=debug"),
    };

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .without_time()
            .init(),
    }
}

/// Cancel `token` on the first Ctrl-C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cleaning up");
            token.cancel();
        }
    });
}

async fn run() -> KilnResult<()> {
    let cli = Cli::parse();

    let config_manager = ConfigManager::from_override(cli.config.clone());
    let config = config_manager.load().await?;

    let format = cli.log_format.unwrap_or(if config.general.log_format == "json" {
        LogFormat::Json
    } else {
        LogFormat::Text
    });
    init_logging(cli.verbose, format);
    kiln::ui::init_theme();
    debug!("Loaded configuration from {}", config_manager.path().display());

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    match cli.command {
        Commands::Build(args) => kiln::cli::commands::build(args, &config, &cancel).await,
        Commands::Rebase(args) => kiln::cli::commands::rebase(args, &config, &cancel).await,
        Commands::CreateBuilder(args) => {
            kiln::cli::commands::create_builder(args, &config, &cancel).await
        }
        Commands::Config(args) => kiln::cli::commands::config(args, &config, &config_manager).await,
    }
}
