//! Vectis - build and test Debian packages in disposable VMs
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use vectis::cli::commands;
use vectis::cli::{Cli, CommandContext, Commands};
use vectis::config::{Config, ConfigManager};
use vectis::error::{VectisError, VectisResult};
use vectis::pipeline::Stage;
use vectis::ui::UiContext;

/// Conventional status for a process stopped by SIGINT
const INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            if matches!(e.cause(), VectisError::Cancelled) {
                ExitCode::from(INTERRUPTED)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run() -> VectisResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;

    init_logging(cli.verbose, &config);

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping the running stage");
            token.cancel();
        }
    });

    let ctx = CommandContext::new(
        config,
        config_manager.path().to_path_buf(),
        cli.target,
        UiContext::detect().with_logging(cli.verbose > 0),
        cancel,
    );

    match cli.command {
        Commands::Bootstrap => commands::stage(Stage::Bootstrap, &ctx).await,
        Commands::New => commands::stage(Stage::New, &ctx).await,
        Commands::SbuildTarball => commands::stage(Stage::SbuildTarball, &ctx).await,
        Commands::MinbaseTarball => commands::stage(Stage::MinbaseTarball, &ctx).await,
        Commands::Prepare(args) => commands::prepare(args, &ctx).await,
        Commands::Build(args) => commands::build(args, &ctx).await,
        Commands::Test(args) => commands::test(args, &ctx).await,
        Commands::Piuparts(args) => commands::piuparts(args, &ctx).await,
        Commands::Run(args) => commands::run(args, &ctx).await,
        Commands::Cache(args) => commands::cache(args, &ctx).await,
        Commands::Config(args) => commands::config(args, &ctx).await,
    }
}

/// 0 = warn (spinners only), 1 = info, 2+ = debug; `RUST_LOG` wins
fn init_logging(verbose: u8, config: &Config) {
    let default = match verbose {
        0 => "vectis=warn",
        1 => "vectis=info",
        _ => "vectis=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    if config.general.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .without_time()
            .init();
    }
}
