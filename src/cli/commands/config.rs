//! Config command - show or initialize configuration

use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::cli::context::CommandContext;
use crate::config::schema::builtin_vendors;
use crate::config::{Config, ConfigManager};
use crate::error::VectisResult;
use crate::ui;

/// Execute the config command
pub async fn execute(args: ConfigArgs, ctx: &CommandContext) -> VectisResult<()> {
    let manager = ConfigManager::with_path(ctx.config_path.clone());

    match args.action {
        None | Some(ConfigAction::Show) => show_config(ctx)?,
        Some(ConfigAction::Path) => println!("{}", manager.path().display()),
        Some(ConfigAction::Init { force }) => init_config(ctx, &manager, force).await?,
    }

    Ok(())
}

/// Effective configuration, built-in vendors included
fn show_config(ctx: &CommandContext) -> VectisResult<()> {
    println!("{}", toml::to_string_pretty(&ctx.config)?);
    Ok(())
}

async fn init_config(ctx: &CommandContext, manager: &ConfigManager, force: bool) -> VectisResult<()> {
    let path = manager.path();

    if path.exists() && !force {
        ui::step_warn_hint(
            &ctx.ui,
            &format!("Config already exists at {}", path.display()),
            "Use --force to overwrite",
        );
        return Ok(());
    }

    manager.save(&initial_config()).await?;
    ui::step_ok_detail(&ctx.ui, "Configuration initialized", &path.display().to_string());

    Ok(())
}

/// Defaults with the built-in vendors spelled out, ready for editing
fn initial_config() -> Config {
    Config {
        vendors: builtin_vendors(),
        ..Config::default()
    }
}
