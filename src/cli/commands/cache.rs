//! Cache command - inspect and manage cached artifacts

use crate::cli::args::{CacheAction, CacheArgs, OutputFormat};
use crate::cli::context::CommandContext;
use crate::error::{VectisError, VectisResult};
use crate::store::{format_bytes, ArtifactEntry, ArtifactKey, ArtifactKind, ArtifactState, ArtifactStore};
use crate::ui;
use console::style;

/// Execute the cache command
pub async fn execute(args: CacheArgs, ctx: &CommandContext) -> VectisResult<()> {
    let store = ctx.store();

    match args.action {
        CacheAction::List { format } => list_artifacts(&store, format).await,
        CacheAction::Path { kind } => {
            let key = selected_key(ctx, kind)?;
            println!("{}", store.path_for(&key).display());
            Ok(())
        }
        CacheAction::Remove { kind } => remove_artifact(ctx, &store, kind).await,
        CacheAction::Clean => clean_staging(ctx, &store).await,
        CacheAction::Materialize { kind } => materialize_artifact(ctx, &store, kind).await,
    }
}

fn selected_key(ctx: &CommandContext, kind: ArtifactKind) -> VectisResult<ArtifactKey> {
    let suite = ctx.suite()?;
    Ok(ArtifactKey::for_suite(&suite, kind))
}

async fn list_artifacts(store: &ArtifactStore, format: OutputFormat) -> VectisResult<()> {
    let entries = store.list().await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        OutputFormat::Plain => {
            for entry in &entries {
                println!("{}", entry.path.display());
            }
        }
        OutputFormat::Table if entries.is_empty() => {
            println!("No artifacts in {}", store.root().display());
        }
        OutputFormat::Table => print_table(&entries),
    }

    Ok(())
}

fn print_table(entries: &[ArtifactEntry]) {
    println!(
        "{:<10} {:<10} {:<22} {:<16} {:<10} {:>10}",
        "ARCH", "VENDOR", "SUITE", "KIND", "STATE", "SIZE"
    );
    println!("{}", "-".repeat(83));

    let mut total = 0;
    for entry in entries {
        let state = match entry.state {
            ArtifactState::Published => style("published").green().to_string(),
            ArtifactState::Linked => style("linked").cyan().to_string(),
            ArtifactState::Building => style("building").yellow().to_string(),
        };
        total += entry.size_bytes;

        println!(
            "{:<10} {:<10} {:<22} {:<16} {:<10} {:>10}",
            entry.key.architecture,
            entry.key.vendor,
            entry.key.suite,
            entry.key.kind,
            state,
            format_bytes(entry.size_bytes)
        );
    }

    println!();
    println!(
        "Total: {} artifact(s), {}",
        entries.len(),
        format_bytes(total)
    );
}

async fn remove_artifact(
    ctx: &CommandContext,
    store: &ArtifactStore,
    kind: ArtifactKind,
) -> VectisResult<()> {
    let key = selected_key(ctx, kind)?;

    if store.remove(&key).await? {
        ui::step_ok(&ctx.ui, &format!("Removed {}", key));
    } else {
        ui::step_warn_hint(
            &ctx.ui,
            &format!("{} is not cached", key),
            "Nothing to remove",
        );
    }
    Ok(())
}

async fn clean_staging(ctx: &CommandContext, store: &ArtifactStore) -> VectisResult<()> {
    let removed = store.clean_staging().await?;
    if removed.is_empty() {
        ui::step_info(&ctx.ui, "No leftover staging files");
        return Ok(());
    }

    let total: u64 = removed.iter().map(|e| e.size_bytes).sum();
    for entry in &removed {
        ui::remark(&ctx.ui, &entry.path.display().to_string());
    }
    ui::step_ok_detail(
        &ctx.ui,
        &format!("Removed {} staging file(s)", removed.len()),
        &format_bytes(total),
    );
    Ok(())
}

async fn materialize_artifact(
    ctx: &CommandContext,
    store: &ArtifactStore,
    kind: ArtifactKind,
) -> VectisResult<()> {
    let key = selected_key(ctx, kind)?;

    let Some(handle) = store.lookup(&key).await? else {
        ui::step_error_detail(&ctx.ui, "Not cached", &key.to_string());
        return Err(VectisError::PathNotFound(store.path_for(&key)));
    };

    if !handle.read_only {
        ui::step_ok_detail(
            &ctx.ui,
            "Already a private copy",
            &handle.path.display().to_string(),
        );
        return Ok(());
    }

    let handle = store.materialize_writable_copy(&handle).await?;
    ui::step_ok_detail(
        &ctx.ui,
        "Replaced symlink with a private copy",
        &handle.path.display().to_string(),
    );
    Ok(())
}
