//! Artifact-producing commands: bootstrap, new, sbuild-tarball,
//! minbase-tarball and prepare

use crate::cli::args::PrepareArgs;
use crate::cli::commands::run_planned;
use crate::cli::context::CommandContext;
use crate::error::VectisResult;
use crate::pipeline::{PlannedStage, Stage};
use crate::store::ArtifactKind;
use crate::ui;
use std::sync::Arc;

/// Run a single stage for the selected suite
pub async fn execute(stage: Stage, ctx: &CommandContext) -> VectisResult<()> {
    let suite = ctx.suite()?;
    let orchestrator = ctx.orchestrator()?;

    run_planned(ctx, &orchestrator, &[PlannedStage { stage, suite }]).await?;
    Ok(())
}

/// Create every missing artifact a package build of the selected suite needs
pub async fn prepare(args: PrepareArgs, ctx: &CommandContext) -> VectisResult<()> {
    let suite = ctx.suite()?;
    let orchestrator = ctx.orchestrator()?;

    ui::section(&ctx.ui, &format!("Preparing {}", suite.label()));
    let mut planned = orchestrator.plan(ArtifactKind::SbuildTarball, &suite);
    if args.minbase {
        planned.push(PlannedStage {
            stage: Stage::MinbaseTarball,
            suite: Arc::clone(&suite),
        });
    }

    run_planned(ctx, &orchestrator, &planned).await?;
    Ok(())
}
