//! Piuparts command - install/purge testing of binary packages

use crate::cli::args::PiupartsArgs;
use crate::cli::commands::{output_dir_or_cwd, run_planned};
use crate::cli::context::CommandContext;
use crate::error::{VectisError, VectisResult};
use crate::package::binary_packages;
use crate::pipeline::{PlannedStage, Stage};

/// Execute the piuparts command
pub async fn execute(args: PiupartsArgs, ctx: &CommandContext) -> VectisResult<()> {
    let packages = binary_packages(&args.packages).await?;
    if packages.is_empty() {
        return Err(VectisError::User(
            "the .changes files list no .deb packages".to_string(),
        ));
    }
    let output_dir = output_dir_or_cwd(args.output_dir)?;

    let suite = ctx.suite()?;
    let orchestrator = ctx.orchestrator()?;
    let planned = PlannedStage {
        stage: Stage::Piuparts {
            packages,
            output_dir,
        },
        suite,
    };

    run_planned(ctx, &orchestrator, &[planned]).await?;
    Ok(())
}
