//! CLI command implementations

pub mod build;
pub mod cache;
pub mod config;
pub mod piuparts;
pub mod run;
pub mod stage;

pub use build::execute as build;
pub use cache::execute as cache;
pub use config::execute as config;
pub use piuparts::execute as piuparts;
pub use run::execute as run;
pub use stage::{execute as stage, prepare};
pub use test::execute as test;

use crate::cli::context::CommandContext;
use crate::error::{VectisError, VectisResult};
use crate::pipeline::{Orchestrator, PlannedStage, StageResult};
use crate::ui::{self, counted, TaskSpinner};
use std::path::PathBuf;

/// Run stages one after another with a spinner each
///
/// Stops at the first failure. Files a stage copied out are listed even
/// when a later stage fails.
pub(crate) async fn run_planned(
    ctx: &CommandContext,
    orchestrator: &Orchestrator,
    planned: &[PlannedStage],
) -> VectisResult<Vec<StageResult>> {
    let mut results = Vec::with_capacity(planned.len());

    for (i, entry) in planned.iter().enumerate() {
        let label = counted(i, planned.len(), &entry.to_string());
        let mut spinner = TaskSpinner::new(&ctx.ui);
        spinner.start(&label);

        match orchestrator.run_stage(&entry.stage, &entry.suite).await {
            Ok(result) => {
                spinner.stop(&summary(&label, &result));
                report_outputs(ctx, &result);
                results.push(result);
            }
            Err(e) => {
                spinner.stop_error(&label);
                return Err(e);
            }
        }
    }

    Ok(results)
}

fn summary(label: &str, result: &StageResult) -> String {
    match &result.artifact {
        Some(artifact) if result.cached => {
            format!("{} (cached at {})", label, artifact.path.display())
        }
        Some(artifact) => format!("{} -> {}", label, artifact.path.display()),
        None => label.to_string(),
    }
}

pub(crate) fn report_outputs(ctx: &CommandContext, result: &StageResult) {
    for output in &result.outputs {
        ui::remark(&ctx.ui, &output.display().to_string());
    }
}

/// `dir`, or the current directory
pub(crate) fn output_dir_or_cwd(dir: Option<PathBuf>) -> VectisResult<PathBuf> {
    match dir {
        Some(dir) => Ok(dir),
        None => std::env::current_dir()
            .map_err(|e| VectisError::io("getting current directory", e)),
    }
}

/// Fail before booting anything if an input file is missing
pub(crate) fn require_files(files: &[PathBuf]) -> VectisResult<()> {
    match files.iter().find(|f| !f.exists()) {
        Some(missing) => Err(VectisError::PathNotFound(missing.clone())),
        None => Ok(()),
    }
}
