//! Run command - run a command in a fresh VM

use crate::cli::args::RunArgs;
use crate::cli::commands::{output_dir_or_cwd, report_outputs};
use crate::cli::context::CommandContext;
use crate::error::{VectisError, VectisResult};
use crate::pipeline::RunRequest;
use crate::ui::{self, TaskSpinner};

/// Execute the run command
pub async fn execute(args: RunArgs, ctx: &CommandContext) -> VectisResult<()> {
    let request = build_request(args)?;
    request.validate()?;
    if let Some(input) = &request.input {
        if !input.exists() {
            return Err(VectisError::PathNotFound(input.clone()));
        }
    }

    let suite = ctx.suite()?;
    let orchestrator = ctx.orchestrator()?;

    let label = format!("run {}", suite.label());
    let mut spinner = TaskSpinner::new(&ctx.ui);
    spinner.start(&label);

    match orchestrator.run_command(&suite, &request).await {
        Ok(result) => {
            spinner.stop(&label);
            if result.outputs.is_empty() {
                ui::step_info(&ctx.ui, "Command produced no artifacts");
            } else {
                report_outputs(ctx, &result);
            }
            Ok(())
        }
        Err(e) => {
            spinner.stop_error(&label);
            if request.output_dir.exists() {
                ui::step_info(
                    &ctx.ui,
                    &format!("Artifacts are in {}", request.output_dir.display()),
                );
            }
            Err(e)
        }
    }
}

fn build_request(args: RunArgs) -> VectisResult<RunRequest> {
    let output_dir = match args.output_dir {
        Some(dir) => dir,
        None => RunRequest::default_output_dir(&output_dir_or_cwd(None)?),
    };

    let mut request = RunRequest::new(args.command, output_dir);
    request.shell = args.shell;
    request.input = args.input;
    request.chdir = args.chdir;
    Ok(request)
}
