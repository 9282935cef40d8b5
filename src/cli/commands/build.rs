//! Build command - build source packages with sbuild

use crate::cli::args::BuildArgs;
use crate::cli::commands::{output_dir_or_cwd, require_files, run_planned};
use crate::cli::context::CommandContext;
use crate::error::{VectisError, VectisResult};
use crate::package::{architectures, build_halves, source_packages};
use crate::pipeline::{BuildArch, PlannedStage, Stage};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Execute the build command
pub async fn execute(args: BuildArgs, ctx: &CommandContext) -> VectisResult<()> {
    let sources = source_packages(&args.sources)?;
    require_files(&sources)?;
    let output_dir = output_dir_or_cwd(args.output_dir)?;

    let forced = if args.all {
        Some(BuildArch::All)
    } else if args.any {
        Some(BuildArch::Any)
    } else {
        None
    };

    let suite = ctx.suite()?;
    let halves = split_halves(&sources, forced, &suite.architecture).await?;
    if halves.is_empty() {
        return Err(VectisError::User(format!(
            "None of the source packages build anything on {}",
            suite.architecture
        )));
    }

    let orchestrator = ctx.orchestrator()?;
    let planned: Vec<PlannedStage> = halves
        .into_iter()
        .map(|(arch, sources)| PlannedStage {
            stage: Stage::Build {
                arch,
                sources,
                output_dir: output_dir.clone(),
            },
            suite: Arc::clone(&suite),
        })
        .collect();

    run_planned(ctx, &orchestrator, &planned).await?;
    Ok(())
}

/// Group sources by the halves each one needs on `arch`
///
/// `--all` only applies to packages with `Architecture: all`; `--any`
/// applies to every package. Without either, a package gets the `all` half
/// when it declares `all` and the `any` half when it builds natively on
/// `arch`. Empty halves are left out.
async fn split_halves(
    sources: &[PathBuf],
    forced: Option<BuildArch>,
    arch: &str,
) -> VectisResult<Vec<(BuildArch, Vec<PathBuf>)>> {
    let mut indep_sources = Vec::new();
    let mut arch_sources = Vec::new();

    for dsc in sources {
        let (indep, native) = build_halves(&architectures(dsc).await?, arch);
        let (wants_indep, wants_arch) = match forced {
            Some(BuildArch::All) => (indep, false),
            Some(BuildArch::Any) => (false, true),
            None => (indep, native),
        };

        info!(
            "{}: arch:all {}, arch:{} {}",
            dsc.display(),
            wants_indep,
            arch,
            wants_arch
        );
        if !wants_indep && !wants_arch {
            warn!("{} builds nothing on {}, skipping", dsc.display(), arch);
        }
        if wants_indep {
            indep_sources.push(dsc.clone());
        }
        if wants_arch {
            arch_sources.push(dsc.clone());
        }
    }

    Ok([(BuildArch::All, indep_sources), (BuildArch::Any, arch_sources)]
        .into_iter()
        .filter(|(_, sources)| !sources.is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn dsc(dir: &TempDir, name: &str, architecture: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(
            &path,
            format!("Source: x\nArchitecture: {}\nFiles:\n 00 1 x.tar.gz\n", architecture),
        )
        .unwrap();
        path
    }

    #[tokio::test]
    async fn each_source_gets_only_its_halves() {
        let temp = TempDir::new().unwrap();
        let indep = dsc(&temp, "a.dsc", "all");
        let arch = dsc(&temp, "b.dsc", "linux-any");
        let both = dsc(&temp, "c.dsc", "any all");

        let halves = split_halves(&[indep.clone(), arch.clone(), both.clone()], None, "amd64")
            .await
            .unwrap();
        assert_eq!(
            halves,
            vec![
                (BuildArch::All, vec![indep, both.clone()]),
                (BuildArch::Any, vec![arch, both]),
            ]
        );
    }

    #[tokio::test]
    async fn foreign_only_package_builds_nothing() {
        let temp = TempDir::new().unwrap();
        let hurd = dsc(&temp, "h.dsc", "hurd-any");

        assert!(split_halves(&[hurd.clone()], None, "amd64")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            split_halves(&[hurd.clone()], None, "hurd-i386").await.unwrap(),
            vec![(BuildArch::Any, vec![hurd])]
        );
    }

    #[tokio::test]
    async fn forced_halves() {
        let temp = TempDir::new().unwrap();
        let indep = dsc(&temp, "a.dsc", "all");
        let arch = dsc(&temp, "b.dsc", "linux-any");
        let sources = [indep.clone(), arch.clone()];

        assert_eq!(
            split_halves(&sources, Some(BuildArch::All), "amd64").await.unwrap(),
            vec![(BuildArch::All, vec![indep])]
        );
        assert_eq!(
            split_halves(&sources, Some(BuildArch::Any), "amd64").await.unwrap(),
            vec![(BuildArch::Any, sources.to_vec())]
        );
    }
}
