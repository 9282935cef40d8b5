//! Build pipeline
//!
//! Stages turn a suite into cached artifacts (VM images, chroot tarballs)
//! and use those artifacts to build and test packages. Every stage runs
//! its recipe in a single worker session and publishes through the
//! artifact store, so a stage whose output is already published is free.
//!
//! ```text
//! bootstrap (root suite) ─▶ new (each derived suite) ─▶ sbuild-tarball ─▶ build-all / build-any
//!                                                   └─▶ minbase-tarball ─▶ test-schroot, piuparts
//!                                                   └─▶ test, run
//! ```

mod autopkgtest;
mod build;
mod image;
pub mod orchestrator;
mod piuparts;
mod recipe;
mod run;
pub mod stage;
mod tarball;

pub use orchestrator::{Orchestrator, PipelineSettings};
pub use run::RunRequest;
pub use stage::{plan, BuildArch, PlannedStage, Stage, StageResult, TestMode};
