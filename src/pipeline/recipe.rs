//! Recipes: what a stage does inside its worker

use crate::error::VectisResult;
use crate::worker::Worker;
use async_trait::async_trait;
use std::path::Path;
use tracing::warn;

/// Work a stage performs in an open worker session
///
/// Multi-step recipes get a clean guest for every step: the orchestrator
/// reverts (or reopens) the worker between steps.
#[async_trait]
pub(crate) trait Recipe: Send {
    /// Number of isolated steps
    fn steps(&self) -> usize {
        1
    }

    async fn run_step(&mut self, worker: &mut Worker, step: usize) -> VectisResult<()>;
}

/// `copy_out`, retrying transfer errors up to `attempts` times in total
pub(crate) async fn copy_out_retrying(
    worker: &mut Worker,
    guest: &str,
    host: &Path,
    attempts: u32,
) -> VectisResult<()> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match worker.copy_out(guest, host).await {
            Err(e) if e.is_retryable() && attempt < attempts => {
                warn!("{} (attempt {}/{}), retrying", e, attempt, attempts);
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// `copy_in`, retrying transfer errors up to `attempts` times in total
pub(crate) async fn copy_in_retrying(
    worker: &mut Worker,
    host: &Path,
    guest: &str,
    attempts: u32,
) -> VectisResult<()> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match worker.copy_in(host, guest).await {
            Err(e) if e.is_retryable() && attempt < attempts => {
                warn!("{} (attempt {}/{}), retrying", e, attempt, attempts);
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Install build tools only where the worker is disposable
///
/// On an unisolated backend (`null`) the host is expected to have them.
pub(crate) async fn install_if_isolated(worker: &mut Worker, packages: &[&str]) -> VectisResult<()> {
    if !worker.capabilities().suitable_for_builds() {
        return Ok(());
    }
    worker.check(&crate::worker::apt_get(&["update"])).await?;
    worker.install(packages).await
}
