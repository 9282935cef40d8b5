//! Worker session state

use crate::error::{VectisError, VectisResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Lifecycle of a worker session
///
/// `Opening → Ready ⇄ {Executing, Reverting} → Closing → Closed`, with
/// `Failed` reachable from anywhere and left only by closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Opening,
    Ready,
    Executing,
    Reverting,
    Closing,
    Closed,
    Failed,
}

impl WorkerState {
    /// Whether `next` may follow this state
    pub fn can_transition(self, next: WorkerState) -> bool {
        use WorkerState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Failed) => true,
            (Opening, Ready) => true,
            (Ready, Executing | Reverting) => true,
            (Executing | Reverting, Ready) => true,
            (Opening | Ready | Failed, Closing) => true,
            (Closing, Closed) => true,
            _ => false,
        }
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow
    pub fn transition(&mut self, next: WorkerState) -> VectisResult<()> {
        if !self.can_transition(next) {
            return Err(VectisError::InvalidState {
                state: self.to_string(),
                operation: format!("become {}", next),
            });
        }
        *self = next;
        Ok(())
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Opening => "opening",
            WorkerState::Ready => "ready",
            WorkerState::Executing => "executing",
            WorkerState::Reverting => "reverting",
            WorkerState::Closing => "closing",
            WorkerState::Closed => "closed",
            WorkerState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Capability words reported by the virt server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    words: BTreeSet<String>,
}

impl Capabilities {
    /// Parse the payload of a `capabilities` response
    pub fn parse(payload: &str) -> Self {
        Self {
            words: payload.split_whitespace().map(str::to_string).collect(),
        }
    }

    pub fn has(&self, capability: &str) -> bool {
        self.words.contains(capability)
    }

    /// The backend can reset the guest without relaunching
    pub fn can_revert(&self) -> bool {
        self.has("revert")
    }

    /// Commands run as root and the guest is isolated from the host
    pub fn suitable_for_builds(&self) -> bool {
        self.has("root-on-testbed")
            && (self.has("isolation-machine") || self.has("isolation-container"))
    }

    /// Unprivileged user suggested by the backend, if any
    pub fn suggested_user(&self) -> Option<&str> {
        self.words
            .iter()
            .find_map(|w| w.strip_prefix("suggested-normal-user="))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.words.iter().map(String::as_str)
    }
}
