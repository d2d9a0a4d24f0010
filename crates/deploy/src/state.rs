//! Deploy status state machine.
//!
//! Allowed transitions (target <- sources):
//! - `DEPLOYED` <- `NONE`
//! - `UPGRADED` <- `NONE`, `DEPLOYED`
//! - `NONE` is never a valid target.

use serde::{Deserialize, Serialize};

use crate::error::DeployError;

/// Outcome of one orchestration call for a proxy.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DeployStatus {
    /// Nothing changed on-chain.
    #[default]
    None,
    /// A new proxy was created.
    Deployed,
    /// The proxy now points (or will point, once a multisig executes) at new code.
    Upgraded,
}

impl DeployStatus {
    /// Sources from which `self` may be reached.
    pub fn allowed_sources(&self) -> &'static [DeployStatus] {
        match self {
            DeployStatus::None => &[],
            DeployStatus::Deployed => &[DeployStatus::None],
            DeployStatus::Upgraded => &[DeployStatus::None, DeployStatus::Deployed],
        }
    }
}

/// Per-call deploy state. Starts at `NONE` and only moves forward.
#[derive(Debug, Default)]
pub struct DeployState {
    status: DeployStatus,
}

impl DeployState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> DeployStatus {
        self.status
    }

    /// Move to `target`, or fail with [`DeployError::IllegalStateTransition`].
    pub fn switch_to(&mut self, target: DeployStatus) -> Result<(), DeployError> {
        if !target.allowed_sources().contains(&self.status) {
            return Err(DeployError::IllegalStateTransition {
                attempted: target,
                current: self.status,
            });
        }

        tracing::debug!(from = %self.status, to = %target, "Deploy state transition");
        self.status = target;
        Ok(())
    }

    /// Consume the state, yielding the final status.
    pub fn finish(self) -> DeployStatus {
        self.status
    }
}
