//! Implementation change detection.

use alloy_core::primitives::Address;

use crate::{error::DeployError, history::BytecodeHistoryStore};

/// Decides whether two implementation addresses carry equivalent code.
///
/// Alias-group equivalence is a heuristic: identical bytecode says nothing about
/// intended semantics, so it can be switched off with [`Self::without_aliasing`].
#[derive(Debug)]
pub struct BytecodeComparator<H> {
    history: H,
    aliasing: bool,
}

impl<H: BytecodeHistoryStore> BytecodeComparator<H> {
    pub fn new(history: H) -> Self {
        Self {
            history,
            aliasing: true,
        }
    }

    /// Only identical addresses compare equal.
    pub fn without_aliasing(mut self) -> Self {
        self.aliasing = false;
        self
    }

    pub fn history(&self) -> &H {
        &self.history
    }

    pub async fn have_same_bytecode(&self, a: Address, b: Address) -> Result<bool, DeployError> {
        if a == b {
            return Ok(true);
        }

        if !self.aliasing {
            return Ok(false);
        }

        let same = self
            .history
            .groups()
            .await?
            .iter()
            .any(|group| group.contains(a) && group.contains(b));

        tracing::debug!(%a, %b, same, "Compared implementations through alias history");
        Ok(same)
    }
}
