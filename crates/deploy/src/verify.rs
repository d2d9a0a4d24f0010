//! Best-effort block explorer verification.
//!
//! Verification never fails a deployment. Every outcome, including exhausted
//! retries, is reported as a [`VerificationOutcome`].

use std::{
    io,
    sync::{Arc, Mutex},
    time::Duration,
};

use alloy_core::primitives::{Address, Bytes};
use tracing::instrument::WithSubscriber;
use tracing_subscriber::fmt::MakeWriter;

use crate::{
    error::DeployError,
    explorer::{ExplorerApi, VerificationTarget},
    retry::{self, RetryPolicy},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// Verification is off for this network, nothing was queried.
    Disabled,
    AlreadyVerified,
    Verified,
    Failed { reason: String, output: String },
}

impl VerificationOutcome {
    /// Whether the explorer ended up showing the target as verified.
    pub fn is_verified(&self) -> bool {
        matches!(
            self,
            VerificationOutcome::AlreadyVerified | VerificationOutcome::Verified
        )
    }

    /// Combined outcome of two targets verified one after the other.
    fn then(self, next: VerificationOutcome) -> VerificationOutcome {
        match (self, next) {
            (VerificationOutcome::AlreadyVerified, VerificationOutcome::AlreadyVerified) => {
                VerificationOutcome::AlreadyVerified
            }
            (first, next) if first.is_verified() && next.is_verified() => {
                VerificationOutcome::Verified
            }
            (first, next) if !first.is_verified() => first,
            (_, next) => next,
        }
    }
}

/// Buffer receiving everything logged while a verify attempt runs.
#[derive(Debug, Clone, Default)]
struct CaptureBuffer(Arc<Mutex<Vec<u8>>>);

impl CaptureBuffer {
    fn take(&self) -> String {
        let mut buffer = match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        String::from_utf8_lossy(&std::mem::take(&mut *buffer))
            .trim_end()
            .to_string()
    }
}

impl io::Write for CaptureBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| io::Error::other("capture buffer poisoned"))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CaptureBuffer {
    type Writer = CaptureBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

pub struct VerificationService<E> {
    explorer: Option<E>,
    retry: RetryPolicy,
    safety_delay: Duration,
}

impl<E: ExplorerApi> VerificationService<E> {
    pub fn new(explorer: E, retry: RetryPolicy, safety_delay: Duration) -> Self {
        Self {
            explorer: Some(explorer),
            retry,
            safety_delay,
        }
    }

    /// No explorer calls at all, e.g. on a local network.
    pub fn disabled() -> Self {
        Self {
            explorer: None,
            retry: RetryPolicy::once(),
            safety_delay: Duration::ZERO,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.explorer.is_some()
    }

    /// Verify `target` unless disabled or already verified.
    ///
    /// Returns `true` only when a verification was performed and confirmed.
    pub async fn verify_if_needed(&self, target: &VerificationTarget) -> bool {
        self.verify(target).await == VerificationOutcome::Verified
    }

    /// Publish the implementation source, then link the proxy to it.
    ///
    /// The proxy is only linked once the implementation is verified, and the result
    /// counts as verified only when both are.
    pub async fn verify_proxy(
        &self,
        proxy: Address,
        implementation: Address,
        contract: &str,
        constructor_args: &Bytes,
    ) -> VerificationOutcome {
        let source = self
            .verify(&VerificationTarget::Source {
                address: implementation,
                contract: contract.to_string(),
                constructor_args: constructor_args.clone(),
            })
            .await;
        if !source.is_verified() {
            return source;
        }

        let link = self
            .verify(&VerificationTarget::ProxyLink {
                proxy,
                implementation,
            })
            .await;
        source.then(link)
    }

    pub async fn verify(&self, target: &VerificationTarget) -> VerificationOutcome {
        let Some(explorer) = &self.explorer else {
            return VerificationOutcome::Disabled;
        };

        let status_policy = RetryPolicy::transient(self.retry.retries(), self.retry.delay());
        match retry::run(&status_policy, || explorer.is_verified(target)).await {
            Ok(true) => {
                tracing::debug!(%target, "Already verified");
                return VerificationOutcome::AlreadyVerified;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(%target, error = %e, "Could not query verification status");
                return VerificationOutcome::Failed {
                    reason: e.to_string(),
                    output: String::new(),
                };
            }
        }

        match retry::run(&self.retry, || self.attempt(explorer, target)).await {
            Ok(()) => {
                tracing::info!(%target, "Verified");
                VerificationOutcome::Verified
            }
            Err(e) => {
                let output = match &e {
                    DeployError::Verification { output, .. } => output.clone(),
                    _ => String::new(),
                };
                tracing::warn!(
                    %target,
                    retries = self.retry.retries(),
                    error = %e,
                    output = %output,
                    "Verification did not complete, continuing"
                );
                VerificationOutcome::Failed {
                    reason: e.to_string(),
                    output,
                }
            }
        }
    }

    /// One verify call followed by a status poll after the safety delay.
    async fn attempt(&self, explorer: &E, target: &VerificationTarget) -> Result<(), DeployError> {
        let capture = CaptureBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(capture.clone())
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::TRACE)
            .finish();

        let submitted = explorer.verify(target).with_subscriber(subscriber).await;

        let failure = |reason: String| DeployError::Verification {
            address: target.address(),
            reason,
            output: capture.take(),
        };

        submitted.map_err(|e| failure(e.to_string()))?;

        tokio::time::sleep(self.safety_delay).await;

        match explorer.is_verified(target).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(failure("explorer does not report verified source".to_string())),
            Err(e) => Err(failure(e.to_string())),
        }
    }
}
