use crate::error::Result;
use crate::pipeline::Pipeline;
use crate::stages::{assembly_pipeline, resubmission_pipeline, StageDeps};
use crate::submit::{Inclusion, RetryPolicy, Submitter};
use crate::types::{Intent, UserOperationDraft};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::Instrument;

/// Turns intents into sponsored, signed and included UserOperations.
///
/// One sender serves any number of concurrent runs; each run is tagged with its own id in
/// the logs. A run that fails or is cancelled before its operation reaches the bundler
/// gives its nonce back.
pub struct UserOpSender {
    assembly: Pipeline,
    submitter: Submitter,
    runs: AtomicU64,
}

impl UserOpSender {
    pub fn new(deps: StageDeps, retry_policy: RetryPolicy) -> Result<Self> {
        retry_policy.validate()?;
        deps.fee_policy.validate()?;
        let deps = StageDeps {
            replacement_bump_percentage: retry_policy.replacement_bump_percentage,
            ..deps
        };
        let assembly = assembly_pipeline(&deps)?;
        let submitter = Submitter::new(
            deps.bundler.clone(),
            deps.entry_point,
            retry_policy,
            resubmission_pipeline(&deps)?,
        );
        Ok(Self {
            assembly,
            submitter,
            runs: AtomicU64::new(1),
        })
    }

    /// Builds, sponsors and signs an operation for `intent` without broadcasting it.
    ///
    /// The nonce is not held for the caller: the next run sees it free again until some
    /// operation using it has been broadcast.
    pub async fn build(&self, intent: Intent) -> Result<UserOperationDraft> {
        let run_id = self.runs.fetch_add(1, Ordering::Relaxed);
        let draft = self
            .assemble(intent)
            .instrument(tracing::info_span!("build", run_id))
            .await?;
        Ok(draft.without_nonce_lease())
    }

    /// Builds the operation and drives it to inclusion.
    pub async fn send(&self, intent: Intent) -> Result<Inclusion> {
        let run_id = self.runs.fetch_add(1, Ordering::Relaxed);
        async move {
            let draft = self.assemble(intent).await?;
            self.submitter.submit(draft).await
        }
        .instrument(tracing::info_span!("send", run_id))
        .await
    }

    async fn assemble(&self, intent: Intent) -> Result<UserOperationDraft> {
        tracing::info!(to = ?intent.target, value = %intent.value, "assembling user operation");
        self.assembly.run(UserOperationDraft::new(intent)).await
    }
}
