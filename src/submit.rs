use crate::bundler::{Bundler, UserOperationReceipt};
use crate::error::{Error, Result};
use crate::pipeline::Pipeline;
use crate::stages::RESUBMISSION_CLEARS;
use crate::types::{UserOperation, UserOperationDraft};
use ethers::types::{Address, H256};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// How hard the submission loop tries before giving up.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Resubmissions after the first broadcast.
    pub max_retries: u32,
    /// Wait before the first resubmission.
    pub interval: Duration,
    /// Growth of the wait between resubmissions; 1.0 keeps it constant.
    pub multiplier: f64,
    /// Minimum fee increase of a same-nonce replacement.
    pub replacement_bump_percentage: u32,
    /// Time to wait for a receipt before treating the operation as stuck. Must be positive.
    pub receipt_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            interval: Duration::from_millis(2_000),
            multiplier: 1.5,
            replacement_bump_percentage: 10,
            receipt_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(1_500),
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::Config(format!(
                "retry multiplier must be a finite number >= 1, got {}",
                self.multiplier
            )));
        }
        if self.receipt_timeout.is_zero() {
            return Err(Error::Config("receipt timeout must be positive".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Config("receipt poll interval must be positive".to_string()));
        }
        Ok(())
    }

    /// Wait before resubmission number `attempt` (1-based): `interval * multiplier^(attempt-1)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.interval.as_secs_f64() * self.multiplier.powi(exp);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

/// Lifecycle of one UserOperation from the submitter's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionState {
    Built,
    Signed,
    Broadcast,
    Pending,
    Included,
    Dropped,
}

impl SubmissionState {
    /// Legal transitions. A refused broadcast or a stuck pending operation goes back to
    /// `Signed` once it has been re-quoted and re-signed.
    pub fn can_transition_to(self, next: SubmissionState) -> bool {
        use SubmissionState::*;
        matches!(
            (self, next),
            (Built, Signed)
                | (Signed, Broadcast)
                | (Signed, Signed)
                | (Signed, Dropped)
                | (Broadcast, Pending)
                | (Broadcast, Signed)
                | (Broadcast, Dropped)
                | (Pending, Included)
                | (Pending, Signed)
                | (Pending, Dropped)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SubmissionState::Included | SubmissionState::Dropped)
    }
}

impl fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubmissionState::Built => "built",
            SubmissionState::Signed => "signed",
            SubmissionState::Broadcast => "broadcast",
            SubmissionState::Pending => "pending",
            SubmissionState::Included => "included",
            SubmissionState::Dropped => "dropped",
        };
        f.write_str(s)
    }
}

/// Outcome of a successful submission.
#[derive(Debug, Clone)]
pub struct Inclusion {
    pub user_op_hash: H256,
    pub receipt: UserOperationReceipt,
    /// Broadcasts made, including the one that got included.
    pub attempts: u32,
    /// The operation as it was finally included.
    pub user_operation: UserOperation,
}

/// Broadcasts a signed draft and keeps it alive until it is included or the retry budget
/// runs out. Every resubmission gets fresh fees, a fresh sponsorship and a fresh signature.
///
/// Replacements share a nonce, so any of the hashes broadcast so far may be the one that
/// lands. All of them are watched until the run ends.
pub struct Submitter {
    bundler: Arc<dyn Bundler>,
    entry_point: Address,
    policy: RetryPolicy,
    requote: Pipeline,
}

impl Submitter {
    pub fn new(
        bundler: Arc<dyn Bundler>,
        entry_point: Address,
        policy: RetryPolicy,
        requote: Pipeline,
    ) -> Self {
        Self {
            bundler,
            entry_point,
            policy,
            requote,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// `draft` must be fully resolved and signed. Once the bundler accepts it, the draft's
    /// nonce reservation is committed and stays taken.
    pub async fn submit(&self, draft: UserOperationDraft) -> Result<Inclusion> {
        let mut state = SubmissionState::Signed;
        let mut draft = draft;
        let mut attempt: u32 = 0;
        let mut broadcasts: Vec<(H256, UserOperation)> = Vec::new();

        loop {
            let op = draft.finalize()?;
            attempt += 1;

            let outcome = match self
                .broadcast_and_wait(&draft, op, &mut broadcasts, &mut state)
                .await
            {
                Err(e) if e.is_retryable() => match self.poll_once(&broadcasts).await {
                    // an earlier broadcast landed while this one was failing
                    Some(found) => Ok(found),
                    None => Err(e),
                },
                other => other,
            };

            match outcome {
                Ok((index, receipt)) => {
                    transition(&mut state, SubmissionState::Included);
                    let (user_op_hash, op) = broadcasts.swap_remove(index);
                    tracing::info!(
                        ?user_op_hash,
                        transaction_hash = ?receipt.transaction_hash,
                        success = receipt.success,
                        attempts = attempt,
                        "user operation included"
                    );
                    return Ok(Inclusion {
                        user_op_hash,
                        receipt,
                        attempts: attempt,
                        user_operation: op,
                    });
                }
                Err(e) if e.is_retryable() && attempt <= self.policy.max_retries => {
                    let delay = self.policy.backoff(attempt);
                    tracing::warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "submission failed; will re-quote and resubmit");
                    sleep(delay).await;

                    draft = match self.requote(draft).await {
                        Ok(d) => d,
                        Err(e) => {
                            transition(&mut state, SubmissionState::Dropped);
                            return Err(e);
                        }
                    };
                    transition(&mut state, SubmissionState::Signed);
                }
                Err(e) if e.is_retryable() => {
                    transition(&mut state, SubmissionState::Dropped);
                    tracing::error!(attempts = attempt, error = %e, "giving up on user operation");
                    return Err(Error::RetriesExhausted {
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }
                Err(e) => {
                    transition(&mut state, SubmissionState::Dropped);
                    return Err(e);
                }
            }
        }
    }

    /// Sends `op` and waits until one of `broadcasts` (which then includes `op`) is mined.
    /// Returns the index of the mined entry.
    async fn broadcast_and_wait(
        &self,
        draft: &UserOperationDraft,
        op: UserOperation,
        broadcasts: &mut Vec<(H256, UserOperation)>,
        state: &mut SubmissionState,
    ) -> Result<(usize, UserOperationReceipt)> {
        let user_op_hash = self.bundler.send_user_operation(&op, self.entry_point).await?;
        if let Some(lease) = draft.nonce_lease() {
            lease.commit();
        }
        transition(state, SubmissionState::Broadcast);
        tracing::info!(?user_op_hash, nonce = %op.nonce, max_fee_per_gas = %op.max_fee_per_gas, "user operation sent to bundler");
        broadcasts.push((user_op_hash, op));

        transition(state, SubmissionState::Pending);
        self.wait_for_receipt(broadcasts, user_op_hash).await
    }

    async fn wait_for_receipt(
        &self,
        broadcasts: &[(H256, UserOperation)],
        latest: H256,
    ) -> Result<(usize, UserOperationReceipt)> {
        let start = Instant::now();
        loop {
            if let Some(found) = self.poll_once(broadcasts).await {
                return Ok(found);
            }
            if start.elapsed() >= self.policy.receipt_timeout {
                return Err(Error::ReceiptTimeout {
                    user_op_hash: latest,
                    timeout: self.policy.receipt_timeout,
                });
            }
            sleep(self.policy.poll_interval).await;
        }
    }

    /// Checks every broadcast hash once, newest first.
    async fn poll_once(
        &self,
        broadcasts: &[(H256, UserOperation)],
    ) -> Option<(usize, UserOperationReceipt)> {
        for (index, (user_op_hash, _)) in broadcasts.iter().enumerate().rev() {
            match self.bundler.get_user_operation_receipt(*user_op_hash).await {
                Ok(Some(receipt)) => return Some((index, receipt)),
                Ok(None) => {}
                Err(e) => tracing::warn!(?user_op_hash, error = %e, "receipt poll failed"),
            }
        }
        None
    }

    async fn requote(&self, draft: UserOperationDraft) -> Result<UserOperationDraft> {
        let previous = draft.finalize()?.fees();
        let draft = draft.clear(RESUBMISSION_CLEARS).with_fee_floor(previous);
        self.requote.run(draft).await
    }
}

fn transition(state: &mut SubmissionState, next: SubmissionState) {
    if !state.can_transition_to(next) {
        tracing::debug!(from = %state, to = %next, "unexpected submission state transition");
    }
    tracing::trace!(from = %state, to = %next, "submission state");
    *state = next;
}
