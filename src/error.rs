use crate::types::FieldSet;
use ethers::types::H256;
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can stop a UserOperation from being built, sponsored or included.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or missing configuration. Raised before any network call.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The paymaster endpoint answered with a non-success HTTP status.
    #[error("paymaster request {request_id} failed with HTTP status {status}")]
    PaymasterHttp { status: u16, request_id: u64 },

    /// The paymaster answered, but not with a usable JSON-RPC result.
    #[error("paymaster request {request_id} returned a malformed response: {reason}")]
    PaymasterProtocol { request_id: u64, reason: String },

    /// Bundler simulation of the operation failed (usually a revert).
    #[error("gas estimation failed: {0}")]
    Estimation(String),

    /// The bundler refused the signed operation (fee too low, stale nonce, ...).
    #[error("bundler rejected user operation: {0}")]
    SubmissionRejected(String),

    #[error("user operation {user_op_hash:?} not included within {timeout:?}")]
    ReceiptTimeout { user_op_hash: H256, timeout: Duration },

    /// Terminal: every submission attempt failed.
    #[error("user operation dropped after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("signing failed: {0}")]
    Signing(String),

    /// A pipeline stage ran without its inputs, or did not produce its outputs.
    #[error("stage `{stage}` contract violated: missing {missing}")]
    StageContract { stage: &'static str, missing: FieldSet },

    /// Chain or bundler JSON-RPC failure outside of estimation and submission.
    #[error("{context}: {message}")]
    Rpc { context: String, message: String },

    /// The HTTP request itself failed (connect, timeout, body decode).
    #[error("request to {endpoint} failed: {message}")]
    Transport { endpoint: String, message: String },
}

impl Error {
    pub(crate) fn rpc(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Rpc {
            context: context.into(),
            message: err.to_string(),
        }
    }

    /// Errors the submission loop answers with a fee bump and a resend.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SubmissionRejected(_) | Self::ReceiptTimeout { .. } | Self::Transport { .. }
        )
    }
}
