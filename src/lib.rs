//! Build, sponsor and submit ERC-4337 (v0.6) UserOperations.
//!
//! An [`Intent`] runs through a contract-checked [`Pipeline`] of stages that fill in the
//! operation field by field, get it sponsored by a paymaster service and sign it. The
//! [`Submitter`] then keeps the operation alive until inclusion, re-quoting fees and
//! re-sponsoring on every resubmission.

pub mod account;
pub mod bundler;
pub mod config;
pub mod encoding;
pub mod error;
pub mod fees;
pub mod nonce;
pub mod paymaster;
pub mod pipeline;
pub mod sender;
pub mod stages;
pub mod submit;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::{load_config, Config, ConfigRaw, DummyPaymaster};
pub use error::{Error, Result};
pub use pipeline::{Pipeline, Stage};
pub use sender::UserOpSender;
pub use submit::{Inclusion, RetryPolicy, Submitter};
pub use types::{Intent, UserOperation, UserOperationDraft};
