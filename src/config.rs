use crate::encoding::parse_bytes;
use crate::error::{Error, Result};
use crate::fees::FeePolicy;
use crate::paymaster::DEFAULT_SPONSORSHIP_METHOD;
use crate::submit::RetryPolicy;
use clap::Args;
use ethers::types::{Address, Bytes, U256};
use serde::Deserialize;
use std::{fs, path::Path, str::FromStr, time::Duration};

/// Where the estimation placeholder for `paymasterAndData` comes from.
///
/// The placeholder has to pass the paymaster contract's validation during simulation, so it
/// is specific to each paymaster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DummyPaymaster {
    /// A fixed, known-good payload for the configured paymaster contract.
    Static(Bytes),
    /// Ask the paymaster service for stub data with this JSON-RPC method.
    Stub { method: String },
}

/// Validated runtime configuration. Built once at process start.
#[derive(Debug, Clone)]
pub struct Config {
    pub rpc_url: String,
    pub bundler_url: String,
    pub paymaster_url: String,
    pub policy_id: String,
    pub entry_point: Address,
    pub factory: Address,
    pub salt: U256,
    pub sponsorship_method: String,
    pub dummy_paymaster: DummyPaymaster,
    pub fee_policy: FeePolicy,
    pub retry_policy: RetryPolicy,
    pub request_timeout: Duration,
}

/// Unvalidated configuration, as read from a JSON file or from flags / environment.
///
/// Every field is optional so that a file and the command line can be layered.
#[derive(Debug, Clone, Default, Deserialize, Args)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConfigRaw {
    /// Chain JSON-RPC URL.
    #[arg(long, env = "SPONSORED_USEROP_RPC_URL")]
    pub rpc_url: Option<String>,

    /// Bundler RPC URL (ERC-4337 methods). Defaults to the chain RPC URL.
    #[arg(long, env = "SPONSORED_USEROP_BUNDLER_URL")]
    pub bundler_url: Option<String>,

    /// Paymaster sponsorship service URL.
    #[arg(long, env = "SPONSORED_USEROP_PAYMASTER_URL")]
    pub paymaster_url: Option<String>,

    /// Sponsorship policy id.
    #[arg(long, env = "SPONSORED_USEROP_POLICY_ID")]
    pub policy_id: Option<String>,

    /// EntryPoint address.
    #[arg(long, env = "SPONSORED_USEROP_ENTRYPOINT")]
    pub entry_point: Option<String>,

    /// SimpleAccountFactory address.
    #[arg(long, env = "SPONSORED_USEROP_FACTORY")]
    pub factory: Option<String>,

    /// CREATE2 salt for the smart account.
    #[arg(long)]
    pub salt: Option<u64>,

    /// JSON-RPC method of the sponsorship round.
    #[arg(long, env = "SPONSORED_USEROP_SPONSORSHIP_METHOD")]
    pub sponsorship_method: Option<String>,

    /// Fixed paymasterAndData used for gas estimation.
    #[arg(long, env = "SPONSORED_USEROP_DUMMY_PAYMASTER_AND_DATA")]
    pub dummy_paymaster_and_data: Option<String>,

    /// Fetch the estimation placeholder from the paymaster with this method instead
    /// (e.g. pm_getPaymasterStubData).
    #[arg(long, env = "SPONSORED_USEROP_STUB_METHOD")]
    pub stub_method: Option<String>,

    /// Floor for maxPriorityFeePerGas, in wei.
    #[arg(long)]
    pub min_priority_fee: Option<u64>,

    /// maxPriorityFeePerGas as a percentage of the base fee.
    #[arg(long)]
    pub priority_fee_percentage: Option<u32>,

    /// maxFeePerGas as a percentage of the base fee.
    #[arg(long)]
    pub max_fee_percentage: Option<u32>,

    /// Resubmissions after the first broadcast.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Wait before the first resubmission.
    #[arg(long)]
    pub retry_interval_ms: Option<u64>,

    /// Growth factor of the wait between resubmissions.
    #[arg(long)]
    pub retry_multiplier: Option<f64>,

    /// Minimum fee increase of a replacement, in percent.
    #[arg(long)]
    pub replacement_bump_percentage: Option<u32>,

    /// How long to wait for inclusion before resubmitting. Must be at least 1.
    #[arg(long)]
    pub receipt_timeout_secs: Option<u64>,

    /// Interval between receipt polls.
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Timeout of every individual HTTP request.
    #[arg(long)]
    pub request_timeout_secs: Option<u64>,
}

impl ConfigRaw {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read config at {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            Error::Config(format!("failed to parse config at {}: {e}", path.display()))
        })
    }

    /// Fields set in `overrides` win.
    pub fn overlay(self, overrides: ConfigRaw) -> Self {
        Self {
            rpc_url: overrides.rpc_url.or(self.rpc_url),
            bundler_url: overrides.bundler_url.or(self.bundler_url),
            paymaster_url: overrides.paymaster_url.or(self.paymaster_url),
            policy_id: overrides.policy_id.or(self.policy_id),
            entry_point: overrides.entry_point.or(self.entry_point),
            factory: overrides.factory.or(self.factory),
            salt: overrides.salt.or(self.salt),
            sponsorship_method: overrides.sponsorship_method.or(self.sponsorship_method),
            dummy_paymaster_and_data: overrides
                .dummy_paymaster_and_data
                .or(self.dummy_paymaster_and_data),
            stub_method: overrides.stub_method.or(self.stub_method),
            min_priority_fee: overrides.min_priority_fee.or(self.min_priority_fee),
            priority_fee_percentage: overrides
                .priority_fee_percentage
                .or(self.priority_fee_percentage),
            max_fee_percentage: overrides.max_fee_percentage.or(self.max_fee_percentage),
            max_retries: overrides.max_retries.or(self.max_retries),
            retry_interval_ms: overrides.retry_interval_ms.or(self.retry_interval_ms),
            retry_multiplier: overrides.retry_multiplier.or(self.retry_multiplier),
            replacement_bump_percentage: overrides
                .replacement_bump_percentage
                .or(self.replacement_bump_percentage),
            receipt_timeout_secs: overrides.receipt_timeout_secs.or(self.receipt_timeout_secs),
            poll_interval_ms: overrides.poll_interval_ms.or(self.poll_interval_ms),
            request_timeout_secs: overrides.request_timeout_secs.or(self.request_timeout_secs),
        }
    }

    pub fn validate(self) -> Result<Config> {
        let rpc_url = required(self.rpc_url, "rpcUrl")?;
        let bundler_url = match self.bundler_url {
            Some(url) if !url.trim().is_empty() => url,
            _ => rpc_url.clone(),
        };
        let paymaster_url = required(self.paymaster_url, "paymasterUrl")?;
        let policy_id = required(self.policy_id, "policyId")?;
        let entry_point = parse_addr(&required(self.entry_point, "entryPoint")?, "entryPoint")?;
        let factory = parse_addr(&required(self.factory, "factory")?, "factory")?;

        for url in [&rpc_url, &bundler_url, &paymaster_url] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(Error::Config(format!("not an http(s) URL: {url}")));
            }
        }
        if rpc_url.contains("alchemy.com/v2/") || rpc_url.contains("infura.io/v3/") {
            tracing::warn!("RPC URL looks like it may contain an API key; consider passing it via SPONSORED_USEROP_RPC_URL instead of a committed config file.");
        }

        let dummy_paymaster = match (self.dummy_paymaster_and_data, self.stub_method) {
            (Some(_), Some(_)) => {
                return Err(Error::Config(
                    "dummyPaymasterAndData and stubMethod are mutually exclusive".to_string(),
                ))
            }
            (Some(hex_str), None) => {
                let bytes = parse_bytes(&hex_str)
                    .map_err(|e| Error::Config(format!("invalid dummyPaymasterAndData: {e}")))?;
                if bytes.len() < 20 {
                    return Err(Error::Config(format!(
                        "dummyPaymasterAndData must start with a 20-byte paymaster address, got {} bytes",
                        bytes.len()
                    )));
                }
                DummyPaymaster::Static(bytes)
            }
            (None, Some(method)) => DummyPaymaster::Stub { method },
            (None, None) => {
                return Err(Error::Config(
                    "missing estimation placeholder: set dummyPaymasterAndData or stubMethod"
                        .to_string(),
                ))
            }
        };

        let defaults = FeePolicy::default();
        let fee_policy = FeePolicy::new(
            self.min_priority_fee
                .map(U256::from)
                .unwrap_or(defaults.min_priority_fee),
            self.priority_fee_percentage
                .unwrap_or(defaults.priority_fee_percentage),
            self.max_fee_percentage.unwrap_or(defaults.max_fee_percentage),
        )?;

        let defaults = RetryPolicy::default();
        let retry_policy = RetryPolicy {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            interval: self
                .retry_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.interval),
            multiplier: self.retry_multiplier.unwrap_or(defaults.multiplier),
            replacement_bump_percentage: self
                .replacement_bump_percentage
                .unwrap_or(defaults.replacement_bump_percentage),
            receipt_timeout: self
                .receipt_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.receipt_timeout),
            poll_interval: self
                .poll_interval_ms
                .map(|ms| Duration::from_millis(ms.max(1)))
                .unwrap_or(defaults.poll_interval),
        };
        retry_policy.validate()?;

        Ok(Config {
            rpc_url,
            bundler_url,
            paymaster_url,
            policy_id,
            entry_point,
            factory,
            salt: U256::from(self.salt.unwrap_or(0)),
            sponsorship_method: self
                .sponsorship_method
                .unwrap_or_else(|| DEFAULT_SPONSORSHIP_METHOD.to_string()),
            dummy_paymaster,
            fee_policy,
            retry_policy,
            request_timeout: Duration::from_secs(self.request_timeout_secs.unwrap_or(30).max(1)),
        })
    }
}

/// Loads the optional config file and layers the command-line values on top.
pub fn load_config(path: Option<&Path>, overrides: ConfigRaw) -> Result<Config> {
    let base = match path {
        Some(p) => ConfigRaw::from_file(p)?,
        None => ConfigRaw::default(),
    };
    base.overlay(overrides).validate()
}

fn required(value: Option<String>, name: &str) -> Result<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| Error::Config(format!("missing required option {name}")))
}

fn parse_addr(s: &str, name: &str) -> Result<Address> {
    Address::from_str(s).map_err(|e| Error::Config(format!("invalid {name} address '{s}': {e}")))
}
