use crate::encoding::{self, fmt_address};
use crate::error::{Error, Result};
use crate::types::UserOperationDraft;
use async_trait::async_trait;
use ethers::types::{Address, Bytes, U256};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Default JSON-RPC method of the sponsorship round.
pub const DEFAULT_SPONSORSHIP_METHOD: &str = "zan_requestPaymasterAndData";

/// Produces JSON-RPC request ids. Ids must never repeat within a process.
pub trait IdSource: Send + Sync {
    fn next_id(&self) -> u64;
}

/// Wall-clock milliseconds, bumped when two requests land in the same millisecond.
#[derive(Debug, Default)]
pub struct ClockIds {
    last: AtomicU64,
}

impl IdSource for ClockIds {
    fn next_id(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0))
            .as_millis() as u64;
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Counts up from a fixed start; deterministic ids for tests and replays.
#[derive(Debug)]
pub struct SequentialIds(AtomicU64);

impl SequentialIds {
    pub fn starting_at(start: u64) -> Self {
        Self(AtomicU64::new(start))
    }
}

impl IdSource for SequentialIds {
    fn next_id(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Gas and fee values a paymaster is willing to sponsor. Present fields override the
/// draft's own estimates.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GasOverrides {
    pub call_gas_limit: Option<U256>,
    pub verification_gas_limit: Option<U256>,
    pub pre_verification_gas: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
}

impl GasOverrides {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sponsorship {
    pub request_id: u64,
    pub paymaster_and_data: Bytes,
    pub overrides: GasOverrides,
}

/// The off-chain side of a paymaster.
#[async_trait]
pub trait Sponsor: Send + Sync {
    /// Final sponsorship for a draft whose gas and fee fields are settled.
    async fn request_sponsorship(
        &self,
        draft: &UserOperationDraft,
        policy_id: &str,
        entry_point: Address,
    ) -> Result<Sponsorship>;

    /// Placeholder `paymasterAndData` good enough for simulation.
    async fn request_stub(
        &self,
        draft: &UserOperationDraft,
        policy_id: &str,
        entry_point: Address,
        method: &str,
    ) -> Result<Bytes>;
}

/// JSON-RPC client for a paymaster sponsorship service.
#[derive(Clone)]
pub struct PaymasterClient {
    url: String,
    method: String,
    http: reqwest::Client,
    ids: Arc<dyn IdSource>,
}

impl PaymasterClient {
    pub fn new(url: String, method: String, http: reqwest::Client, ids: Arc<dyn IdSource>) -> Self {
        Self {
            url,
            method,
            http,
            ids,
        }
    }

    async fn rpc(
        &self,
        method: &str,
        draft: &UserOperationDraft,
        policy_id: &str,
        entry_point: Address,
    ) -> Result<(u64, Value)> {
        let id = self.ids.next_id();
        let req = build_request(id, method, draft, policy_id, entry_point);
        tracing::debug!(request_id = id, %method, request = %req, "paymaster request");

        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| Error::Transport {
                endpoint: self.url.clone(),
                message: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            tracing::warn!(request_id = id, status = status.as_u16(), "paymaster HTTP error");
            return Err(Error::PaymasterHttp {
                status: status.as_u16(),
                request_id: id,
            });
        }

        let body: Value = resp.json().await.map_err(|e| Error::PaymasterProtocol {
            request_id: id,
            reason: format!("failed to decode JSON: {e}"),
        })?;
        tracing::debug!(request_id = id, response = %body, "paymaster response");

        if let Some(err) = body.get("error") {
            return Err(Error::PaymasterProtocol {
                request_id: id,
                reason: format!("RPC error: {err}"),
            });
        }

        let result = body.get("result").cloned().ok_or_else(|| Error::PaymasterProtocol {
            request_id: id,
            reason: "missing result field".to_string(),
        })?;
        Ok((id, result))
    }
}

#[async_trait]
impl Sponsor for PaymasterClient {
    async fn request_sponsorship(
        &self,
        draft: &UserOperationDraft,
        policy_id: &str,
        entry_point: Address,
    ) -> Result<Sponsorship> {
        let (id, result) = self.rpc(&self.method, draft, policy_id, entry_point).await?;
        let sponsorship = parse_sponsorship(id, &result)?;
        tracing::info!(
            request_id = id,
            paymaster_and_data = %encoding::fmt_bytes(&sponsorship.paymaster_and_data),
            overrides = !sponsorship.overrides.is_empty(),
            "paymaster sponsored user operation"
        );
        Ok(sponsorship)
    }

    async fn request_stub(
        &self,
        draft: &UserOperationDraft,
        policy_id: &str,
        entry_point: Address,
        method: &str,
    ) -> Result<Bytes> {
        let (id, result) = self.rpc(method, draft, policy_id, entry_point).await?;
        parse_paymaster_and_data(id, &result)
    }
}

fn build_request(
    id: u64,
    method: &str,
    draft: &UserOperationDraft,
    policy_id: &str,
    entry_point: Address,
) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": {
            "policyId": policy_id,
            "entryPoint": fmt_address(entry_point),
            "userOperation": encoding::draft_to_json(draft),
        },
        "id": id,
    })
}

fn parse_paymaster_and_data(request_id: u64, result: &Value) -> Result<Bytes> {
    let s = result
        .get("paymasterAndData")
        .and_then(|x| x.as_str())
        .ok_or_else(|| Error::PaymasterProtocol {
            request_id,
            reason: "missing result.paymasterAndData".to_string(),
        })?;
    encoding::parse_bytes(s).map_err(|e| Error::PaymasterProtocol {
        request_id,
        reason: format!("invalid hex in paymasterAndData: {e}"),
    })
}

fn parse_sponsorship(request_id: u64, result: &Value) -> Result<Sponsorship> {
    let paymaster_and_data = parse_paymaster_and_data(request_id, result)?;

    let field = |key: &str| -> Result<Option<U256>> {
        match result.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => encoding::parse_u256_quantity(s).map(Some).map_err(|e| {
                Error::PaymasterProtocol {
                    request_id,
                    reason: format!("invalid {key}: {e}"),
                }
            }),
            Some(Value::Number(n)) => n.as_u64().map(|v| Some(U256::from(v))).ok_or_else(|| {
                Error::PaymasterProtocol {
                    request_id,
                    reason: format!("invalid {key}: {n}"),
                }
            }),
            Some(other) => Err(Error::PaymasterProtocol {
                request_id,
                reason: format!("invalid {key}: {other}"),
            }),
        }
    };

    Ok(Sponsorship {
        request_id,
        paymaster_and_data,
        overrides: GasOverrides {
            call_gas_limit: field("callGasLimit")?,
            verification_gas_limit: field("verificationGasLimit")?,
            pre_verification_gas: field("preVerificationGas")?,
            max_fee_per_gas: field("maxFeePerGas")?,
            max_priority_fee_per_gas: field("maxPriorityFeePerGas")?,
        },
    })
}
