use crate::encoding::{fmt_address, fmt_h256, parse_h256, parse_u256_quantity, user_op_to_json};
use crate::error::{Error, Result};
use crate::types::UserOperation;
use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GasEstimates {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserOperationReceipt {
    pub user_op_hash: H256,
    /// Hash of the bundle transaction that included the operation.
    pub transaction_hash: H256,
    /// Whether the operation's call succeeded (the bundle itself was mined either way).
    pub success: bool,
    pub raw: Value,
}

/// ERC-4337 bundler RPC surface used by the pipeline and the submission loop.
#[async_trait]
pub trait Bundler: Send + Sync {
    async fn estimate_user_operation_gas(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<GasEstimates>;

    async fn send_user_operation(&self, op: &UserOperation, entry_point: Address) -> Result<H256>;

    /// `None` while the operation is not yet included.
    async fn get_user_operation_receipt(
        &self,
        user_op_hash: H256,
    ) -> Result<Option<UserOperationReceipt>>;
}

#[derive(Debug)]
enum RpcFailure {
    /// The bundler answered with a JSON-RPC error (or a non-success status).
    Rejected(String),
    /// No usable answer at all.
    Transport(String),
}

#[derive(Debug, Clone)]
pub struct BundlerClient {
    url: String,
    http: reqwest::Client,
}

impl BundlerClient {
    pub fn new(url: String, http: reqwest::Client) -> Self {
        Self { url, http }
    }

    async fn rpc(&self, method: &str, params: Value) -> std::result::Result<Value, RpcFailure> {
        let req = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| RpcFailure::Transport(format!("POST {} failed: {e}", self.url)))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| RpcFailure::Transport(format!("failed to decode JSON: {e}")))?;

        if let Some(err) = body.get("error") {
            return Err(RpcFailure::Rejected(rpc_error_message(err)));
        }

        if !status.is_success() {
            return Err(RpcFailure::Transport(format!("HTTP {}: {}", status, body)));
        }

        body.get("result")
            .cloned()
            .ok_or_else(|| RpcFailure::Transport("missing result field".to_string()))
    }

    fn transport(&self, message: String) -> Error {
        Error::Transport {
            endpoint: self.url.clone(),
            message,
        }
    }
}

#[async_trait]
impl Bundler for BundlerClient {
    async fn estimate_user_operation_gas(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<GasEstimates> {
        let params = serde_json::json!([user_op_to_json(op), fmt_address(entry_point)]);
        let res = match self.rpc("eth_estimateUserOperationGas", params).await {
            Ok(v) => v,
            Err(RpcFailure::Rejected(reason)) => return Err(Error::Estimation(reason)),
            Err(RpcFailure::Transport(message)) => return Err(self.transport(message)),
        };

        Ok(GasEstimates {
            call_gas_limit: parse_u256_field(&res, "callGasLimit")?,
            verification_gas_limit: parse_u256_field(&res, "verificationGasLimit")?,
            pre_verification_gas: parse_u256_field(&res, "preVerificationGas")?,
        })
    }

    async fn send_user_operation(&self, op: &UserOperation, entry_point: Address) -> Result<H256> {
        let params = serde_json::json!([user_op_to_json(op), fmt_address(entry_point)]);
        match self.rpc("eth_sendUserOperation", params).await {
            Ok(res) => parse_userop_hash(&res),
            Err(RpcFailure::Rejected(reason)) => Err(Error::SubmissionRejected(reason)),
            Err(RpcFailure::Transport(message)) => Err(self.transport(message)),
        }
    }

    async fn get_user_operation_receipt(
        &self,
        user_op_hash: H256,
    ) -> Result<Option<UserOperationReceipt>> {
        let params = serde_json::json!([fmt_h256(user_op_hash)]);
        match self.rpc("eth_getUserOperationReceipt", params).await {
            Ok(v) if v.is_null() => Ok(None),
            Ok(v) => parse_receipt(user_op_hash, v).map(Some),
            Err(RpcFailure::Rejected(reason)) => {
                Err(Error::rpc("eth_getUserOperationReceipt", reason))
            }
            Err(RpcFailure::Transport(message)) => Err(self.transport(message)),
        }
    }
}

fn rpc_error_message(err: &Value) -> String {
    err.get("message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| err.to_string())
}

fn parse_u256_field(v: &Value, key: &str) -> Result<U256> {
    let field = v
        .get(key)
        .ok_or_else(|| Error::rpc("eth_estimateUserOperationGas", format!("missing field {key}")))?;
    match field {
        Value::String(s) => parse_u256_quantity(s),
        Value::Number(n) => n
            .as_u64()
            .map(U256::from)
            .ok_or_else(|| Error::rpc("eth_estimateUserOperationGas", format!("invalid {key}"))),
        _ => Err(Error::rpc(
            "eth_estimateUserOperationGas",
            format!("invalid field {key}"),
        )),
    }
}

fn parse_userop_hash(res: &Value) -> Result<H256> {
    // Most bundlers return the userOpHash directly as a JSON string.
    // Some wrap it in an object: { "result": "0x..." }.
    let hash_str = if let Some(s) = res.as_str() {
        s
    } else if let Some(s) = res.get("result").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOpHash").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOperationHash").and_then(|v| v.as_str()) {
        s
    } else {
        return Err(Error::rpc(
            "eth_sendUserOperation",
            format!("unexpected result shape (expected string or {{result: ...}}): {res}"),
        ));
    };

    parse_h256(hash_str)
}

fn parse_receipt(user_op_hash: H256, raw: Value) -> Result<UserOperationReceipt> {
    let tx_hash = raw
        .get("receipt")
        .and_then(|r| r.get("transactionHash"))
        .or_else(|| raw.get("transactionHash"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            Error::rpc(
                "eth_getUserOperationReceipt",
                "receipt without transactionHash",
            )
        })?;
    let transaction_hash = parse_h256(tx_hash)?;
    let success = raw.get("success").and_then(|v| v.as_bool()).unwrap_or(true);

    Ok(UserOperationReceipt {
        user_op_hash,
        transaction_hash,
        success,
        raw,
    })
}
