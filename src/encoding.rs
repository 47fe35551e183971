use crate::error::{Error, Result};
use crate::types::{PaymasterAndData, UserOperation, UserOperationDraft};
use ethers::types::{Address, Bytes, H256, U256};
use serde_json::{Map, Value};

pub fn fmt_address(addr: Address) -> String {
    format!("0x{}", hex::encode(addr.as_bytes()))
}

pub fn fmt_h256(h: H256) -> String {
    format!("0x{}", hex::encode(h.as_bytes()))
}

/// JSON-RPC "quantity" encoding.
pub fn fmt_u256(v: U256) -> String {
    if v.is_zero() {
        "0x0".to_string()
    } else {
        format!("0x{:x}", v)
    }
}

pub fn fmt_bytes(b: &Bytes) -> String {
    format!("0x{}", hex::encode(b.as_ref()))
}

pub fn user_op_to_json(op: &UserOperation) -> Value {
    serde_json::json!({
        "sender": fmt_address(op.sender),
        "nonce": fmt_u256(op.nonce),
        "initCode": fmt_bytes(&op.init_code),
        "callData": fmt_bytes(&op.call_data),
        "callGasLimit": fmt_u256(op.call_gas_limit),
        "verificationGasLimit": fmt_u256(op.verification_gas_limit),
        "preVerificationGas": fmt_u256(op.pre_verification_gas),
        "maxFeePerGas": fmt_u256(op.max_fee_per_gas),
        "maxPriorityFeePerGas": fmt_u256(op.max_priority_fee_per_gas),
        "paymasterAndData": fmt_bytes(&op.paymaster_and_data),
        "signature": fmt_bytes(&op.signature),
    })
}

/// Hexlifies the resolved part of a draft for the paymaster.
///
/// Pending fields are omitted. A stub `paymasterAndData` is rendered as `0x`: the sponsor
/// must never see the estimation placeholder. Until the draft is signed, the account's dummy
/// signature stands in for `signature`.
pub fn draft_to_json(draft: &UserOperationDraft) -> Value {
    let mut obj = Map::new();
    let mut put = |key: &str, value: Option<String>| {
        if let Some(v) = value {
            obj.insert(key.to_string(), Value::String(v));
        }
    };

    put("sender", draft.sender().map(fmt_address));
    put("nonce", draft.nonce().map(fmt_u256));
    put("initCode", draft.init_code().map(fmt_bytes));
    put("callData", draft.call_data().map(fmt_bytes));
    put("callGasLimit", draft.call_gas_limit().map(fmt_u256));
    put(
        "verificationGasLimit",
        draft.verification_gas_limit().map(fmt_u256),
    );
    put("preVerificationGas", draft.pre_verification_gas().map(fmt_u256));
    put("maxFeePerGas", draft.max_fee_per_gas().map(fmt_u256));
    put(
        "maxPriorityFeePerGas",
        draft.max_priority_fee_per_gas().map(fmt_u256),
    );
    put(
        "paymasterAndData",
        Some(match draft.paymaster_and_data() {
            PaymasterAndData::Sponsored(b) => fmt_bytes(b),
            PaymasterAndData::Stub(_) | PaymasterAndData::Pending => "0x".to_string(),
        }),
    );
    put(
        "signature",
        draft
            .signature()
            .or_else(|| draft.dummy_signature())
            .map(fmt_bytes),
    );

    Value::Object(obj)
}

pub fn parse_u256_quantity(s: &str) -> Result<U256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return Ok(U256::zero());
    }
    U256::from_str_radix(s, 16).map_err(|e| Error::Config(format!("invalid quantity 0x{s}: {e}")))
}

/// Parses `0x`-prefixed hex bytes. Odd-length input is left-padded (`0x0` is one zero byte).
pub fn parse_bytes(s: &str) -> Result<Bytes> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let decoded = if s.len() % 2 == 1 {
        hex::decode(format!("0{s}"))
    } else {
        hex::decode(s)
    };
    decoded
        .map(Bytes::from)
        .map_err(|e| Error::Config(format!("invalid hex 0x{s}: {e}")))
}

pub fn parse_h256(s: &str) -> Result<H256> {
    let bytes = parse_bytes(s)?;
    if bytes.len() != 32 {
        return Err(Error::Config(format!(
            "expected 32-byte hex, got {} bytes",
            bytes.len()
        )));
    }
    Ok(H256::from_slice(bytes.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FieldValue, Intent};

    fn draft() -> UserOperationDraft {
        UserOperationDraft::new(Intent {
            target: Address::repeat_byte(0x22),
            data: Bytes::default(),
            value: U256::zero(),
        })
        .with(FieldValue::Sender(Address::repeat_byte(0xab)))
        .with(FieldValue::Nonce(U256::from(255)))
        .with(FieldValue::InitCode(Bytes::default()))
        .with(FieldValue::CallData(Bytes::from(vec![0xde, 0xad])))
        .with_dummy_signature(Bytes::from(vec![0xff; 2]))
    }

    #[test]
    fn quantities_are_minimal_lowercase_hex() {
        assert_eq!(fmt_u256(U256::zero()), "0x0");
        assert_eq!(fmt_u256(U256::from(255)), "0xff");
        assert_eq!(fmt_u256(U256::from(1_000_000_000u64)), "0x3b9aca00");
    }

    #[test]
    fn draft_json_omits_pending_fields() {
        let v = draft_to_json(&draft());
        assert_eq!(v["sender"], format!("0x{}", "ab".repeat(20)));
        assert_eq!(v["nonce"], "0xff");
        assert_eq!(v["callData"], "0xdead");
        assert_eq!(v["signature"], "0xffff");
        assert!(v.get("callGasLimit").is_none());
        assert!(v.get("maxFeePerGas").is_none());
    }

    #[test]
    fn draft_json_never_contains_stub() {
        let d = draft().with(FieldValue::StubPaymasterAndData(Bytes::from(vec![0x7a; 20])));
        assert_eq!(draft_to_json(&d)["paymasterAndData"], "0x");

        let d = d.with(FieldValue::PaymasterAndData(Bytes::from(vec![0xaa; 3])));
        assert_eq!(draft_to_json(&d)["paymasterAndData"], "0xaaaaaa");
    }

    #[test]
    fn parse_bytes_accepts_odd_length() {
        assert_eq!(parse_bytes("0x0").unwrap(), Bytes::from(vec![0u8]));
        assert_eq!(parse_bytes("0x").unwrap(), Bytes::default());
        assert_eq!(parse_bytes("0xabc").unwrap(), Bytes::from(vec![0x0a, 0xbc]));
        assert!(parse_bytes("0xzz").is_err());
    }

    #[test]
    fn parse_h256_checks_length() {
        let h = format!("0x{}", "11".repeat(32));
        assert_eq!(parse_h256(&h).unwrap(), H256::repeat_byte(0x11));
        assert!(parse_h256("0x1234").is_err());
    }
}
