use crate::error::{Error, Result};
use crate::nonce::NonceLease;
use ethers::types::{Address, Bytes, U256};
use std::fmt;

/// What the caller wants the smart account to do: one call to `target`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Intent {
    pub target: Address,
    pub data: Bytes,
    pub value: U256,
}

/// ERC-4337 UserOperation (EntryPoint v0.6 layout).
///
/// Note: EntryPoint v0.7 uses a *different* packed struct layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

impl UserOperation {
    /// Returns a tuple matching the Solidity struct layout, suitable for
    /// calling `EntryPoint.getUserOpHash((...))`.
    pub fn as_abi_tuple(
        &self,
    ) -> (
        Address,
        U256,
        Bytes,
        Bytes,
        U256,
        U256,
        U256,
        U256,
        U256,
        Bytes,
        Bytes,
    ) {
        (
            self.sender,
            self.nonce,
            self.init_code.clone(),
            self.call_data.clone(),
            self.call_gas_limit,
            self.verification_gas_limit,
            self.pre_verification_gas,
            self.max_fee_per_gas,
            self.max_priority_fee_per_gas,
            self.paymaster_and_data.clone(),
            self.signature.clone(),
        )
    }

    pub fn fees(&self) -> FeeQuote {
        FeeQuote {
            max_fee_per_gas: self.max_fee_per_gas,
            max_priority_fee_per_gas: self.max_priority_fee_per_gas,
        }
    }
}

/// A pair of EIP-1559 fee caps for a UserOperation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeeQuote {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

/// Names of the resolvable UserOperation fields.
///
/// `StubPaymasterAndData` and `PaymasterAndData` are two distinct resolution states of the
/// same wire field: the inert placeholder used for estimation and the sponsor-issued value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Field {
    Sender,
    Nonce,
    InitCode,
    CallData,
    CallGasLimit,
    VerificationGasLimit,
    PreVerificationGas,
    MaxFeePerGas,
    MaxPriorityFeePerGas,
    StubPaymasterAndData,
    PaymasterAndData,
    Signature,
}

impl Field {
    pub const ALL: [Field; 12] = [
        Field::Sender,
        Field::Nonce,
        Field::InitCode,
        Field::CallData,
        Field::CallGasLimit,
        Field::VerificationGasLimit,
        Field::PreVerificationGas,
        Field::MaxFeePerGas,
        Field::MaxPriorityFeePerGas,
        Field::StubPaymasterAndData,
        Field::PaymasterAndData,
        Field::Signature,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Field::Sender => "sender",
            Field::Nonce => "nonce",
            Field::InitCode => "initCode",
            Field::CallData => "callData",
            Field::CallGasLimit => "callGasLimit",
            Field::VerificationGasLimit => "verificationGasLimit",
            Field::PreVerificationGas => "preVerificationGas",
            Field::MaxFeePerGas => "maxFeePerGas",
            Field::MaxPriorityFeePerGas => "maxPriorityFeePerGas",
            Field::StubPaymasterAndData => "paymasterAndData(stub)",
            Field::PaymasterAndData => "paymasterAndData",
            Field::Signature => "signature",
        }
    }

    const fn bit(self) -> u16 {
        1 << self as u16
    }
}

/// A set of [`Field`]s, used for stage contracts and draft resolution status.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FieldSet(u16);

impl FieldSet {
    pub const EMPTY: FieldSet = FieldSet(0);

    pub const BASE: FieldSet = FieldSet::of(&[
        Field::Sender,
        Field::Nonce,
        Field::InitCode,
        Field::CallData,
    ]);

    pub const GAS: FieldSet = FieldSet::of(&[
        Field::CallGasLimit,
        Field::VerificationGasLimit,
        Field::PreVerificationGas,
    ]);

    pub const FEES: FieldSet = FieldSet::of(&[Field::MaxFeePerGas, Field::MaxPriorityFeePerGas]);

    /// Every field a signed, broadcastable operation needs.
    pub const FINAL: FieldSet = FieldSet::BASE
        .union(FieldSet::GAS)
        .union(FieldSet::FEES)
        .union(FieldSet::of(&[Field::PaymasterAndData, Field::Signature]));

    pub const fn of(fields: &[Field]) -> FieldSet {
        let mut bits = 0;
        let mut i = 0;
        while i < fields.len() {
            bits |= fields[i].bit();
            i += 1;
        }
        FieldSet(bits)
    }

    pub const fn union(self, other: FieldSet) -> FieldSet {
        FieldSet(self.0 | other.0)
    }

    pub const fn difference(self, other: FieldSet) -> FieldSet {
        FieldSet(self.0 & !other.0)
    }

    pub const fn contains(self, field: Field) -> bool {
        self.0 & field.bit() != 0
    }

    pub const fn is_superset(self, other: FieldSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn with(self, field: Field) -> FieldSet {
        FieldSet(self.0 | field.bit())
    }

    pub fn iter(self) -> impl Iterator<Item = Field> {
        Field::ALL.into_iter().filter(move |f| self.contains(*f))
    }
}

impl fmt::Display for FieldSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(Field::name).collect();
        write!(f, "{{{}}}", names.join(", "))
    }
}

impl fmt::Debug for FieldSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A value for one field of a [`UserOperationDraft`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldValue {
    Sender(Address),
    Nonce(U256),
    InitCode(Bytes),
    CallData(Bytes),
    CallGasLimit(U256),
    VerificationGasLimit(U256),
    PreVerificationGas(U256),
    MaxFeePerGas(U256),
    MaxPriorityFeePerGas(U256),
    StubPaymasterAndData(Bytes),
    PaymasterAndData(Bytes),
    Signature(Bytes),
}

impl FieldValue {
    pub fn field(&self) -> Field {
        match self {
            FieldValue::Sender(_) => Field::Sender,
            FieldValue::Nonce(_) => Field::Nonce,
            FieldValue::InitCode(_) => Field::InitCode,
            FieldValue::CallData(_) => Field::CallData,
            FieldValue::CallGasLimit(_) => Field::CallGasLimit,
            FieldValue::VerificationGasLimit(_) => Field::VerificationGasLimit,
            FieldValue::PreVerificationGas(_) => Field::PreVerificationGas,
            FieldValue::MaxFeePerGas(_) => Field::MaxFeePerGas,
            FieldValue::MaxPriorityFeePerGas(_) => Field::MaxPriorityFeePerGas,
            FieldValue::StubPaymasterAndData(_) => Field::StubPaymasterAndData,
            FieldValue::PaymasterAndData(_) => Field::PaymasterAndData,
            FieldValue::Signature(_) => Field::Signature,
        }
    }
}

/// State of the `paymasterAndData` wire field.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum PaymasterAndData {
    #[default]
    Pending,
    /// Inert placeholder, only good for simulation.
    Stub(Bytes),
    /// Issued by the paymaster for exactly this operation.
    Sponsored(Bytes),
}

/// A UserOperation under construction.
///
/// Every field starts pending and is filled in by exactly one pipeline stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserOperationDraft {
    intent: Intent,
    sender: Option<Address>,
    nonce: Option<U256>,
    init_code: Option<Bytes>,
    call_data: Option<Bytes>,
    call_gas_limit: Option<U256>,
    verification_gas_limit: Option<U256>,
    pre_verification_gas: Option<U256>,
    max_fee_per_gas: Option<U256>,
    max_priority_fee_per_gas: Option<U256>,
    paymaster_and_data: PaymasterAndData,
    signature: Option<Bytes>,
    /// Signature-shaped placeholder the account accepts during simulation.
    dummy_signature: Option<Bytes>,
    /// Lower bound for re-quoted fees when replacing an already broadcast operation.
    fee_floor: Option<FeeQuote>,
    /// Reservation backing `nonce`; dropping the draft gives the nonce back.
    nonce_lease: Option<NonceLease>,
}

impl UserOperationDraft {
    pub fn new(intent: Intent) -> Self {
        Self {
            intent,
            sender: None,
            nonce: None,
            init_code: None,
            call_data: None,
            call_gas_limit: None,
            verification_gas_limit: None,
            pre_verification_gas: None,
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
            paymaster_and_data: PaymasterAndData::Pending,
            signature: None,
            dummy_signature: None,
            fee_floor: None,
            nonce_lease: None,
        }
    }

    /// Sets one field. A sponsored `paymasterAndData` replaces the stub.
    pub fn with(mut self, value: FieldValue) -> Self {
        match value {
            FieldValue::Sender(v) => self.sender = Some(v),
            FieldValue::Nonce(v) => {
                if self.nonce_lease.as_ref().map(|l| l.nonce()) != Some(v) {
                    self.nonce_lease = None;
                }
                self.nonce = Some(v)
            }
            FieldValue::InitCode(v) => self.init_code = Some(v),
            FieldValue::CallData(v) => self.call_data = Some(v),
            FieldValue::CallGasLimit(v) => self.call_gas_limit = Some(v),
            FieldValue::VerificationGasLimit(v) => self.verification_gas_limit = Some(v),
            FieldValue::PreVerificationGas(v) => self.pre_verification_gas = Some(v),
            FieldValue::MaxFeePerGas(v) => self.max_fee_per_gas = Some(v),
            FieldValue::MaxPriorityFeePerGas(v) => self.max_priority_fee_per_gas = Some(v),
            FieldValue::StubPaymasterAndData(v) => {
                self.paymaster_and_data = PaymasterAndData::Stub(v)
            }
            FieldValue::PaymasterAndData(v) => {
                self.paymaster_and_data = PaymasterAndData::Sponsored(v)
            }
            FieldValue::Signature(v) => self.signature = Some(v),
        }
        self
    }

    pub fn with_dummy_signature(mut self, signature: Bytes) -> Self {
        self.dummy_signature = Some(signature);
        self
    }

    pub fn with_fee_floor(mut self, floor: FeeQuote) -> Self {
        self.fee_floor = Some(floor);
        self
    }

    /// Sets the nonce from a reservation the draft keeps alive.
    pub fn with_nonce_lease(mut self, lease: NonceLease) -> Self {
        self.nonce = Some(lease.nonce());
        self.nonce_lease = Some(lease);
        self
    }

    /// Drops the reservation behind the nonce, keeping the value.
    pub fn without_nonce_lease(mut self) -> Self {
        self.nonce_lease = None;
        self
    }

    /// Returns the given fields to the pending state.
    ///
    /// Clearing `PaymasterAndData` or `StubPaymasterAndData` clears whichever value is held.
    pub fn clear(mut self, fields: FieldSet) -> Self {
        for field in fields.iter() {
            match field {
                Field::Sender => self.sender = None,
                Field::Nonce => {
                    self.nonce = None;
                    self.nonce_lease = None;
                }
                Field::InitCode => self.init_code = None,
                Field::CallData => self.call_data = None,
                Field::CallGasLimit => self.call_gas_limit = None,
                Field::VerificationGasLimit => self.verification_gas_limit = None,
                Field::PreVerificationGas => self.pre_verification_gas = None,
                Field::MaxFeePerGas => self.max_fee_per_gas = None,
                Field::MaxPriorityFeePerGas => self.max_priority_fee_per_gas = None,
                Field::StubPaymasterAndData | Field::PaymasterAndData => {
                    self.paymaster_and_data = PaymasterAndData::Pending
                }
                Field::Signature => self.signature = None,
            }
        }
        self
    }

    /// Fields currently holding a value.
    pub fn resolved(&self) -> FieldSet {
        let mut set = FieldSet::EMPTY;
        let present = [
            (Field::Sender, self.sender.is_some()),
            (Field::Nonce, self.nonce.is_some()),
            (Field::InitCode, self.init_code.is_some()),
            (Field::CallData, self.call_data.is_some()),
            (Field::CallGasLimit, self.call_gas_limit.is_some()),
            (Field::VerificationGasLimit, self.verification_gas_limit.is_some()),
            (Field::PreVerificationGas, self.pre_verification_gas.is_some()),
            (Field::MaxFeePerGas, self.max_fee_per_gas.is_some()),
            (Field::MaxPriorityFeePerGas, self.max_priority_fee_per_gas.is_some()),
            (
                Field::StubPaymasterAndData,
                matches!(self.paymaster_and_data, PaymasterAndData::Stub(_)),
            ),
            (
                Field::PaymasterAndData,
                matches!(self.paymaster_and_data, PaymasterAndData::Sponsored(_)),
            ),
            (Field::Signature, self.signature.is_some()),
        ];
        for (field, is_set) in present {
            if is_set {
                set = set.with(field);
            }
        }
        set
    }

    pub fn intent(&self) -> &Intent {
        &self.intent
    }

    pub fn sender(&self) -> Option<Address> {
        self.sender
    }

    pub fn nonce(&self) -> Option<U256> {
        self.nonce
    }

    pub fn init_code(&self) -> Option<&Bytes> {
        self.init_code.as_ref()
    }

    pub fn call_data(&self) -> Option<&Bytes> {
        self.call_data.as_ref()
    }

    pub fn call_gas_limit(&self) -> Option<U256> {
        self.call_gas_limit
    }

    pub fn verification_gas_limit(&self) -> Option<U256> {
        self.verification_gas_limit
    }

    pub fn pre_verification_gas(&self) -> Option<U256> {
        self.pre_verification_gas
    }

    pub fn max_fee_per_gas(&self) -> Option<U256> {
        self.max_fee_per_gas
    }

    pub fn max_priority_fee_per_gas(&self) -> Option<U256> {
        self.max_priority_fee_per_gas
    }

    pub fn paymaster_and_data(&self) -> &PaymasterAndData {
        &self.paymaster_and_data
    }

    pub fn signature(&self) -> Option<&Bytes> {
        self.signature.as_ref()
    }

    pub fn dummy_signature(&self) -> Option<&Bytes> {
        self.dummy_signature.as_ref()
    }

    pub fn fee_floor(&self) -> Option<FeeQuote> {
        self.fee_floor
    }

    pub fn nonce_lease(&self) -> Option<&NonceLease> {
        self.nonce_lease.as_ref()
    }

    /// The operation the bundler simulates: stub paymaster data, the account's dummy
    /// signature, and zero for gas and fee fields not yet known.
    pub fn estimation_view(&self) -> Result<UserOperation> {
        let stub = match &self.paymaster_and_data {
            PaymasterAndData::Stub(b) => b.clone(),
            _ => {
                return Err(Error::StageContract {
                    stage: "estimation view",
                    missing: FieldSet::of(&[Field::StubPaymasterAndData]),
                })
            }
        };
        let missing = FieldSet::BASE.difference(self.resolved());
        if !missing.is_empty() {
            return Err(Error::StageContract {
                stage: "estimation view",
                missing,
            });
        }
        Ok(UserOperation {
            sender: self.sender.unwrap_or_default(),
            nonce: self.nonce.unwrap_or_default(),
            init_code: self.init_code.clone().unwrap_or_default(),
            call_data: self.call_data.clone().unwrap_or_default(),
            call_gas_limit: self.call_gas_limit.unwrap_or_default(),
            verification_gas_limit: self.verification_gas_limit.unwrap_or_default(),
            pre_verification_gas: self.pre_verification_gas.unwrap_or_default(),
            max_fee_per_gas: self.max_fee_per_gas.unwrap_or_default(),
            max_priority_fee_per_gas: self.max_priority_fee_per_gas.unwrap_or_default(),
            paymaster_and_data: stub,
            signature: self.dummy_signature.clone().unwrap_or_default(),
        })
    }

    /// The fully resolved operation minus its signature: what gets signed.
    pub fn unsigned(&self) -> Result<UserOperation> {
        let required = FieldSet::FINAL.difference(FieldSet::of(&[Field::Signature]));
        let missing = required.difference(self.resolved());
        if !missing.is_empty() {
            return Err(Error::StageContract {
                stage: "signing",
                missing,
            });
        }
        self.to_operation(Bytes::default())
    }

    /// Converts a draft with every field resolved into the final operation.
    pub fn finalize(&self) -> Result<UserOperation> {
        let missing = FieldSet::FINAL.difference(self.resolved());
        if !missing.is_empty() {
            return Err(Error::StageContract {
                stage: "finalize",
                missing,
            });
        }
        self.to_operation(self.signature.clone().unwrap_or_default())
    }

    fn to_operation(&self, signature: Bytes) -> Result<UserOperation> {
        let paymaster_and_data = match &self.paymaster_and_data {
            PaymasterAndData::Sponsored(b) => b.clone(),
            _ => {
                return Err(Error::StageContract {
                    stage: "finalize",
                    missing: FieldSet::of(&[Field::PaymasterAndData]),
                })
            }
        };
        Ok(UserOperation {
            sender: self.sender.unwrap_or_default(),
            nonce: self.nonce.unwrap_or_default(),
            init_code: self.init_code.clone().unwrap_or_default(),
            call_data: self.call_data.clone().unwrap_or_default(),
            call_gas_limit: self.call_gas_limit.unwrap_or_default(),
            verification_gas_limit: self.verification_gas_limit.unwrap_or_default(),
            pre_verification_gas: self.pre_verification_gas.unwrap_or_default(),
            max_fee_per_gas: self.max_fee_per_gas.unwrap_or_default(),
            max_priority_fee_per_gas: self.max_priority_fee_per_gas.unwrap_or_default(),
            paymaster_and_data,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent() -> Intent {
        Intent {
            target: Address::repeat_byte(0x22),
            data: Bytes::from(vec![0u8]),
            value: U256::zero(),
        }
    }

    fn fully_resolved() -> UserOperationDraft {
        UserOperationDraft::new(intent())
            .with(FieldValue::Sender(Address::repeat_byte(0x11)))
            .with(FieldValue::Nonce(U256::from(3)))
            .with(FieldValue::InitCode(Bytes::default()))
            .with(FieldValue::CallData(Bytes::from(vec![0xb6, 0x1d, 0x27, 0xf6])))
            .with(FieldValue::CallGasLimit(U256::from(50_000)))
            .with(FieldValue::VerificationGasLimit(U256::from(100_000)))
            .with(FieldValue::PreVerificationGas(U256::from(45_000)))
            .with(FieldValue::MaxFeePerGas(U256::from(1_000_000_000u64)))
            .with(FieldValue::MaxPriorityFeePerGas(U256::from(200_000_000u64)))
            .with(FieldValue::PaymasterAndData(Bytes::from(vec![0xaa; 20])))
            .with(FieldValue::Signature(Bytes::from(vec![0x01; 65])))
    }

    #[test]
    fn new_draft_has_nothing_resolved() {
        let draft = UserOperationDraft::new(intent());
        assert!(draft.resolved().is_empty());
        assert_eq!(draft.paymaster_and_data(), &PaymasterAndData::Pending);
    }

    #[test]
    fn stub_and_sponsored_are_distinct_states() {
        let draft = UserOperationDraft::new(intent())
            .with(FieldValue::StubPaymasterAndData(Bytes::from(vec![0x01; 20])));
        assert!(draft.resolved().contains(Field::StubPaymasterAndData));
        assert!(!draft.resolved().contains(Field::PaymasterAndData));

        let draft = draft.with(FieldValue::PaymasterAndData(Bytes::from(vec![0x02; 20])));
        assert!(!draft.resolved().contains(Field::StubPaymasterAndData));
        assert!(draft.resolved().contains(Field::PaymasterAndData));
    }

    #[test]
    fn finalize_requires_every_field() {
        let draft = fully_resolved();
        let op = draft.finalize().unwrap();
        assert_eq!(op.nonce, U256::from(3));
        assert_eq!(op.paymaster_and_data, Bytes::from(vec![0xaa; 20]));

        let err = draft.clear(FieldSet::FEES).finalize().unwrap_err();
        match err {
            Error::StageContract { missing, .. } => assert_eq!(missing, FieldSet::FEES),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn stub_paymaster_data_can_never_be_finalized() {
        let draft = fully_resolved().with(FieldValue::StubPaymasterAndData(Bytes::from(
            vec![0x01; 20],
        )));
        assert!(draft.unsigned().is_err());
        assert!(draft.finalize().is_err());
    }

    #[test]
    fn estimation_view_uses_stub_and_dummy_signature() {
        let draft = UserOperationDraft::new(intent())
            .with(FieldValue::Sender(Address::repeat_byte(0x11)))
            .with(FieldValue::Nonce(U256::zero()))
            .with(FieldValue::InitCode(Bytes::default()))
            .with(FieldValue::CallData(Bytes::from(vec![0x01])))
            .with(FieldValue::StubPaymasterAndData(Bytes::from(vec![0x7a; 20])))
            .with_dummy_signature(Bytes::from(vec![0xff; 65]));

        let op = draft.estimation_view().unwrap();
        assert_eq!(op.paymaster_and_data, Bytes::from(vec![0x7a; 20]));
        assert_eq!(op.signature, Bytes::from(vec![0xff; 65]));
        assert!(op.call_gas_limit.is_zero());
        assert!(op.max_fee_per_gas.is_zero());
    }

    #[test]
    fn dropping_a_draft_returns_its_nonce() {
        let alloc = std::sync::Arc::new(crate::nonce::NonceAllocator::new());
        let sender = Address::repeat_byte(0x11);
        let draft = UserOperationDraft::new(intent())
            .with_nonce_lease(alloc.reserve(sender, U256::from(9)));
        assert_eq!(draft.nonce(), Some(U256::from(9)));
        assert!(draft.resolved().contains(Field::Nonce));

        let copy = draft.clone().clear(FieldSet::FEES);
        drop(draft);
        assert_eq!(alloc.reserve(sender, U256::from(9)).nonce(), U256::from(10));
        drop(copy);
        assert_eq!(alloc.reserve(sender, U256::from(9)).nonce(), U256::from(9));
    }

    #[test]
    fn field_set_display_lists_names() {
        assert_eq!(
            FieldSet::FEES.to_string(),
            "{maxFeePerGas, maxPriorityFeePerGas}"
        );
        assert!(FieldSet::FINAL.is_superset(FieldSet::GAS));
        assert!(!FieldSet::FINAL.contains(Field::StubPaymasterAndData));
    }
}
