//! The concrete assembly steps, in the order a sponsored operation needs them:
//! base fields, estimation placeholder, gas, fees, sponsorship, signature.

use crate::account::{FeeOracle, SmartAccount};
use crate::bundler::Bundler;
use crate::config::DummyPaymaster;
use crate::error::{Error, Result};
use crate::fees::{apply_floor, FeePolicy};
use crate::nonce::NonceAllocator;
use crate::paymaster::Sponsor;
use crate::pipeline::{Pipeline, Stage};
use crate::types::{Field, FeeQuote, FieldSet, FieldValue, PaymasterAndData, UserOperationDraft};
use async_trait::async_trait;
use ethers::types::{Address, Bytes};
use std::sync::Arc;

/// Sender, nonce, initCode and callData, plus the account's dummy signature.
pub struct BaseFieldsStage {
    account: Arc<dyn SmartAccount>,
    nonces: Arc<NonceAllocator>,
}

impl BaseFieldsStage {
    pub fn new(account: Arc<dyn SmartAccount>, nonces: Arc<NonceAllocator>) -> Self {
        Self { account, nonces }
    }
}

#[async_trait]
impl Stage for BaseFieldsStage {
    fn name(&self) -> &'static str {
        "base-fields"
    }

    fn requires(&self) -> FieldSet {
        FieldSet::EMPTY
    }

    fn provides(&self) -> FieldSet {
        FieldSet::BASE
    }

    async fn apply(&self, draft: UserOperationDraft) -> Result<UserOperationDraft> {
        let sender = self.account.address().await?;
        let call_data = self.account.encode_execute(draft.intent())?;
        let init_code = self.account.init_code().await?;
        let on_chain = self.account.nonce().await?;
        let lease = self.nonces.reserve(sender, on_chain);
        tracing::debug!(?sender, nonce = %lease.nonce(), %on_chain, deployed = init_code.is_empty(), "base fields resolved");

        Ok(draft
            .with(FieldValue::Sender(sender))
            .with_nonce_lease(lease)
            .with(FieldValue::InitCode(init_code))
            .with(FieldValue::CallData(call_data))
            .with_dummy_signature(self.account.dummy_signature()))
    }
}

/// Fills in the placeholder `paymasterAndData` used only for simulation.
pub struct DummyPaymasterStage {
    source: DummyPaymaster,
    sponsor: Arc<dyn Sponsor>,
    policy_id: String,
    entry_point: Address,
}

impl DummyPaymasterStage {
    pub fn new(
        source: DummyPaymaster,
        sponsor: Arc<dyn Sponsor>,
        policy_id: String,
        entry_point: Address,
    ) -> Self {
        Self {
            source,
            sponsor,
            policy_id,
            entry_point,
        }
    }
}

#[async_trait]
impl Stage for DummyPaymasterStage {
    fn name(&self) -> &'static str {
        "dummy-paymaster"
    }

    fn requires(&self) -> FieldSet {
        FieldSet::BASE
    }

    fn provides(&self) -> FieldSet {
        FieldSet::of(&[Field::StubPaymasterAndData])
    }

    async fn apply(&self, draft: UserOperationDraft) -> Result<UserOperationDraft> {
        let stub = match &self.source {
            DummyPaymaster::Static(bytes) => bytes.clone(),
            DummyPaymaster::Stub { method } => {
                self.sponsor
                    .request_stub(&draft, &self.policy_id, self.entry_point, method)
                    .await?
            }
        };
        if stub.len() < 20 {
            return Err(Error::Config(format!(
                "estimation placeholder must start with a paymaster address, got {} bytes",
                stub.len()
            )));
        }
        Ok(draft.with(FieldValue::StubPaymasterAndData(stub)))
    }
}

/// Asks the bundler to simulate the draft and takes its three gas limits.
pub struct GasEstimationStage {
    bundler: Arc<dyn Bundler>,
    entry_point: Address,
}

impl GasEstimationStage {
    pub fn new(bundler: Arc<dyn Bundler>, entry_point: Address) -> Self {
        Self {
            bundler,
            entry_point,
        }
    }
}

#[async_trait]
impl Stage for GasEstimationStage {
    fn name(&self) -> &'static str {
        "gas-estimation"
    }

    fn requires(&self) -> FieldSet {
        FieldSet::BASE.with(Field::StubPaymasterAndData)
    }

    fn provides(&self) -> FieldSet {
        FieldSet::GAS
    }

    async fn apply(&self, draft: UserOperationDraft) -> Result<UserOperationDraft> {
        let view = draft.estimation_view()?;
        let gas = self
            .bundler
            .estimate_user_operation_gas(&view, self.entry_point)
            .await?;
        tracing::debug!(
            call_gas_limit = %gas.call_gas_limit,
            verification_gas_limit = %gas.verification_gas_limit,
            pre_verification_gas = %gas.pre_verification_gas,
            "gas estimated"
        );
        Ok(draft
            .with(FieldValue::CallGasLimit(gas.call_gas_limit))
            .with(FieldValue::VerificationGasLimit(gas.verification_gas_limit))
            .with(FieldValue::PreVerificationGas(gas.pre_verification_gas)))
    }
}

/// Quotes fees from the current base fee. A draft carrying a fee floor (a replacement)
/// gets at least the floor bumped by `replacement_bump_percentage`.
pub struct FeeStage {
    oracle: Arc<dyn FeeOracle>,
    policy: FeePolicy,
    replacement_bump_percentage: u32,
}

impl FeeStage {
    pub fn new(
        oracle: Arc<dyn FeeOracle>,
        policy: FeePolicy,
        replacement_bump_percentage: u32,
    ) -> Self {
        Self {
            oracle,
            policy,
            replacement_bump_percentage,
        }
    }
}

#[async_trait]
impl Stage for FeeStage {
    fn name(&self) -> &'static str {
        "fees"
    }

    fn requires(&self) -> FieldSet {
        FieldSet::EMPTY
    }

    fn provides(&self) -> FieldSet {
        FieldSet::FEES
    }

    async fn apply(&self, draft: UserOperationDraft) -> Result<UserOperationDraft> {
        let base_fee = self.oracle.base_fee().await?;
        let mut quote = self.policy.quote(base_fee);
        if let Some(previous) = draft.fee_floor() {
            quote = apply_floor(quote, previous, self.replacement_bump_percentage);
        }
        tracing::debug!(
            %base_fee,
            max_fee_per_gas = %quote.max_fee_per_gas,
            max_priority_fee_per_gas = %quote.max_priority_fee_per_gas,
            replacement = draft.fee_floor().is_some(),
            "fees quoted"
        );
        Ok(draft
            .with(FieldValue::MaxFeePerGas(quote.max_fee_per_gas))
            .with(FieldValue::MaxPriorityFeePerGas(quote.max_priority_fee_per_gas)))
    }
}

/// Real sponsorship round. The paymaster sees the settled gas and fees, never the stub.
///
/// Fee overrides from the paymaster must still form a valid quote, and on a replacement
/// must clear the bumped fee floor.
pub struct PaymasterStage {
    sponsor: Arc<dyn Sponsor>,
    policy_id: String,
    entry_point: Address,
    replacement_bump_percentage: u32,
}

impl PaymasterStage {
    pub fn new(
        sponsor: Arc<dyn Sponsor>,
        policy_id: String,
        entry_point: Address,
        replacement_bump_percentage: u32,
    ) -> Self {
        Self {
            sponsor,
            policy_id,
            entry_point,
            replacement_bump_percentage,
        }
    }
}

#[async_trait]
impl Stage for PaymasterStage {
    fn name(&self) -> &'static str {
        "paymaster"
    }

    fn requires(&self) -> FieldSet {
        FieldSet::BASE.union(FieldSet::GAS).union(FieldSet::FEES)
    }

    fn provides(&self) -> FieldSet {
        FieldSet::of(&[Field::PaymasterAndData])
    }

    async fn apply(&self, draft: UserOperationDraft) -> Result<UserOperationDraft> {
        let stub = match draft.paymaster_and_data() {
            PaymasterAndData::Stub(b) => Some(b.clone()),
            _ => None,
        };
        let draft = draft.clear(FieldSet::of(&[Field::StubPaymasterAndData]));

        let sponsorship = self
            .sponsor
            .request_sponsorship(&draft, &self.policy_id, self.entry_point)
            .await?;

        if sponsorship.paymaster_and_data.is_empty()
            || stub.as_ref() == Some(&sponsorship.paymaster_and_data)
        {
            return Err(Error::PaymasterProtocol {
                request_id: sponsorship.request_id,
                reason: "paymaster returned placeholder data instead of a sponsorship".to_string(),
            });
        }

        let o = &sponsorship.overrides;
        if !o.is_empty() {
            tracing::debug!(request_id = sponsorship.request_id, overrides = ?o, "paymaster adjusted gas values");
        }
        let mut draft = draft.with(FieldValue::PaymasterAndData(sponsorship.paymaster_and_data));
        let overrides = [
            o.call_gas_limit.map(FieldValue::CallGasLimit),
            o.verification_gas_limit.map(FieldValue::VerificationGasLimit),
            o.pre_verification_gas.map(FieldValue::PreVerificationGas),
            o.max_fee_per_gas.map(FieldValue::MaxFeePerGas),
            o.max_priority_fee_per_gas.map(FieldValue::MaxPriorityFeePerGas),
        ];
        for value in overrides.into_iter().flatten() {
            draft = draft.with(value);
        }
        self.check_fees(&draft, sponsorship.request_id)?;
        Ok(draft)
    }
}

impl PaymasterStage {
    fn check_fees(&self, draft: &UserOperationDraft, request_id: u64) -> Result<()> {
        let (Some(max_fee), Some(priority)) =
            (draft.max_fee_per_gas(), draft.max_priority_fee_per_gas())
        else {
            return Ok(());
        };
        if priority > max_fee {
            return Err(Error::PaymasterProtocol {
                request_id,
                reason: format!(
                    "sponsored maxPriorityFeePerGas {priority} exceeds maxFeePerGas {max_fee}"
                ),
            });
        }
        if let Some(previous) = draft.fee_floor() {
            let floor = apply_floor(FeeQuote::default(), previous, self.replacement_bump_percentage);
            if max_fee < floor.max_fee_per_gas || priority < floor.max_priority_fee_per_gas {
                return Err(Error::PaymasterProtocol {
                    request_id,
                    reason: format!(
                        "sponsored fees ({max_fee}, {priority}) are below the replacement floor ({}, {})",
                        floor.max_fee_per_gas, floor.max_priority_fee_per_gas
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Signs the fully resolved operation. Always last.
pub struct SignStage {
    account: Arc<dyn SmartAccount>,
}

impl SignStage {
    pub fn new(account: Arc<dyn SmartAccount>) -> Self {
        Self { account }
    }
}

#[async_trait]
impl Stage for SignStage {
    fn name(&self) -> &'static str {
        "sign"
    }

    fn requires(&self) -> FieldSet {
        FieldSet::FINAL.difference(FieldSet::of(&[Field::Signature]))
    }

    fn provides(&self) -> FieldSet {
        FieldSet::of(&[Field::Signature])
    }

    async fn apply(&self, draft: UserOperationDraft) -> Result<UserOperationDraft> {
        let unsigned = draft.unsigned()?;
        let signature: Bytes = self.account.sign(&unsigned).await?;
        Ok(draft.with(FieldValue::Signature(signature)))
    }
}

/// Collaborators shared by the assembly and resubmission pipelines.
#[derive(Clone)]
pub struct StageDeps {
    pub account: Arc<dyn SmartAccount>,
    pub bundler: Arc<dyn Bundler>,
    pub oracle: Arc<dyn FeeOracle>,
    pub sponsor: Arc<dyn Sponsor>,
    pub nonces: Arc<NonceAllocator>,
    pub dummy_paymaster: DummyPaymaster,
    pub fee_policy: FeePolicy,
    pub replacement_bump_percentage: u32,
    pub policy_id: String,
    pub entry_point: Address,
}

/// Fields a resubmission keeps from the broadcast operation.
pub const RESUBMISSION_KEEPS: FieldSet = FieldSet::BASE.union(FieldSet::GAS);

/// Fields a resubmission re-derives.
pub const RESUBMISSION_CLEARS: FieldSet = FieldSet::FEES.union(FieldSet::of(&[
    Field::PaymasterAndData,
    Field::Signature,
]));

/// The full six-stage pipeline, from an intent to a signed operation.
pub fn assembly_pipeline(deps: &StageDeps) -> Result<Pipeline> {
    Pipeline::new(
        FieldSet::EMPTY,
        vec![
            Box::new(BaseFieldsStage::new(deps.account.clone(), deps.nonces.clone())),
            Box::new(DummyPaymasterStage::new(
                deps.dummy_paymaster.clone(),
                deps.sponsor.clone(),
                deps.policy_id.clone(),
                deps.entry_point,
            )),
            Box::new(GasEstimationStage::new(deps.bundler.clone(), deps.entry_point)),
            Box::new(FeeStage::new(
                deps.oracle.clone(),
                deps.fee_policy,
                deps.replacement_bump_percentage,
            )),
            Box::new(PaymasterStage::new(
                deps.sponsor.clone(),
                deps.policy_id.clone(),
                deps.entry_point,
                deps.replacement_bump_percentage,
            )),
            Box::new(SignStage::new(deps.account.clone())),
        ],
    )
}

/// Re-quote, re-sponsor and re-sign an operation whose gas is already settled. Sponsorship
/// covers the fee fields, so new fees always need a new paymaster signature.
pub fn resubmission_pipeline(deps: &StageDeps) -> Result<Pipeline> {
    Pipeline::new(
        RESUBMISSION_KEEPS,
        vec![
            Box::new(FeeStage::new(
                deps.oracle.clone(),
                deps.fee_policy,
                deps.replacement_bump_percentage,
            )),
            Box::new(PaymasterStage::new(
                deps.sponsor.clone(),
                deps.policy_id.clone(),
                deps.entry_point,
                deps.replacement_bump_percentage,
            )),
            Box::new(SignStage::new(deps.account.clone())),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::draft_to_json;
    use crate::paymaster::GasOverrides;
    use crate::testing::{intent, Harness};
    use ethers::types::U256;

    #[test]
    fn standard_pipelines_compose() {
        let h = Harness::new();
        let assembly = assembly_pipeline(&h.deps()).unwrap();
        assert_eq!(
            assembly.stage_names(),
            vec!["base-fields", "dummy-paymaster", "gas-estimation", "fees", "paymaster", "sign"]
        );
        let resubmit = resubmission_pipeline(&h.deps()).unwrap();
        assert_eq!(resubmit.stage_names(), vec!["fees", "paymaster", "sign"]);
    }

    #[tokio::test]
    async fn assembles_a_sponsored_signed_operation() {
        let h = Harness::new();
        let draft = assembly_pipeline(&h.deps())
            .unwrap()
            .run(UserOperationDraft::new(intent()))
            .await
            .unwrap();
        let op = draft.finalize().unwrap();

        assert_eq!(op.sender, h.account.address);
        assert_eq!(op.call_gas_limit, U256::from(100_000));
        // 1 gwei base fee, default policy
        assert_eq!(op.max_priority_fee_per_gas, U256::from(200_000_000u64));
        assert_eq!(op.max_fee_per_gas, U256::from(1_000_000_000u64));
        assert_eq!(op.paymaster_and_data, h.sponsor.sponsored_bytes());
        assert_eq!(op.signature, h.account.signature_bytes());
    }

    #[tokio::test]
    async fn paymaster_never_sees_the_stub() {
        let h = Harness::new();
        assembly_pipeline(&h.deps())
            .unwrap()
            .run(UserOperationDraft::new(intent()))
            .await
            .unwrap();

        let requests = h.sponsor.sponsorship_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0]["paymasterAndData"], "0x");
        // the estimate did carry the stub
        let estimated = h.bundler.estimated();
        assert_eq!(estimated[0].paymaster_and_data, h.sponsor.stub_bytes());
    }

    #[tokio::test]
    async fn static_placeholder_skips_the_stub_round() {
        let h = Harness::new();
        let mut deps = h.deps();
        deps.dummy_paymaster = DummyPaymaster::Static(Bytes::from(vec![0x77u8; 20]));
        assembly_pipeline(&deps)
            .unwrap()
            .run(UserOperationDraft::new(intent()))
            .await
            .unwrap();
        assert_eq!(h.sponsor.stub_calls(), 0);
        assert_eq!(
            h.bundler.estimated()[0].paymaster_and_data,
            Bytes::from(vec![0x77u8; 20])
        );
    }

    #[tokio::test]
    async fn signer_only_sees_fully_resolved_operations() {
        let h = Harness::new();
        assembly_pipeline(&h.deps())
            .unwrap()
            .run(UserOperationDraft::new(intent()))
            .await
            .unwrap();

        let signed = h.account.signed();
        assert_eq!(signed.len(), 1);
        let op = &signed[0];
        assert!(!op.call_gas_limit.is_zero());
        assert!(!op.max_fee_per_gas.is_zero());
        assert_eq!(op.paymaster_and_data, h.sponsor.sponsored_bytes());
        assert!(op.signature.is_empty());
    }

    #[tokio::test]
    async fn paymaster_overrides_replace_estimates() {
        let h = Harness::new();
        h.sponsor.set_overrides(GasOverrides {
            verification_gas_limit: Some(U256::from(555_555)),
            max_fee_per_gas: Some(U256::from(2_000_000_000u64)),
            ..Default::default()
        });
        let draft = assembly_pipeline(&h.deps())
            .unwrap()
            .run(UserOperationDraft::new(intent()))
            .await
            .unwrap();
        let op = draft.finalize().unwrap();
        assert_eq!(op.verification_gas_limit, U256::from(555_555));
        assert_eq!(op.max_fee_per_gas, U256::from(2_000_000_000u64));
        assert_eq!(op.call_gas_limit, U256::from(100_000));
        // the signed operation carries the overridden values
        assert_eq!(h.account.signed()[0].verification_gas_limit, U256::from(555_555));
    }

    #[tokio::test]
    async fn stub_echoed_back_is_rejected() {
        let h = Harness::new();
        h.sponsor.set_sponsored(h.sponsor.stub_bytes());
        let err = assembly_pipeline(&h.deps())
            .unwrap()
            .run(UserOperationDraft::new(intent()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PaymasterProtocol { .. }));
        assert!(h.account.signed().is_empty());
    }

    #[tokio::test]
    async fn paymaster_failure_stops_before_signing() {
        let h = Harness::new();
        h.sponsor.fail_with_status(500);
        let err = assembly_pipeline(&h.deps())
            .unwrap()
            .run(UserOperationDraft::new(intent()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PaymasterHttp { status: 500, .. }));
        assert!(h.account.signed().is_empty());
    }

    #[tokio::test]
    async fn short_stub_is_rejected() {
        let h = Harness::new();
        let mut deps = h.deps();
        deps.dummy_paymaster = DummyPaymaster::Static(Bytes::from(vec![0x01u8; 4]));
        let err = assembly_pipeline(&deps)
            .unwrap()
            .run(UserOperationDraft::new(intent()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(h.bundler.estimated().is_empty());
    }

    #[tokio::test]
    async fn replacement_fees_respect_the_floor() {
        let h = Harness::new();
        let deps = h.deps();
        let first = assembly_pipeline(&deps)
            .unwrap()
            .run(UserOperationDraft::new(intent()))
            .await
            .unwrap();
        let previous = first.finalize().unwrap().fees();

        let draft = first.clear(RESUBMISSION_CLEARS).with_fee_floor(previous);
        assert_eq!(draft_to_json(&draft)["paymasterAndData"], "0x");
        let second = resubmission_pipeline(&deps).unwrap().run(draft).await.unwrap();
        let op = second.finalize().unwrap();

        assert_eq!(op.max_fee_per_gas, U256::from(1_100_000_000u64));
        assert_eq!(op.max_priority_fee_per_gas, U256::from(220_000_000u64));
        assert_eq!(h.sponsor.sponsorship_requests().len(), 2);
        assert_eq!(h.account.signed().len(), 2);
    }

    #[tokio::test]
    async fn override_inverting_the_fee_caps_is_rejected() {
        let h = Harness::new();
        h.sponsor.set_overrides(GasOverrides {
            max_fee_per_gas: Some(U256::from(100_000_000u64)),
            ..Default::default()
        });
        let err = assembly_pipeline(&h.deps())
            .unwrap()
            .run(UserOperationDraft::new(intent()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PaymasterProtocol { reason, .. } if reason.contains("exceeds")));
        assert!(h.account.signed().is_empty());
    }

    #[tokio::test]
    async fn override_below_the_replacement_floor_is_rejected() {
        let h = Harness::new();
        let deps = h.deps();
        let first = assembly_pipeline(&deps)
            .unwrap()
            .run(UserOperationDraft::new(intent()))
            .await
            .unwrap();
        let previous = first.finalize().unwrap().fees();

        // the paymaster tries to keep the old caps
        h.sponsor.set_overrides(GasOverrides {
            max_fee_per_gas: Some(previous.max_fee_per_gas),
            max_priority_fee_per_gas: Some(previous.max_priority_fee_per_gas),
            ..Default::default()
        });
        let draft = first.clear(RESUBMISSION_CLEARS).with_fee_floor(previous);
        let err = resubmission_pipeline(&deps).unwrap().run(draft).await.unwrap_err();
        assert!(matches!(err, Error::PaymasterProtocol { reason, .. } if reason.contains("replacement floor")));
        assert_eq!(h.account.signed().len(), 1);
    }

    #[tokio::test]
    async fn failed_assembly_gives_its_nonce_back() {
        let h = Harness::new();
        let pipeline = assembly_pipeline(&h.deps()).unwrap();
        h.sponsor.fail_with_status(502);
        assert!(pipeline.run(UserOperationDraft::new(intent())).await.is_err());
        h.sponsor.recover();
        let draft = pipeline.run(UserOperationDraft::new(intent())).await.unwrap();
        assert_eq!(draft.nonce(), Some(h.account.nonce));
    }

    #[tokio::test]
    async fn concurrent_assemblies_get_distinct_nonces() {
        let h = Harness::new();
        let pipeline = assembly_pipeline(&h.deps()).unwrap();
        let (a, b) = tokio::join!(
            pipeline.run(UserOperationDraft::new(intent())),
            pipeline.run(UserOperationDraft::new(intent()))
        );
        assert_ne!(a.unwrap().nonce(), b.unwrap().nonce());
    }
}
