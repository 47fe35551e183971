//! In-memory collaborators for pipeline and submission tests.

use crate::account::{FeeOracle, SmartAccount};
use crate::bundler::{Bundler, GasEstimates, UserOperationReceipt};
use crate::config::DummyPaymaster;
use crate::encoding::draft_to_json;
use crate::error::{Error, Result};
use crate::fees::FeePolicy;
use crate::nonce::NonceAllocator;
use crate::paymaster::{GasOverrides, IdSource, SequentialIds, Sponsor, Sponsorship};
use crate::stages::StageDeps;
use crate::types::{Intent, UserOperation, UserOperationDraft};
use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

pub fn intent() -> Intent {
    Intent {
        target: Address::repeat_byte(0x42),
        data: Bytes::from(vec![0xde, 0xad, 0xbe, 0xef]),
        value: U256::zero(),
    }
}

pub struct MockAccount {
    pub address: Address,
    pub nonce: U256,
    signed: Mutex<Vec<UserOperation>>,
}

impl MockAccount {
    pub fn signature_bytes(&self) -> Bytes {
        Bytes::from(vec![0x5a; 65])
    }

    /// Operations handed to `sign`, in order.
    pub fn signed(&self) -> Vec<UserOperation> {
        self.signed.lock().clone()
    }
}

#[async_trait]
impl SmartAccount for MockAccount {
    async fn address(&self) -> Result<Address> {
        Ok(self.address)
    }

    async fn nonce(&self) -> Result<U256> {
        Ok(self.nonce)
    }

    async fn init_code(&self) -> Result<Bytes> {
        Ok(Bytes::default())
    }

    fn encode_execute(&self, intent: &Intent) -> Result<Bytes> {
        let mut v = intent.target.as_bytes().to_vec();
        v.extend_from_slice(intent.data.as_ref());
        Ok(Bytes::from(v))
    }

    fn dummy_signature(&self) -> Bytes {
        Bytes::from(vec![0xff; 65])
    }

    async fn sign(&self, op: &UserOperation) -> Result<Bytes> {
        self.signed.lock().push(op.clone());
        Ok(self.signature_bytes())
    }
}

#[derive(Default)]
pub struct MockBundler {
    estimated: Mutex<Vec<UserOperation>>,
    sent: Mutex<Vec<UserOperation>>,
    rejections: Mutex<VecDeque<Error>>,
    hold: Mutex<u32>,
    held: Mutex<HashSet<H256>>,
    mine_held_at: Mutex<Option<usize>>,
}

impl MockBundler {
    pub fn estimated(&self) -> Vec<UserOperation> {
        self.estimated.lock().clone()
    }

    /// Every operation passed to `send_user_operation`, accepted or not.
    pub fn sent(&self) -> Vec<UserOperation> {
        self.sent.lock().clone()
    }

    pub fn send_calls(&self) -> usize {
        self.sent.lock().len()
    }

    /// The next send fails with `err`. Queued rejections are used in order.
    pub fn reject_next(&self, err: Error) {
        self.rejections.lock().push_back(err);
    }

    /// The next `n` accepted operations never get a receipt.
    pub fn hold_receipts(&self, n: u32) {
        *self.hold.lock() = n;
    }

    /// When send number `n` arrives the held operations are mined, so that send and every
    /// later one is refused with a nonce error.
    pub fn mine_held_at_send(&self, n: usize) {
        *self.mine_held_at.lock() = Some(n);
    }
}

#[async_trait]
impl Bundler for MockBundler {
    async fn estimate_user_operation_gas(
        &self,
        op: &UserOperation,
        _entry_point: Address,
    ) -> Result<GasEstimates> {
        self.estimated.lock().push(op.clone());
        Ok(GasEstimates {
            call_gas_limit: U256::from(100_000),
            verification_gas_limit: U256::from(150_000),
            pre_verification_gas: U256::from(50_000),
        })
    }

    async fn send_user_operation(&self, op: &UserOperation, _entry_point: Address) -> Result<H256> {
        let n = {
            let mut sent = self.sent.lock();
            sent.push(op.clone());
            sent.len()
        };
        if matches!(*self.mine_held_at.lock(), Some(at) if n >= at) {
            self.held.lock().clear();
            return Err(Error::SubmissionRejected("AA25 invalid account nonce".into()));
        }
        if let Some(err) = self.rejections.lock().pop_front() {
            return Err(err);
        }
        let hash = H256::from_low_u64_be(n as u64);
        let mut hold = self.hold.lock();
        if *hold > 0 {
            *hold -= 1;
            self.held.lock().insert(hash);
        }
        Ok(hash)
    }

    async fn get_user_operation_receipt(
        &self,
        user_op_hash: H256,
    ) -> Result<Option<UserOperationReceipt>> {
        if self.held.lock().contains(&user_op_hash) {
            return Ok(None);
        }
        Ok(Some(UserOperationReceipt {
            user_op_hash,
            transaction_hash: H256::repeat_byte(0xee),
            success: true,
            raw: Value::Null,
        }))
    }
}

pub struct MockOracle {
    base_fee: Mutex<U256>,
}

impl MockOracle {
    pub fn set_base_fee(&self, fee: U256) {
        *self.base_fee.lock() = fee;
    }
}

#[async_trait]
impl FeeOracle for MockOracle {
    async fn base_fee(&self) -> Result<U256> {
        Ok(*self.base_fee.lock())
    }

    async fn chain_id(&self) -> Result<u64> {
        Ok(1)
    }
}

pub struct MockSponsor {
    ids: SequentialIds,
    requests: Mutex<Vec<Value>>,
    stub_calls: Mutex<usize>,
    sponsored: Mutex<Bytes>,
    overrides: Mutex<GasOverrides>,
    fail_status: Mutex<Option<u16>>,
    stall_stubs: Mutex<bool>,
}

impl MockSponsor {
    pub fn stub_bytes(&self) -> Bytes {
        Bytes::from(vec![0xaa; 20])
    }

    pub fn sponsored_bytes(&self) -> Bytes {
        self.sponsored.lock().clone()
    }

    /// Wire JSON of every draft sent for final sponsorship.
    pub fn sponsorship_requests(&self) -> Vec<Value> {
        self.requests.lock().clone()
    }

    pub fn stub_calls(&self) -> usize {
        *self.stub_calls.lock()
    }

    pub fn set_sponsored(&self, bytes: Bytes) {
        *self.sponsored.lock() = bytes;
    }

    pub fn set_overrides(&self, overrides: GasOverrides) {
        *self.overrides.lock() = overrides;
    }

    /// Every following request fails with this HTTP status.
    pub fn fail_with_status(&self, status: u16) {
        *self.fail_status.lock() = Some(status);
    }

    pub fn recover(&self) {
        *self.fail_status.lock() = None;
        *self.stall_stubs.lock() = false;
    }

    /// Stub requests never answer until [`MockSponsor::recover`].
    pub fn stall_stubs(&self) {
        *self.stall_stubs.lock() = true;
    }

    fn check(&self, request_id: u64) -> Result<()> {
        match *self.fail_status.lock() {
            Some(status) => Err(Error::PaymasterHttp { status, request_id }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Sponsor for MockSponsor {
    async fn request_sponsorship(
        &self,
        draft: &UserOperationDraft,
        _policy_id: &str,
        _entry_point: Address,
    ) -> Result<Sponsorship> {
        let request_id = self.ids.next_id();
        self.check(request_id)?;
        self.requests.lock().push(draft_to_json(draft));
        Ok(Sponsorship {
            request_id,
            paymaster_and_data: self.sponsored_bytes(),
            overrides: self.overrides.lock().clone(),
        })
    }

    async fn request_stub(
        &self,
        _draft: &UserOperationDraft,
        _policy_id: &str,
        _entry_point: Address,
        _method: &str,
    ) -> Result<Bytes> {
        let request_id = self.ids.next_id();
        *self.stub_calls.lock() += 1;
        let stalled = *self.stall_stubs.lock();
        if stalled {
            std::future::pending::<()>().await;
        }
        self.check(request_id)?;
        Ok(self.stub_bytes())
    }
}

/// One set of mocks wired into [`StageDeps`].
pub struct Harness {
    pub account: Arc<MockAccount>,
    pub bundler: Arc<MockBundler>,
    pub oracle: Arc<MockOracle>,
    pub sponsor: Arc<MockSponsor>,
    pub nonces: Arc<NonceAllocator>,
    pub entry_point: Address,
}

impl Harness {
    pub fn new() -> Self {
        let mut sponsored = vec![0xbb; 20];
        sponsored.extend_from_slice(&[0x01; 45]);
        Self {
            account: Arc::new(MockAccount {
                address: Address::repeat_byte(0x11),
                nonce: U256::from(7),
                signed: Mutex::new(Vec::new()),
            }),
            bundler: Arc::new(MockBundler::default()),
            oracle: Arc::new(MockOracle {
                base_fee: Mutex::new(U256::from(1_000_000_000u64)),
            }),
            sponsor: Arc::new(MockSponsor {
                ids: SequentialIds::starting_at(1),
                requests: Mutex::new(Vec::new()),
                stub_calls: Mutex::new(0),
                sponsored: Mutex::new(Bytes::from(sponsored)),
                overrides: Mutex::new(GasOverrides::default()),
                fail_status: Mutex::new(None),
                stall_stubs: Mutex::new(false),
            }),
            nonces: Arc::new(NonceAllocator::new()),
            entry_point: Address::repeat_byte(0xe4),
        }
    }

    pub fn deps(&self) -> StageDeps {
        StageDeps {
            account: self.account.clone(),
            bundler: self.bundler.clone(),
            oracle: self.oracle.clone(),
            sponsor: self.sponsor.clone(),
            nonces: self.nonces.clone(),
            dummy_paymaster: DummyPaymaster::Stub {
                method: "pm_getPaymasterStubData".to_string(),
            },
            fee_policy: FeePolicy::default(),
            replacement_bump_percentage: 10,
            policy_id: "test-policy".to_string(),
            entry_point: self.entry_point,
        }
    }
}
