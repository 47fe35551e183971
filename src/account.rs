use crate::error::{Error, Result};
use crate::types::{Intent, UserOperation};
use async_trait::async_trait;
use ethers::abi::{Abi, AbiParser};
use ethers::prelude::*;
use std::sync::Arc;

/// Signature-shaped placeholder for an ECDSA-owned account: passes `ecrecover` without reverting.
pub const SIMPLE_ACCOUNT_DUMMY_SIGNATURE: &str = "0xfffffffffffffffffffffffffffffff000000000000000000000000000000007aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa1c";

const ENTRY_POINT_GET_USER_OP_HASH: &str = r#"[{"inputs":[{"components":[{"internalType":"address","name":"sender","type":"address"},{"internalType":"uint256","name":"nonce","type":"uint256"},{"internalType":"bytes","name":"initCode","type":"bytes"},{"internalType":"bytes","name":"callData","type":"bytes"},{"internalType":"uint256","name":"callGasLimit","type":"uint256"},{"internalType":"uint256","name":"verificationGasLimit","type":"uint256"},{"internalType":"uint256","name":"preVerificationGas","type":"uint256"},{"internalType":"uint256","name":"maxFeePerGas","type":"uint256"},{"internalType":"uint256","name":"maxPriorityFeePerGas","type":"uint256"},{"internalType":"bytes","name":"paymasterAndData","type":"bytes"},{"internalType":"bytes","name":"signature","type":"bytes"}],"internalType":"struct UserOperation","name":"userOp","type":"tuple"}],"name":"getUserOpHash","outputs":[{"internalType":"bytes32","name":"","type":"bytes32"}],"stateMutability":"view","type":"function"}]"#;

/// The smart contract account a UserOperation is built for.
#[async_trait]
pub trait SmartAccount: Send + Sync {
    async fn address(&self) -> Result<Address>;

    /// Current EntryPoint nonce of the account.
    async fn nonce(&self) -> Result<U256>;

    /// Factory call deploying the account; empty once it is deployed.
    async fn init_code(&self) -> Result<Bytes>;

    /// Account calldata executing the intent.
    fn encode_execute(&self, intent: &Intent) -> Result<Bytes>;

    fn dummy_signature(&self) -> Bytes;

    /// Signs the operation's hash. `op.signature` is ignored.
    async fn sign(&self, op: &UserOperation) -> Result<Bytes>;
}

/// Source of network fee conditions.
#[async_trait]
pub trait FeeOracle: Send + Sync {
    async fn base_fee(&self) -> Result<U256>;

    async fn chain_id(&self) -> Result<u64>;
}

/// eth-infinitism `SimpleAccount`, owned by a single ECDSA key and deployed by
/// `SimpleAccountFactory.createAccount(owner, salt)`.
pub struct SimpleAccount<M> {
    client: Arc<M>,
    owner: LocalWallet,
    entry_point: Address,
    factory: Address,
    salt: U256,
    address: Address,
}

impl<M: Middleware + 'static> SimpleAccount<M> {
    /// Resolves the counterfactual address through the factory.
    pub async fn connect(
        client: Arc<M>,
        owner: LocalWallet,
        entry_point: Address,
        factory: Address,
        salt: U256,
    ) -> Result<Self> {
        let address = compute_account_address(client.clone(), factory, owner.address(), salt).await?;
        tracing::debug!(account = ?address, owner = ?owner.address(), "resolved smart account address");
        Ok(Self {
            client,
            owner,
            entry_point,
            factory,
            salt,
            address,
        })
    }

    pub fn owner(&self) -> Address {
        self.owner.address()
    }

    pub async fn is_deployed(&self) -> Result<bool> {
        let code = self
            .client
            .get_code(self.address, None)
            .await
            .map_err(|e| Error::rpc("eth_getCode failed", e))?;
        Ok(!code.as_ref().is_empty())
    }
}

#[async_trait]
impl<M: Middleware + 'static> SmartAccount for SimpleAccount<M> {
    async fn address(&self) -> Result<Address> {
        Ok(self.address)
    }

    async fn nonce(&self) -> Result<U256> {
        let entrypoint_abi = parse_abi(&[
            "function getNonce(address sender, uint192 key) view returns (uint256)",
        ])?;
        let entrypoint_c = Contract::new(self.entry_point, entrypoint_abi, self.client.clone());

        entrypoint_c
            .method::<_, U256>("getNonce", (self.address, U256::zero()))
            .map_err(|e| Error::rpc("entryPoint.getNonce", e))?
            .call()
            .await
            .map_err(|e| Error::rpc("entryPoint.getNonce failed", e))
    }

    async fn init_code(&self) -> Result<Bytes> {
        if self.is_deployed().await? {
            return Ok(Bytes::default());
        }
        let factory_abi = parse_abi(&[
            "function createAccount(address owner, uint256 salt) returns (address)",
        ])?;
        let factory_c = Contract::new(self.factory, factory_abi, self.client.clone());
        let create_calldata = factory_c
            .method::<_, Address>("createAccount", (self.owner.address(), self.salt))
            .map_err(|e| Error::rpc("factory.createAccount", e))?
            .calldata()
            .ok_or_else(|| Error::rpc("factory.createAccount", "failed to build calldata"))?;

        let mut v = Vec::with_capacity(20 + create_calldata.len());
        v.extend_from_slice(self.factory.as_bytes());
        v.extend_from_slice(create_calldata.as_ref());
        Ok(Bytes::from(v))
    }

    fn encode_execute(&self, intent: &Intent) -> Result<Bytes> {
        // SimpleAccount.execute(address dest, uint256 value, bytes func)
        let account_abi = parse_abi(&["function execute(address dest, uint256 value, bytes func)"])?;
        let account_c = Contract::new(self.address, account_abi, self.client.clone());
        account_c
            .method::<_, ()>("execute", (intent.target, intent.value, intent.data.clone()))
            .map_err(|e| Error::rpc("account.execute", e))?
            .calldata()
            .ok_or_else(|| Error::rpc("account.execute", "failed to build calldata"))
    }

    fn dummy_signature(&self) -> Bytes {
        crate::encoding::parse_bytes(SIMPLE_ACCOUNT_DUMMY_SIGNATURE).unwrap_or_default()
    }

    async fn sign(&self, op: &UserOperation) -> Result<Bytes> {
        // Use the on-chain EntryPoint.getUserOpHash for correctness.
        let entrypoint_abi: Abi = serde_json::from_str(ENTRY_POINT_GET_USER_OP_HASH)
            .map_err(|e| Error::Signing(format!("failed to parse EntryPoint ABI: {e}")))?;
        let entrypoint_c = Contract::new(self.entry_point, entrypoint_abi, self.client.clone());

        let user_op_hash: H256 = entrypoint_c
            .method("getUserOpHash", (op.as_abi_tuple(),))
            .map_err(|e| Error::Signing(e.to_string()))?
            .call()
            .await
            .map_err(|e| Error::Signing(format!("entryPoint.getUserOpHash failed: {e}")))?;

        let sig = self
            .owner
            .sign_message(user_op_hash.as_bytes())
            .await
            .map_err(|e| Error::Signing(format!("failed to sign userOpHash: {e}")))?;

        Ok(Bytes::from(sig.to_vec()))
    }
}

/// Reads the base fee of the latest block.
pub struct ProviderFeeOracle<M> {
    client: Arc<M>,
}

impl<M> ProviderFeeOracle<M> {
    pub fn new(client: Arc<M>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<M: Middleware + 'static> FeeOracle for ProviderFeeOracle<M> {
    async fn base_fee(&self) -> Result<U256> {
        let block = self
            .client
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| Error::rpc("eth_getBlockByNumber failed", e))?
            .ok_or_else(|| Error::rpc("eth_getBlockByNumber", "latest block not found"))?;
        block
            .base_fee_per_gas
            .ok_or_else(|| Error::rpc("eth_getBlockByNumber", "chain does not report a base fee"))
    }

    async fn chain_id(&self) -> Result<u64> {
        self.client
            .get_chainid()
            .await
            .map(|id| id.as_u64())
            .map_err(|e| Error::rpc("eth_chainId failed", e))
    }
}

/// Counterfactual account address from `SimpleAccountFactory.getAddress(owner, salt)`.
pub async fn compute_account_address<M: Middleware + 'static>(
    client: Arc<M>,
    factory: Address,
    owner: Address,
    salt: U256,
) -> Result<Address> {
    let factory_abi =
        parse_abi(&["function getAddress(address owner, uint256 salt) view returns (address)"])?;
    let factory = Contract::new(factory, factory_abi, client);

    factory
        .method::<_, Address>("getAddress", (owner, salt))
        .map_err(|e| Error::rpc("factory.getAddress", e))?
        .call()
        .await
        .map_err(|e| Error::rpc("factory.getAddress failed", e))
}

fn parse_abi(signatures: &[&str]) -> Result<Abi> {
    AbiParser::default()
        .parse(signatures)
        .map_err(|e| Error::rpc("invalid ABI signature", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dummy_signature_is_65_bytes() {
        let sig = crate::encoding::parse_bytes(SIMPLE_ACCOUNT_DUMMY_SIGNATURE).unwrap();
        assert_eq!(sig.len(), 65);
    }

    #[test]
    fn user_op_hash_abi_parses() {
        let abi: Abi = serde_json::from_str(ENTRY_POINT_GET_USER_OP_HASH).unwrap();
        assert!(abi.function("getUserOpHash").is_ok());
    }

    #[test]
    fn execute_calldata_uses_selector() {
        let abi = parse_abi(&["function execute(address dest, uint256 value, bytes func)"]).unwrap();
        let f = abi.function("execute").unwrap();
        // keccak256("execute(address,uint256,bytes)")[..4]
        assert_eq!(hex::encode(f.short_signature()), "b61d27f6");
    }
}
