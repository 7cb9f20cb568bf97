use crate::encoding::parse_bytes;
use crate::pipeline::NonceSource;
use crate::types::{GasPriceTier, UserOperation};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ethers::abi::{AbiParser, Token};
use ethers::contract::Contract;
use ethers::providers::Middleware;
use ethers::types::{Address, Bytes, U256};
use std::sync::Arc;

/// Placeholder signature carried until the real one is attached.
///
/// SimpleAccount reverts on a signature of the wrong length before it ever checks the
/// signer, so the paymaster's simulation needs a well-formed 65-byte value here. Only the
/// length matters.
pub const PLACEHOLDER_SIGNATURE: &str = "0xfffffffffffffffffffffffffffffff0000000000000000000000000000000007aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa1c";

/// r (32) + s (32) + v (1).
pub const ECDSA_SIGNATURE_LEN: usize = 65;

/// A single `execute(dest, value, func)` call made by the smart account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecuteCall {
    pub dest: Address,
    pub value: U256,
    pub func: Bytes,
}

impl ExecuteCall {
    /// SimpleAccount.execute(address dest, uint256 value, bytes func)
    pub fn encode(&self) -> Result<Bytes> {
        let account_abi = AbiParser::default()
            .parse(&["function execute(address dest, uint256 value, bytes func)"])?;
        let data = account_abi
            .function("execute")?
            .encode_input(&[
                Token::Address(self.dest),
                Token::Uint(self.value),
                Token::Bytes(self.func.to_vec()),
            ])
            .context("failed to build execute calldata")?;
        Ok(Bytes::from(data))
    }
}

pub fn placeholder_signature() -> Result<Bytes> {
    let sig = parse_bytes(PLACEHOLDER_SIGNATURE)?;
    if sig.len() != ECDSA_SIGNATURE_LEN {
        return Err(anyhow!(
            "placeholder signature must be {} bytes, got {}",
            ECDSA_SIGNATURE_LEN,
            sig.len()
        ));
    }
    Ok(sig)
}

/// Assembles the unsigned operation: no init code (the account is already deployed), zero gas
/// limits and empty `paymasterAndData` until the paymaster fills them in.
pub fn build_unsigned_user_op(
    sender: Address,
    nonce: U256,
    call_data: Bytes,
    fees: GasPriceTier,
) -> Result<UserOperation> {
    Ok(UserOperation {
        sender,
        nonce,
        init_code: Bytes::from(Vec::new()),
        call_data,
        call_gas_limit: U256::zero(),
        verification_gas_limit: U256::zero(),
        pre_verification_gas: U256::zero(),
        max_fee_per_gas: fees.max_fee_per_gas,
        max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
        paymaster_and_data: Bytes::from(Vec::new()),
        signature: placeholder_signature()?,
    })
}

/// Reads the sender nonce from the EntryPoint contract over the chain RPC.
#[derive(Debug, Clone)]
pub struct EntryPointNonce<M> {
    client: Arc<M>,
}

impl<M: Middleware + 'static> EntryPointNonce<M> {
    pub fn new(client: Arc<M>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<M: Middleware + 'static> NonceSource for EntryPointNonce<M> {
    async fn get_nonce(&self, entry_point: Address, sender: Address) -> Result<U256> {
        let entrypoint_abi = AbiParser::default()
            .parse(&["function getNonce(address sender, uint192 key) view returns (uint256)"])?;
        let entrypoint_c = Contract::new(entry_point, entrypoint_abi, self.client.clone());

        let nonce: U256 = entrypoint_c
            .method("getNonce", (sender, U256::zero()))?
            .call()
            .await
            .context("entryPoint.getNonce failed")?;
        Ok(nonce)
    }
}

/// Refuses to continue if the RPC endpoint serves a different chain than configured.
pub async fn ensure_chain_id<M: Middleware + 'static>(client: &M, expected: u64) -> Result<()> {
    let chain_id = client
        .get_chainid()
        .await
        .map_err(|e| anyhow!("eth_chainId failed: {e}"))?;
    if chain_id != U256::from(expected) {
        return Err(anyhow!(
            "chainId mismatch: config has {}, RPC returned {}",
            expected,
            chain_id
        ));
    }
    Ok(())
}
