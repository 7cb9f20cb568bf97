use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use serde_json::Value;
use std::fmt;

/// ERC-4337 UserOperation (EntryPoint v0.6 layout).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
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
    /// ABI-encodes every field except the signature, with the dynamic fields replaced by their
    /// keccak256 digests. This is the preimage the EntryPoint hashes in `getUserOpHash`.
    pub fn pack_without_signature(&self) -> Vec<u8> {
        encode(&[
            Token::Address(self.sender),
            Token::Uint(self.nonce),
            Token::FixedBytes(keccak256(&self.init_code).to_vec()),
            Token::FixedBytes(keccak256(&self.call_data).to_vec()),
            Token::Uint(self.call_gas_limit),
            Token::Uint(self.verification_gas_limit),
            Token::Uint(self.pre_verification_gas),
            Token::Uint(self.max_fee_per_gas),
            Token::Uint(self.max_priority_fee_per_gas),
            Token::FixedBytes(keccak256(&self.paymaster_and_data).to_vec()),
        ])
    }

    /// userOpHash as computed by `EntryPoint.getUserOpHash` on chain `chain_id`.
    pub fn hash(&self, entry_point: Address, chain_id: u64) -> H256 {
        let packed = keccak256(self.pack_without_signature());
        H256(keccak256(encode(&[
            Token::FixedBytes(packed.to_vec()),
            Token::Address(entry_point),
            Token::Uint(U256::from(chain_id)),
        ])))
    }

    /// Merges a paymaster sponsorship. Only the three gas limits and `paymasterAndData` change.
    pub fn apply_sponsorship(&mut self, sponsorship: &SponsorResult) {
        self.pre_verification_gas = sponsorship.pre_verification_gas;
        self.verification_gas_limit = sponsorship.verification_gas_limit;
        self.call_gas_limit = sponsorship.call_gas_limit;
        self.paymaster_and_data = sponsorship.paymaster_and_data.clone();
    }
}

/// Lifecycle of the single operation a run handles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationStage {
    Unsigned,
    Enriched,
    Signed,
    Submitted,
    Confirmed,
}

impl fmt::Display for OperationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationStage::Unsigned => "unsigned",
            OperationStage::Enriched => "enriched",
            OperationStage::Signed => "signed",
            OperationStage::Submitted => "submitted",
            OperationStage::Confirmed => "confirmed",
        };
        f.write_str(s)
    }
}

/// Fields returned by `pm_sponsorUserOperation`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SponsorResult {
    pub pre_verification_gas: U256,
    pub verification_gas_limit: U256,
    pub call_gas_limit: U256,
    pub paymaster_and_data: Bytes,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GasPriceTier {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

/// Result of `pimlico_getUserOperationGasPrice`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GasPrices {
    pub slow: GasPriceTier,
    pub standard: GasPriceTier,
    pub fast: GasPriceTier,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum GasSpeed {
    Slow,
    Standard,
    #[default]
    Fast,
}

impl GasPrices {
    pub fn tier(&self, speed: GasSpeed) -> GasPriceTier {
        match speed {
            GasSpeed::Slow => self.slow,
            GasSpeed::Standard => self.standard,
            GasSpeed::Fast => self.fast,
        }
    }
}

/// Result of `eth_getUserOperationReceipt` once the operation is included.
#[derive(Clone, Debug)]
pub struct UserOperationReceipt {
    pub user_op_hash: H256,
    /// `None` when the bundler leaves the flag out.
    pub success: Option<bool>,
    /// Hash of the bundle transaction that included the operation.
    pub transaction_hash: H256,
    pub raw: Value,
}
