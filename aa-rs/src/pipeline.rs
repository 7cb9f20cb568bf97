//! The single linear flow: build calldata, assemble, sponsor, sign, submit, confirm.
//!
//! Every step is awaited before the next one starts and the first error aborts the run.

use crate::account::{build_unsigned_user_op, ExecuteCall};
use crate::encoding::fmt_h256;
use crate::signer::{sign_user_operation, verify_user_operation_signature};
use crate::types::{
    GasPrices, GasSpeed, OperationStage, SponsorResult, UserOperation, UserOperationReceipt,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, H256, U256};

#[async_trait]
pub trait NonceSource: Send + Sync {
    /// Current EntryPoint nonce of `sender` (key 0).
    async fn get_nonce(&self, entry_point: Address, sender: Address) -> Result<U256>;
}

#[async_trait]
pub trait Bundler: Send + Sync {
    async fn get_user_operation_gas_price(&self) -> Result<GasPrices>;

    /// Returns the userOpHash. Acceptance does not mean inclusion.
    async fn send_user_operation(&self, op: &UserOperation, entry_point: Address) -> Result<H256>;

    async fn wait_for_user_operation_receipt(
        &self,
        user_op_hash: H256,
    ) -> Result<UserOperationReceipt>;
}

#[async_trait]
pub trait Paymaster: Send + Sync {
    async fn sponsor_user_operation(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<SponsorResult>;
}

/// Everything the flow needs that does not come from a remote service.
#[derive(Clone, Debug)]
pub struct OperationRequest {
    pub chain_id: u64,
    pub entry_point: Address,
    pub sender: Address,
    pub call: ExecuteCall,
    pub gas_speed: GasSpeed,
    /// Stop after signing.
    pub dry_run: bool,
    /// Submit but do not poll for the receipt.
    pub no_wait: bool,
}

#[derive(Clone, Debug)]
pub struct PipelineReport {
    pub stage: OperationStage,
    pub call_data: Bytes,
    pub user_operation: UserOperation,
    pub user_op_hash: Option<H256>,
    pub receipt: Option<UserOperationReceipt>,
}

impl PipelineReport {
    pub fn transaction_hash(&self) -> Option<H256> {
        self.receipt.as_ref().map(|r| r.transaction_hash)
    }
}

/// Calldata, gas price and nonce combined into an unsigned operation.
pub async fn assemble_user_operation<N: NonceSource, B: Bundler>(
    req: &OperationRequest,
    nonce_source: &N,
    bundler: &B,
) -> Result<(Bytes, UserOperation)> {
    let call_data = req.call.encode()?;
    tracing::info!(call_data = %call_data, "generated callData");

    let gas_prices = bundler.get_user_operation_gas_price().await?;
    let fees = gas_prices.tier(req.gas_speed);

    let nonce = nonce_source.get_nonce(req.entry_point, req.sender).await?;
    tracing::info!(
        sender = ?req.sender,
        %nonce,
        max_fee_per_gas = %fees.max_fee_per_gas,
        max_priority_fee_per_gas = %fees.max_priority_fee_per_gas,
        "fetched nonce and gas price"
    );

    let op = build_unsigned_user_op(req.sender, nonce, call_data.clone(), fees)?;
    Ok((call_data, op))
}

pub async fn sponsor<P: Paymaster>(
    op: &mut UserOperation,
    entry_point: Address,
    paymaster: &P,
) -> Result<()> {
    let sponsorship = paymaster.sponsor_user_operation(op, entry_point).await?;
    tracing::info!(
        pre_verification_gas = %sponsorship.pre_verification_gas,
        verification_gas_limit = %sponsorship.verification_gas_limit,
        call_gas_limit = %sponsorship.call_gas_limit,
        paymaster_and_data = %sponsorship.paymaster_and_data,
        "received paymaster sponsorship"
    );
    op.apply_sponsorship(&sponsorship);
    Ok(())
}

/// Replaces the placeholder signature. No other field changes.
pub async fn sign(
    op: &mut UserOperation,
    owner: &LocalWallet,
    entry_point: Address,
    chain_id: u64,
) -> Result<()> {
    let signature = sign_user_operation(owner, op, entry_point, chain_id).await?;
    op.signature = signature;
    verify_user_operation_signature(op, entry_point, chain_id, owner.address())
        .context("signature self-check failed")?;
    tracing::info!(signature = %op.signature, "generated signature");
    Ok(())
}

pub async fn run<N, B, P>(
    req: &OperationRequest,
    owner: &LocalWallet,
    nonce_source: &N,
    bundler: &B,
    paymaster: &P,
) -> Result<PipelineReport>
where
    N: NonceSource,
    B: Bundler,
    P: Paymaster,
{
    let (call_data, mut op) = assemble_user_operation(req, nonce_source, bundler).await?;
    let mut report = PipelineReport {
        stage: OperationStage::Unsigned,
        call_data,
        user_operation: op.clone(),
        user_op_hash: None,
        receipt: None,
    };
    tracing::info!(stage = %report.stage, "operation assembled");

    sponsor(&mut op, req.entry_point, paymaster).await?;
    report.stage = OperationStage::Enriched;

    sign(&mut op, owner, req.entry_point, req.chain_id).await?;
    report.stage = OperationStage::Signed;
    report.user_operation = op.clone();

    if req.dry_run {
        tracing::info!(stage = %report.stage, "dry run: not submitting");
        return Ok(report);
    }

    let user_op_hash = bundler.send_user_operation(&op, req.entry_point).await?;
    report.stage = OperationStage::Submitted;
    report.user_op_hash = Some(user_op_hash);
    tracing::info!(user_op_hash = %fmt_h256(user_op_hash), "received userOpHash");

    if req.no_wait {
        return Ok(report);
    }

    tracing::info!("querying for receipts...");
    let receipt = bundler
        .wait_for_user_operation_receipt(user_op_hash)
        .await?;
    if receipt.success == Some(false) {
        tracing::warn!(
            transaction_hash = %fmt_h256(receipt.transaction_hash),
            "userOp was included but its execution reverted"
        );
    }
    report.stage = OperationStage::Confirmed;
    report.receipt = Some(receipt);

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{placeholder_signature, ECDSA_SIGNATURE_LEN};
    use crate::types::GasPriceTier;
    use anyhow::anyhow;
    use serde_json::json;
    use std::str::FromStr;
    use std::sync::Mutex;

    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const ENTRY_POINT: &str = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789";
    const SENDER: &str = "0x955E79CB7cD74099C6A4BC2E86cCa312C1369BC3";
    const CHAIN_ID: u64 = 3163830386846714;

    struct MockNonce(u64);

    #[async_trait]
    impl NonceSource for MockNonce {
        async fn get_nonce(&self, _entry_point: Address, _sender: Address) -> Result<U256> {
            Ok(U256::from(self.0))
        }
    }

    struct FailingNonce;

    #[async_trait]
    impl NonceSource for FailingNonce {
        async fn get_nonce(&self, _entry_point: Address, _sender: Address) -> Result<U256> {
            Err(anyhow!("entryPoint.getNonce failed: connection refused"))
        }
    }

    /// Records every call so tests can check what reached the bundler.
    #[derive(Default)]
    struct MockBundler {
        sent: Mutex<Vec<UserOperation>>,
        receipt_polls: Mutex<u32>,
    }

    fn tier(fee: u64, tip: u64) -> GasPriceTier {
        GasPriceTier {
            max_fee_per_gas: fee.into(),
            max_priority_fee_per_gas: tip.into(),
        }
    }

    #[async_trait]
    impl Bundler for MockBundler {
        async fn get_user_operation_gas_price(&self) -> Result<GasPrices> {
            Ok(GasPrices {
                slow: tier(100, 10),
                standard: tier(200, 20),
                fast: tier(300, 30),
            })
        }

        async fn send_user_operation(
            &self,
            op: &UserOperation,
            _entry_point: Address,
        ) -> Result<H256> {
            self.sent.lock().unwrap().push(op.clone());
            Ok(H256::repeat_byte(0x11))
        }

        async fn wait_for_user_operation_receipt(
            &self,
            user_op_hash: H256,
        ) -> Result<UserOperationReceipt> {
            *self.receipt_polls.lock().unwrap() += 1;
            Ok(UserOperationReceipt {
                user_op_hash,
                success: Some(true),
                transaction_hash: H256::repeat_byte(0x22),
                raw: json!({}),
            })
        }
    }

    #[derive(Default)]
    struct MockPaymaster {
        seen: Mutex<Vec<UserOperation>>,
    }

    fn sponsorship() -> SponsorResult {
        SponsorResult {
            pre_verification_gas: 50_000u64.into(),
            verification_gas_limit: 150_000u64.into(),
            call_gas_limit: 30_000u64.into(),
            paymaster_and_data: Bytes::from(vec![0xe9; 97]),
        }
    }

    #[async_trait]
    impl Paymaster for MockPaymaster {
        async fn sponsor_user_operation(
            &self,
            op: &UserOperation,
            _entry_point: Address,
        ) -> Result<SponsorResult> {
            self.seen.lock().unwrap().push(op.clone());
            Ok(sponsorship())
        }
    }

    fn request() -> OperationRequest {
        OperationRequest {
            chain_id: CHAIN_ID,
            entry_point: ENTRY_POINT.parse().unwrap(),
            sender: SENDER.parse().unwrap(),
            call: ExecuteCall {
                dest: "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045".parse().unwrap(),
                value: U256::zero(),
                func: "0x68656c6c6f".parse().unwrap(),
            },
            gas_speed: GasSpeed::Fast,
            dry_run: false,
            no_wait: false,
        }
    }

    fn owner() -> LocalWallet {
        LocalWallet::from_str(TEST_KEY).unwrap()
    }

    #[tokio::test]
    async fn end_to_end_with_mocked_services() {
        let bundler = MockBundler::default();
        let paymaster = MockPaymaster::default();
        let req = request();

        let report = run(&req, &owner(), &MockNonce(7), &bundler, &paymaster)
            .await
            .unwrap();

        assert_eq!(report.stage, OperationStage::Confirmed);
        assert_eq!(report.user_op_hash, Some(H256::repeat_byte(0x11)));
        assert_eq!(report.transaction_hash(), Some(H256::repeat_byte(0x22)));
        assert_eq!(*bundler.receipt_polls.lock().unwrap(), 1);

        // The paymaster saw the unsigned operation with the placeholder signature.
        let seen = paymaster.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].nonce, U256::from(7u64));
        assert_eq!(seen[0].signature, placeholder_signature().unwrap());
        assert_eq!(seen[0].max_fee_per_gas, U256::from(300u64));
        assert_eq!(seen[0].max_priority_fee_per_gas, U256::from(30u64));

        let sent = bundler.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let op = &sent[0];
        assert_eq!(op, &report.user_operation);
        assert_eq!(op.call_data, report.call_data);
        assert_eq!(op.paymaster_and_data, sponsorship().paymaster_and_data);
        assert_eq!(op.signature.len(), ECDSA_SIGNATURE_LEN);
        verify_user_operation_signature(op, req.entry_point, CHAIN_ID, owner().address())
            .unwrap();

        // Signing touched nothing but the signature.
        let mut expected = seen[0].clone();
        expected.apply_sponsorship(&sponsorship());
        expected.signature = op.signature.clone();
        assert_eq!(op, &expected);
    }

    #[tokio::test]
    async fn gas_speed_selects_tier() {
        let bundler = MockBundler::default();
        let req = OperationRequest {
            gas_speed: GasSpeed::Slow,
            ..request()
        };
        let (_, op) = assemble_user_operation(&req, &MockNonce(0), &bundler)
            .await
            .unwrap();
        assert_eq!(op.max_fee_per_gas, U256::from(100u64));
        assert_eq!(op.max_priority_fee_per_gas, U256::from(10u64));
    }

    #[tokio::test]
    async fn dry_run_stops_after_signing() {
        let bundler = MockBundler::default();
        let req = OperationRequest {
            dry_run: true,
            ..request()
        };
        let report = run(&req, &owner(), &MockNonce(7), &bundler, &MockPaymaster::default())
            .await
            .unwrap();

        assert_eq!(report.stage, OperationStage::Signed);
        assert!(report.user_op_hash.is_none());
        assert!(bundler.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_wait_skips_receipt_polling() {
        let bundler = MockBundler::default();
        let req = OperationRequest {
            no_wait: true,
            ..request()
        };
        let report = run(&req, &owner(), &MockNonce(7), &bundler, &MockPaymaster::default())
            .await
            .unwrap();

        assert_eq!(report.stage, OperationStage::Submitted);
        assert!(report.transaction_hash().is_none());
        assert_eq!(*bundler.receipt_polls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn first_failure_aborts_before_later_steps() {
        let bundler = MockBundler::default();
        let paymaster = MockPaymaster::default();
        let err = run(&request(), &owner(), &FailingNonce, &bundler, &paymaster)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("getNonce"));
        assert!(paymaster.seen.lock().unwrap().is_empty());
        assert!(bundler.sent.lock().unwrap().is_empty());
    }
}
