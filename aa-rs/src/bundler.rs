use crate::encoding::{self, parse_h256, parse_u256_field};
use crate::pipeline::Bundler;
use crate::rpc::RpcHttpClient;
use crate::types::{GasPriceTier, GasPrices, UserOperation, UserOperationReceipt};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ethers::types::{Address, H256};
use serde_json::Value;
use std::time::{Duration, Instant};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1500);
pub const DEFAULT_RECEIPT_TIMEOUT: Duration = Duration::from_secs(180);
/// Shorter polling intervals are raised to this.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// ERC-4337 bundler client with the Pimlico gas price extension.
#[derive(Debug, Clone)]
pub struct BundlerClient {
    rpc: RpcHttpClient,
    poll_interval: Duration,
    /// Zero disables the timeout.
    receipt_timeout: Duration,
}

impl BundlerClient {
    pub fn new(url: String) -> Self {
        Self {
            rpc: RpcHttpClient::new(url),
            poll_interval: DEFAULT_POLL_INTERVAL,
            receipt_timeout: DEFAULT_RECEIPT_TIMEOUT,
        }
    }

    pub fn with_polling(mut self, poll_interval: Duration, receipt_timeout: Duration) -> Self {
        self.poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        self.receipt_timeout = receipt_timeout;
        self
    }

    /// `None` until the operation has been included.
    pub async fn get_user_operation_receipt(
        &self,
        user_op_hash: H256,
    ) -> Result<Option<UserOperationReceipt>> {
        let params = serde_json::json!([encoding::fmt_h256(user_op_hash)]);
        let res = self
            .rpc
            .request("eth_getUserOperationReceipt", params)
            .await
            .context("eth_getUserOperationReceipt failed")?;
        if res.is_null() {
            return Ok(None);
        }
        parse_receipt(user_op_hash, res).map(Some)
    }
}

#[async_trait]
impl Bundler for BundlerClient {
    async fn get_user_operation_gas_price(&self) -> Result<GasPrices> {
        let res = self
            .rpc
            .request("pimlico_getUserOperationGasPrice", serde_json::json!([]))
            .await
            .context("pimlico_getUserOperationGasPrice failed")?;
        parse_gas_prices(&res)
    }

    async fn send_user_operation(&self, op: &UserOperation, entry_point: Address) -> Result<H256> {
        let params = serde_json::json!([
            encoding::user_op_to_json(op),
            encoding::fmt_address(entry_point)
        ]);
        let res = self
            .rpc
            .request("eth_sendUserOperation", params)
            .await
            .context("eth_sendUserOperation failed")?;
        parse_userop_hash(&res)
    }

    /// Poll until the receipt shows up. Any RPC error ends the wait.
    async fn wait_for_user_operation_receipt(
        &self,
        user_op_hash: H256,
    ) -> Result<UserOperationReceipt> {
        let start = Instant::now();
        loop {
            if let Some(receipt) = self.get_user_operation_receipt(user_op_hash).await? {
                return Ok(receipt);
            }

            if !self.receipt_timeout.is_zero() && start.elapsed() > self.receipt_timeout {
                return Err(anyhow!(
                    "timed out waiting for userOp receipt after {:?}",
                    self.receipt_timeout
                ));
            }

            tracing::debug!(
                user_op_hash = %encoding::fmt_h256(user_op_hash),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "receipt not available yet"
            );
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

fn parse_gas_tier(v: &Value, tier: &str) -> Result<GasPriceTier> {
    let t = v
        .get(tier)
        .ok_or_else(|| anyhow!("missing gas price tier {tier}"))?;
    Ok(GasPriceTier {
        max_fee_per_gas: parse_u256_field(t, "maxFeePerGas")
            .with_context(|| format!("gas price tier {tier}"))?,
        max_priority_fee_per_gas: parse_u256_field(t, "maxPriorityFeePerGas")
            .with_context(|| format!("gas price tier {tier}"))?,
    })
}

fn parse_gas_prices(res: &Value) -> Result<GasPrices> {
    Ok(GasPrices {
        slow: parse_gas_tier(res, "slow")?,
        standard: parse_gas_tier(res, "standard")?,
        fast: parse_gas_tier(res, "fast")?,
    })
}

fn parse_userop_hash(res: &Value) -> Result<H256> {
    // Most bundlers return the userOpHash directly as a JSON string; a few wrap it in an object.
    let hash_str = if let Some(s) = res.as_str() {
        s
    } else if let Some(s) = res.get("result").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOpHash").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOperationHash").and_then(|v| v.as_str()) {
        s
    } else {
        return Err(anyhow!(
            "unexpected eth_sendUserOperation result shape (expected string or {{result: ...}}): {}",
            res
        ));
    };

    parse_h256(hash_str)
}

fn parse_receipt(user_op_hash: H256, res: Value) -> Result<UserOperationReceipt> {
    let tx_hash = res
        .get("receipt")
        .and_then(|r| r.get("transactionHash"))
        .and_then(|h| h.as_str())
        .ok_or_else(|| anyhow!("userOp receipt has no receipt.transactionHash: {}", res))?;
    let transaction_hash = parse_h256(tx_hash).context("invalid receipt.transactionHash")?;
    if transaction_hash.is_zero() {
        return Err(anyhow!("userOp receipt has an empty transaction hash"));
    }

    let success = res.get("success").and_then(|s| s.as_bool());

    Ok(UserOperationReceipt {
        user_op_hash,
        success,
        transaction_hash,
        raw: res,
    })
}
