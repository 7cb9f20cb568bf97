use crate::encoding::{self, parse_bytes_field, parse_u256_field};
use crate::pipeline::Paymaster;
use crate::rpc::RpcHttpClient;
use crate::types::{SponsorResult, UserOperation};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ethers::types::Address;
use serde_json::Value;

/// Pimlico verifying paymaster client (`/v2` endpoint).
#[derive(Debug, Clone)]
pub struct PaymasterClient {
    rpc: RpcHttpClient,
}

impl PaymasterClient {
    pub fn new(url: String) -> Self {
        Self {
            rpc: RpcHttpClient::new(url),
        }
    }
}

#[async_trait]
impl Paymaster for PaymasterClient {
    async fn sponsor_user_operation(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<SponsorResult> {
        let params = serde_json::json!([
            encoding::user_op_to_sponsor_json(op),
            encoding::fmt_address(entry_point)
        ]);
        let res = self
            .rpc
            .request("pm_sponsorUserOperation", params)
            .await
            .context("pm_sponsorUserOperation failed")?;
        parse_sponsor_result(&res)
    }
}

fn parse_sponsor_result(result: &Value) -> Result<SponsorResult> {
    // Pimlico returns the fields at the top level. Some ERC-7677 style services nest the v0.6
    // answer under `entrypointV06Response`; accept both.
    let v06 = if result.get("paymasterAndData").is_some() {
        result
    } else {
        result
            .get("entrypointV06Response")
            .or_else(|| result.get("entryPointV06Response"))
            .ok_or_else(|| {
                anyhow!(
                    "missing paymasterAndData (expected top-level fields or entrypointV06Response)"
                )
            })?
    };

    let sponsorship = SponsorResult {
        pre_verification_gas: parse_u256_field(v06, "preVerificationGas")?,
        verification_gas_limit: parse_u256_field(v06, "verificationGasLimit")?,
        call_gas_limit: parse_u256_field(v06, "callGasLimit")?,
        paymaster_and_data: parse_bytes_field(v06, "paymasterAndData")?,
    };

    if sponsorship.paymaster_and_data.len() < 20 {
        return Err(anyhow!(
            "paymasterAndData too short to hold a paymaster address ({} bytes)",
            sponsorship.paymaster_and_data.len()
        ));
    }

    Ok(sponsorship)
}
