mod account;
mod bundler;
mod config;
mod encoding;
mod paymaster;
mod pipeline;
mod rpc;
mod signer;
mod types;

use account::{ensure_chain_id, EntryPointNonce, ExecuteCall};
use anyhow::{Context, Result};
use bundler::BundlerClient;
use clap::Parser;
use config::{load_network_file, parse_addr, Config, NetworkPreset, Overrides};
use ethers::prelude::*;
use paymaster::PaymasterClient;
use pipeline::OperationRequest;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use types::{GasSpeed, OperationStage};

#[derive(Parser, Debug)]
#[command(
    name = "sponsored-userop",
    version,
    about = "Build, sponsor, sign and submit one ERC-4337 UserOperation via Pimlico"
)]
struct Cli {
    /// Built-in target network.
    #[arg(long, value_enum, default_value_t = NetworkPreset::ParallelL3Testnet)]
    network: NetworkPreset,

    /// Custom network definition (JSON: name, chainId, rpc, sender, optional rpcEnvVar,
    /// entryPoint, explorer). Takes precedence over --network.
    #[arg(long)]
    network_file: Option<PathBuf>,

    /// Override the chain RPC URL.
    #[arg(long, env = "AA_RPC_URL")]
    rpc_url: Option<String>,

    /// Override the EntryPoint address.
    #[arg(long)]
    entry_point: Option<String>,

    /// Override the smart account (sender) address.
    #[arg(long)]
    sender: Option<String>,

    /// Bundler RPC URL. Defaults to the Pimlico v1 endpoint for the network.
    #[arg(long, env = "AA_BUNDLER_URL")]
    bundler_url: Option<String>,

    /// Paymaster RPC URL. Defaults to the Pimlico v2 endpoint for the network.
    #[arg(long, env = "AA_PAYMASTER_URL")]
    paymaster_url: Option<String>,

    /// Pimlico API key.
    #[arg(long, env = "PIMLICO_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Private key of the EOA that owns the smart account.
    #[arg(long, env = "PRIVATE_KEY", hide_env_values = true)]
    private_key: Option<String>,

    /// Call target.
    #[arg(long, default_value = "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045")]
    to: String,

    /// Wei sent with the call (decimal).
    #[arg(long, default_value = "0")]
    value: String,

    /// Call data ("hello" by default).
    #[arg(long, default_value = "0x68656c6c6f")]
    data: String,

    /// Which tier of the bundler's gas price suggestion to use.
    #[arg(long, value_enum, default_value_t = GasSpeed::Fast)]
    gas_tier: GasSpeed,

    /// Receipt polling interval in milliseconds (minimum 100; lower values are raised).
    #[arg(long, default_value_t = 1500)]
    poll_interval_ms: u64,

    /// Max seconds to wait for the userOp receipt. Use 0 to disable timeout.
    #[arg(long, default_value_t = 180)]
    max_wait_seconds: u64,

    /// Do not send the UserOperation; only build, sponsor and sign it.
    #[arg(long)]
    dry_run: bool,

    /// Do not wait for the userOp receipt.
    #[arg(long)]
    no_wait: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Values in .env win over the inherited environment.
    dotenvy::dotenv_override().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        // Logs go to stderr; stdout carries the results.
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let network = match cli.network_file.as_ref() {
        Some(path) => load_network_file(path)?,
        None => cli.network.network()?,
    };

    let overrides = Overrides {
        rpc_url: cli.rpc_url.clone(),
        entry_point: cli.entry_point.clone(),
        sender: cli.sender.clone(),
        bundler_url: cli.bundler_url.clone(),
        paymaster_url: cli.paymaster_url.clone(),
    };
    let cfg = Config::resolve(
        network,
        overrides,
        cli.api_key.clone(),
        cli.private_key.clone(),
    )?;

    let call = ExecuteCall {
        dest: parse_addr(&cli.to).context("invalid --to address")?,
        value: U256::from_dec_str(&cli.value)
            .with_context(|| format!("invalid --value (expected integer wei): {}", cli.value))?,
        func: encoding::parse_bytes(&cli.data).context("invalid --data")?,
    };

    tracing::info!(
        network = %cfg.network.name,
        chain_id = cfg.network.chain_id,
        entry_point = ?cfg.network.entry_point,
        sender = ?cfg.network.sender,
        owner = ?cfg.owner.address(),
        dry_run = cli.dry_run,
        "resolved configuration"
    );

    let provider = Provider::<Http>::try_from(cfg.network.rpc_url.as_str())
        .with_context(|| format!("invalid RPC URL {}", cfg.network.rpc_url))?;
    ensure_chain_id(&provider, cfg.network.chain_id).await?;

    let nonce_source = EntryPointNonce::new(Arc::new(provider));
    let bundler = BundlerClient::new(cfg.bundler_url.clone()).with_polling(
        Duration::from_millis(cli.poll_interval_ms),
        Duration::from_secs(cli.max_wait_seconds),
    );
    let paymaster = PaymasterClient::new(cfg.paymaster_url.clone());

    let req = OperationRequest {
        chain_id: cfg.network.chain_id,
        entry_point: cfg.network.entry_point,
        sender: cfg.network.sender,
        call,
        gas_speed: cli.gas_tier,
        dry_run: cli.dry_run,
        no_wait: cli.no_wait,
    };

    let report = pipeline::run(&req, &cfg.owner, &nonce_source, &bundler, &paymaster).await?;

    println!("Generated callData: {}", encoding::fmt_bytes(&report.call_data));
    println!(
        "\nUserOperation ({}):\n{}",
        report.stage,
        serde_json::to_string_pretty(&encoding::user_op_to_json(&report.user_operation))?
    );

    if report.stage == OperationStage::Signed {
        println!("\n--dry-run set: not sending user operation.");
        return Ok(());
    }

    if let Some(user_op_hash) = report.user_op_hash {
        println!("\nReceived User Operation hash: {}", encoding::fmt_h256(user_op_hash));
    }

    let Some(tx_hash) = report.transaction_hash() else {
        println!("--no-wait set: not waiting for receipt.");
        return Ok(());
    };

    if let Some(receipt) = report.receipt.as_ref() {
        tracing::debug!(
            user_op_hash = %encoding::fmt_h256(receipt.user_op_hash),
            "receipt received"
        );
        println!(
            "\nUserOp receipt:\n{}",
            serde_json::to_string_pretty(&receipt.raw)?
        );
    }

    let tx_hash = encoding::fmt_h256(tx_hash);
    match cfg.explorer_tx_url(&tx_hash) {
        Some(url) => println!("\nUserOperation included: {url}"),
        None => println!("\nUserOperation included in transaction {tx_hash}"),
    }

    Ok(())
}
