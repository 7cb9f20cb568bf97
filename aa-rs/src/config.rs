use anyhow::{anyhow, Context, Result};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use serde::Deserialize;
use std::{env, fs, path::Path, str::FromStr};

/// EntryPoint v0.6, same address on every chain.
pub const ENTRY_POINT_V06: &str = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789";

const PIMLICO_API: &str = "https://api.pimlico.io";
const GOERLI_EXPLORER: &str = "https://goerli.etherscan.io";

/// Built-in targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum NetworkPreset {
    /// Conduit-hosted Parallel L3 testnet.
    #[value(name = "parallel-l3-testnet")]
    ParallelL3Testnet,
    Goerli,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    /// Chain name as used in Pimlico endpoint paths.
    pub name: String,
    pub chain_id: u64,
    pub rpc_url: String,
    pub entry_point: Address,
    /// Smart account the operation is sent from.
    pub sender: Address,
    pub explorer_url: Option<String>,
}

impl NetworkPreset {
    pub fn network(self) -> Result<Network> {
        let (name, chain_id, rpc_url, sender) = match self {
            NetworkPreset::ParallelL3Testnet => (
                "parallel-l3-testnet",
                3163830386846714,
                "https://nitrorpc-compact-lime-moose-5r7g6fkl78.t.conduit.xyz",
                "0x955E79CB7cD74099C6A4BC2E86cCa312C1369BC3",
            ),
            NetworkPreset::Goerli => (
                "goerli",
                5,
                "https://rpc.ankr.com/eth_goerli",
                "0x8F77b64181feC4194711615A839D49E83614b4d6",
            ),
        };

        Ok(Network {
            name: name.to_string(),
            chain_id,
            rpc_url: rpc_url.to_string(),
            entry_point: parse_addr(ENTRY_POINT_V06).context("invalid entry point address")?,
            sender: parse_addr(sender).context("invalid sender address")?,
            // The Parallel testnet has no explorer of its own; links point at Goerli Etherscan.
            explorer_url: Some(GOERLI_EXPLORER.to_string()),
        })
    }
}

/// Custom network definition file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRaw {
    pub name: String,
    pub chain_id: u64,
    pub rpc: String,
    /// Optional name of an environment variable holding the RPC URL, so keyed URLs stay out of
    /// the file.
    #[serde(default)]
    pub rpc_env_var: Option<String>,
    #[serde(default)]
    pub entry_point: Option<String>,
    pub sender: String,
    #[serde(default)]
    pub explorer: Option<String>,
}

pub fn load_network_file(path: &Path) -> Result<Network> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read network json at {}", path.display()))?;
    let raw: NetworkRaw = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse network json at {}", path.display()))?;
    network_from_raw(raw)
}

fn network_from_raw(raw: NetworkRaw) -> Result<Network> {
    if raw.name.trim().is_empty() {
        return Err(anyhow!("network name is empty"));
    }

    let rpc_url = raw
        .rpc_env_var
        .as_ref()
        .and_then(|env_var| env::var(env_var).ok())
        .filter(|url| !url.trim().is_empty())
        .unwrap_or_else(|| raw.rpc.clone());

    let entry_point = parse_addr(raw.entry_point.as_deref().unwrap_or(ENTRY_POINT_V06))
        .context("invalid entryPoint address")?;
    let sender = parse_addr(&raw.sender).context("invalid sender address")?;

    Ok(Network {
        name: raw.name,
        chain_id: raw.chain_id,
        rpc_url,
        entry_point,
        sender,
        explorer_url: raw.explorer,
    })
}

/// Per-field overrides from the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub rpc_url: Option<String>,
    pub entry_point: Option<String>,
    pub sender: Option<String>,
    pub bundler_url: Option<String>,
    pub paymaster_url: Option<String>,
}

/// Fully resolved run configuration. Holds the API key inside the service URLs, so it does not
/// implement `Debug`.
#[derive(Clone)]
pub struct Config {
    pub network: Network,
    pub bundler_url: String,
    pub paymaster_url: String,
    pub owner: LocalWallet,
}

impl Config {
    pub fn resolve(
        mut network: Network,
        overrides: Overrides,
        api_key: Option<String>,
        owner_private_key: Option<String>,
    ) -> Result<Self> {
        if let Some(rpc) = overrides.rpc_url {
            network.rpc_url = rpc;
        }
        if let Some(ep) = overrides.entry_point.as_deref() {
            network.entry_point = parse_addr(ep).context("invalid --entry-point address")?;
        }
        if let Some(sender) = overrides.sender.as_deref() {
            network.sender = parse_addr(sender).context("invalid --sender address")?;
        }

        let api_key = api_key.filter(|k| !k.trim().is_empty());
        let bundler_url = match overrides.bundler_url {
            Some(url) => url,
            None => pimlico_bundler_url(&network.name, require_api_key(api_key.as_deref())?),
        };
        let paymaster_url = match overrides.paymaster_url {
            Some(url) => url,
            None => pimlico_paymaster_url(&network.name, require_api_key(api_key.as_deref())?),
        };

        let owner_pk = owner_private_key
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| anyhow!("missing PRIVATE_KEY (or --private-key)"))?;
        let owner = LocalWallet::from_str(owner_pk.trim())
            .context("invalid owner private key")?
            .with_chain_id(network.chain_id);

        if network.rpc_url.contains("apikey=") || network.rpc_url.contains("/v3/") {
            tracing::warn!("RPC URL looks like it may contain an API key; prefer passing it via the environment.");
        }

        Ok(Self {
            network,
            bundler_url,
            paymaster_url,
            owner,
        })
    }

    pub fn explorer_tx_url(&self, tx_hash: &str) -> Option<String> {
        self.network
            .explorer_url
            .as_ref()
            .map(|base| format!("{}/tx/{}", base.trim_end_matches('/'), tx_hash))
    }
}

fn require_api_key(api_key: Option<&str>) -> Result<&str> {
    api_key.ok_or_else(|| {
        anyhow!("missing PIMLICO_API_KEY (or --api-key); required unless both --bundler-url and --paymaster-url are given")
    })
}

/// Bundler methods live on the v1 API.
pub fn pimlico_bundler_url(chain_name: &str, api_key: &str) -> String {
    format!("{PIMLICO_API}/v1/{chain_name}/rpc?apikey={api_key}")
}

/// `pm_sponsorUserOperation` is served by the v2 API.
pub fn pimlico_paymaster_url(chain_name: &str, api_key: &str) -> String {
    format!("{PIMLICO_API}/v2/{chain_name}/rpc?apikey={api_key}")
}

pub fn parse_addr(s: &str) -> Result<Address> {
    s.trim()
        .parse::<Address>()
        .map_err(|e| anyhow!("{e}"))
}
