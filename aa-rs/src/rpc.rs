use anyhow::{anyhow, Context, Result};
use serde_json::Value;

/// Plain JSON-RPC 2.0 over HTTP POST, shared by the bundler and paymaster clients.
#[derive(Debug, Clone)]
pub struct RpcHttpClient {
    url: String,
    http: reqwest::Client,
}

impl RpcHttpClient {
    pub fn new(url: String) -> Self {
        Self {
            url,
            http: reqwest::Client::new(),
        }
    }

    /// Endpoint URL with the query string dropped. Pimlico URLs carry the API key there.
    pub fn redacted_url(&self) -> &str {
        redact_url(&self.url)
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let req = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        tracing::debug!(method, url = self.redacted_url(), "json-rpc request");

        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .with_context(|| format!("POST {} failed", self.redacted_url()))?;

        let status = resp.status();
        let body: Value = resp.json().await.context("failed to decode JSON")?;

        extract_result(status, body)
    }
}

fn extract_result(status: reqwest::StatusCode, body: Value) -> Result<Value> {
    if !status.is_success() {
        return Err(anyhow!("HTTP {}: {}", status, body));
    }

    if let Some(err) = body.get("error") {
        return Err(anyhow!("RPC error: {}", err));
    }

    body.get("result")
        .cloned()
        .ok_or_else(|| anyhow!("missing result field"))
}

pub fn redact_url(url: &str) -> &str {
    url.split_once('?').map(|(base, _)| base).unwrap_or(url)
}
