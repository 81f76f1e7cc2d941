use crate::config::Commitment;
use crate::error::ProbeError;
use crate::probe::PollTransport;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;
use url::Url;

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcReply<T> {
    result: Option<T>,
    error: Option<RpcErrorObject>,
}

impl<T> RpcReply<T> {
    fn into_result(self) -> Result<T> {
        if let Some(error) = self.error {
            return Err(ProbeError::Rpc {
                code: error.code,
                message: error.message,
            }
            .into());
        }
        self.result
            .ok_or_else(|| anyhow!("JSON-RPC reply carries neither result nor error"))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureInfo {
    pub signature: String,
    #[serde(default)]
    pub slot: u64,
}

pub fn signatures_request(id: u64, account: &str, commitment: Commitment) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "getSignaturesForAddress",
        "params": [
            account,
            { "commitment": commitment.as_str(), "limit": 1 }
        ]
    })
}

/// Polls `getSignaturesForAddress` over JSON-RPC, cycling through the tracked accounts.
pub struct HttpCalls {
    client: reqwest::Client,
    url: String,
    endpoint: Option<Url>,
    accounts: Vec<String>,
    commitment: Commitment,
    next_id: u64,
}

impl HttpCalls {
    pub fn new(url: impl Into<String>, accounts: Vec<String>, commitment: Commitment) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            endpoint: None,
            accounts,
            commitment,
            next_id: 0,
        }
    }

    async fn request<T: DeserializeOwned>(&self, endpoint: Url, body: &Value) -> Result<T> {
        let reply: RpcReply<T> = self
            .client
            .post(endpoint)
            .json(body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        reply.into_result()
    }
}

#[async_trait]
impl PollTransport for HttpCalls {
    async fn connect(&mut self) -> Result<()> {
        let endpoint = Url::parse(&self.url)?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            anyhow::bail!("unsupported scheme for HTTP RPC: {}", endpoint.scheme());
        }
        if self.accounts.is_empty() {
            anyhow::bail!("no accounts to query");
        }
        self.endpoint = Some(endpoint);
        Ok(())
    }

    async fn call(&mut self) -> Result<String> {
        let endpoint = self
            .endpoint
            .clone()
            .ok_or_else(|| anyhow!("HTTP RPC client not connected"))?;
        let account = &self.accounts[self.next_id as usize % self.accounts.len()];
        self.next_id += 1;

        let body = signatures_request(self.next_id, account, self.commitment);
        let signatures: Vec<SignatureInfo> = self.request(endpoint, &body).await?;
        debug!("{} signature(s) returned for {}", signatures.len(), account);

        Ok(match signatures.first() {
            Some(latest) => format!(
                "latest signature for {} is {} (slot {})",
                account, latest.signature, latest.slot
            ),
            None => format!("no signatures for {}", account),
        })
    }
}
