//! Ledger data provider: the contract the scanner consumes and an
//! Etherscan-compatible HTTP client implementing it.
//!
//! The client makes exactly one attempt per call. Each failure is tagged as
//! transient or fatal through [`ProviderError::is_transient`]; retrying is the
//! caller's job (see [`crate::feed`]).

use crate::config::ProviderConfig;
use crate::schemas::{Block, BlockId};
use alloy_primitives::Address;
use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt;
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("JSON-RPC error: code={code}, message={message}")]
    JsonRpc { code: i64, message: String },

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("deserialization error: {0}")]
    Deserialize(#[from] serde_json::Error),

    #[error("missing result for {0}")]
    MissingResult(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Network hiccups, throttling and not-yet-available results are retried;
    /// everything else is fatal.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Http(_) => true,
            ProviderError::Status(code) => *code == 429 || *code >= 500,
            ProviderError::JsonRpc { code, message } => is_transient_error(*code, message),
            ProviderError::Upstream(_) | ProviderError::MissingResult(_) => true,
            // A result that does not match the schema fails the same way every time.
            ProviderError::Deserialize(_)
            | ProviderError::Rejected(_)
            | ProviderError::InvalidResponse(_) => false,
        }
    }
}

/// Message fragments Etherscan uses for throttling and overload.
const TRANSIENT_HINTS: &[&str] = &[
    "rate limit",
    "max calls",
    "timeout",
    "temporarily",
    "too busy",
    "capacity",
];

/// Whether an upstream error is worth retrying.
fn is_transient_error(code: i64, message: &str) -> bool {
    // -32005 limit exceeded, -32000/-32603 node side failures
    let message = message.to_lowercase();
    matches!(code, -32005 | -32000 | -32603)
        || TRANSIENT_HINTS.iter().any(|hint| message.contains(hint))
}

/// Rounding applied when mapping a timestamp to a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundDirection {
    Before,
    After,
}

impl fmt::Display for RoundDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundDirection::Before => write!(f, "before"),
            RoundDirection::After => write!(f, "after"),
        }
    }
}

/// Everything the scanner needs from the ledger.
#[async_trait]
pub trait LedgerProvider: Send + Sync {
    async fn block_by_number(&self, id: BlockId) -> Result<Block, ProviderError>;

    async fn block_number_by_timestamp(
        &self,
        timestamp: u64,
        direction: RoundDirection,
    ) -> Result<BlockId, ProviderError>;

    /// Hex-encoded code; `0x` for accounts that are not contracts.
    async fn code_at(&self, address: Address) -> Result<String, ProviderError>;

    /// Hex-encoded 32-byte storage word.
    async fn storage_at(&self, address: Address, slot: u32) -> Result<String, ProviderError>;
}

/// Etherscan response envelope. Proxy endpoints answer JSON-RPC style, the
/// others with `status`/`message`/`result`.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

impl Envelope {
    fn into_result<R: DeserializeOwned>(self, action: &str) -> Result<R, ProviderError> {
        if let Some(error) = self.error {
            return Err(ProviderError::JsonRpc {
                code: error.code,
                message: error.message,
            });
        }

        if self.status.as_deref() == Some("0") {
            let detail = match &self.result {
                Some(serde_json::Value::String(s)) => s.clone(),
                _ => self.message.clone().unwrap_or_default(),
            };
            if is_transient_error(0, &detail) {
                return Err(ProviderError::Upstream(detail));
            }
            return Err(ProviderError::Rejected(detail));
        }

        match self.result {
            None | Some(serde_json::Value::Null) => {
                Err(ProviderError::MissingResult(action.to_string()))
            }
            // Proxy endpoints report throttling as a bare string result.
            Some(serde_json::Value::String(s)) if s.to_lowercase().contains("rate limit") => {
                Err(ProviderError::Upstream(s))
            }
            Some(value) => Ok(serde_json::from_value(value)?),
        }
    }
}

/// Rate-limited Etherscan API client.
pub struct EtherscanClient {
    client: reqwest::Client,
    config: ProviderConfig,
    api_key: String,
    rate_limiter: RateLimiter<
        governor::state::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
}

impl EtherscanClient {
    pub fn new(config: ProviderConfig, api_key: String) -> Result<Self, ProviderError> {
        let rps = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = RateLimiter::direct(Quota::per_second(rps));

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .tcp_keepalive(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            config,
            api_key,
            rate_limiter,
        })
    }

    /// One GET against the API; no retries here.
    async fn call<R: DeserializeOwned>(
        &self,
        module: &str,
        action: &str,
        params: &[(&str, String)],
    ) -> Result<R, ProviderError> {
        self.rate_limiter.until_ready().await;

        let mut query: Vec<(&str, String)> = vec![
            ("chainid", self.config.chain_id.to_string()),
            ("module", module.to_string()),
            ("action", action.to_string()),
        ];
        query.extend(params.iter().cloned());
        query.push(("apikey", self.api_key.clone()));

        debug!("{}.{} {:?}", module, action, params);

        let response = self
            .client
            .get(&self.config.base_url)
            .query(&query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Status(status.as_u16()));
        }

        let envelope: Envelope = response.json().await?;
        envelope.into_result(action)
    }
}

#[async_trait]
impl LedgerProvider for EtherscanClient {
    async fn block_by_number(&self, id: BlockId) -> Result<Block, ProviderError> {
        self.call(
            "proxy",
            "eth_getBlockByNumber",
            &[("tag", format!("0x{:x}", id)), ("boolean", "true".into())],
        )
        .await
    }

    async fn block_number_by_timestamp(
        &self,
        timestamp: u64,
        direction: RoundDirection,
    ) -> Result<BlockId, ProviderError> {
        let result: String = self
            .call(
                "block",
                "getblocknobytime",
                &[
                    ("timestamp", timestamp.to_string()),
                    ("closest", direction.to_string()),
                ],
            )
            .await?;
        result
            .trim()
            .parse()
            .map_err(|_| ProviderError::InvalidResponse(format!("invalid block number {result:?}")))
    }

    async fn code_at(&self, address: Address) -> Result<String, ProviderError> {
        self.call(
            "proxy",
            "eth_getCode",
            &[("address", address.to_string()), ("tag", "latest".into())],
        )
        .await
    }

    async fn storage_at(&self, address: Address, slot: u32) -> Result<String, ProviderError> {
        self.call(
            "proxy",
            "eth_getStorageAt",
            &[
                ("address", address.to_string()),
                ("position", format!("0x{:x}", slot)),
                ("tag", "latest".into()),
            ],
        )
        .await
    }
}
