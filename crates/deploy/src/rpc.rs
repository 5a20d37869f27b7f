//! Shared RPC utilities for interacting with Ethereum JSON-RPC endpoints.

use std::{future::Future, time::Duration};

use alloy_core::primitives::{Address, B256, Bytes};
use anyhow::Context;
use backon::{ConstantBuilder, Retryable};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de::DeserializeOwned};
use serde_json::Value;
use url::Url;

/// Default timeout for RPC requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Create an HTTP client configured for JSON-RPC requests.
pub fn create_client() -> Result<reqwest::Client, anyhow::Error> {
    create_client_with_timeout(DEFAULT_TIMEOUT)
}

/// Create an HTTP client with a custom per-request timeout.
pub fn create_client_with_timeout(timeout: Duration) -> Result<reqwest::Client, anyhow::Error> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to create HTTP client")
}

/// Make a JSON-RPC call and deserialize the result.
///
/// # Arguments
/// * `client` - The HTTP client to use
/// * `url` - The RPC endpoint URL
/// * `method` - The RPC method name
/// * `params` - The method parameters
///
/// # Returns
/// The deserialized result, or an error if the request failed or returned an error response.
pub async fn json_rpc_call<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    method: &str,
    params: Vec<Value>,
) -> Result<T, anyhow::Error> {
    let response = client
        .post(url)
        .json(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        }))
        .send()
        .await
        .with_context(|| format!("Failed to send {} request", method))?;

    let result: Value = response
        .json()
        .await
        .with_context(|| format!("Failed to parse {} response", method))?;

    if let Some(error) = result.get("error") {
        anyhow::bail!(
            "RPC error: {}",
            error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown")
        );
    }

    let result_value = result
        .get("result")
        .context("No result in response")?
        .clone();

    serde_json::from_value(result_value)
        .with_context(|| format!("Failed to deserialize {} result", method))
}

/// Deserialize a u64 from a hex quantity string (with 0x prefix).
pub(crate) fn deserialize_u64_from_hex<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_hex_u64(&s).map_err(serde::de::Error::custom)
}

fn deserialize_opt_u64_from_hex<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|s| parse_hex_u64(&s).map_err(serde::de::Error::custom))
        .transpose()
}

fn serialize_opt_u64_as_hex<S>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(v) => serializer.serialize_str(&format!("0x{:x}", v)),
        None => serializer.serialize_none(),
    }
}

/// Parse a `0x`-prefixed hex quantity.
pub fn parse_hex_u64(s: &str) -> Result<u64, std::num::ParseIntError> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
}

/// Header fields of a block returned by `eth_getBlockByNumber`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    #[serde(deserialize_with = "deserialize_u64_from_hex")]
    pub number: u64,
    #[serde(deserialize_with = "deserialize_u64_from_hex")]
    pub gas_limit: u64,
    #[serde(deserialize_with = "deserialize_u64_from_hex")]
    pub timestamp: u64,
}

/// A transaction submitted through a node-managed account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransactionRequest {
    pub from: Address,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<Address>,
    pub data: Bytes,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_opt_u64_as_hex"
    )]
    pub gas: Option<u64>,
}

impl TransactionRequest {
    /// A contract-creation transaction carrying `bytecode` with an explicit gas limit.
    pub fn create(from: Address, bytecode: Bytes, gas: u64) -> Self {
        Self {
            from,
            to: None,
            data: bytecode,
            gas: Some(gas),
        }
    }

    /// A call to `to` with the given calldata.
    pub fn call(from: Address, to: Address, data: Bytes) -> Self {
        Self {
            from,
            to: Some(to),
            data,
            gas: None,
        }
    }
}

/// Receipt of a mined transaction.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction_hash: B256,
    #[serde(default)]
    pub contract_address: Option<Address>,
    #[serde(deserialize_with = "deserialize_u64_from_hex")]
    pub gas_used: u64,
    /// Post-byzantium status (1 success, 0 revert). Older backends omit it.
    #[serde(default, deserialize_with = "deserialize_opt_u64_from_hex")]
    pub status: Option<u64>,
}

impl TransactionReceipt {
    pub fn succeeded(&self) -> bool {
        self.status.is_none_or(|status| status == 1)
    }
}

/// The subset of the Ethereum JSON-RPC API the orchestrator relies on.
///
/// Implementations must be cheap to clone: the interaction client handed back to callers
/// keeps its own copy.
pub trait ChainRpc: Clone + Send + Sync + 'static {
    /// The endpoint this client talks to, for logs and error messages.
    fn endpoint(&self) -> &str;

    fn chain_id(&self) -> impl Future<Output = anyhow::Result<u64>> + Send;

    fn block_number(&self) -> impl Future<Output = anyhow::Result<u64>> + Send;

    /// Node-managed (unlocked) accounts.
    fn accounts(&self) -> impl Future<Output = anyhow::Result<Vec<Address>>> + Send;

    fn latest_block(&self) -> impl Future<Output = anyhow::Result<BlockHeader>> + Send;

    fn send_transaction(
        &self,
        tx: &TransactionRequest,
    ) -> impl Future<Output = anyhow::Result<B256>> + Send;

    fn transaction_receipt(
        &self,
        hash: B256,
    ) -> impl Future<Output = anyhow::Result<Option<TransactionReceipt>>> + Send;

    fn call(&self, tx: &TransactionRequest) -> impl Future<Output = anyhow::Result<Bytes>> + Send;
}

/// [`ChainRpc`] over HTTP JSON-RPC.
#[derive(Debug, Clone)]
pub struct HttpChainRpc {
    client: reqwest::Client,
    url: Url,
}

impl HttpChainRpc {
    pub fn new(url: Url) -> anyhow::Result<Self> {
        Ok(Self {
            client: create_client()?,
            url,
        })
    }

    pub fn with_timeout(url: Url, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: create_client_with_timeout(timeout)?,
            url,
        })
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> anyhow::Result<T> {
        json_rpc_call(&self.client, self.url.as_str(), method, params).await
    }
}

impl ChainRpc for HttpChainRpc {
    fn endpoint(&self) -> &str {
        self.url.as_str()
    }

    async fn chain_id(&self) -> anyhow::Result<u64> {
        let result: String = self.request("eth_chainId", vec![]).await?;
        parse_hex_u64(&result).context("Invalid eth_chainId result")
    }

    async fn block_number(&self) -> anyhow::Result<u64> {
        let result: String = self.request("eth_blockNumber", vec![]).await?;
        parse_hex_u64(&result).context("Invalid eth_blockNumber result")
    }

    async fn accounts(&self) -> anyhow::Result<Vec<Address>> {
        self.request("eth_accounts", vec![]).await
    }

    async fn latest_block(&self) -> anyhow::Result<BlockHeader> {
        let block: Option<BlockHeader> = self
            .request(
                "eth_getBlockByNumber",
                vec![serde_json::json!("latest"), serde_json::json!(false)],
            )
            .await?;
        block.context("Backend returned no latest block")
    }

    async fn send_transaction(&self, tx: &TransactionRequest) -> anyhow::Result<B256> {
        let tx = serde_json::to_value(tx).context("Failed to serialize transaction")?;
        self.request("eth_sendTransaction", vec![tx]).await
    }

    async fn transaction_receipt(&self, hash: B256) -> anyhow::Result<Option<TransactionReceipt>> {
        self.request("eth_getTransactionReceipt", vec![serde_json::json!(hash)])
            .await
    }

    async fn call(&self, tx: &TransactionRequest) -> anyhow::Result<Bytes> {
        let tx = serde_json::to_value(tx).context("Failed to serialize call")?;
        self.request("eth_call", vec![tx, serde_json::json!("latest")])
            .await
    }
}

/// Poll for a transaction receipt, at most `attempts` times, `interval` apart.
pub async fn wait_for_receipt<R: ChainRpc>(
    rpc: &R,
    hash: B256,
    attempts: usize,
    interval: Duration,
) -> anyhow::Result<TransactionReceipt> {
    let fetch = move || async move {
        rpc.transaction_receipt(hash)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Receipt for {} not available yet", hash))
    };

    fetch
        .retry(
            ConstantBuilder::default()
                .with_delay(interval)
                .with_max_times(attempts.saturating_sub(1)),
        )
        .notify(|err, _| {
            tracing::trace!(error = %err, tx_hash = %hash, "Waiting for receipt, retrying...");
        })
        .await
        .with_context(|| format!("No receipt for {} after {} polls", hash, attempts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_block_header() {
        let header: BlockHeader = serde_json::from_value(serde_json::json!({
            "number": "0x1b4",
            "gasLimit": "0x7a1200",
            "timestamp": "0x6553f100",
            "hash": "0x0000000000000000000000000000000000000000000000000000000000000001"
        }))
        .unwrap();

        assert_eq!(header.number, 436);
        assert_eq!(header.gas_limit, 8_000_000);
        assert_eq!(header.timestamp, 0x6553f100);
    }

    #[test]
    fn test_parse_receipt_with_and_without_status() {
        let hash = "0x00000000000000000000000000000000000000000000000000000000000000aa";
        let receipt: TransactionReceipt = serde_json::from_value(serde_json::json!({
            "transactionHash": hash,
            "contractAddress": "0x5fbdb2315678afecb367f032d93f642f64180aa3",
            "gasUsed": "0x5208",
            "status": "0x0"
        }))
        .unwrap();
        assert_eq!(receipt.gas_used, 21_000);
        assert!(!receipt.succeeded());

        let legacy: TransactionReceipt = serde_json::from_value(serde_json::json!({
            "transactionHash": hash,
            "contractAddress": null,
            "gasUsed": "0x1"
        }))
        .unwrap();
        assert!(legacy.succeeded());
        assert!(legacy.contract_address.is_none());
    }

    #[test]
    fn test_transaction_request_serialization() {
        let tx =
            TransactionRequest::create(Address::ZERO, Bytes::from(vec![0x60, 0x80]), 6_400_000);
        let value = serde_json::to_value(&tx).unwrap();

        assert_eq!(value["gas"], "0x61a800");
        assert_eq!(value["data"], "0x6080");
        assert!(value.get("to").is_none());
    }
}
