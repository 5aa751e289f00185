use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

const RPC_TIMEOUT: Duration = Duration::from_secs(30);

// Node error code for "still warming up"; worth waiting out, unlike wallet
// and policy rejections.
const RPC_IN_WARMUP: i64 = -28;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("node transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("node rejected {method}: {message} (code {code})")]
    Node { method: String, code: i64, message: String },
    #[error("malformed node response to {method}: {reason}")]
    Malformed { method: String, reason: String },
}

impl RpcError {
    /// Whether retrying with backoff is worthwhile: connection trouble, a
    /// node still warming up, or a congested mempool. Policy rejections and
    /// missing funds are permanent for the current anchor attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            RpcError::Transport(_) => true,
            RpcError::Node { code, message, .. } => {
                *code == RPC_IN_WARMUP || message.contains("mempool full")
            }
            RpcError::Malformed { .. } => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainInfo {
    pub chain: String,
    pub blocks: u64,
}

#[derive(Debug, Clone)]
pub struct Unspent {
    pub txid: String,
    pub vout: u32,
    /// Satoshis.
    pub value: u64,
}

#[derive(Debug, Clone)]
pub struct WalletTx {
    pub confirmations: i64,
    pub block_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WalletTxSummary {
    pub txid: String,
    pub confirmations: i64,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub height: usize,
    pub merkle_root_hex: String,
    pub txids: Vec<String>,
}

/// The slice of the node wallet RPC the stamper needs. Kept as a trait so the
/// anchoring state machine can be driven against a scripted node in tests.
#[async_trait]
pub trait BitcoinRpc: Send + Sync {
    async fn chain_info(&self) -> Result<ChainInfo, RpcError>;
    async fn list_unspent(&self, min_confirmations: u32) -> Result<Vec<Unspent>, RpcError>;
    async fn list_recent_transactions(&self, count: usize)
        -> Result<Vec<WalletTxSummary>, RpcError>;
    /// Raw serialized transaction; may carry witness data.
    async fn raw_transaction(&self, txid: &str) -> Result<Vec<u8>, RpcError>;
    async fn sign_raw_transaction(&self, tx_hex: &str) -> Result<String, RpcError>;
    /// Returns the txid as displayed by the node.
    async fn send_raw_transaction(&self, tx_hex: &str) -> Result<String, RpcError>;
    /// None when the wallet does not know the transaction.
    async fn wallet_transaction(&self, txid: &str) -> Result<Option<WalletTx>, RpcError>;
    async fn block(&self, hash: &str) -> Result<Block, RpcError>;
    /// Estimated feerate in sat/vB for the given confirmation target, if the
    /// node has enough data.
    async fn estimate_fee_rate(&self, conf_target: u16) -> Result<Option<u64>, RpcError>;
}

/// JSON-RPC client for a Bitcoin Core node with wallet enabled.
pub struct CoreRpc {
    client: reqwest::Client,
    url: String,
    user: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    result: Option<Value>,
    error: Option<RpcFailure>,
}

#[derive(Debug, Deserialize)]
struct RpcFailure {
    code: i64,
    message: String,
}

fn btc_to_sats(amount: f64) -> u64 {
    (amount * 1e8).round() as u64
}

impl CoreRpc {
    pub fn new(url: String, user: String, password: String) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder().timeout(RPC_TIMEOUT).build()?;
        Ok(CoreRpc { client, url, user, password })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": env!("CARGO_PKG_NAME"),
            "method": method,
            "params": params,
        });
        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await?;
        let envelope: RpcEnvelope = response.json().await?;
        if let Some(failure) = envelope.error {
            return Err(RpcError::Node {
                method: method.to_string(),
                code: failure.code,
                message: failure.message,
            });
        }
        let result = envelope.result.ok_or_else(|| RpcError::Malformed {
            method: method.to_string(),
            reason: "neither result nor error present".into(),
        })?;
        serde_json::from_value(result).map_err(|e| RpcError::Malformed {
            method: method.to_string(),
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct UnspentEntry {
    txid: String,
    vout: u32,
    amount: f64,
    #[serde(default)]
    spendable: bool,
}

#[derive(Debug, Deserialize)]
struct SignResult {
    hex: String,
    complete: bool,
}

#[derive(Debug, Deserialize)]
struct WalletTxEntry {
    confirmations: i64,
    blockhash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListTxEntry {
    txid: String,
    confirmations: i64,
}

#[derive(Debug, Deserialize)]
struct BlockEntry {
    height: usize,
    merkleroot: String,
    tx: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EstimateResult {
    feerate: Option<f64>,
}

#[async_trait]
impl BitcoinRpc for CoreRpc {
    async fn chain_info(&self) -> Result<ChainInfo, RpcError> {
        self.call("getblockchaininfo", json!([])).await
    }

    async fn list_unspent(&self, min_confirmations: u32) -> Result<Vec<Unspent>, RpcError> {
        let entries: Vec<UnspentEntry> =
            self.call("listunspent", json!([min_confirmations])).await?;
        Ok(entries
            .into_iter()
            .filter(|e| e.spendable)
            .map(|e| Unspent { txid: e.txid, vout: e.vout, value: btc_to_sats(e.amount) })
            .collect())
    }

    async fn list_recent_transactions(
        &self,
        count: usize,
    ) -> Result<Vec<WalletTxSummary>, RpcError> {
        let entries: Vec<ListTxEntry> =
            self.call("listtransactions", json!(["*", count])).await?;
        Ok(entries
            .into_iter()
            .map(|e| WalletTxSummary { txid: e.txid, confirmations: e.confirmations })
            .collect())
    }

    async fn raw_transaction(&self, txid: &str) -> Result<Vec<u8>, RpcError> {
        let tx_hex: String = self.call("getrawtransaction", json!([txid])).await?;
        hex::decode(&tx_hex).map_err(|e| RpcError::Malformed {
            method: "getrawtransaction".into(),
            reason: e.to_string(),
        })
    }

    async fn sign_raw_transaction(&self, tx_hex: &str) -> Result<String, RpcError> {
        let signed: SignResult =
            self.call("signrawtransactionwithwallet", json!([tx_hex])).await?;
        if !signed.complete {
            return Err(RpcError::Node {
                method: "signrawtransactionwithwallet".into(),
                code: 0,
                message: "wallet could not fully sign the transaction".into(),
            });
        }
        Ok(signed.hex)
    }

    async fn send_raw_transaction(&self, tx_hex: &str) -> Result<String, RpcError> {
        self.call("sendrawtransaction", json!([tx_hex])).await
    }

    async fn wallet_transaction(&self, txid: &str) -> Result<Option<WalletTx>, RpcError> {
        match self.call::<WalletTxEntry>("gettransaction", json!([txid])).await {
            Ok(entry) => Ok(Some(WalletTx {
                confirmations: entry.confirmations,
                block_hash: entry.blockhash,
            })),
            // -5: invalid or non-wallet transaction id
            Err(RpcError::Node { code: -5, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn block(&self, hash: &str) -> Result<Block, RpcError> {
        let entry: BlockEntry = self.call("getblock", json!([hash, 1])).await?;
        Ok(Block { height: entry.height, merkle_root_hex: entry.merkleroot, txids: entry.tx })
    }

    async fn estimate_fee_rate(&self, conf_target: u16) -> Result<Option<u64>, RpcError> {
        let estimate: EstimateResult =
            self.call("estimatesmartfee", json!([conf_target])).await?;
        // feerate comes back in BTC/kvB.
        Ok(estimate.feerate.map(|rate| ((rate * 1e8) / 1000.0).round() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amounts_convert_to_whole_satoshis() {
        assert_eq!(btc_to_sats(0.00015), 15_000);
        assert_eq!(btc_to_sats(1.0), 100_000_000);
        assert_eq!(btc_to_sats(0.0), 0);
    }

    #[test]
    fn transient_classification() {
        let warmup = RpcError::Node { method: "x".into(), code: -28, message: "warming up".into() };
        assert!(warmup.is_transient());
        let congested =
            RpcError::Node { method: "x".into(), code: -26, message: "mempool full".into() };
        assert!(congested.is_transient());
        let funds = RpcError::Node {
            method: "x".into(),
            code: -6,
            message: "Insufficient funds".into(),
        };
        assert!(!funds.is_transient());
    }
}
