//! Bitcoin settlement through a bitcoind wallet over JSON-RPC.

use crate::{
    config::WalletConfig,
    error::{Collaborator, Result, TradeError},
    interfaces::Wallet,
    model::{TradeId, TxHandle},
};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

const SATS_PER_BTC: u64 = 100_000_000;

#[derive(Debug, Clone)]
pub struct WalletSettings {
    pub rpc_url: String,
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
    pub confirmations: u32,
    pub poll_interval: Duration,
}

impl From<&WalletConfig> for WalletSettings {
    fn from(config: &WalletConfig) -> Self {
        Self {
            rpc_url: config.rpc_url.clone(),
            rpc_user: config.rpc_user.clone(),
            rpc_password: config.rpc_password.clone(),
            confirmations: config.confirmations,
            poll_interval: Duration::from_secs(config.poll_interval_seconds),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct WalletTransaction {
    txid: String,
    category: String,
    #[serde(default)]
    comment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReceivedByAddress {
    address: String,
    amount: Value,
    #[serde(default)]
    txids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TransactionInfo {
    confirmations: i64,
}

/// Renders satoshis as an exact BTC decimal string.
pub fn format_btc(sats: u64) -> String {
    format!("{}.{:08}", sats / SATS_PER_BTC, sats % SATS_PER_BTC)
}

/// Parses a BTC amount as returned by bitcoind into satoshis without going through floats.
pub fn parse_btc(amount: &Value) -> Option<u64> {
    let text = match amount {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => return None,
    };
    let (whole, fraction) = text.split_once('.').unwrap_or((text.as_str(), ""));
    if fraction.len() > 8 || whole.starts_with('-') {
        return None;
    }
    let whole: u64 = whole.parse().ok()?;
    let fraction: u64 = if fraction.is_empty() {
        0
    } else {
        format!("{:0<8}", fraction).parse().ok()?
    };
    whole.checked_mul(SATS_PER_BTC)?.checked_add(fraction)
}

fn payment_comment(trade_id: &TradeId) -> String {
    format!("peertrade:{}", trade_id)
}

pub struct BitcoindWallet {
    client: reqwest::Client,
    settings: WalletSettings,
}

impl BitcoindWallet {
    pub fn new(settings: WalletSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, settings })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "peertrade",
            "method": method,
            "params": params,
        });
        let mut request = self.client.post(&self.settings.rpc_url).json(&body);
        if let Some(user) = &self.settings.rpc_user {
            request = request.basic_auth(user, self.settings.rpc_password.as_ref());
        }

        // bitcoind reports RPC errors with a non-2xx status and a JSON body.
        let response: RpcResponse<T> = request.send().await?.json().await?;
        match (response.result, response.error) {
            (_, Some(err)) => Err(TradeError::collaborator(
                Collaborator::Wallet,
                format!("{} failed ({}): {}", method, err.code, err.message),
            )),
            (Some(result), None) => Ok(result),
            (None, None) => Err(TradeError::collaborator(
                Collaborator::Wallet,
                format!("{} returned no result", method),
            )),
        }
    }

    async fn find_payment(&self, comment: &str) -> Result<Option<TxHandle>> {
        let transactions: Vec<WalletTransaction> = self.call("listtransactions", json!(["*", 1000, 0, true])).await?;
        Ok(transactions
            .into_iter()
            .find(|tx| tx.category == "send" && tx.comment.as_deref() == Some(comment))
            .map(|tx| TxHandle { txid: tx.txid }))
    }
}

#[async_trait]
impl Wallet for BitcoindWallet {
    async fn request_payment(&self, trade_id: &TradeId, amount_sats: u64, destination: &str) -> Result<TxHandle> {
        let comment = payment_comment(trade_id);
        if let Some(existing) = self.find_payment(&comment).await? {
            info!(%trade_id, txid = %existing.txid, "Payment already broadcast");
            return Ok(existing);
        }

        let amount = format_btc(amount_sats);
        let txid: String = self
            .call("sendtoaddress", json!([destination, amount, comment]))
            .await?;
        info!(%trade_id, %txid, %amount, %destination, "Bitcoin payment broadcast");
        Ok(TxHandle { txid })
    }

    async fn watch_incoming(&self, trade_id: &TradeId, amount_sats: u64, destination: &str) -> Result<TxHandle> {
        loop {
            let received: Vec<ReceivedByAddress> = self
                .call("listreceivedbyaddress", json!([0, true, true, destination]))
                .await?;
            let seen = received.into_iter().find(|entry| {
                entry.address == destination
                    && parse_btc(&entry.amount).map(|sats| sats >= amount_sats).unwrap_or(false)
            });
            if let Some(txid) = seen.and_then(|entry| entry.txids.into_iter().next()) {
                info!(%trade_id, %txid, "Incoming bitcoin transfer seen");
                return Ok(TxHandle { txid });
            }
            debug!(%trade_id, %destination, "No incoming transfer yet");
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    async fn await_confirmation(&self, tx: &TxHandle) -> Result<()> {
        loop {
            let info: TransactionInfo = self.call("gettransaction", json!([tx.txid])).await?;
            if info.confirmations < 0 {
                return Err(TradeError::collaborator(
                    Collaborator::Wallet,
                    format!("transaction {} conflicts with the chain", tx.txid),
                ));
            }
            if info.confirmations >= self.settings.confirmations as i64 {
                info!(txid = %tx.txid, confirmations = info.confirmations, "Transaction confirmed");
                return Ok(());
            }
            debug!(txid = %tx.txid, confirmations = info.confirmations, "Waiting for confirmations");
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }
}
