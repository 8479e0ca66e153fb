//! Esplora REST client (Blockstream / mempool.space API).

use async_trait::async_trait;
use bitcoin::{Address, Amount, Network, OutPoint, Txid};
use reqwest::StatusCode;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

use crate::{ChainSource, Error, TxStatus, Utxo};

/// Esplora HTTP client bound to one network.
pub struct EsploraClient {
    http: reqwest::Client,
    base_url: String,
    network: Network,
}

#[derive(Debug, Deserialize)]
struct EsploraStatus {
    confirmed: bool,
    #[serde(default)]
    block_height: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct EsploraUtxo {
    txid: Txid,
    vout: u32,
    value: u64,
    status: EsploraStatus,
}

impl From<EsploraUtxo> for Utxo {
    fn from(u: EsploraUtxo) -> Self {
        let height = if u.status.confirmed {
            u.status.block_height
        } else {
            None
        };
        Utxo {
            outpoint: OutPoint::new(u.txid, u.vout),
            value: Amount::from_sat(u.value),
            confirmed: u.status.confirmed,
            height,
        }
    }
}

impl From<EsploraStatus> for TxStatus {
    fn from(s: EsploraStatus) -> Self {
        match (s.confirmed, s.block_height) {
            (true, Some(height)) => TxStatus::Confirmed { height },
            _ => TxStatus::Mempool,
        }
    }
}

impl EsploraClient {
    /// Create a client for `base_url` (e.g. "https://mempool.space/testnet/api").
    ///
    /// Every request is bounded by `timeout`.
    pub fn new(base_url: &str, network: Network, timeout: Duration) -> Result<Self, Error> {
        if !base_url.starts_with("https://") {
            log::warn!("Esplora endpoint {} is not HTTPS", base_url);
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("nostring-heir/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Connection(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            network,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl ChainSource for EsploraClient {
    fn network(&self) -> Network {
        self.network
    }

    async fn tip_height(&self) -> Result<u32, Error> {
        let body = self
            .http
            .get(self.url("/blocks/tip/height"))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        parse_height(&body)
    }

    async fn utxos(&self, address: &Address) -> Result<Vec<Utxo>, Error> {
        let utxos: Vec<EsploraUtxo> = self
            .http
            .get(self.url(&format!("/address/{}/utxo", address)))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        log::debug!("{} UTXOs at {}", utxos.len(), address);
        Ok(utxos.into_iter().map(Utxo::from).collect())
    }

    async fn broadcast(&self, tx_hex: &str) -> Result<Txid, Error> {
        let response = self
            .http
            .post(self.url("/tx"))
            .body(tx_hex.to_string())
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(Error::Rejected(body.trim().to_string()));
        }
        Txid::from_str(body.trim())
            .map_err(|e| Error::InvalidResponse(format!("broadcast returned '{}': {}", body, e)))
    }

    async fn tx_status(&self, txid: &Txid) -> Result<TxStatus, Error> {
        let response = self
            .http
            .get(self.url(&format!("/tx/{}/status", txid)))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(TxStatus::Unknown);
        }
        let status: EsploraStatus = response.error_for_status()?.json().await?;
        Ok(status.into())
    }
}

fn parse_height(body: &str) -> Result<u32, Error> {
    body.trim()
        .parse()
        .map_err(|_| Error::InvalidResponse(format!("tip height '{}'", body.trim())))
}

/// Default Esplora API for each network
pub fn default_url(network: Network) -> &'static str {
    match network {
        Network::Bitcoin => "https://mempool.space/api",
        Network::Testnet => "https://mempool.space/testnet/api",
        Network::Signet => "https://mempool.space/signet/api",
        Network::Regtest => "http://127.0.0.1:3002",
        _ => "https://mempool.space/testnet4/api",
    }
}
