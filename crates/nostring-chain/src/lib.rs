//! NoString Chain Sources
//!
//! Read-mostly access to the Bitcoin network for heir claims:
//! - Block height monitoring (timelock tracking)
//! - UTXO discovery at the vault address
//! - Transaction broadcasting and status lookup
//!
//! Two backends implement [`ChainSource`]: an Esplora REST client
//! (Blockstream / mempool.space API) and an Electrum client.
//!
//! # Security
//!
//! - Prefer TLS endpoints (https://, ssl://)
//! - Nothing here ever sees key material; only addresses and raw transactions
//!
//! # Example
//!
//! ```ignore
//! use nostring_chain::{connect, default_endpoint, Backend};
//! use bitcoin::Network;
//! use std::time::Duration;
//!
//! let url = default_endpoint(Backend::Esplora, Network::Testnet);
//! let source = connect(Backend::Esplora, url, Network::Testnet, Duration::from_secs(30)).await?;
//! println!("Current block height: {}", source.tip_height().await?);
//! ```

pub mod electrum;
pub mod esplora;

use async_trait::async_trait;
use bitcoin::{Address, Amount, Network, OutPoint, Txid};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use electrum::ElectrumSource;
pub use esplora::EsploraClient;

/// Errors from chain data sources
#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Electrum protocol error: {0}")]
    Electrum(#[from] electrum_client::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected response: {0}")]
    InvalidResponse(String),

    /// The server refused a transaction; carries its message verbatim
    #[error("{0}")]
    Rejected(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

/// A UTXO at a watched address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    /// The outpoint (txid:vout)
    pub outpoint: OutPoint,
    /// Value in satoshis
    pub value: Amount,
    pub confirmed: bool,
    /// Block height where this was confirmed
    pub height: Option<u32>,
}

/// Where a transaction currently is, as far as the server knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Unknown,
    Mempool,
    Confirmed { height: u32 },
}

impl TxStatus {
    pub fn is_known(&self) -> bool {
        !matches!(self, TxStatus::Unknown)
    }
}

/// A chain data service bound to one network.
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Network this source serves
    fn network(&self) -> Network;

    /// Current blockchain height
    async fn tip_height(&self) -> Result<u32, Error>;

    /// Every UTXO the server reports for `address`, confirmed or not
    async fn utxos(&self, address: &Address) -> Result<Vec<Utxo>, Error>;

    /// Submit a raw transaction (hex). Returns the txid the server reports.
    async fn broadcast(&self, tx_hex: &str) -> Result<Txid, Error>;

    async fn tx_status(&self, txid: &Txid) -> Result<TxStatus, Error>;
}

/// Chain data protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Esplora,
    Electrum,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Esplora => f.write_str("esplora"),
            Backend::Electrum => f.write_str("electrum"),
        }
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "esplora" => Ok(Backend::Esplora),
            "electrum" => Ok(Backend::Electrum),
            other => Err(format!("unknown chain backend: {}", other)),
        }
    }
}

/// Default endpoint for each backend and network
pub fn default_endpoint(backend: Backend, network: Network) -> &'static str {
    match backend {
        Backend::Esplora => esplora::default_url(network),
        Backend::Electrum => electrum::default_server(network),
    }
}

/// Open a chain source for `network` at `url`.
pub async fn connect(
    backend: Backend,
    url: &str,
    network: Network,
    timeout: Duration,
) -> Result<Arc<dyn ChainSource>, Error> {
    log::debug!("connecting to {} backend at {} ({})", backend, url, network);
    match backend {
        Backend::Esplora => Ok(Arc::new(EsploraClient::new(url, network, timeout)?)),
        Backend::Electrum => Ok(Arc::new(ElectrumSource::connect(url, network).await?)),
    }
}
