//! Electrum backend.
//!
//! `electrum-client` is blocking, so every call runs on tokio's blocking
//! pool.

use async_trait::async_trait;
use bitcoin::{Address, Amount, Network, OutPoint, Txid};
use electrum_client::{ElectrumApi, Error as ElectrumError};
use std::sync::Arc;

use crate::{ChainSource, Error, TxStatus, Utxo};

/// Electrum client for Bitcoin network operations
pub struct ElectrumSource {
    client: Arc<electrum_client::Client>,
    network: Network,
}

impl ElectrumSource {
    /// Connect to an Electrum server
    ///
    /// # Arguments
    /// * `url` - Electrum server URL (e.g., "ssl://electrum.blockstream.info:60002")
    /// * `network` - Bitcoin network (Mainnet, Testnet, Signet, Regtest)
    ///
    /// # Security
    /// Always use SSL URLs in production. Plaintext connections can be MITM'd.
    pub async fn connect(url: &str, network: Network) -> Result<Self, Error> {
        if !is_tls_url(url) {
            log::warn!("Connecting to Electrum without SSL - insecure for mainnet!");
        }

        let url = url.to_string();
        let client = tokio::task::spawn_blocking(move || electrum_client::Client::new(&url))
            .await
            .map_err(|e| Error::Task(e.to_string()))?
            .map_err(|e: ElectrumError| Error::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            network,
        })
    }

    async fn call<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&electrum_client::Client) -> Result<T, Error> + Send + 'static,
    {
        let client = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || f(client.as_ref()))
            .await
            .map_err(|e| Error::Task(e.to_string()))?
    }
}

#[async_trait]
impl ChainSource for ElectrumSource {
    fn network(&self) -> Network {
        self.network
    }

    async fn tip_height(&self) -> Result<u32, Error> {
        self.call(|c| {
            let header = c.block_headers_subscribe()?;
            u32::try_from(header.height)
                .map_err(|_| Error::InvalidResponse(format!("height {}", header.height)))
        })
        .await
    }

    async fn utxos(&self, address: &Address) -> Result<Vec<Utxo>, Error> {
        let script = address.script_pubkey();
        self.call(move |c| {
            let unspent = c.script_list_unspent(&script)?;
            Ok(unspent
                .into_iter()
                .map(|u| {
                    // Electrum reports unconfirmed outputs at height 0
                    let height = u32::try_from(u.height).ok().filter(|h| *h > 0);
                    Utxo {
                        outpoint: OutPoint::new(u.tx_hash, u.tx_pos as u32),
                        value: Amount::from_sat(u.value),
                        confirmed: height.is_some(),
                        height,
                    }
                })
                .collect())
        })
        .await
    }

    async fn broadcast(&self, tx_hex: &str) -> Result<Txid, Error> {
        let raw = hex::decode(tx_hex.trim())
            .map_err(|e| Error::InvalidResponse(format!("invalid transaction hex: {}", e)))?;
        self.call(move |c| {
            c.transaction_broadcast_raw(&raw)
                .map_err(|e| Error::Rejected(rejection_message(e)))
        })
        .await
    }

    async fn tx_status(&self, txid: &Txid) -> Result<TxStatus, Error> {
        let txid = *txid;
        self.call(move |c| {
            if c.transaction_get(&txid).is_err() {
                return Ok(TxStatus::Unknown);
            }
            // A merkle proof only exists once the transaction is in a block
            match c.transaction_get_merkle(&txid, 0) {
                Ok(merkle) if merkle.block_height > 0 => Ok(TxStatus::Confirmed {
                    height: merkle.block_height as u32,
                }),
                _ => Ok(TxStatus::Mempool),
            }
        })
        .await
    }
}

fn is_tls_url(url: &str) -> bool {
    url.starts_with("ssl://") || url.contains("tls")
}

/// Server-side rejection text without the client's wrapping.
fn rejection_message(e: ElectrumError) -> String {
    match e {
        ElectrumError::Protocol(value) => value
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

/// Default Electrum servers for each network
pub fn default_server(network: Network) -> &'static str {
    match network {
        Network::Bitcoin => "ssl://electrum.blockstream.info:60002",
        Network::Testnet => "ssl://electrum.blockstream.info:60004",
        Network::Signet => "ssl://mempool.space:60602",
        Network::Regtest => "tcp://127.0.0.1:60401",
        _ => "ssl://mempool.space:40002",
    }
}
