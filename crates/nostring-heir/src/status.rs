//! Chain status provider.
//!
//! Reads the tip height and the UTXOs at the vault address from a
//! [`ChainSource`]. Both reads run concurrently, each bounded by the
//! configured timeout; a failure of either one fails the attempt, and
//! attempts are retried a bounded number of times with linear backoff.

use bitcoin::{Address, Network};
use nostring_chain::{ChainSource, Utxo};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ClaimError;

/// A point-in-time read of chain state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainSnapshot {
    pub network: Network,
    pub current_height: u32,
    /// Exactly what the source reported, in its order
    pub utxos: Vec<Utxo>,
}

/// Timeout and retry policy for chain reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainSettings {
    /// Bound on each individual request
    pub timeout: Duration,
    /// Total attempts, including the first
    pub attempts: u32,
    /// Delay before attempt `n + 1` is `backoff * n`
    pub backoff: Duration,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Fetches [`ChainSnapshot`]s from one chain source.
#[derive(Clone)]
pub struct ChainStatusProvider {
    source: Arc<dyn ChainSource>,
    settings: ChainSettings,
}

impl ChainStatusProvider {
    pub fn new(source: Arc<dyn ChainSource>, settings: ChainSettings) -> Self {
        Self { source, settings }
    }

    pub fn source(&self) -> &Arc<dyn ChainSource> {
        &self.source
    }

    pub fn settings(&self) -> ChainSettings {
        self.settings
    }

    /// Read the tip height and the UTXOs at `address`.
    pub async fn fetch(
        &self,
        network: Network,
        address: &Address,
    ) -> Result<ChainSnapshot, ClaimError> {
        if self.source.network() != network {
            return Err(ClaimError::ConfigurationError(format!(
                "chain source serves {}, vault is on {}",
                self.source.network(),
                network
            )));
        }

        let attempts = self.settings.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.fetch_once(network, address).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(cause) if attempt < attempts => {
                    log::warn!(
                        "chain query attempt {}/{} failed: {}",
                        attempt,
                        attempts,
                        cause
                    );
                    tokio::time::sleep(self.settings.backoff * attempt).await;
                    attempt += 1;
                }
                Err(cause) => {
                    return Err(ClaimError::ChainQueryFailed { cause });
                }
            }
        }
    }

    async fn fetch_once(&self, network: Network, address: &Address) -> Result<ChainSnapshot, String> {
        let timeout = self.settings.timeout;
        let (height, utxos) = tokio::join!(
            bounded(timeout, "tip height", self.source.tip_height()),
            bounded(timeout, "utxo set", self.source.utxos(address)),
        );

        let (current_height, utxos) = match (height, utxos) {
            (Ok(h), Ok(u)) => (h, u),
            (Err(a), Err(b)) => return Err(format!("{}; {}", a, b)),
            (Err(e), _) | (_, Err(e)) => return Err(e),
        };

        if let Some(bad) = utxos
            .iter()
            .find(|u| u.confirmed && u.height.is_some_and(|h| h > current_height))
        {
            return Err(format!(
                "utxo {} confirmed at {:?}, above tip {}",
                bad.outpoint, bad.height, current_height
            ));
        }

        log::debug!(
            "snapshot at height {}: {} utxos at {}",
            current_height,
            utxos.len(),
            address
        );

        Ok(ChainSnapshot {
            network,
            current_height,
            utxos,
        })
    }
}

async fn bounded<T>(
    timeout: Duration,
    what: &str,
    read: impl Future<Output = Result<T, nostring_chain::Error>>,
) -> Result<T, String> {
    match tokio::time::timeout(timeout, read).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(format!("{}: {}", what, e)),
        Err(_) => Err(format!("{}: timed out after {:?}", what, timeout)),
    }
}
