//! In-memory chain source for unit tests.

use async_trait::async_trait;
use bitcoin::consensus::encode::deserialize_hex;
use bitcoin::hashes::Hash;
use bitcoin::{Address, Amount, Network, OutPoint, Transaction, Txid};
use nostring_chain::{ChainSource, Error, TxStatus, Utxo};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn confirmed(n: u8, sats: u64, height: u32) -> Utxo {
    Utxo {
        outpoint: OutPoint::new(Txid::from_byte_array([n; 32]), 0),
        value: Amount::from_sat(sats),
        confirmed: true,
        height: Some(height),
    }
}

pub fn unconfirmed(n: u8, sats: u64) -> Utxo {
    Utxo {
        outpoint: OutPoint::new(Txid::from_byte_array([n; 32]), 0),
        value: Amount::from_sat(sats),
        confirmed: false,
        height: None,
    }
}

#[derive(Default)]
struct Failures {
    remaining: u32,
    message: String,
}

pub struct MockChain {
    network: Network,
    height: AtomicU32,
    utxos: Mutex<Vec<Utxo>>,
    delay: Mutex<Option<Duration>>,
    height_failures: Mutex<Failures>,
    utxo_failures: Mutex<Failures>,
    height_calls: AtomicU32,
    broadcast_calls: AtomicU32,
    reject_with: Mutex<Option<String>>,
    known: Mutex<HashSet<Txid>>,
}

impl MockChain {
    pub fn new(network: Network, height: u32) -> Arc<Self> {
        Arc::new(Self {
            network,
            height: AtomicU32::new(height),
            utxos: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
            height_failures: Mutex::new(Failures::default()),
            utxo_failures: Mutex::new(Failures::default()),
            height_calls: AtomicU32::new(0),
            broadcast_calls: AtomicU32::new(0),
            reject_with: Mutex::new(None),
            known: Mutex::new(HashSet::new()),
        })
    }

    pub fn set_height(&self, height: u32) {
        self.height.store(height, Ordering::SeqCst);
    }

    pub fn set_utxos(&self, utxos: Vec<Utxo>) {
        *self.utxos.lock().unwrap() = utxos;
    }

    pub fn utxos_snapshot(&self) -> Vec<Utxo> {
        self.utxos.lock().unwrap().clone()
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Fail the next `times` height reads with `message`.
    pub fn fail_height(&self, times: u32, message: &str) {
        *self.height_failures.lock().unwrap() = Failures {
            remaining: times,
            message: message.to_string(),
        };
    }

    pub fn fail_utxos(&self, times: u32, message: &str) {
        *self.utxo_failures.lock().unwrap() = Failures {
            remaining: times,
            message: message.to_string(),
        };
    }

    /// Reject every broadcast with `message`.
    pub fn reject_broadcasts(&self, message: &str) {
        *self.reject_with.lock().unwrap() = Some(message.to_string());
    }

    pub fn mark_known(&self, txid: Txid) {
        self.known.lock().unwrap().insert(txid);
    }

    pub fn height_calls(&self) -> u32 {
        self.height_calls.load(Ordering::SeqCst)
    }

    pub fn broadcast_calls(&self) -> u32 {
        self.broadcast_calls.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

fn take_failure(failures: &Mutex<Failures>) -> Option<Error> {
    let mut f = failures.lock().unwrap();
    if f.remaining == 0 {
        return None;
    }
    f.remaining -= 1;
    Some(Error::Connection(f.message.clone()))
}

#[async_trait]
impl ChainSource for MockChain {
    fn network(&self) -> Network {
        self.network
    }

    async fn tip_height(&self) -> Result<u32, Error> {
        self.height_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if let Some(e) = take_failure(&self.height_failures) {
            return Err(e);
        }
        Ok(self.height.load(Ordering::SeqCst))
    }

    async fn utxos(&self, _address: &Address) -> Result<Vec<Utxo>, Error> {
        self.pause().await;
        if let Some(e) = take_failure(&self.utxo_failures) {
            return Err(e);
        }
        Ok(self.utxos_snapshot())
    }

    async fn broadcast(&self, tx_hex: &str) -> Result<Txid, Error> {
        self.broadcast_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let tx: Transaction =
            deserialize_hex(tx_hex).map_err(|e| Error::Rejected(format!("TX decode failed: {}", e)))?;
        if let Some(message) = self.reject_with.lock().unwrap().clone() {
            return Err(Error::Rejected(message));
        }
        let txid = tx.compute_txid();
        self.known.lock().unwrap().insert(txid);
        Ok(txid)
    }

    async fn tx_status(&self, txid: &Txid) -> Result<TxStatus, Error> {
        if self.known.lock().unwrap().contains(txid) {
            Ok(TxStatus::Mempool)
        } else {
            Ok(TxStatus::Unknown)
        }
    }
}
