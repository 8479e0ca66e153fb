//! UTXO aggregation: which outputs a claim may spend.

use bitcoin::Amount;
use nostring_chain::Utxo;
use serde::Serialize;

use crate::error::ClaimError;
use crate::status::ChainSnapshot;

/// Confirmed outputs at the vault address and their exact total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpendableSet {
    pub utxos: Vec<Utxo>,
    pub total: Amount,
}

impl SpendableSet {
    pub fn len(&self) -> usize {
        self.utxos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }
}

/// Select the confirmed outputs of `snapshot`.
pub fn aggregate(snapshot: &ChainSnapshot) -> Result<SpendableSet, ClaimError> {
    let utxos: Vec<Utxo> = snapshot
        .utxos
        .iter()
        .filter(|u| u.confirmed && u.height.is_some())
        .cloned()
        .collect();

    if utxos.is_empty() {
        return Err(ClaimError::NoSpendableFunds);
    }

    let total = utxos
        .iter()
        .try_fold(Amount::ZERO, |acc, u| acc.checked_add(u.value))
        .ok_or_else(|| {
            ClaimError::AccountingMismatch("spendable total overflows".to_string())
        })?;

    log::debug!("{} spendable utxos totalling {}", utxos.len(), total);
    Ok(SpendableSet { utxos, total })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{confirmed, unconfirmed};
    use bitcoin::Network;

    fn snapshot(utxos: Vec<Utxo>) -> ChainSnapshot {
        ChainSnapshot {
            network: Network::Testnet,
            current_height: 900_000,
            utxos,
        }
    }

    #[test]
    fn test_only_confirmed_counted() {
        let set = aggregate(&snapshot(vec![
            confirmed(1, 50_000, 800_000),
            unconfirmed(2, 1_000_000),
        ]))
        .unwrap();
        assert_eq!(set.total, Amount::from_sat(50_000));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_exact_sum() {
        let set = aggregate(&snapshot(vec![
            confirmed(1, 1, 800_000),
            confirmed(2, 2_099_999_997_690_000, 800_001),
            confirmed(3, 12_345, 800_002),
        ]))
        .unwrap();
        assert_eq!(set.total.to_sat(), 2_099_999_997_702_346);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_no_confirmed_funds() {
        assert_eq!(
            aggregate(&snapshot(vec![unconfirmed(1, 10_000)])).unwrap_err(),
            ClaimError::NoSpendableFunds
        );
        assert_eq!(
            aggregate(&snapshot(vec![])).unwrap_err(),
            ClaimError::NoSpendableFunds
        );
    }
}
