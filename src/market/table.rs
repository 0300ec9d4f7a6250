use std::collections::HashSet;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use log::error;

/// Current price of one symbol. This is also the element type of every
/// snapshot pushed to streaming clients and returned by `GET /api/prices`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceEntry {
    pub symbol: String,
    pub price: f64,
}

#[derive(Debug, Error, PartialEq)]
pub enum MarketError {
    #[error("price table needs at least one symbol")]
    Empty,
    #[error("symbol cannot be empty")]
    EmptySymbol,
    #[error("duplicate symbol: {0}")]
    DuplicateSymbol(String),
    #[error("invalid starting price {price} for {symbol}")]
    InvalidPrice { symbol: String, price: f64 },
}

/// The single source of truth for current market state.
///
/// The symbol set is fixed at construction. The price driver is the only
/// writer; every reader gets a copy taken under the read lock, so nobody
/// observes a tick half applied.
pub struct PriceTable {
    entries: RwLock<Vec<PriceEntry>>,
}

impl PriceTable {
    pub fn new<I, S>(initial: I) -> Result<Self, MarketError>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let mut entries = Vec::new();

        for (symbol, price) in initial {
            let symbol = symbol.into().trim().to_uppercase();
            if symbol.is_empty() {
                return Err(MarketError::EmptySymbol);
            }
            if !price.is_finite() || price <= 0.0 {
                return Err(MarketError::InvalidPrice { symbol, price });
            }
            if !seen.insert(symbol.clone()) {
                return Err(MarketError::DuplicateSymbol(symbol));
            }
            entries.push(PriceEntry { symbol, price });
        }

        if entries.is_empty() {
            return Err(MarketError::Empty);
        }

        Ok(Self {
            entries: RwLock::new(entries),
        })
    }

    /// Consistent copy of every entry, in initialization order.
    pub fn snapshot(&self) -> Vec<PriceEntry> {
        self.read().clone()
    }

    pub fn symbol_count(&self) -> usize {
        self.read().len()
    }

    /// Runs `perturb` once per symbol with the write lock held for the whole
    /// pass, so a snapshot sees either the previous generation or the next one.
    /// `perturb` returns the new price; the symbol cannot be changed.
    pub fn apply_perturbation<F>(&self, mut perturb: F)
    where
        F: FnMut(&PriceEntry) -> f64,
    {
        let mut entries = self.write();
        for entry in entries.iter_mut() {
            entry.price = perturb(entry);
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<PriceEntry>> {
        self.entries.read().unwrap_or_else(|poisoned| {
            error!("Price table lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<PriceEntry>> {
        self.entries.write().unwrap_or_else(|poisoned| {
            error!("Price table lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

#[cfg(test)]
impl PriceTable {
    pub fn price_of(&self, symbol: &str) -> Option<f64> {
        self.read()
            .iter()
            .find(|entry| entry.symbol.eq_ignore_ascii_case(symbol))
            .map(|entry| entry.price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_normalizes_symbols() {
        let table = PriceTable::new([("aapl", 100.0), (" tsla ", 200.0)]).unwrap();
        let snapshot = table.snapshot();

        assert_eq!(snapshot[0].symbol, "AAPL");
        assert_eq!(snapshot[1].symbol, "TSLA");
        assert_eq!(table.symbol_count(), 2);
    }

    #[test]
    fn test_new_rejects_bad_input() {
        let empty: Vec<(&str, f64)> = Vec::new();
        assert_eq!(PriceTable::new(empty).err(), Some(MarketError::Empty));
        assert_eq!(PriceTable::new([("", 1.0)]).err(), Some(MarketError::EmptySymbol));
        assert_eq!(
            PriceTable::new([("AAPL", 1.0), ("aapl", 2.0)]).err(),
            Some(MarketError::DuplicateSymbol("AAPL".to_string()))
        );
        assert!(matches!(
            PriceTable::new([("X", 0.0)]),
            Err(MarketError::InvalidPrice { .. })
        ));
        assert!(matches!(
            PriceTable::new([("X", f64::NAN)]),
            Err(MarketError::InvalidPrice { .. })
        ));
    }

    #[test]
    fn test_snapshot_order_is_stable() {
        let table = PriceTable::new([("B", 2.0), ("A", 1.0), ("C", 3.0)]).unwrap();
        let first: Vec<String> = table.snapshot().into_iter().map(|e| e.symbol).collect();
        let second: Vec<String> = table.snapshot().into_iter().map(|e| e.symbol).collect();

        assert_eq!(first, vec!["B", "A", "C"]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_apply_perturbation_updates_every_entry() {
        let table = PriceTable::new([("A", 10.0), ("B", 20.0)]).unwrap();
        let mut visited = Vec::new();

        table.apply_perturbation(|entry| {
            visited.push(entry.symbol.clone());
            entry.price * 2.0
        });

        assert_eq!(visited, vec!["A", "B"]);
        assert_eq!(table.price_of("a"), Some(20.0));
        assert_eq!(table.price_of("B"), Some(40.0));
        assert_eq!(table.price_of("MISSING"), None);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let table = PriceTable::new([("A", 10.0)]).unwrap();
        let before = table.snapshot();

        table.apply_perturbation(|_| 11.0);

        assert_eq!(before[0].price, 10.0);
        assert_eq!(table.snapshot()[0].price, 11.0);
    }
}
