use crate::market::types::Quote;
use std::collections::HashMap;

/// Latest quote per symbol for one session.
///
/// Entries are upserted and never removed: unsubscribing only stops updates, and
/// the table stays bounded by the set of symbols ever subscribed.
#[derive(Debug, Default, Clone)]
pub struct QuoteTable {
    latest: HashMap<String, Quote>,
}

impl QuoteTable {
    pub fn upsert(&mut self, quote: Quote) {
        self.latest.insert(quote.symbol.clone(), quote);
    }

    pub fn upsert_batch<I>(&mut self, quotes: I) -> usize
    where
        I: IntoIterator<Item = Quote>,
    {
        let mut applied = 0;
        for quote in quotes {
            self.upsert(quote);
            applied += 1;
        }
        applied
    }

    pub fn get(&self, symbol: &str) -> Option<&Quote> {
        self.latest.get(symbol)
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    /// Symbols in ascending order, so a pass over the table is reproducible.
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.latest.keys().cloned().collect();
        symbols.sort_unstable();
        symbols
    }
}
