//! File-backed instrument catalog.
//!
//! The real universe builder (chain discovery, greeks refresh) runs as a
//! separate service; this adapter serves its exported JSON snapshot so the
//! engine can resolve tokens and route options without a network hop.

use crate::domain::ports::{OptionCandidate, OptionRouter};
use crate::domain::trading::types::{Instrument, OptType, OptionMeta, Side};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    pub instrument_token: u32,
    pub exchange: String,
    pub tradingsymbol: String,
    pub segment: String,
    pub lot_size: i64,
    pub tick_size: rust_decimal::Decimal,
    #[serde(default)]
    pub freeze_qty: Option<i64>,
    #[serde(default)]
    pub underlying_token: Option<u32>,
    #[serde(default)]
    pub option_meta: Option<OptionMeta>,
    /// Rank within its chain, 0 = ATM. Assigned by the universe builder.
    #[serde(default)]
    pub moneyness_rank: i32,
}

pub struct FileCatalog {
    by_token: HashMap<u32, CatalogEntry>,
}

impl FileCatalog {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let entries: Vec<CatalogEntry> = serde_json::from_str(&raw)?;
        Ok(Self::from_entries(entries))
    }

    pub fn from_entries(entries: Vec<CatalogEntry>) -> Self {
        let by_token = entries.into_iter().map(|e| (e.instrument_token, e)).collect();
        Self { by_token }
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }

    fn to_instrument(entry: &CatalogEntry) -> Instrument {
        Instrument {
            exchange: entry.exchange.clone(),
            tradingsymbol: entry.tradingsymbol.clone(),
            segment: entry.segment.clone(),
            lot_size: entry.lot_size,
            tick_size: entry.tick_size,
            freeze_qty: entry.freeze_qty,
        }
    }
}

#[async_trait]
impl OptionRouter for FileCatalog {
    async fn instrument(&self, token: u32) -> anyhow::Result<Option<Instrument>> {
        Ok(self.by_token.get(&token).map(Self::to_instrument))
    }

    async fn candidates(
        &self,
        underlying_token: u32,
        side: Side,
    ) -> anyhow::Result<Vec<OptionCandidate>> {
        // Directional long-premium routing: calls for longs, puts for shorts
        let wanted = match side {
            Side::Buy => OptType::Ce,
            Side::Sell => OptType::Pe,
        };
        let mut matches: Vec<&CatalogEntry> = self
            .by_token
            .values()
            .filter(|e| {
                e.underlying_token == Some(underlying_token)
                    && e.option_meta.as_ref().is_some_and(|m| m.opt_type == wanted)
            })
            .collect();
        matches.sort_by_key(|e| e.moneyness_rank.abs());
        Ok(matches
            .into_iter()
            .filter_map(|e| {
                Some(OptionCandidate {
                    instrument_token: e.instrument_token,
                    instrument: Self::to_instrument(e),
                    meta: e.option_meta.clone()?,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn entry(token: u32, symbol: &str, opt: Option<(OptType, i32)>) -> CatalogEntry {
        CatalogEntry {
            instrument_token: token,
            exchange: "NFO".into(),
            tradingsymbol: symbol.into(),
            segment: if opt.is_some() { "NFO-OPT".into() } else { "NSE".into() },
            lot_size: 25,
            tick_size: dec!(0.05),
            freeze_qty: Some(1800),
            underlying_token: opt.is_some().then_some(256265),
            option_meta: opt.map(|(opt_type, _)| OptionMeta {
                strike: dec!(24800),
                expiry: chrono::NaiveDate::from_ymd_opt(2024, 8, 29).unwrap(),
                opt_type,
                delta: None,
                gamma: None,
                vega: None,
                theta: None,
                iv_pts: None,
            }),
            moneyness_rank: opt.map(|(_, r)| r).unwrap_or(0),
        }
    }

    #[test]
    fn test_candidates_ranked_atm_first_by_side() {
        let catalog = FileCatalog::from_entries(vec![
            entry(1, "NIFTY", None),
            entry(10, "NIFTY24AUG24800CE", Some((OptType::Ce, 0))),
            entry(11, "NIFTY24AUG24900CE", Some((OptType::Ce, 1))),
            entry(20, "NIFTY24AUG24800PE", Some((OptType::Pe, 0))),
        ]);

        tokio_test::block_on(async {
            let calls = catalog.candidates(256265, Side::Buy).await.unwrap();
            assert_eq!(calls.len(), 2);
            assert_eq!(calls[0].instrument_token, 10);
            assert_eq!(calls[1].instrument_token, 11);

            let puts = catalog.candidates(256265, Side::Sell).await.unwrap();
            assert_eq!(puts.len(), 1);
            assert_eq!(puts[0].instrument_token, 20);

            let inst = catalog.instrument(1).await.unwrap().unwrap();
            assert!(!inst.is_option());
            assert!(catalog.instrument(999).await.unwrap().is_none());
        });
    }
}
