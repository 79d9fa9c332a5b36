//! Instrument master cache
//!
//! Loaded once at startup from the `instruments` table (one read of all
//! active rows), then immutable. The secondary index maps the feed's
//! opaque `security_id` to the canonical `instrument_token`. A Redis hash
//! fallback (`instrument:<token>`) is consulted only when the SQL load
//! fails; if both fail the process must abort, since unknown instruments mean
//! silent tick drops.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use redis::AsyncCommands;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tracing::{error, info, warn};

/// One row of the instrument master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub instrument_token: u32,
    pub security_id: Option<String>,
    pub trading_symbol: String,
    pub exchange: String,
    pub segment: Option<String>,
    pub instrument_type: Option<String>,
    pub expiry: Option<NaiveDate>,
    pub strike: Option<f64>,
    pub tick_size: Option<f64>,
    pub lot_size: Option<i32>,
    pub source: Option<String>,
    pub is_active: bool,
}

/// Immutable in-memory view of the instrument master.
///
/// Reloading builds a fresh cache and swaps it in whole; a failed reload
/// leaves the previous cache untouched.
#[derive(Debug, Default)]
pub struct InstrumentCache {
    by_token: FxHashMap<u32, Instrument>,
    by_security_id: FxHashMap<String, u32>,
}

impl InstrumentCache {
    /// Build a cache from rows already in hand (tests, fallback loads).
    pub fn from_instruments(instruments: Vec<Instrument>) -> Self {
        let mut cache = Self::default();
        for instrument in instruments {
            cache.insert(instrument);
        }
        cache
    }

    fn insert(&mut self, instrument: Instrument) {
        if let Some(sid) = instrument.security_id.as_ref() {
            self.by_security_id
                .insert(sid.clone(), instrument.instrument_token);
        }
        self.by_token.insert(instrument.instrument_token, instrument);
    }

    /// One SQL read of all active rows.
    pub async fn load(pool: &PgPool) -> Result<Self> {
        let rows = sqlx::query(
            r"
            SELECT
                instrument_token, security_id, trading_symbol, exchange,
                segment, instrument_type, expiry, strike, tick_size,
                lot_size, source, is_active
            FROM instruments
            WHERE is_active = TRUE
            ",
        )
        .fetch_all(pool)
        .await
        .context("failed to load instrument master")?;

        let mut cache = Self::default();
        for row in &rows {
            let token: i64 = row.get("instrument_token");
            let Ok(token) = u32::try_from(token) else {
                warn!(token, "instrument_token out of u32 range, skipping");
                continue;
            };
            cache.insert(Instrument {
                instrument_token: token,
                security_id: row.get("security_id"),
                trading_symbol: row.get("trading_symbol"),
                exchange: row.get("exchange"),
                segment: row.get("segment"),
                instrument_type: row.get("instrument_type"),
                expiry: row.get("expiry"),
                strike: row.get("strike"),
                tick_size: row.get("tick_size"),
                lot_size: row.get("lot_size"),
                source: row.get("source"),
                is_active: row.get("is_active"),
            });
        }

        info!(
            instruments = cache.by_token.len(),
            security_ids = cache.by_security_id.len(),
            "instrument cache loaded from database"
        );
        Ok(cache)
    }

    /// Load from SQL, falling back to the Redis `instrument:<token>`
    /// hashes if the database is unavailable. Errors only when both
    /// sources fail.
    pub async fn load_with_fallback(
        pool: &PgPool,
        redis: Option<redis::aio::ConnectionManager>,
    ) -> Result<Self> {
        match Self::load(pool).await {
            Ok(cache) => Ok(cache),
            Err(db_err) => {
                error!(error = %db_err, "instrument load from database failed");
                let Some(mut conn) = redis else {
                    return Err(db_err.context("no cache fallback available"));
                };
                warn!("falling back to redis instrument cache");
                Self::load_from_redis(&mut conn).await
            }
        }
    }

    async fn load_from_redis(conn: &mut redis::aio::ConnectionManager) -> Result<Self> {
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg("instrument:*")
            .query_async(conn)
            .await
            .context("redis fallback scan failed")?;

        let mut cache = Self::default();
        for key in &keys {
            let Some(token) = key
                .split(':')
                .nth(1)
                .and_then(|t| t.parse::<u32>().ok())
            else {
                continue;
            };
            let fields: HashMap<String, String> = conn
                .hgetall(key)
                .await
                .with_context(|| format!("redis fallback read failed for {key}"))?;
            if fields.is_empty() {
                continue;
            }
            cache.insert(Instrument {
                instrument_token: token,
                security_id: fields.get("security_id").cloned(),
                trading_symbol: fields
                    .get("trading_symbol")
                    .cloned()
                    .unwrap_or_default(),
                exchange: fields.get("exchange").cloned().unwrap_or_default(),
                segment: fields.get("segment").cloned(),
                instrument_type: fields.get("instrument_type").cloned(),
                expiry: fields
                    .get("expiry")
                    .and_then(|e| NaiveDate::parse_from_str(e, "%Y-%m-%d").ok()),
                strike: fields.get("strike").and_then(|s| s.parse().ok()),
                tick_size: fields.get("tick_size").and_then(|s| s.parse().ok()),
                lot_size: fields.get("lot_size").and_then(|s| s.parse().ok()),
                source: fields.get("source").cloned(),
                is_active: true,
            });
        }

        if cache.is_empty() {
            anyhow::bail!("redis instrument fallback is empty");
        }
        info!(
            instruments = cache.by_token.len(),
            "instrument cache loaded from redis fallback"
        );
        Ok(cache)
    }

    /// Resolve a feed security id to its canonical token and metadata.
    pub fn resolve_security_id(&self, security_id: &str) -> Option<(u32, &Instrument)> {
        let token = *self.by_security_id.get(security_id)?;
        self.by_token.get(&token).map(|meta| (token, meta))
    }

    /// Look up metadata by canonical token. Hot path.
    pub fn get_by_token(&self, token: u32) -> Option<&Instrument> {
        self.by_token.get(&token)
    }

    /// All cached instruments, e.g. to build the subscription list.
    pub fn instruments(&self) -> impl Iterator<Item = &Instrument> {
        self.by_token.values()
    }

    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nifty_future() -> Instrument {
        Instrument {
            instrument_token: 256265,
            security_id: Some("49229".to_string()),
            trading_symbol: "NIFTY25DECFUT".to_string(),
            exchange: "NSE".to_string(),
            segment: Some("NSE_FNO".to_string()),
            instrument_type: Some("FUT".to_string()),
            expiry: NaiveDate::from_ymd_opt(2025, 12, 24),
            strike: None,
            tick_size: Some(0.05),
            lot_size: Some(25),
            source: Some("dhan".to_string()),
            is_active: true,
        }
    }

    #[test]
    fn resolves_security_id_to_token() {
        let cache = InstrumentCache::from_instruments(vec![nifty_future()]);
        let (token, meta) = cache.resolve_security_id("49229").unwrap();
        assert_eq!(token, 256265);
        assert_eq!(meta.trading_symbol, "NIFTY25DECFUT");
    }

    #[test]
    fn unknown_security_id_is_a_miss() {
        let cache = InstrumentCache::from_instruments(vec![nifty_future()]);
        assert!(cache.resolve_security_id("99999").is_none());
    }

    #[test]
    fn instruments_without_security_id_still_resolve_by_token() {
        let mut inst = nifty_future();
        inst.security_id = None;
        let cache = InstrumentCache::from_instruments(vec![inst]);
        assert!(cache.get_by_token(256265).is_some());
        assert!(cache.resolve_security_id("49229").is_none());
    }
}
