//! Market mapping cache: outcome-token ids ↔ venue market metadata.
//!
//! Maps between:
//! - tokenId (on-chain, uint256) ↔ market question/slug/outcome (Gamma API)
//! - conditionId ↔ both outcome token ids (derived, see `onchain::abi`)
//!
//! Unknown tokens resolve asynchronously; trades arrive with
//! `market = unknown` and are rewritten once metadata lands.

use alloy::primitives::{Address, B256, U256};
use dashmap::DashMap;
use reqwest::Client;
use serde::Deserialize;
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::onchain::abi;

/// A market entry in the cache, combining on-chain and API data.
#[derive(Debug, Clone)]
pub struct MarketInfo {
    pub token_id: U256,
    pub condition_id: Option<B256>,
    pub question_id: Option<B256>,
    pub oracle: Option<Address>,
    pub yes_token_id: Option<U256>,
    pub no_token_id: Option<U256>,
    /// "Yes" / "No" label for this token.
    pub outcome: String,
    pub question: String,
    pub slug: String,
    pub status: String,
}

impl MarketInfo {
    /// Placeholder entry for a token the catalog has not resolved yet.
    pub fn unknown(token_id: U256) -> Self {
        Self {
            token_id,
            condition_id: None,
            question_id: None,
            oracle: None,
            yes_token_id: None,
            no_token_id: None,
            outcome: String::new(),
            question: String::new(),
            slug: String::new(),
            status: "unknown".to_string(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        !self.question.is_empty()
    }

    /// Short display name for API payloads.
    pub fn display_name(&self) -> String {
        if self.question.is_empty() {
            let id = self.token_id.to_string();
            return format!("Token {}...", &id[..16.min(id.len())]);
        }
        let mut name = if self.question.len() > 50 {
            format!("{}...", &self.question[..50])
        } else {
            self.question.clone()
        };
        if !self.outcome.is_empty() {
            name = format!("{name} ({})", self.outcome);
        }
        name
    }
}

/// Gamma API market response (subset of fields we need).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GammaMarket {
    #[serde(default)]
    question: String,
    #[serde(default)]
    slug: Option<String>,
    #[serde(default)]
    condition_id: Option<String>,
    #[serde(default, rename = "questionID")]
    question_id: Option<String>,
    #[serde(default)]
    outcomes: Option<String>, // JSON-encoded string like "[\"Yes\",\"No\"]"
    #[serde(default)]
    clob_token_ids: Option<String>, // JSON-encoded string of decimal ids
    #[serde(default)]
    active: Option<bool>,
    #[serde(default)]
    closed: Option<bool>,
}

/// Thread-safe token-id → market cache backed by the Gamma catalog API.
#[derive(Clone)]
pub struct MarketResolver {
    by_token: Arc<DashMap<U256, MarketInfo>>,
    /// Tokens with a resolve already in flight.
    pending: Arc<DashMap<U256, ()>>,
    gamma_url: String,
    collateral: Address,
    http: Client,
    pool: Option<SqlitePool>,
}

impl MarketResolver {
    pub fn new(gamma_url: String, collateral: Address, pool: Option<SqlitePool>) -> Self {
        Self {
            by_token: Arc::new(DashMap::new()),
            pending: Arc::new(DashMap::new()),
            gamma_url,
            collateral,
            http: Client::new(),
            pool,
        }
    }

    pub fn get(&self, token_id: U256) -> Option<MarketInfo> {
        self.by_token.get(&token_id).map(|e| e.clone())
    }

    pub fn display_name(&self, token_id: U256) -> String {
        self.get(token_id)
            .unwrap_or_else(|| MarketInfo::unknown(token_id))
            .display_name()
    }

    pub fn all(&self) -> Vec<MarketInfo> {
        let mut out: Vec<MarketInfo> = self.by_token.iter().map(|e| e.clone()).collect();
        out.sort_by_key(|m| m.token_id);
        out
    }

    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }

    /// Insert or update a market, persisting to the durable cache table.
    pub fn insert(&self, market: MarketInfo) {
        if let Some(pool) = self.pool.clone() {
            let m = market.clone();
            tokio::spawn(async move {
                if let Err(e) = crate::db::upsert_market(&pool, &m).await {
                    debug!(error = %e, "market cache persist failed");
                }
            });
        }
        self.by_token.insert(market.token_id, market);
    }

    /// Warm the in-memory cache from the durable market table.
    pub async fn load_cached(&self) -> crate::error::Result<usize> {
        let Some(pool) = self.pool.clone() else {
            return Ok(0);
        };
        let markets = crate::db::load_markets(&pool).await?;
        let count = markets.len();
        for m in markets {
            self.by_token.insert(m.token_id, m);
        }
        if count > 0 {
            info!(markets = count, "market cache warmed from durable store");
        }
        Ok(count)
    }

    /// Load all active markets from the Gamma API on startup.
    pub async fn load_active_markets(&self) -> crate::error::Result<usize> {
        let mut offset = 0usize;
        let page_size = 500usize;
        let max_markets = 3_000usize;
        let mut count = 0usize;

        while offset < max_markets {
            let url = format!(
                "{}/markets?active=true&closed=false&limit={}&offset={}",
                self.gamma_url, page_size, offset
            );
            let resp = self.http.get(&url).send().await?;
            if !resp.status().is_success() {
                warn!(status = %resp.status(), "Gamma markets page fetch failed");
                break;
            }
            let markets: Vec<GammaMarket> = resp.json().await?;
            let page_len = markets.len();
            for market in &markets {
                count += self.ingest_gamma_market(market);
            }
            if page_len < page_size {
                break;
            }
            offset += page_size;
        }

        info!(tokens = count, "market cache loaded from Gamma API");
        Ok(count)
    }

    /// Schedule an asynchronous resolve for an unknown token. Idempotent;
    /// at most one fetch is in flight per token.
    pub fn schedule_resolve(&self, token_id: U256) {
        if self
            .by_token
            .get(&token_id)
            .map(|m| m.is_resolved())
            .unwrap_or(false)
        {
            return;
        }
        if self.pending.insert(token_id, ()).is_some() {
            return;
        }
        let resolver = self.clone();
        tokio::spawn(async move {
            resolver.lookup_token(token_id).await;
            resolver.pending.remove(&token_id);
        });
    }

    /// Query the Gamma API for a specific token and add it to the cache.
    /// Uses exponential backoff if the API hasn't indexed it yet.
    pub async fn lookup_token(&self, token_id: U256) -> Option<MarketInfo> {
        if let Some(entry) = self.by_token.get(&token_id) {
            if entry.is_resolved() {
                return Some(entry.clone());
            }
        }

        let mut delay = std::time::Duration::from_millis(500);
        for attempt in 0..5 {
            let url = format!("{}/markets?clob_token_ids={}", self.gamma_url, token_id);

            match self.http.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    if let Ok(markets) = resp.json::<Vec<GammaMarket>>().await {
                        if let Some(market) = markets.first() {
                            if self.ingest_gamma_market(market) > 0 {
                                let resolved = self.by_token.get(&token_id).map(|e| e.clone());
                                if let Some(ref m) = resolved {
                                    info!(
                                        token = %token_id,
                                        question = %m.question,
                                        attempt,
                                        "market resolved via Gamma API"
                                    );
                                }
                                return resolved;
                            }
                        }
                    }
                }
                Ok(resp) => {
                    debug!(status = %resp.status(), attempt, "Gamma lookup failed, retrying");
                }
                Err(e) => {
                    warn!(error = %e, attempt, "Gamma request error");
                }
            }

            if attempt < 4 {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }

        warn!(token = %token_id, "failed to resolve token via Gamma API after 5 attempts");
        None
    }

    /// Parse one Gamma market into per-token cache entries. Returns the
    /// number of tokens ingested.
    fn ingest_gamma_market(&self, market: &GammaMarket) -> usize {
        let token_ids: Vec<U256> = market
            .clob_token_ids
            .as_ref()
            .and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
            .unwrap_or_default()
            .iter()
            .filter_map(|s| U256::from_str(s).ok())
            .collect();
        if token_ids.is_empty() {
            return 0;
        }

        let outcomes: Vec<String> = market
            .outcomes
            .as_ref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_else(|| vec!["Yes".to_string(), "No".to_string()]);

        let condition_id = market
            .condition_id
            .as_ref()
            .and_then(|s| B256::from_str(s).ok());
        let question_id = market
            .question_id
            .as_ref()
            .and_then(|s| B256::from_str(s).ok());

        // Cross-check the catalog ids against the deterministic derivation
        // when we know the condition.
        let (derived_yes, derived_no) = match condition_id {
            Some(cid) => {
                let (y, n) = abi::outcome_token_ids(self.collateral, cid);
                (Some(y), Some(n))
            }
            None => (None, None),
        };

        let yes_token_id = token_ids.first().copied().or(derived_yes);
        let no_token_id = token_ids.get(1).copied().or(derived_no);

        let status = match (market.active, market.closed) {
            (_, Some(true)) => "closed",
            (Some(true), _) => "active",
            _ => "unknown",
        }
        .to_string();

        let mut count = 0;
        for (idx, tid) in token_ids.iter().enumerate() {
            let outcome = outcomes
                .get(idx)
                .cloned()
                .unwrap_or_else(|| format!("Outcome {idx}"));
            self.insert(MarketInfo {
                token_id: *tid,
                condition_id,
                question_id,
                oracle: None,
                yes_token_id,
                no_token_id,
                outcome,
                question: market.question.clone(),
                slug: market.slug.clone().unwrap_or_default(),
                status: status.clone(),
            });
            count += 1;
        }
        count
    }
}
