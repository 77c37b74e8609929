use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::agent::pool::OpenInterestSource;
use crate::agent::types::{AgentError, MarketSnapshot, TradingContext};
use crate::config::MarketConfig;

/// Per-symbol technical snapshot provider.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn get_snapshot(&self, symbol: &str) -> Result<MarketSnapshot, AgentError>;
}

/// Reads snapshots from `<base_url>/<symbol>`.
pub struct HttpMarketDataSource {
    client: Client,
    base_url: String,
}

impl HttpMarketDataSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self, AgentError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl MarketDataSource for HttpMarketDataSource {
    async fn get_snapshot(&self, symbol: &str) -> Result<MarketSnapshot, AgentError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), symbol);
        let response = self.client.get(&url).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(AgentError::NotFound(symbol.to_string())),
            status if !status.is_success() => Err(AgentError::MarketData {
                symbol: symbol.to_string(),
                reason: format!("market data API returned {status}"),
            }),
            _ => Ok(response.json().await?),
        }
    }
}

/// Counters from one assembly pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AssemblyStats {
    pub requested: usize,
    pub fetched: usize,
    pub failed: usize,
    pub filtered_illiquid: usize,
    pub oi_records: usize,
    pub elapsed_ms: u64,
}

/// Fills a cycle's market-data and OI-momentum maps.
pub struct MarketContextAssembler {
    source: Arc<dyn MarketDataSource>,
    oi_source: Option<Arc<dyn OpenInterestSource>>,
    fetch_semaphore: Arc<Semaphore>,
    min_oi_value_usd: f64,
}

impl MarketContextAssembler {
    pub fn new(
        source: Arc<dyn MarketDataSource>,
        oi_source: Option<Arc<dyn OpenInterestSource>>,
        config: &MarketConfig,
    ) -> Self {
        Self {
            source,
            oi_source,
            fetch_semaphore: Arc::new(Semaphore::new(config.max_concurrent_fetches.max(1))),
            min_oi_value_usd: config.min_oi_value_usd,
        }
    }

    /// Position symbols first, then candidates, without duplicates.
    fn symbols(ctx: &TradingContext) -> Vec<String> {
        let mut seen = HashSet::new();
        ctx.positions
            .iter()
            .map(|p| p.symbol.clone())
            .chain(ctx.candidates.iter().map(|c| c.symbol.clone()))
            .filter(|s| seen.insert(s.clone()))
            .collect()
    }

    async fn fetch_one(&self, symbol: String) -> (String, Result<MarketSnapshot, AgentError>) {
        let _permit = match self.fetch_semaphore.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                return (
                    symbol.clone(),
                    Err(AgentError::MarketData {
                        symbol,
                        reason: format!("fetch pool closed: {e}"),
                    }),
                );
            }
        };
        let result = self.source.get_snapshot(&symbol).await;
        (symbol, result)
    }

    /// Fetches every symbol concurrently (bounded), drops illiquid candidates
    /// and merges OI momentum data. Never fails the cycle.
    pub async fn assemble(&self, ctx: &mut TradingContext) -> AssemblyStats {
        let start = Instant::now();
        let symbols = Self::symbols(ctx);
        let mut stats = AssemblyStats {
            requested: symbols.len(),
            ..Default::default()
        };

        let fetches = symbols.into_iter().map(|s| self.fetch_one(s));
        let results = futures::future::join_all(fetches).await;

        for (symbol, result) in results {
            let snapshot = match result {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("Skipping {}: {}", symbol, e);
                    stats.failed += 1;
                    continue;
                }
            };

            if !ctx.holds(&symbol) {
                if let Some(value) = snapshot.open_interest_value_usd() {
                    if snapshot.current_price > 0.0 && value < self.min_oi_value_usd {
                        info!(
                            "Dropping {}: open interest value {:.2}M USD below {:.2}M",
                            symbol,
                            value / 1_000_000.0,
                            self.min_oi_value_usd / 1_000_000.0
                        );
                        stats.filtered_illiquid += 1;
                        continue;
                    }
                }
            }

            stats.fetched += 1;
            ctx.market_data.insert(symbol, snapshot);
        }

        if let Some(oi_source) = &self.oi_source {
            match oi_source.oi_top().await {
                Ok(records) => {
                    stats.oi_records = records.len();
                    ctx.oi_top_data.extend(records);
                }
                Err(e) => warn!("OI momentum data unavailable: {}", e),
            }
        }

        stats.elapsed_ms = start.elapsed().as_millis() as u64;
        debug!(
            "Assembled {}/{} snapshots in {}ms ({} failed, {} illiquid)",
            stats.fetched, stats.requested, stats.elapsed_ms, stats.failed, stats.filtered_illiquid
        );
        stats
    }
}
