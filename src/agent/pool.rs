use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::agent::types::{AgentError, CandidateCoin, CandidateSource, OiTopData};
use crate::config::MarketConfig;

/// Upstream screener producing the ranked candidate list.
#[async_trait]
pub trait CandidateProvider: Send + Sync {
    async fn candidates(&self) -> Result<Vec<CandidateCoin>, AgentError>;
}

/// Open-interest momentum records keyed by symbol. Best-effort.
#[async_trait]
pub trait OpenInterestSource: Send + Sync {
    async fn oi_top(&self) -> Result<HashMap<String, OiTopData>, AgentError>;
}

#[derive(Debug, Deserialize)]
struct PoolResponse<T> {
    success: bool,
    data: PoolData<T>,
}

#[derive(Debug, Deserialize)]
struct PoolData<T> {
    coins: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct PoolCoin {
    pair: String,
}

#[derive(Debug, Deserialize)]
struct OiCoin {
    symbol: String,
    rank: u32,
    #[serde(default)]
    oi_delta_percent: f64,
    #[serde(default)]
    oi_delta_value: f64,
    #[serde(default)]
    price_delta_percent: f64,
    #[serde(default)]
    net_long: f64,
    #[serde(default)]
    net_short: f64,
}

/// One OI ranking response serves both the candidate pass and the momentum
/// merge of a cycle.
const OI_CACHE_TTL: Duration = Duration::from_secs(60);

struct CachedOi {
    fetched_at: Instant,
    coins: Arc<Vec<OiCoin>>,
}

/// Upper-cases a symbol and appends `USDT` when missing.
pub fn normalize_symbol(symbol: &str) -> String {
    let upper = symbol.trim().to_ascii_uppercase();
    if upper.ends_with("USDT") {
        upper
    } else {
        format!("{upper}USDT")
    }
}

/// Merges the score pool and the OI pool, keeping score-pool order first.
pub fn merge_pools(ai500: &[String], oi_top: &[String], limit: usize) -> Vec<CandidateCoin> {
    let mut merged: Vec<CandidateCoin> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    let tagged = ai500
        .iter()
        .map(|s| (s, CandidateSource::Ai500))
        .chain(oi_top.iter().map(|s| (s, CandidateSource::OiTop)));

    for (raw, source) in tagged {
        let symbol = normalize_symbol(raw);
        match index.get(&symbol) {
            Some(&i) => {
                if !merged[i].sources.contains(&source) {
                    merged[i].sources.push(source);
                }
            }
            None => {
                index.insert(symbol.clone(), merged.len());
                merged.push(CandidateCoin::new(symbol, vec![source]));
            }
        }
    }

    merged.truncate(limit);
    merged
}

/// HTTP client for the coin-pool and OI-ranking services.
pub struct CoinPoolClient {
    client: Client,
    coin_pool_url: Option<String>,
    oi_top_url: Option<String>,
    use_default_coins: bool,
    default_coins: Vec<String>,
    max_candidates: usize,
    oi_cache: Mutex<Option<CachedOi>>,
}

impl CoinPoolClient {
    pub fn new(config: &MarketConfig) -> Result<Self, AgentError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            client,
            coin_pool_url: config.coin_pool_url.clone(),
            oi_top_url: config.oi_top_url.clone(),
            use_default_coins: config.use_default_coins,
            default_coins: config.default_coins.clone(),
            max_candidates: config.max_candidates,
            oi_cache: Mutex::new(None),
        })
    }

    fn default_candidates(&self) -> Vec<CandidateCoin> {
        self.default_coins
            .iter()
            .map(|c| CandidateCoin::new(normalize_symbol(c), vec![CandidateSource::Ai500]))
            .collect()
    }

    async fn fetch_pool<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
    ) -> Result<Vec<T>, AgentError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::MarketData {
                symbol: url.to_string(),
                reason: format!("pool API returned {status}"),
            });
        }

        let body: PoolResponse<T> = response.json().await?;
        if !body.success {
            return Err(AgentError::MarketData {
                symbol: url.to_string(),
                reason: "pool API reported failure".to_string(),
            });
        }
        Ok(body.data.coins)
    }

    async fn ai500_symbols(&self) -> Result<Vec<String>, AgentError> {
        let Some(url) = &self.coin_pool_url else {
            return Ok(Vec::new());
        };
        let coins: Vec<PoolCoin> = self.fetch_pool(url).await?;
        Ok(coins.into_iter().map(|c| c.pair).collect())
    }

    fn cached_oi(&self) -> Option<Arc<Vec<OiCoin>>> {
        self.oi_cache
            .lock()
            .as_ref()
            .filter(|cached| cached.fetched_at.elapsed() < OI_CACHE_TTL)
            .map(|cached| Arc::clone(&cached.coins))
    }

    async fn oi_coins(&self) -> Result<Arc<Vec<OiCoin>>, AgentError> {
        let Some(url) = &self.oi_top_url else {
            return Ok(Arc::default());
        };
        if let Some(coins) = self.cached_oi() {
            debug!("OI ranking served from cache ({} coins)", coins.len());
            return Ok(coins);
        }

        let coins = Arc::new(self.fetch_pool::<OiCoin>(url).await?);
        *self.oi_cache.lock() = Some(CachedOi {
            fetched_at: Instant::now(),
            coins: Arc::clone(&coins),
        });
        Ok(coins)
    }
}

#[async_trait]
impl CandidateProvider for CoinPoolClient {
    async fn candidates(&self) -> Result<Vec<CandidateCoin>, AgentError> {
        if self.use_default_coins || (self.coin_pool_url.is_none() && self.oi_top_url.is_none()) {
            return Ok(self.default_candidates());
        }

        let (ai500, oi) = futures::join!(self.ai500_symbols(), self.oi_coins());

        let ai500 = ai500.unwrap_or_else(|e| {
            warn!("Coin pool fetch failed: {}", e);
            Vec::new()
        });
        let oi_symbols: Vec<String> = match oi {
            Ok(coins) => coins.iter().map(|c| c.symbol.clone()).collect(),
            Err(e) => {
                warn!("OI ranking fetch failed: {}", e);
                Vec::new()
            }
        };

        if ai500.is_empty() && oi_symbols.is_empty() {
            warn!("Both candidate pools empty, falling back to default coins");
            return Ok(self.default_candidates());
        }

        let merged = merge_pools(&ai500, &oi_symbols, self.max_candidates);
        info!(
            "Candidate pool: {} coins ({} score-ranked, {} OI-ranked)",
            merged.len(),
            ai500.len(),
            oi_symbols.len()
        );
        Ok(merged)
    }
}

#[async_trait]
impl OpenInterestSource for CoinPoolClient {
    async fn oi_top(&self) -> Result<HashMap<String, OiTopData>, AgentError> {
        let coins = self.oi_coins().await?;
        Ok(coins
            .iter()
            .map(|c| {
                (
                    normalize_symbol(&c.symbol),
                    OiTopData {
                        rank: c.rank,
                        oi_delta_pct: c.oi_delta_percent,
                        oi_delta_value: c.oi_delta_value,
                        price_delta_pct: c.price_delta_percent,
                        net_long: c.net_long,
                        net_short: c.net_short,
                    },
                )
            })
            .collect())
    }
}
