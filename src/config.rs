//! Configuration loaded from environment variables into an explicit struct.
//!
//! Built once at startup and handed to each component's constructor.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use crate::agent::ai_client::{AiProvider, AuthStrategy, ProviderConfig};
use crate::agent::scanner::ScanConfig;

/// Coins scanned when no pool URL is configured.
pub const DEFAULT_COINS: [&str; 8] = ["BTC", "ETH", "SOL", "BNB", "XRP", "DOGE", "ADA", "HYPE"];

#[derive(Debug, Clone)]
pub struct Config {
    pub market: MarketConfig,
    pub scanner: ScanConfig,
    /// One entry per trading instance, in `TRADER_IDS` order.
    pub traders: Vec<TraderConfig>,
}

/// Settings owned by a single trading instance.
#[derive(Debug, Clone)]
pub struct TraderConfig {
    pub ai: AiConfig,
    pub trading: TradingConfig,
}

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub provider: ProviderConfig,
    pub api_key: String,
    /// Per-attempt bound; full-context prompts regularly take over a minute.
    pub timeout: Duration,
    pub max_retries: u32,
    /// Wait before attempt N+1 is `N * retry_backoff`.
    pub retry_backoff: Duration,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct MarketConfig {
    pub market_data_url: String,
    pub coin_pool_url: Option<String>,
    pub oi_top_url: Option<String>,
    pub use_default_coins: bool,
    pub default_coins: Vec<String>,
    pub max_concurrent_fetches: usize,
    /// Candidates below this open-interest value (USD) are dropped.
    pub min_oi_value_usd: f64,
    pub max_candidates: usize,
}

#[derive(Debug, Clone)]
pub struct TradingConfig {
    pub trader_id: String,
    pub scan_interval: Duration,
    pub paper_equity_usd: f64,
    pub decision_log_path: PathBuf,
    /// Number of cycles in the Sharpe window.
    pub sharpe_window: usize,
}

impl Config {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    ///
    /// Per-trader keys are read as `TRADER_<ID>_<KEY>` first and fall back to
    /// the shared `<KEY>`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let market = MarketConfig {
            market_data_url: var("MARKET_DATA_URL")
                .ok_or_else(|| anyhow!("MARKET_DATA_URL environment variable is required"))?,
            coin_pool_url: var("COIN_POOL_URL"),
            oi_top_url: var("OI_TOP_URL"),
            use_default_coins: parse_or(&var, "USE_DEFAULT_COINS", false)?,
            default_coins: DEFAULT_COINS.iter().map(|c| format!("{c}USDT")).collect(),
            max_concurrent_fetches: parse_or(&var, "MAX_CONCURRENT_FETCHES", 8)?,
            min_oi_value_usd: parse_or(&var, "MIN_OI_VALUE_USD", 15_000_000.0)?,
            max_candidates: parse_or(&var, "MAX_CANDIDATES", 20)?,
        };
        if market.max_concurrent_fetches == 0 {
            return Err(anyhow!("MAX_CONCURRENT_FETCHES must be at least 1"));
        }

        let defaults = ScanConfig::default();
        let scanner = ScanConfig {
            enabled: parse_or(&var, "SCANNER_ENABLED", defaults.enabled)?,
            min_confidence: parse_or(&var, "SCAN_MIN_CONFIDENCE", defaults.min_confidence)?,
            min_priority: parse_or(&var, "SCAN_MIN_PRIORITY", defaults.min_priority)?,
            min_reward_risk: parse_or(&var, "SCAN_MIN_REWARD_RISK", defaults.min_reward_risk)?,
            enable_long: parse_or(&var, "SCAN_ENABLE_LONG", defaults.enable_long)?,
            enable_short: parse_or(&var, "SCAN_ENABLE_SHORT", defaults.enable_short)?,
            max_concurrent: parse_or(&var, "SCAN_MAX_CONCURRENT", defaults.max_concurrent)?,
            top_n: parse_or(&var, "SCAN_TOP_N", defaults.top_n)?,
        };

        let log_dir = var("DECISION_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("decision_logs"));
        let ids = trader_ids(&var)?;
        let single = ids.len() == 1;
        let traders = ids
            .into_iter()
            .map(|id| {
                let prefix = format!("TRADER_{}_", env_key(&id));
                let scoped = |key: &str| var(&format!("{prefix}{key}")).or_else(|| var(key));
                // a shared log path only makes sense for a single trader
                let log_path = var(&format!("{prefix}DECISION_LOG_PATH"))
                    .or_else(|| var("DECISION_LOG_PATH").filter(|_| single))
                    .map(PathBuf::from)
                    .unwrap_or_else(|| log_dir.join(format!("{id}.jsonl")));
                trader_config(&scoped, id.clone(), log_path)
                    .with_context(|| format!("invalid configuration for trader {id}"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            market,
            scanner,
            traders,
        })
    }
}

/// `TRADER_IDS` (comma separated), else `TRADER_ID`, else a single `paper`.
fn trader_ids<F>(var: &F) -> Result<Vec<String>>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = var("TRADER_IDS")
        .or_else(|| var("TRADER_ID"))
        .unwrap_or_else(|| "paper".to_string());

    let mut ids: Vec<String> = Vec::new();
    for id in raw.split(',').map(str::trim).filter(|id| !id.is_empty()) {
        if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(anyhow!("trader id {id:?} may only contain letters, digits, '-' and '_'"));
        }
        if ids.iter().any(|known| env_key(known) == env_key(id)) {
            return Err(anyhow!("duplicate trader id {id:?}"));
        }
        ids.push(id.to_string());
    }
    if ids.is_empty() {
        return Err(anyhow!("TRADER_IDS lists no trader"));
    }
    Ok(ids)
}

fn env_key(trader_id: &str) -> String {
    trader_id.to_ascii_uppercase().replace('-', "_")
}

fn trader_config<F>(var: &F, trader_id: String, decision_log_path: PathBuf) -> Result<TraderConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let provider_name = var("AI_PROVIDER").unwrap_or_else(|| "deepseek".to_string());
    let provider_kind = AiProvider::from_str(&provider_name).map_err(|e| anyhow!(e))?;
    let mut provider =
        ProviderConfig::resolve(provider_kind, var("AI_BASE_URL"), var("AI_MODEL"))
            .map_err(|e| anyhow!(e))?;
    if let Some(name) = var("AI_AUTH_HEADER") {
        provider.auth = AuthStrategy::Header { name };
    }

    let ai = AiConfig {
        provider,
        api_key: var("AI_API_KEY")
            .ok_or_else(|| anyhow!("AI_API_KEY environment variable is required"))?,
        timeout: Duration::from_secs(parse_or(var, "AI_TIMEOUT_SECS", 120)?),
        max_retries: parse_or(var, "AI_MAX_RETRIES", 3)?,
        retry_backoff: Duration::from_secs(parse_or(var, "AI_RETRY_BACKOFF_SECS", 2)?),
        temperature: parse_or(var, "AI_TEMPERATURE", 0.5)?,
        max_tokens: parse_or(var, "AI_MAX_TOKENS", 2000)?,
    };
    if ai.max_retries == 0 {
        return Err(anyhow!("AI_MAX_RETRIES must be at least 1"));
    }

    let trading = TradingConfig {
        scan_interval: Duration::from_secs(parse_or(var, "SCAN_INTERVAL_SECS", 180)?),
        paper_equity_usd: parse_or(var, "PAPER_EQUITY_USD", 1000.0)?,
        sharpe_window: parse_or(var, "SHARPE_WINDOW", 100)?,
        decision_log_path,
        trader_id,
    };

    Ok(TraderConfig { ai, trading })
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw}")),
        None => Ok(default),
    }
}
