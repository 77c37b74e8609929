//! In-memory collaborators shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use perp_agent::agent::ai_client::AIGateway;
use perp_agent::agent::data_fetcher::MarketDataSource;
use perp_agent::agent::observer::{DecisionLogSink, DecisionRecord};
use perp_agent::agent::pool::CandidateProvider;
use perp_agent::agent::{
    AgentError, CandidateCoin, MarketSnapshot, OpenInterest, PerformanceSummary,
};
use perp_agent::config::MarketConfig;

pub struct FakeMarket(pub HashMap<String, MarketSnapshot>);

impl FakeMarket {
    pub fn new() -> Arc<Self> {
        // (symbol, price, open interest in contracts)
        let rows = [
            ("BTCUSDT", 95_000.0, 80_000.0),
            ("SOLUSDT", 185.0, 500_000.0),
            ("TINYUSDT", 0.5, 1_000_000.0),
        ];
        Arc::new(Self(
            rows.iter()
                .map(|(symbol, price, oi)| {
                    (
                        symbol.to_string(),
                        MarketSnapshot {
                            symbol: symbol.to_string(),
                            current_price: *price,
                            ema20: price * 0.99,
                            macd: 1.2,
                            rsi7: 58.0,
                            funding_rate: 0.0001,
                            open_interest: Some(OpenInterest { latest: *oi, average: *oi }),
                            price_change_1h: 0.6,
                            price_change_4h: 1.8,
                            longer_term: None,
                        },
                    )
                })
                .collect(),
        ))
    }
}

#[async_trait]
impl MarketDataSource for FakeMarket {
    async fn get_snapshot(&self, symbol: &str) -> Result<MarketSnapshot, AgentError> {
        self.0
            .get(symbol)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(symbol.to_string()))
    }
}

pub struct FixedCandidates(pub Vec<CandidateCoin>);

#[async_trait]
impl CandidateProvider for FixedCandidates {
    async fn candidates(&self) -> Result<Vec<CandidateCoin>, AgentError> {
        Ok(self.0.clone())
    }
}

/// Replays canned completions and remembers the prompts it was sent.
pub struct ScriptedAi {
    replies: Mutex<VecDeque<Result<String, AgentError>>>,
    user_prompts: Mutex<Vec<String>>,
}

impl ScriptedAi {
    pub fn new(replies: Vec<Result<String, AgentError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            user_prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn last_user_prompt(&self) -> String {
        self.user_prompts.lock().last().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl AIGateway for ScriptedAi {
    async fn complete(
        &self,
        _system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, AgentError> {
        self.user_prompts.lock().push(user_prompt.to_string());
        self.replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(AgentError::AIAnalysis("script exhausted".into())))
    }
}

#[derive(Default)]
pub struct MemoryLog {
    pub records: Mutex<Vec<DecisionRecord>>,
    pub performance: Option<PerformanceSummary>,
}

#[async_trait]
impl DecisionLogSink for MemoryLog {
    async fn record(&self, record: &DecisionRecord) -> Result<(), AgentError> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    async fn performance(&self) -> Result<Option<PerformanceSummary>, AgentError> {
        Ok(self.performance.clone())
    }
}

pub fn market_config() -> MarketConfig {
    MarketConfig {
        market_data_url: String::new(),
        coin_pool_url: None,
        oi_top_url: None,
        use_default_coins: false,
        default_coins: Vec::new(),
        max_concurrent_fetches: 4,
        min_oi_value_usd: 15_000_000.0,
        max_candidates: 20,
    }
}

pub const OPEN_SOL: &str = "SOL holds above EMA20 with bullish MACD, volume confirms.\n\
[{\"symbol\":\"SOLUSDT\",\"action\":\"open_long\",\"leverage\":10,\"position_size_usd\":1200,\
\"stop_loss\":178,\"take_profit\":200,\"confidence\":82,\"risk_usd\":45,\"reasoning\":\"trend continuation\"},\
{\"symbol\":\"BTCUSDT\",\"action\":\"wait\",\"reasoning\":\"no edge\"}]";
