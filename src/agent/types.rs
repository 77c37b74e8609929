use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Symbols that get the higher leverage and size caps.
pub const MAJOR_SYMBOLS: [&str; 2] = ["BTCUSDT", "ETHUSDT"];

pub fn is_major(symbol: &str) -> bool {
    MAJOR_SYMBOLS.contains(&symbol)
}

/// Open interest for a symbol, latest sample vs. the recent average.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenInterest {
    pub latest: f64,
    pub average: f64,
}

impl OpenInterest {
    /// Percentage change of the latest sample against the average.
    pub fn change_pct(&self) -> f64 {
        if self.average == 0.0 {
            return 0.0;
        }
        (self.latest - self.average) / self.average * 100.0
    }
}

/// 4h context attached to a snapshot when the data source has it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongerTermContext {
    pub ema20: f64,
    pub ema50: f64,
    pub atr3: f64,
    pub atr14: f64,
    pub current_volume: f64,
    pub average_volume: f64,
}

/// Pre-computed technical state for one symbol, valid for a single cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub current_price: f64,
    pub ema20: f64,
    pub macd: f64,
    pub rsi7: f64,
    #[serde(default)]
    pub funding_rate: f64,
    #[serde(default)]
    pub open_interest: Option<OpenInterest>,
    #[serde(default)]
    pub price_change_1h: f64,
    #[serde(default)]
    pub price_change_4h: f64,
    #[serde(default)]
    pub longer_term: Option<LongerTermContext>,
}

impl MarketSnapshot {
    /// Open interest value in USD (contracts x price), if open interest is known.
    pub fn open_interest_value_usd(&self) -> Option<f64> {
        self.open_interest
            .as_ref()
            .map(|oi| oi.latest * self.current_price)
    }
}

/// Screeners that can nominate a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    /// Score-ranked coin pool.
    Ai500,
    /// Open-interest growth ranking.
    OiTop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateCoin {
    pub symbol: String,
    pub sources: Vec<CandidateSource>,
}

impl CandidateCoin {
    pub fn new(symbol: impl Into<String>, sources: Vec<CandidateSource>) -> Self {
        Self {
            symbol: symbol.into(),
            sources,
        }
    }

    pub fn is_dual_signal(&self) -> bool {
        self.sources.len() > 1
    }
}

/// Open-interest momentum record from the OI ranking source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OiTopData {
    pub rank: u32,
    pub oi_delta_pct: f64,
    pub oi_delta_value: f64,
    pub price_delta_pct: f64,
    pub net_long: f64,
    pub net_short: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionInfo {
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: f64,
    pub mark_price: f64,
    pub quantity: f64,
    pub leverage: u32,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_pct: f64,
    pub liquidation_price: f64,
    pub margin_used: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub total_equity: f64,
    pub available_balance: f64,
    pub total_pnl: f64,
    pub total_pnl_pct: f64,
    pub margin_used: f64,
    pub margin_used_pct: f64,
    pub position_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub symbol: String,
    pub side: PositionSide,
    pub open_price: f64,
    pub close_price: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolPerformance {
    pub symbol: String,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub avg_pnl: f64,
}

/// Historical performance computed by the analytics side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub win_rate: f64,
    pub avg_win_pct: f64,
    pub avg_loss_pct: f64,
    pub profit_factor: f64,
    /// Cycle-level, not annualized.
    pub sharpe_ratio: f64,
    pub best_symbol: Option<String>,
    pub worst_symbol: Option<String>,
    pub symbol_stats: HashMap<String, SymbolPerformance>,
    pub recent_trades: Vec<TradeOutcome>,
}

/// Everything the pipeline knows about one cycle.
#[derive(Debug, Clone, Default)]
pub struct TradingContext {
    pub current_time: DateTime<Utc>,
    pub cycle: u64,
    pub runtime_minutes: i64,
    pub account: AccountInfo,
    pub positions: Vec<PositionInfo>,
    pub candidates: Vec<CandidateCoin>,
    pub market_data: HashMap<String, MarketSnapshot>,
    pub oi_top_data: HashMap<String, OiTopData>,
    pub performance: Option<PerformanceSummary>,
}

impl TradingContext {
    pub fn holds(&self, symbol: &str) -> bool {
        self.positions.iter().any(|p| p.symbol == symbol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    Hold,
    Wait,
}

impl DecisionAction {
    pub const ALL: [DecisionAction; 6] = [
        DecisionAction::OpenLong,
        DecisionAction::OpenShort,
        DecisionAction::CloseLong,
        DecisionAction::CloseShort,
        DecisionAction::Hold,
        DecisionAction::Wait,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionAction::OpenLong => "open_long",
            DecisionAction::OpenShort => "open_short",
            DecisionAction::CloseLong => "close_long",
            DecisionAction::CloseShort => "close_short",
            DecisionAction::Hold => "hold",
            DecisionAction::Wait => "wait",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, DecisionAction::OpenLong | DecisionAction::OpenShort)
    }

    pub fn is_close(&self) -> bool {
        matches!(self, DecisionAction::CloseLong | DecisionAction::CloseShort)
    }
}

impl fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecisionAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DecisionAction::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| format!("invalid action: {s}"))
    }
}

/// One instruction as emitted by the model.
///
/// `action` stays a raw string so an unknown value survives decoding and is
/// rejected by the validator with its name; use [`TradingDecision::action_kind`]
/// once validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingDecision {
    pub symbol: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leverage: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_size_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_usd: Option<f64>,
    #[serde(default)]
    pub reasoning: String,
}

impl TradingDecision {
    pub fn action_kind(&self) -> Result<DecisionAction, String> {
        self.action.parse()
    }
}

/// Terminal output of a cycle: reasoning trace, decisions and the prompts
/// that produced them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AIFullDecision {
    pub id: Uuid,
    pub cot_trace: String,
    pub decisions: Vec<TradingDecision>,
    pub system_prompt: String,
    pub user_prompt: String,
    pub raw_response: String,
    pub timestamp: DateTime<Utc>,
}

/// The model's output could not be turned into a decision array.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{reason}")]
pub struct MalformedResponse {
    pub reason: String,
    /// Offending JSON substring, when one was located.
    pub fragment: Option<String>,
    /// Reasoning extracted before the failure.
    pub cot_trace: String,
}

/// First rule violation in a batch. `index` is 1-based.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("decision #{index} ({symbol}): {reason}")]
pub struct ValidationError {
    pub index: usize,
    pub symbol: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("AI analysis error: {0}")]
    AIAnalysis(String),

    #[error("transient AI endpoint failure: {0}")]
    AITransient(String),

    #[error("AI call failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("market data error for {symbol}: {reason}")]
    MarketData { symbol: String, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("malformed AI response: {0}")]
    MalformedResponse(#[from] MalformedResponse),

    #[error("decision validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("execution failed for {symbol}: {reason}")]
    Execution { symbol: String, reason: String },
}
