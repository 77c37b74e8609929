use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::executor::ExecutionResult;
use crate::agent::types::{
    AccountInfo, AgentError, DecisionAction, PerformanceSummary, PositionInfo, PositionSide,
    SymbolPerformance, TradeOutcome, TradingDecision,
};

const MAX_TRADES_KEPT: usize = 1000;
const RECENT_TRADES: usize = 5;
/// Reported when there are wins and no losses.
const PROFIT_FACTOR_NO_LOSSES: f64 = 999.0;

/// One cycle as written to the decision log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: Uuid,
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
    pub system_prompt: String,
    pub user_prompt: String,
    pub cot_trace: String,
    pub raw_response: String,
    pub decisions: Vec<TradingDecision>,
    pub account: AccountInfo,
    pub positions: Vec<PositionInfo>,
    pub execution: Vec<ExecutionResult>,
    pub success: bool,
    pub error_message: Option<String>,
}

/// Destination for per-cycle records, and the analytics built on them.
#[async_trait]
pub trait DecisionLogSink: Send + Sync {
    async fn record(&self, record: &DecisionRecord) -> Result<(), AgentError>;

    /// `None` until at least one cycle has been recorded.
    async fn performance(&self) -> Result<Option<PerformanceSummary>, AgentError>;
}

/// Cycle-level Sharpe ratio over an equity series. Not annualised; 0 with
/// fewer than two returns or no variance.
pub fn sharpe_ratio<'a>(equity: impl IntoIterator<Item = &'a f64>) -> f64 {
    let equity: Vec<f64> = equity.into_iter().copied().collect();
    let returns: Vec<f64> = equity
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();

    if returns.len() < 2 {
        return 0.0;
    }

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();

    if std_dev == 0.0 { 0.0 } else { mean / std_dev }
}

#[derive(Debug, Clone)]
struct OpenLeg {
    price: f64,
    quantity: f64,
    leverage: u32,
}

/// Rolling analytics state rebuilt from the records it has seen.
#[derive(Debug, Default)]
struct Ledger {
    window: usize,
    equity: VecDeque<f64>,
    open_legs: HashMap<(String, PositionSide), OpenLeg>,
    trades: VecDeque<TradeOutcome>,
    cycles: u64,
}

impl Ledger {
    fn new(window: usize) -> Self {
        Self {
            window: window.max(2),
            ..Default::default()
        }
    }

    fn apply(&mut self, record: &DecisionRecord) {
        self.cycles += 1;
        self.equity.push_back(record.account.total_equity);
        while self.equity.len() > self.window {
            self.equity.pop_front();
        }

        for result in record.execution.iter().filter(|r| r.success) {
            let (Ok(action), Some(price), Some(quantity)) =
                (result.action.parse::<DecisionAction>(), result.price, result.quantity)
            else {
                continue;
            };
            let side = match action {
                DecisionAction::OpenLong | DecisionAction::CloseLong => PositionSide::Long,
                DecisionAction::OpenShort | DecisionAction::CloseShort => PositionSide::Short,
                _ => continue,
            };
            let key = (result.symbol.clone(), side);

            if action.is_open() {
                self.open_legs.insert(
                    key,
                    OpenLeg {
                        price,
                        quantity,
                        leverage: result.leverage.unwrap_or(1),
                    },
                );
            } else if let Some(leg) = self.open_legs.remove(&key) {
                self.trades.push_back(close_trade(&result.symbol, side, &leg, price, quantity));
                while self.trades.len() > MAX_TRADES_KEPT {
                    self.trades.pop_front();
                }
            }
        }
    }

    fn summary(&self) -> PerformanceSummary {
        let mut summary = PerformanceSummary {
            sharpe_ratio: sharpe_ratio(&self.equity),
            ..Default::default()
        };

        let mut total_win_pct = 0.0;
        let mut total_loss_pct = 0.0;
        let mut gross_win = 0.0;
        let mut gross_loss = 0.0;

        for trade in &self.trades {
            summary.total_trades += 1;
            let stats = summary
                .symbol_stats
                .entry(trade.symbol.clone())
                .or_insert_with(|| SymbolPerformance {
                    symbol: trade.symbol.clone(),
                    ..Default::default()
                });
            stats.total_trades += 1;
            stats.total_pnl += trade.pnl;

            if trade.pnl > 0.0 {
                summary.winning_trades += 1;
                stats.winning_trades += 1;
                total_win_pct += trade.pnl_pct;
                gross_win += trade.pnl;
            } else {
                summary.losing_trades += 1;
                stats.losing_trades += 1;
                total_loss_pct += trade.pnl_pct;
                gross_loss += trade.pnl.abs();
            }
        }

        if summary.total_trades > 0 {
            summary.win_rate = summary.winning_trades as f64 / summary.total_trades as f64 * 100.0;
        }
        if summary.winning_trades > 0 {
            summary.avg_win_pct = total_win_pct / summary.winning_trades as f64;
        }
        if summary.losing_trades > 0 {
            summary.avg_loss_pct = total_loss_pct / summary.losing_trades as f64;
        }
        summary.profit_factor = if gross_loss > 0.0 {
            gross_win / gross_loss
        } else if gross_win > 0.0 {
            PROFIT_FACTOR_NO_LOSSES
        } else {
            0.0
        };

        for stats in summary.symbol_stats.values_mut() {
            stats.win_rate = stats.winning_trades as f64 / stats.total_trades as f64 * 100.0;
            stats.avg_pnl = stats.total_pnl / stats.total_trades as f64;
        }

        let mut ranked: Vec<&SymbolPerformance> = summary.symbol_stats.values().collect();
        ranked.sort_by(|a, b| {
            b.total_pnl
                .total_cmp(&a.total_pnl)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });
        summary.best_symbol = ranked.first().map(|s| s.symbol.clone());
        summary.worst_symbol = ranked.last().map(|s| s.symbol.clone());

        summary.recent_trades = self.trades.iter().rev().take(RECENT_TRADES).cloned().collect();
        summary
    }
}

fn close_trade(
    symbol: &str,
    side: PositionSide,
    leg: &OpenLeg,
    close_price: f64,
    quantity: f64,
) -> TradeOutcome {
    let quantity = quantity.min(leg.quantity);
    let pnl = match side {
        PositionSide::Long => (close_price - leg.price) * quantity,
        PositionSide::Short => (leg.price - close_price) * quantity,
    };
    let margin = leg.price * quantity / leg.leverage.max(1) as f64;

    TradeOutcome {
        symbol: symbol.to_string(),
        side,
        open_price: leg.price,
        close_price,
        pnl,
        pnl_pct: if margin > 0.0 { pnl / margin * 100.0 } else { 0.0 },
    }
}

/// Appends one JSON object per cycle and keeps the analytics window in memory.
pub struct JsonlDecisionLog {
    path: PathBuf,
    ledger: SyncMutex<Ledger>,
    write_lock: Mutex<()>,
}

impl JsonlDecisionLog {
    /// Opens the log, replaying any existing records into the window.
    pub async fn open(path: impl AsRef<Path>, sharpe_window: usize) -> Result<Self, AgentError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut ledger = Ledger::new(sharpe_window);
        if tokio::fs::try_exists(&path).await? {
            let content = tokio::fs::read_to_string(&path).await?;
            let mut skipped = 0;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<DecisionRecord>(line) {
                    Ok(record) => ledger.apply(&record),
                    Err(_) => skipped += 1,
                }
            }
            if skipped > 0 {
                warn!("Skipped {} unreadable lines in {}", skipped, path.display());
            }
            info!("Replayed {} cycles from {}", ledger.cycles, path.display());
        }

        Ok(Self {
            path,
            ledger: SyncMutex::new(ledger),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cycles_recorded(&self) -> u64 {
        self.ledger.lock().cycles
    }
}

#[async_trait]
impl DecisionLogSink for JsonlDecisionLog {
    async fn record(&self, record: &DecisionRecord) -> Result<(), AgentError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        {
            let _guard = self.write_lock.lock().await;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
        }

        self.ledger.lock().apply(record);
        debug!("Recorded cycle #{} to {}", record.cycle, self.path.display());
        Ok(())
    }

    async fn performance(&self) -> Result<Option<PerformanceSummary>, AgentError> {
        let ledger = self.ledger.lock();
        if ledger.cycles == 0 {
            return Ok(None);
        }
        Ok(Some(ledger.summary()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use temp_dir::TempDir;

    fn record(cycle: u64, equity: f64, execution: Vec<ExecutionResult>) -> DecisionRecord {
        DecisionRecord {
            id: Uuid::new_v4(),
            cycle,
            timestamp: Utc::now(),
            system_prompt: "system".into(),
            user_prompt: "user".into(),
            cot_trace: "thinking".into(),
            raw_response: "thinking\n[]".into(),
            decisions: Vec::new(),
            account: AccountInfo {
                total_equity: equity,
                ..Default::default()
            },
            positions: Vec::new(),
            execution,
            success: true,
            error_message: None,
        }
    }

    fn fill(
        symbol: &str,
        action: &str,
        price: f64,
        quantity: f64,
        leverage: Option<u32>,
    ) -> ExecutionResult {
        ExecutionResult {
            symbol: symbol.into(),
            action: action.into(),
            success: true,
            order_id: Some("1".into()),
            price: Some(price),
            quantity: Some(quantity),
            leverage,
            error_message: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn sharpe_edge_cases() {
        assert_eq!(sharpe_ratio(&[1000.0, 1010.0]), 0.0);
        assert_eq!(sharpe_ratio(&[1000.0, 1000.0, 1000.0]), 0.0);
        assert!(sharpe_ratio(&[1000.0, 1010.0, 1015.0, 1030.0]) > 0.0);
        assert!(sharpe_ratio(&[1000.0, 990.0, 985.0, 960.0]) < 0.0);
    }

    #[test]
    fn sharpe_matches_hand_computation() {
        // returns: +10%, -5%  -> mean 0.025, pop std 0.075
        let s = sharpe_ratio(&[100.0, 110.0, 104.5]);
        assert!((s - 0.025 / 0.075).abs() < 1e-9);
    }

    #[test]
    fn ledger_pairs_opens_and_closes() {
        let mut ledger = Ledger::new(100);
        let steps = [
            (1000.0, fill("SOLUSDT", "open_long", 100.0, 10.0, Some(10))),
            (1050.0, fill("SOLUSDT", "close_long", 105.0, 10.0, None)),
            (1050.0, fill("DOGEUSDT", "open_short", 0.2, 1000.0, Some(5))),
            (1030.0, fill("DOGEUSDT", "close_short", 0.22, 1000.0, None)),
        ];
        for (cycle, (equity, result)) in (1..).zip(steps) {
            ledger.apply(&record(cycle, equity, vec![result]));
        }

        let summary = ledger.summary();
        assert_eq!(summary.total_trades, 2);
        assert_eq!(summary.winning_trades, 1);
        assert_eq!(summary.win_rate, 50.0);
        assert!((summary.recent_trades[1].pnl - 50.0).abs() < 1e-9);
        assert!((summary.recent_trades[1].pnl_pct - 50.0).abs() < 1e-9);
        assert_eq!(summary.best_symbol.as_deref(), Some("SOLUSDT"));
        assert_eq!(summary.worst_symbol.as_deref(), Some("DOGEUSDT"));
        assert!((summary.profit_factor - 2.5).abs() < 1e-9);
    }

    #[test]
    fn equity_window_is_bounded() {
        let mut ledger = Ledger::new(3);
        for (i, equity) in [1000.0, 500.0, 1000.0, 1010.0, 1020.0].into_iter().enumerate() {
            ledger.apply(&record(i as u64, equity, Vec::new()));
        }
        assert_eq!(ledger.equity.len(), 3);
        assert!(ledger.summary().sharpe_ratio > 0.0);
    }

    #[tokio::test]
    async fn jsonl_log_appends_and_replays() {
        let dir = TempDir::new().unwrap();
        let path = dir.child("logs").join("trader.jsonl");

        let log = JsonlDecisionLog::open(&path, 100).await.unwrap();
        assert!(log.performance().await.unwrap().is_none());
        log.record(&record(1, 1000.0, Vec::new())).await.unwrap();
        log.record(&record(2, 1010.0, Vec::new())).await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content.lines().count(), 2);

        let reopened = JsonlDecisionLog::open(&path, 100).await.unwrap();
        assert_eq!(reopened.cycles_recorded(), 2);
        let perf = reopened.performance().await.unwrap().unwrap();
        assert_eq!(perf.total_trades, 0);
    }
}
