use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agent::data_fetcher::MarketDataSource;
use crate::agent::types::{
    AccountInfo, AgentError, DecisionAction, MarketSnapshot, PositionInfo, PositionSide,
    TradingDecision,
};

/// Exchange acknowledgement for a filled order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub price: f64,
    pub quantity: f64,
}

/// Exchange capability consumed by the pipeline. One implementation per venue.
#[async_trait]
pub trait Trader: Send + Sync {
    async fn get_account(&self) -> Result<AccountInfo, AgentError>;
    async fn get_positions(&self) -> Result<Vec<PositionInfo>, AgentError>;
    async fn open_long(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
    ) -> Result<OrderAck, AgentError>;
    async fn open_short(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
    ) -> Result<OrderAck, AgentError>;
    /// A quantity of 0 closes the whole position.
    async fn close_long(&self, symbol: &str, quantity: f64) -> Result<OrderAck, AgentError>;
    /// A quantity of 0 closes the whole position.
    async fn close_short(&self, symbol: &str, quantity: f64) -> Result<OrderAck, AgentError>;
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), AgentError>;
    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        price: f64,
    ) -> Result<(), AgentError>;
    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        price: f64,
    ) -> Result<(), AgentError>;
}

/// Outcome of dispatching one decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub symbol: String,
    pub action: String,
    pub success: bool,
    pub order_id: Option<String>,
    pub price: Option<f64>,
    pub quantity: Option<f64>,
    pub leverage: Option<u32>,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionResult {
    fn ok(decision: &TradingDecision, ack: Option<&OrderAck>, leverage: Option<u32>) -> Self {
        Self {
            symbol: decision.symbol.clone(),
            action: decision.action.clone(),
            success: true,
            order_id: ack.map(|a| a.order_id.clone()),
            price: ack.map(|a| a.price),
            quantity: ack.map(|a| a.quantity),
            leverage,
            error_message: None,
            timestamp: Utc::now(),
        }
    }

    fn failed(decision: &TradingDecision, error: &AgentError) -> Self {
        Self {
            symbol: decision.symbol.clone(),
            action: decision.action.clone(),
            success: false,
            order_id: None,
            price: None,
            quantity: None,
            leverage: None,
            error_message: Some(error.to_string()),
            timestamp: Utc::now(),
        }
    }
}

/// Reward distance over risk distance from entry. `None` when the stop is on
/// the wrong side of entry or the action does not open.
pub fn reward_risk_ratio(
    action: DecisionAction,
    entry: f64,
    stop_loss: f64,
    take_profit: f64,
) -> Option<f64> {
    let (risk, reward) = match action {
        DecisionAction::OpenLong => (entry - stop_loss, take_profit - entry),
        DecisionAction::OpenShort => (stop_loss - entry, entry - take_profit),
        _ => return None,
    };
    if risk <= 0.0 {
        return None;
    }
    Some(reward / risk)
}

fn dispatch_rank(action: Result<DecisionAction, String>) -> u8 {
    match action {
        Ok(a) if a.is_close() => 0,
        Ok(a) if a.is_open() => 1,
        _ => 2,
    }
}

/// Hands a validated batch to the [`Trader`]. Closes go first so their margin
/// is free before anything opens.
pub struct DecisionExecutor {
    trader: Arc<dyn Trader>,
    account_lock: Mutex<()>,
}

impl DecisionExecutor {
    pub fn new(trader: Arc<dyn Trader>) -> Self {
        Self {
            trader,
            account_lock: Mutex::new(()),
        }
    }

    pub fn trader(&self) -> &Arc<dyn Trader> {
        &self.trader
    }

    pub async fn execute(
        &self,
        decisions: &[TradingDecision],
        market_data: &HashMap<String, MarketSnapshot>,
    ) -> Vec<ExecutionResult> {
        let _guard = self.account_lock.lock().await;

        let mut ordered: Vec<&TradingDecision> = decisions.iter().collect();
        ordered.sort_by_key(|d| dispatch_rank(d.action_kind()));

        let mut results = Vec::with_capacity(ordered.len());
        for decision in ordered {
            let result = match self.execute_one(decision, market_data).await {
                Ok(result) => result,
                Err(e) => {
                    error!("{} {} failed: {}", decision.symbol, decision.action, e);
                    ExecutionResult::failed(decision, &e)
                }
            };
            results.push(result);
        }
        results
    }

    async fn execute_one(
        &self,
        decision: &TradingDecision,
        market_data: &HashMap<String, MarketSnapshot>,
    ) -> Result<ExecutionResult, AgentError> {
        let action = decision
            .action_kind()
            .map_err(|reason| execution_error(decision, reason))?;

        match action {
            DecisionAction::Hold | DecisionAction::Wait => {
                Ok(ExecutionResult::ok(decision, None, None))
            }
            DecisionAction::CloseLong => {
                let ack = self.trader.close_long(&decision.symbol, 0.0).await?;
                info!("Closed long {} @ {:.4}", decision.symbol, ack.price);
                Ok(ExecutionResult::ok(decision, Some(&ack), None))
            }
            DecisionAction::CloseShort => {
                let ack = self.trader.close_short(&decision.symbol, 0.0).await?;
                info!("Closed short {} @ {:.4}", decision.symbol, ack.price);
                Ok(ExecutionResult::ok(decision, Some(&ack), None))
            }
            DecisionAction::OpenLong => {
                self.open(decision, PositionSide::Long, market_data).await
            }
            DecisionAction::OpenShort => {
                self.open(decision, PositionSide::Short, market_data).await
            }
        }
    }

    async fn open(
        &self,
        decision: &TradingDecision,
        side: PositionSide,
        market_data: &HashMap<String, MarketSnapshot>,
    ) -> Result<ExecutionResult, AgentError> {
        let symbol = decision.symbol.as_str();

        let positions = self.trader.get_positions().await?;
        if positions.iter().any(|p| p.symbol == symbol && p.side == side) {
            return Err(execution_error(
                decision,
                format!("{symbol} already has a {side} position"),
            ));
        }

        let price = market_data
            .get(symbol)
            .map(|s| s.current_price)
            .filter(|p| *p > 0.0)
            .ok_or_else(|| execution_error(decision, "no market price this cycle"))?;

        let (Some(size), Some(leverage), Some(stop_loss), Some(take_profit)) = (
            decision.position_size_usd,
            decision.leverage,
            decision.stop_loss,
            decision.take_profit,
        ) else {
            return Err(execution_error(
                decision,
                "open decision is missing sizing fields",
            ));
        };
        let leverage = u32::try_from(leverage)
            .map_err(|_| execution_error(decision, format!("invalid leverage {leverage}")))?;
        let quantity = size / price;

        self.trader.set_leverage(symbol, leverage).await?;
        let ack = match side {
            PositionSide::Long => self.trader.open_long(symbol, quantity, leverage).await?,
            PositionSide::Short => self.trader.open_short(symbol, quantity, leverage).await?,
        };

        if let Err(e) = self
            .trader
            .set_stop_loss(symbol, side, ack.quantity, stop_loss)
            .await
        {
            warn!("Failed to set stop-loss for {}: {}", symbol, e);
        }
        if let Err(e) = self
            .trader
            .set_take_profit(symbol, side, ack.quantity, take_profit)
            .await
        {
            warn!("Failed to set take-profit for {}: {}", symbol, e);
        }

        let rr = decision
            .action_kind()
            .ok()
            .and_then(|a| reward_risk_ratio(a, ack.price, stop_loss, take_profit));
        info!(
            "Opened {} {} qty {:.6} @ {:.4} ({}x, SL {:.4}, TP {:.4}, R:R {})",
            side,
            symbol,
            ack.quantity,
            ack.price,
            leverage,
            stop_loss,
            take_profit,
            rr.map(|r| format!("1:{r:.2}")).unwrap_or_else(|| "n/a".to_string())
        );

        Ok(ExecutionResult::ok(decision, Some(&ack), Some(leverage)))
    }
}

fn execution_error(decision: &TradingDecision, reason: impl Into<String>) -> AgentError {
    AgentError::Execution {
        symbol: decision.symbol.clone(),
        reason: reason.into(),
    }
}

#[derive(Debug, Clone)]
struct PaperPosition {
    symbol: String,
    side: PositionSide,
    entry_price: f64,
    quantity: f64,
    leverage: u32,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
}

impl PaperPosition {
    fn margin(&self) -> f64 {
        self.entry_price * self.quantity / self.leverage.max(1) as f64
    }

    fn pnl_at(&self, price: f64) -> f64 {
        match self.side {
            PositionSide::Long => (price - self.entry_price) * self.quantity,
            PositionSide::Short => (self.entry_price - price) * self.quantity,
        }
    }

    /// Each trigger fires on its own; a missing take-profit leaves the stop armed.
    fn triggered(&self, price: f64) -> bool {
        let (stopped, target_hit) = match self.side {
            PositionSide::Long => (
                self.stop_loss.is_some_and(|sl| price <= sl),
                self.take_profit.is_some_and(|tp| price >= tp),
            ),
            PositionSide::Short => (
                self.stop_loss.is_some_and(|sl| price >= sl),
                self.take_profit.is_some_and(|tp| price <= tp),
            ),
        };
        stopped || target_hit
    }
}

fn position_key(symbol: &str, side: PositionSide) -> String {
    format!("{symbol}_{side}")
}

/// In-memory venue filling at the market-data price.
pub struct PaperTrader {
    prices: Arc<dyn MarketDataSource>,
    positions: DashMap<String, PaperPosition>,
    initial_balance: f64,
    balance: SyncMutex<f64>,
    leverage: DashMap<String, u32>,
}

impl PaperTrader {
    pub fn new(prices: Arc<dyn MarketDataSource>, initial_balance: f64) -> Self {
        Self {
            prices,
            positions: DashMap::new(),
            initial_balance,
            balance: SyncMutex::new(initial_balance),
            leverage: DashMap::new(),
        }
    }

    async fn price(&self, symbol: &str) -> Result<f64, AgentError> {
        let snapshot = self.prices.get_snapshot(symbol).await?;
        if snapshot.current_price <= 0.0 {
            return Err(AgentError::MarketData {
                symbol: symbol.to_string(),
                reason: "non-positive price".to_string(),
            });
        }
        Ok(snapshot.current_price)
    }

    async fn open(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        leverage: u32,
    ) -> Result<OrderAck, AgentError> {
        if quantity <= 0.0 {
            return Err(AgentError::Execution {
                symbol: symbol.to_string(),
                reason: format!("quantity must be positive: {quantity}"),
            });
        }
        let price = self.price(symbol).await?;
        let leverage = self.leverage.get(symbol).map(|l| *l).unwrap_or(leverage);

        let key = position_key(symbol, side);
        if self.positions.contains_key(&key) {
            return Err(AgentError::Execution {
                symbol: symbol.to_string(),
                reason: format!("{side} position already open"),
            });
        }
        self.positions.insert(
            key,
            PaperPosition {
                symbol: symbol.to_string(),
                side,
                entry_price: price,
                quantity,
                leverage,
                stop_loss: None,
                take_profit: None,
            },
        );

        Ok(OrderAck {
            order_id: Uuid::new_v4().to_string(),
            price,
            quantity,
        })
    }

    async fn close(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
    ) -> Result<OrderAck, AgentError> {
        let price = self.price(symbol).await?;
        let key = position_key(symbol, side);

        let closed_qty = {
            let Some(mut position) = self.positions.get_mut(&key) else {
                return Err(AgentError::Execution {
                    symbol: symbol.to_string(),
                    reason: format!("no {side} position to close"),
                });
            };
            let qty = if quantity <= 0.0 || quantity >= position.quantity {
                position.quantity
            } else {
                quantity
            };
            let realized = match side {
                PositionSide::Long => (price - position.entry_price) * qty,
                PositionSide::Short => (position.entry_price - price) * qty,
            };
            *self.balance.lock() += realized;
            position.quantity -= qty;
            qty
        };
        self.positions.remove_if(&key, |_, p| p.quantity <= f64::EPSILON);

        Ok(OrderAck {
            order_id: Uuid::new_v4().to_string(),
            price,
            quantity: closed_qty,
        })
    }

    /// Settles positions whose stop-loss or take-profit has been crossed.
    async fn settle_triggers(&self) {
        let open: Vec<PaperPosition> = self.positions.iter().map(|p| p.value().clone()).collect();
        for position in open {
            let Ok(price) = self.price(&position.symbol).await else {
                continue;
            };
            if position.triggered(price) {
                info!(
                    "Paper {} {} hit stop/target @ {:.4}",
                    position.side, position.symbol, price
                );
                if let Err(e) = self.close(&position.symbol, position.side, 0.0).await {
                    warn!("Failed to settle {}: {}", position.symbol, e);
                }
            }
        }
    }

    fn set_trigger(
        &self,
        symbol: &str,
        side: PositionSide,
        price: f64,
        stop: bool,
    ) -> Result<(), AgentError> {
        let mut position = self
            .positions
            .get_mut(&position_key(symbol, side))
            .ok_or_else(|| AgentError::Execution {
                symbol: symbol.to_string(),
                reason: format!("no {side} position for trigger order"),
            })?;
        if stop {
            position.stop_loss = Some(price);
        } else {
            position.take_profit = Some(price);
        }
        Ok(())
    }
}

#[async_trait]
impl Trader for PaperTrader {
    async fn get_account(&self) -> Result<AccountInfo, AgentError> {
        let positions = self.get_positions().await?;
        let balance = *self.balance.lock();

        let unrealized: f64 = positions.iter().map(|p| p.unrealized_pnl).sum();
        let margin_used: f64 = positions.iter().map(|p| p.margin_used).sum();
        let total_equity = balance + unrealized;
        let total_pnl = total_equity - self.initial_balance;

        Ok(AccountInfo {
            total_equity,
            available_balance: total_equity - margin_used,
            total_pnl,
            total_pnl_pct: if self.initial_balance > 0.0 {
                total_pnl / self.initial_balance * 100.0
            } else {
                0.0
            },
            margin_used,
            margin_used_pct: if total_equity > 0.0 {
                margin_used / total_equity * 100.0
            } else {
                0.0
            },
            position_count: positions.len(),
        })
    }

    async fn get_positions(&self) -> Result<Vec<PositionInfo>, AgentError> {
        self.settle_triggers().await;

        let open: Vec<PaperPosition> = self.positions.iter().map(|p| p.value().clone()).collect();
        let mut out = Vec::with_capacity(open.len());
        for position in open {
            let mark = self.price(&position.symbol).await.unwrap_or(position.entry_price);
            let pnl = position.pnl_at(mark);
            let margin = position.margin();
            let move_to_liq = position.entry_price / position.leverage.max(1) as f64;
            out.push(PositionInfo {
                symbol: position.symbol.clone(),
                side: position.side,
                entry_price: position.entry_price,
                mark_price: mark,
                quantity: position.quantity,
                leverage: position.leverage,
                unrealized_pnl: pnl,
                unrealized_pnl_pct: if margin > 0.0 { pnl / margin * 100.0 } else { 0.0 },
                liquidation_price: match position.side {
                    PositionSide::Long => position.entry_price - move_to_liq,
                    PositionSide::Short => position.entry_price + move_to_liq,
                },
                margin_used: margin,
            });
        }
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(out)
    }

    async fn open_long(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
    ) -> Result<OrderAck, AgentError> {
        self.open(symbol, PositionSide::Long, quantity, leverage).await
    }

    async fn open_short(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
    ) -> Result<OrderAck, AgentError> {
        self.open(symbol, PositionSide::Short, quantity, leverage).await
    }

    async fn close_long(&self, symbol: &str, quantity: f64) -> Result<OrderAck, AgentError> {
        self.close(symbol, PositionSide::Long, quantity).await
    }

    async fn close_short(&self, symbol: &str, quantity: f64) -> Result<OrderAck, AgentError> {
        self.close(symbol, PositionSide::Short, quantity).await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), AgentError> {
        self.leverage.insert(symbol.to_string(), leverage);
        Ok(())
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        _quantity: f64,
        price: f64,
    ) -> Result<(), AgentError> {
        self.set_trigger(symbol, side, price, true)
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        _quantity: f64,
        price: f64,
    ) -> Result<(), AgentError> {
        self.set_trigger(symbol, side, price, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::types::OpenInterest;

    struct Prices(DashMap<String, f64>);

    impl Prices {
        fn new(pairs: &[(&str, f64)]) -> Arc<Self> {
            Arc::new(Self(pairs.iter().map(|(s, p)| (s.to_string(), *p)).collect()))
        }

        fn snapshot(&self, symbol: &str) -> Option<MarketSnapshot> {
            self.0.get(symbol).map(|p| MarketSnapshot {
                symbol: symbol.to_string(),
                current_price: *p,
                ema20: *p,
                macd: 0.0,
                rsi7: 50.0,
                funding_rate: 0.0,
                open_interest: Some(OpenInterest { latest: 1e9, average: 1e9 }),
                price_change_1h: 0.0,
                price_change_4h: 0.0,
                longer_term: None,
            })
        }

        fn map(&self) -> HashMap<String, MarketSnapshot> {
            let symbols: Vec<String> = self.0.iter().map(|e| e.key().clone()).collect();
            symbols
                .into_iter()
                .filter_map(|s| self.snapshot(&s).map(|snap| (s, snap)))
                .collect()
        }
    }

    #[async_trait]
    impl MarketDataSource for Prices {
        async fn get_snapshot(&self, symbol: &str) -> Result<MarketSnapshot, AgentError> {
            self.snapshot(symbol)
                .ok_or_else(|| AgentError::NotFound(symbol.to_string()))
        }
    }

    fn decision(symbol: &str, action: &str) -> TradingDecision {
        TradingDecision {
            symbol: symbol.to_string(),
            action: action.to_string(),
            leverage: None,
            position_size_usd: None,
            stop_loss: None,
            take_profit: None,
            confidence: None,
            risk_usd: None,
            reasoning: String::new(),
        }
    }

    fn open_long(symbol: &str, size: f64, leverage: i64, sl: f64, tp: f64) -> TradingDecision {
        TradingDecision {
            leverage: Some(leverage),
            position_size_usd: Some(size),
            stop_loss: Some(sl),
            take_profit: Some(tp),
            confidence: Some(80.0),
            risk_usd: Some(10.0),
            ..decision(symbol, "open_long")
        }
    }

    #[test]
    fn reward_risk_by_side() {
        use DecisionAction::*;
        assert_eq!(reward_risk_ratio(OpenLong, 100.0, 95.0, 115.0), Some(3.0));
        assert_eq!(reward_risk_ratio(OpenShort, 100.0, 104.0, 92.0), Some(2.0));
        assert_eq!(reward_risk_ratio(OpenLong, 100.0, 101.0, 115.0), None);
        assert_eq!(reward_risk_ratio(Hold, 100.0, 95.0, 115.0), None);
    }

    #[tokio::test]
    async fn closes_run_before_opens() {
        let prices = Prices::new(&[("SOLUSDT", 180.0), ("ETHUSDT", 3500.0)]);
        let trader = Arc::new(PaperTrader::new(prices.clone(), 1000.0));
        trader.open_long("ETHUSDT", 1.0, 10).await.unwrap();

        let executor = DecisionExecutor::new(trader.clone());
        let batch = vec![
            open_long("SOLUSDT", 900.0, 10, 170.0, 200.0),
            decision("BTCUSDT", "wait"),
            decision("ETHUSDT", "close_long"),
        ];
        let results = executor.execute(&batch, &prices.map()).await;

        let order: Vec<_> = results.iter().map(|r| r.action.as_str()).collect();
        assert_eq!(order, ["close_long", "open_long", "wait"]);
        assert!(results.iter().all(|r| r.success));

        let positions = trader.get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].symbol, "SOLUSDT");
        assert!((positions[0].quantity - 5.0).abs() < 1e-9);
        assert_eq!(positions[0].leverage, 10);
    }

    #[tokio::test]
    async fn failure_is_reported_per_decision() {
        let prices = Prices::new(&[("SOLUSDT", 180.0)]);
        let trader = Arc::new(PaperTrader::new(prices.clone(), 1000.0));
        let executor = DecisionExecutor::new(trader);

        let batch = vec![
            decision("DOGEUSDT", "close_short"),
            open_long("SOLUSDT", 500.0, 5, 170.0, 200.0),
        ];
        let results = executor.execute(&batch, &prices.map()).await;
        assert!(!results[0].success);
        assert!(results[0].error_message.is_some());
        assert!(results[1].success);
    }

    #[tokio::test]
    async fn paper_account_tracks_pnl() {
        let prices = Prices::new(&[("SOLUSDT", 100.0)]);
        let trader = PaperTrader::new(prices.clone(), 1000.0);
        trader.set_leverage("SOLUSDT", 5).await.unwrap();
        trader.open_long("SOLUSDT", 5.0, 5).await.unwrap();

        prices.0.insert("SOLUSDT".into(), 110.0);
        let account = trader.get_account().await.unwrap();
        assert!((account.total_equity - 1050.0).abs() < 1e-9);
        assert!((account.margin_used - 100.0).abs() < 1e-9);
        assert_eq!(account.position_count, 1);

        let ack = trader.close_long("SOLUSDT", 0.0).await.unwrap();
        assert_eq!(ack.price, 110.0);
        let account = trader.get_account().await.unwrap();
        assert!((account.total_equity - 1050.0).abs() < 1e-9);
        assert_eq!(account.position_count, 0);
    }

    #[tokio::test]
    async fn paper_stop_loss_triggers() {
        let prices = Prices::new(&[("SOLUSDT", 100.0)]);
        let trader = PaperTrader::new(prices.clone(), 1000.0);
        trader.open_short("SOLUSDT", 2.0, 10).await.unwrap();
        trader
            .set_stop_loss("SOLUSDT", PositionSide::Short, 2.0, 105.0)
            .await
            .unwrap();
        trader
            .set_take_profit("SOLUSDT", PositionSide::Short, 2.0, 90.0)
            .await
            .unwrap();

        prices.0.insert("SOLUSDT".into(), 106.0);
        assert!(trader.get_positions().await.unwrap().is_empty());
        let account = trader.get_account().await.unwrap();
        assert!((account.total_equity - 988.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn stop_loss_fires_without_take_profit() {
        let prices = Prices::new(&[("ETHUSDT", 3000.0)]);
        let trader = PaperTrader::new(prices.clone(), 1000.0);
        trader.open_long("ETHUSDT", 0.1, 10).await.unwrap();
        trader
            .set_stop_loss("ETHUSDT", PositionSide::Long, 0.1, 2900.0)
            .await
            .unwrap();

        prices.0.insert("ETHUSDT".into(), 2950.0);
        assert_eq!(trader.get_positions().await.unwrap().len(), 1);

        prices.0.insert("ETHUSDT".into(), 2880.0);
        assert!(trader.get_positions().await.unwrap().is_empty());
        let account = trader.get_account().await.unwrap();
        assert!((account.total_equity - 988.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn take_profit_fires_without_stop_loss() {
        let prices = Prices::new(&[("SOLUSDT", 100.0)]);
        let trader = PaperTrader::new(prices.clone(), 1000.0);
        trader.open_short("SOLUSDT", 1.0, 5).await.unwrap();
        trader
            .set_take_profit("SOLUSDT", PositionSide::Short, 1.0, 95.0)
            .await
            .unwrap();

        prices.0.insert("SOLUSDT".into(), 94.0);
        assert!(trader.get_positions().await.unwrap().is_empty());
        let account = trader.get_account().await.unwrap();
        assert!((account.total_equity - 1006.0).abs() < 1e-9);
    }
}
