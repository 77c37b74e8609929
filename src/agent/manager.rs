use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::agent::trading_agent::{AgentStats, TradingAgent};
use crate::agent::types::AgentError;

type AgentTask = JoinHandle<Result<(), AgentError>>;

/// Side-by-side view of one trader for comparing instances.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraderSummary {
    pub trader_id: String,
    pub total_equity: f64,
    pub total_pnl: f64,
    pub total_pnl_pct: f64,
    pub position_count: usize,
    pub margin_used_pct: f64,
    pub cycles_run: u64,
    pub is_running: bool,
}

/// Owns several independent trading agents, keyed by trader id.
#[derive(Default)]
pub struct TraderManager {
    agents: DashMap<String, Arc<TradingAgent>>,
    tasks: Mutex<HashMap<String, AgentTask>>,
}

impl TraderManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, agent: TradingAgent) -> Result<Arc<TradingAgent>, AgentError> {
        let trader_id = agent.config().trader_id.clone();
        if self.agents.contains_key(&trader_id) {
            return Err(AgentError::Configuration(format!(
                "Trader {trader_id} is already registered"
            )));
        }

        let agent = Arc::new(agent);
        self.agents.insert(trader_id.clone(), Arc::clone(&agent));
        info!("Registered trader {}", trader_id);
        Ok(agent)
    }

    pub fn get(&self, trader_id: &str) -> Option<Arc<TradingAgent>> {
        self.agents.get(trader_id).map(|a| Arc::clone(a.value()))
    }

    /// Registered ids, sorted.
    pub fn trader_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.iter().map(|a| a.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    fn agents(&self) -> Vec<Arc<TradingAgent>> {
        self.trader_ids()
            .into_iter()
            .filter_map(|id| self.get(&id))
            .collect()
    }

    /// Starts every agent that is not already running, each on its own task.
    pub async fn start_all(&self) {
        for agent in self.agents() {
            let trader_id = agent.config().trader_id.clone();
            match agent.spawn().await {
                Some(task) => {
                    info!("Trader {} started", trader_id);
                    self.tasks.lock().insert(trader_id, task);
                }
                None => warn!("Trader {} is already running", trader_id),
            }
        }
    }

    /// Stops every agent and waits for its task to finish.
    pub async fn stop_all(&self) {
        for agent in self.agents() {
            agent.stop().await;
        }

        let tasks: Vec<(String, AgentTask)> = self.tasks.lock().drain().collect();
        for (trader_id, task) in tasks {
            match task.await {
                Ok(Ok(())) => info!("Trader {} stopped", trader_id),
                Ok(Err(e)) => error!("Trader {} exited with error: {}", trader_id, e),
                Err(e) => error!("Trader {} task failed: {}", trader_id, e),
            }
        }
    }

    pub async fn stats(&self) -> Vec<(String, AgentStats)> {
        let mut out = Vec::with_capacity(self.len());
        for agent in self.agents() {
            out.push((agent.config().trader_id.clone(), agent.get_stats().await));
        }
        out
    }

    /// Account and run state per trader. Traders whose account cannot be
    /// read are left out.
    pub async fn comparison(&self) -> Vec<TraderSummary> {
        let mut out = Vec::with_capacity(self.len());
        for agent in self.agents() {
            let trader_id = agent.config().trader_id.clone();
            let account = match agent.account().await {
                Ok(account) => account,
                Err(e) => {
                    warn!("Skipping {} in comparison: {}", trader_id, e);
                    continue;
                }
            };
            let stats = agent.get_stats().await;
            out.push(TraderSummary {
                trader_id,
                total_equity: account.total_equity,
                total_pnl: account.total_pnl,
                total_pnl_pct: account.total_pnl_pct,
                position_count: account.position_count,
                margin_used_pct: account.margin_used_pct,
                cycles_run: stats.cycles_run,
                is_running: stats.is_running,
            });
        }
        out
    }
}
