use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::ai_client::AIGateway;
use crate::agent::data_fetcher::MarketContextAssembler;
use crate::agent::executor::{DecisionExecutor, ExecutionResult, Trader};
use crate::agent::observer::{DecisionLogSink, DecisionRecord};
use crate::agent::parser::parse_response;
use crate::agent::pool::CandidateProvider;
use crate::agent::prompt::{Prompts, build_prompts};
use crate::agent::types::{
    AIFullDecision, AccountInfo, AgentError, PositionInfo, TradingContext, TradingDecision,
};
use crate::agent::validator::validate_decisions;
use crate::config::TradingConfig;

#[derive(Debug, Clone)]
pub struct TradingAgentConfig {
    pub trader_id: String,
    pub scan_interval: Duration,
}

/// Collaborators the agent drives each cycle.
pub struct AgentComponents {
    pub trader: Arc<dyn Trader>,
    pub candidates: Arc<dyn CandidateProvider>,
    pub assembler: MarketContextAssembler,
    pub ai: Arc<dyn AIGateway>,
    pub log: Arc<dyn DecisionLogSink>,
}

/// Pipeline stage at which a cycle was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStage {
    AiCall,
    Parse,
    Validate,
}

#[derive(Debug)]
pub enum CycleOutcome {
    Executed {
        decision: AIFullDecision,
        results: Vec<ExecutionResult>,
    },
    /// Nothing was executed; positions are untouched.
    Skipped {
        stage: CycleStage,
        error: AgentError,
        cot_trace: Option<String>,
    },
}

impl CycleOutcome {
    pub fn is_executed(&self) -> bool {
        matches!(self, CycleOutcome::Executed { .. })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentStats {
    pub is_running: bool,
    pub cycles_run: u64,
    pub cycles_skipped: u64,
    pub decisions_executed: u64,
    pub executions_failed: u64,
    pub uptime_seconds: i64,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

/// Runs the decision pipeline for one trading account.
pub struct TradingAgent {
    config: TradingAgentConfig,
    trader: Arc<dyn Trader>,
    candidates: Arc<dyn CandidateProvider>,
    assembler: MarketContextAssembler,
    ai: Arc<dyn AIGateway>,
    executor: DecisionExecutor,
    log: Arc<dyn DecisionLogSink>,
    cycle: AtomicU64,
    started_at: DateTime<Utc>,
    cycle_lock: Mutex<()>,
    is_running: Arc<RwLock<bool>>,
    stop_signal: Notify,
    stats: RwLock<AgentStats>,
}

impl std::fmt::Debug for TradingAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradingAgent")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Per-cycle inputs captured before the AI call, for logging.
struct CycleInputs {
    cycle: u64,
    context: TradingContext,
    prompts: Prompts,
}

impl TradingAgent {
    pub fn new(config: TradingAgentConfig, components: AgentComponents) -> Self {
        info!(
            "Initializing trading agent {} (scan every {:?})",
            config.trader_id, config.scan_interval
        );

        Self {
            executor: DecisionExecutor::new(Arc::clone(&components.trader)),
            trader: components.trader,
            candidates: components.candidates,
            assembler: components.assembler,
            ai: components.ai,
            log: components.log,
            config,
            cycle: AtomicU64::new(0),
            started_at: Utc::now(),
            cycle_lock: Mutex::new(()),
            is_running: Arc::new(RwLock::new(false)),
            stop_signal: Notify::new(),
            stats: RwLock::new(AgentStats::default()),
        }
    }

    pub fn config(&self) -> &TradingAgentConfig {
        &self.config
    }

    /// Tick on the scan interval until [`TradingAgent::stop`] is called.
    pub async fn run(&self) -> Result<(), AgentError> {
        if !self.mark_running().await {
            return Ok(());
        }
        self.run_loop().await
    }

    /// Marks the agent running, then drives [`TradingAgent::run`]'s loop on a
    /// new task. `None` when the agent is already running.
    pub async fn spawn(self: &Arc<Self>) -> Option<JoinHandle<Result<(), AgentError>>> {
        if !self.mark_running().await {
            return None;
        }
        let agent = Arc::clone(self);
        Some(tokio::spawn(async move { agent.run_loop().await }))
    }

    async fn mark_running(&self) -> bool {
        let mut is_running = self.is_running.write().await;
        if *is_running {
            return false;
        }
        *is_running = true;
        true
    }

    async fn run_loop(&self) -> Result<(), AgentError> {
        info!("Starting trading agent {}", self.config.trader_id);
        let mut ticker = interval(self.config.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let stopped = self.stop_signal.notified();
            tokio::pin!(stopped);
            // register before the flag check so a stop in between is not lost
            stopped.as_mut().enable();
            if !*self.is_running.read().await {
                break;
            }

            tokio::select! {
                biased;
                _ = &mut stopped => break,
                _ = ticker.tick() => {}
            }

            match self.run_cycle().await {
                Ok(CycleOutcome::Executed { decision, results }) => {
                    let failed = results.iter().filter(|r| !r.success).count();
                    info!(
                        "[{}] Cycle complete: {} decisions, {} executed, {} failed",
                        self.config.trader_id,
                        decision.decisions.len(),
                        results.len() - failed,
                        failed
                    );
                }
                Ok(CycleOutcome::Skipped { stage, error, .. }) => {
                    warn!("[{}] Cycle skipped at {:?}: {}", self.config.trader_id, stage, error);
                }
                Err(e) => error!(
                    "[{}] Cycle aborted before the AI call: {}",
                    self.config.trader_id, e
                ),
            }
        }

        info!("Trading agent {} stopped", self.config.trader_id);
        Ok(())
    }

    pub async fn stop(&self) {
        info!("Stopping trading agent {}", self.config.trader_id);
        *self.is_running.write().await = false;
        self.stop_signal.notify_waiters();
    }

    /// Runs the pipeline once. Failures at the AI, parse or validate stage
    /// end the cycle as [`CycleOutcome::Skipped`] with nothing executed; an
    /// `Err` means account state could not be read.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, AgentError> {
        let _guard = self.cycle_lock.lock().await;
        let cycle = self.cycle.fetch_add(1, Ordering::SeqCst) + 1;
        info!("=== Cycle #{} ({}) ===", cycle, self.config.trader_id);

        let inputs = self.prepare(cycle).await?;
        let account = inputs.context.account.clone();
        let positions = inputs.context.positions.clone();

        let raw = match self.ai.complete(&inputs.prompts.system, &inputs.prompts.user).await {
            Ok(raw) => raw,
            Err(e) => {
                error!(
                    "AI call failed for cycle #{}: {}\n--- user prompt ---\n{}",
                    cycle, e, inputs.prompts.user
                );
                return Ok(self
                    .skip(
                        &inputs,
                        account,
                        positions,
                        "",
                        Vec::new(),
                        CycleStage::AiCall,
                        e,
                        None,
                    )
                    .await);
            }
        };

        let parsed = match parse_response(&raw) {
            Ok(parsed) => parsed,
            Err(malformed) => {
                error!(
                    "Unparseable AI response in cycle #{}: {}\n--- reasoning ---\n{}\n--- raw ---\n{}",
                    cycle, malformed.reason, malformed.cot_trace, raw
                );
                let trace = malformed.cot_trace.clone();
                return Ok(self
                    .skip(
                        &inputs,
                        account,
                        positions,
                        &raw,
                        Vec::new(),
                        CycleStage::Parse,
                        malformed.into(),
                        Some(trace),
                    )
                    .await);
            }
        };

        let decision = AIFullDecision {
            id: Uuid::new_v4(),
            cot_trace: parsed.cot_trace,
            decisions: parsed.decisions,
            system_prompt: inputs.prompts.system.clone(),
            user_prompt: inputs.prompts.user.clone(),
            raw_response: raw,
            timestamp: Utc::now(),
        };

        if let Err(invalid) = validate_decisions(&decision.decisions, account.total_equity) {
            error!(
                "Rejected decision batch in cycle #{}: {}\n--- reasoning ---\n{}",
                cycle, invalid, decision.cot_trace
            );
            let trace = decision.cot_trace.clone();
            return Ok(self
                .skip(
                    &inputs,
                    account,
                    positions,
                    &decision.raw_response,
                    decision.decisions.clone(),
                    CycleStage::Validate,
                    invalid.into(),
                    Some(trace),
                )
                .await);
        }

        let results = self
            .executor
            .execute(&decision.decisions, &inputs.context.market_data)
            .await;

        let failed = results.iter().filter(|r| !r.success).count() as u64;
        {
            let mut stats = self.stats.write().await;
            stats.cycles_run += 1;
            stats.decisions_executed += results.len() as u64 - failed;
            stats.executions_failed += failed;
            stats.last_cycle_at = Some(decision.timestamp);
        }

        let record = DecisionRecord {
            id: decision.id,
            cycle,
            timestamp: decision.timestamp,
            system_prompt: decision.system_prompt.clone(),
            user_prompt: decision.user_prompt.clone(),
            cot_trace: decision.cot_trace.clone(),
            raw_response: decision.raw_response.clone(),
            decisions: decision.decisions.clone(),
            account,
            positions,
            execution: results.clone(),
            success: failed == 0,
            error_message: None,
        };
        self.write_record(&record).await;

        Ok(CycleOutcome::Executed { decision, results })
    }

    async fn prepare(&self, cycle: u64) -> Result<CycleInputs, AgentError> {
        let account = self.trader.get_account().await?;
        let positions = self.trader.get_positions().await?;

        let candidates = self.candidates.candidates().await.unwrap_or_else(|e| {
            warn!("Candidate screener unavailable: {}", e);
            Vec::new()
        });

        let now = Utc::now();
        let mut context = TradingContext {
            current_time: now,
            cycle,
            runtime_minutes: (now - self.started_at).num_minutes(),
            account,
            positions,
            candidates,
            ..Default::default()
        };

        let stats = self.assembler.assemble(&mut context).await;
        debug!("Market context: {:?}", stats);

        context.performance = match self.log.performance().await {
            Ok(perf) => perf,
            Err(e) => {
                warn!("Performance history unavailable: {}", e);
                None
            }
        };

        let prompts = build_prompts(&context);
        Ok(CycleInputs {
            cycle,
            context,
            prompts,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn skip(
        &self,
        inputs: &CycleInputs,
        account: AccountInfo,
        positions: Vec<PositionInfo>,
        raw_response: &str,
        decisions: Vec<TradingDecision>,
        stage: CycleStage,
        error: AgentError,
        cot_trace: Option<String>,
    ) -> CycleOutcome {
        let now = Utc::now();
        {
            let mut stats = self.stats.write().await;
            stats.cycles_run += 1;
            stats.cycles_skipped += 1;
            stats.last_cycle_at = Some(now);
        }

        let record = DecisionRecord {
            id: Uuid::new_v4(),
            cycle: inputs.cycle,
            timestamp: now,
            system_prompt: inputs.prompts.system.clone(),
            user_prompt: inputs.prompts.user.clone(),
            cot_trace: cot_trace.clone().unwrap_or_default(),
            raw_response: raw_response.to_string(),
            decisions,
            account,
            positions,
            execution: Vec::new(),
            success: false,
            error_message: Some(error.to_string()),
        };
        self.write_record(&record).await;

        CycleOutcome::Skipped {
            stage,
            error,
            cot_trace,
        }
    }

    async fn write_record(&self, record: &DecisionRecord) {
        if let Err(e) = self.log.record(record).await {
            warn!("Failed to write decision record for cycle #{}: {}", record.cycle, e);
        }
    }

    /// Current account state from this agent's venue.
    pub async fn account(&self) -> Result<AccountInfo, AgentError> {
        self.trader.get_account().await
    }

    pub async fn get_stats(&self) -> AgentStats {
        let mut stats = self.stats.read().await.clone();
        stats.is_running = *self.is_running.read().await;
        stats.uptime_seconds = (Utc::now() - self.started_at).num_seconds();
        stats
    }
}

/// Builder for creating trading agent configurations
pub struct TradingAgentConfigBuilder {
    trader_id: Option<String>,
    scan_interval: Duration,
}

impl Default for TradingAgentConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TradingAgentConfigBuilder {
    pub fn new() -> Self {
        Self {
            trader_id: None,
            scan_interval: Duration::from_secs(180),
        }
    }

    pub fn from_config(config: &TradingConfig) -> Self {
        Self::new()
            .with_trader_id(config.trader_id.clone())
            .with_scan_interval(config.scan_interval)
    }

    pub fn with_trader_id(mut self, trader_id: String) -> Self {
        self.trader_id = Some(trader_id);
        self
    }

    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn build(self) -> Result<TradingAgentConfig, AgentError> {
        let trader_id = self
            .trader_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| AgentError::Configuration("Trader id required".to_string()))?;

        if self.scan_interval.is_zero() {
            return Err(AgentError::Configuration("Scan interval must be positive".to_string()));
        }

        Ok(TradingAgentConfig {
            trader_id,
            scan_interval: self.scan_interval,
        })
    }
}
