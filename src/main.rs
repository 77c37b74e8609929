//! # perp-agent
//!
//! Runs one or more AI decision loops, each against its own paper account.
//!
//! ## Environment Setup
//! Configuration is read from the environment (a `.env` file is loaded if
//! present). At minimum set `AI_API_KEY` and `MARKET_DATA_URL`:
//! ```bash
//! AI_PROVIDER=deepseek AI_API_KEY=sk-... MARKET_DATA_URL=http://localhost:8080/market cargo run
//! ```
//!
//! Several instances run side by side when `TRADER_IDS=alpha,beta` is set;
//! any key can be overridden per instance as `TRADER_<ID>_<KEY>`.
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use perp_agent::agent::TradingAgent;
use perp_agent::agent::ai_client::{AIClient, AIGateway};
use perp_agent::agent::data_fetcher::{
    HttpMarketDataSource, MarketContextAssembler, MarketDataSource,
};
use perp_agent::agent::executor::PaperTrader;
use perp_agent::agent::manager::TraderManager;
use perp_agent::agent::observer::JsonlDecisionLog;
use perp_agent::agent::pool::{CandidateProvider, CoinPoolClient, OpenInterestSource};
use perp_agent::agent::scanner::{AiSignalSource, OpportunityScanner, ScreenedCandidates};
use perp_agent::agent::trading_agent::{AgentComponents, TradingAgentConfigBuilder};
use perp_agent::config::{Config, TraderConfig};

struct Shared {
    config: Config,
    market: Arc<dyn MarketDataSource>,
    pool: Arc<CoinPoolClient>,
}

async fn build_agent(shared: &Shared, trader: &TraderConfig) -> Result<TradingAgent> {
    let trading = &trader.trading;
    let ai: Arc<dyn AIGateway> = Arc::new(AIClient::new(&trader.ai)?);

    let oi_source: Arc<dyn OpenInterestSource> = shared.pool.clone();
    let assembler =
        MarketContextAssembler::new(shared.market.clone(), Some(oi_source), &shared.config.market);

    let candidates: Arc<dyn CandidateProvider> = if shared.config.scanner.enabled {
        let scanner = OpportunityScanner::new(
            shared.market.clone(),
            Arc::new(AiSignalSource::new(ai.clone())),
            shared.config.scanner.clone(),
        );
        Arc::new(ScreenedCandidates::new(shared.pool.clone(), scanner))
    } else {
        shared.pool.clone()
    };

    let log = JsonlDecisionLog::open(&trading.decision_log_path, trading.sharpe_window)
        .await
        .with_context(|| format!("Failed to open {}", trading.decision_log_path.display()))?;

    let agent_config = TradingAgentConfigBuilder::from_config(trading).build()?;
    Ok(TradingAgent::new(
        agent_config,
        AgentComponents {
            trader: Arc::new(PaperTrader::new(shared.market.clone(), trading.paper_equity_usd)),
            candidates,
            assembler,
            ai,
            log: Arc::new(log),
        },
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false).compact())
        .init();

    tracing::info!("🏁 Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(
        "{} trader(s) | market data: {} | scanner {}",
        config.traders.len(),
        config.market.market_data_url,
        if config.scanner.enabled { "on" } else { "off" }
    );

    let shared = Shared {
        market: Arc::new(HttpMarketDataSource::new(config.market.market_data_url.clone())?),
        pool: Arc::new(CoinPoolClient::new(&config.market)?),
        config,
    };

    let manager = TraderManager::new();
    for trader in &shared.config.traders {
        tracing::info!(
            "[{}] AI provider: {:?} ({})",
            trader.trading.trader_id,
            trader.ai.provider.provider,
            trader.ai.provider.model
        );
        let agent = build_agent(&shared, trader)
            .await
            .with_context(|| format!("Failed to build trader {}", trader.trading.trader_id))?;
        manager.add(agent)?;
    }

    manager.start_all().await;
    tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    manager.stop_all().await;

    for (trader_id, stats) in manager.stats().await {
        tracing::info!(
            "[{}] Shutdown after {} cycles ({} skipped, {} decisions executed)",
            trader_id,
            stats.cycles_run,
            stats.cycles_skipped,
            stats.decisions_executed
        );
    }
    for summary in manager.comparison().await {
        tracing::info!(
            "[{}] equity {:.2} | pnl {:+.2} ({:+.2}%) | {} positions",
            summary.trader_id,
            summary.total_equity,
            summary.total_pnl,
            summary.total_pnl_pct,
            summary.position_count
        );
    }
    Ok(())
}
