//! Candidate pre-screening: one signal per symbol, scored and ranked so only
//! the strongest setups reach the decision prompt.

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::agent::ai_client::AIGateway;
use crate::agent::data_fetcher::MarketDataSource;
use crate::agent::executor::reward_risk_ratio;
use crate::agent::parser::{find_matching_brace, normalize_quotes};
use crate::agent::pool::CandidateProvider;
use crate::agent::prompt::write_snapshot;
use crate::agent::types::{
    AgentError, CandidateCoin, DecisionAction, MalformedResponse, MarketSnapshot,
};

/// Scan errors logged individually before the rest are only counted.
const LOGGED_ERRORS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct ScanConfig {
    pub enabled: bool,
    pub min_confidence: f64,
    /// Opportunities scoring below this are dropped.
    pub min_priority: u32,
    pub min_reward_risk: f64,
    pub enable_long: bool,
    pub enable_short: bool,
    pub max_concurrent: usize,
    pub top_n: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_confidence: 65.0,
            min_priority: 60,
            min_reward_risk: 1.5,
            enable_long: true,
            enable_short: true,
            max_concurrent: 10,
            top_n: 10,
        }
    }
}

/// Single-symbol call from the signal model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingSignal {
    #[serde(default)]
    pub symbol: String,
    /// Upper-case action name, e.g. `OPEN_LONG`.
    pub signal: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub entry_price: f64,
    #[serde(default)]
    pub stop_loss: f64,
    #[serde(default)]
    pub take_profit: f64,
}

impl TradingSignal {
    pub fn action(&self) -> Result<DecisionAction, String> {
        self.signal.trim().to_ascii_lowercase().parse()
    }

    /// 0 when the stop is on the wrong side or the signal does not open.
    pub fn reward_risk(&self) -> f64 {
        self.action()
            .ok()
            .and_then(|a| reward_risk_ratio(a, self.entry_price, self.stop_loss, self.take_profit))
            .unwrap_or(0.0)
    }
}

/// A signal that passed every scan gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Opportunity {
    pub symbol: String,
    pub action: DecisionAction,
    pub confidence: f64,
    pub reasoning: String,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub current_price: f64,
    pub priority: u32,
    pub reward_risk: f64,
    pub analyzed_at: DateTime<Utc>,
}

/// Only opening signals with prices on the correct sides of entry qualify.
pub fn is_valid_signal(signal: &TradingSignal, config: &ScanConfig) -> bool {
    if signal.confidence < config.min_confidence {
        return false;
    }

    let (entry, sl, tp) = (signal.entry_price, signal.stop_loss, signal.take_profit);
    let ordered = match signal.action() {
        Ok(DecisionAction::OpenLong) => config.enable_long && sl < entry && entry < tp,
        Ok(DecisionAction::OpenShort) => config.enable_short && tp < entry && entry < sl,
        _ => false,
    };

    ordered && entry > 0.0 && sl > 0.0 && tp > 0.0
}

/// Scores a signal out of 100: confidence (40), reward:risk (25), indicator
/// confirmation (25) and volume expansion (10).
pub fn priority_score(signal: &TradingSignal, snapshot: &MarketSnapshot) -> u32 {
    let mut score = (signal.confidence.clamp(0.0, 100.0) * 0.4) as u32;

    score += match signal.reward_risk() {
        rr if rr >= 3.0 => 25,
        rr if rr >= 2.5 => 20,
        rr if rr >= 2.0 => 15,
        rr if rr >= 1.5 => 10,
        _ => 0,
    };

    let long = matches!(signal.action(), Ok(DecisionAction::OpenLong));
    let short = matches!(signal.action(), Ok(DecisionAction::OpenShort));
    let rsi = snapshot.rsi7;

    score += if (long && rsi < 35.0) || (short && rsi > 65.0) {
        7
    } else if (long && rsi < 45.0) || (short && rsi > 55.0) {
        3
    } else {
        0
    };
    if (long && snapshot.macd > 0.0) || (short && snapshot.macd < 0.0) {
        score += 6;
    }
    let price = snapshot.current_price;
    if (long && price > snapshot.ema20) || (short && price < snapshot.ema20) {
        score += 6;
    }
    // crowded funding on the other side pays the position
    let funding = snapshot.funding_rate;
    if (long && funding < -0.0001) || (short && funding > 0.0001) {
        score += 6;
    }

    if let Some(lt) = snapshot.longer_term.as_ref().filter(|lt| lt.average_volume > 0.0) {
        score += match lt.current_volume / lt.average_volume {
            ratio if ratio > 2.0 => 10,
            ratio if ratio > 1.5 => 7,
            ratio if ratio > 1.2 => 4,
            _ => 0,
        };
    }

    score
}

/// Highest priority first; equal scores keep scan order. Keeps at most `n`.
pub fn filter_top_n(mut opportunities: Vec<Opportunity>, n: usize) -> Vec<Opportunity> {
    opportunities.sort_by(|a, b| b.priority.cmp(&a.priority));
    opportunities.truncate(n);
    opportunities
}

/// Produces a per-symbol signal from a market snapshot.
#[async_trait]
pub trait SignalSource: Send + Sync {
    async fn signal(&self, snapshot: &MarketSnapshot) -> Result<TradingSignal, AgentError>;
}

const SIGNAL_SYSTEM_PROMPT: &str = "You are an aggressive crypto futures trader who hunts for \
setups. Given one symbol's market data, commit to a direction whenever the evidence leans one \
way: prefer OPEN_LONG or OPEN_SHORT over WAIT, and answer WAIT only when both sides are truly \
balanced. Stop-loss and take-profit must give a reward:risk of at least 1:2.";

fn build_signal_prompt(snapshot: &MarketSnapshot) -> String {
    let mut p = String::new();
    let _ = writeln!(p, "Symbol: {}\n", snapshot.symbol);
    write_snapshot(&mut p, snapshot);
    p.push_str(
        "\nReply with one JSON object only:\n\
         {\"signal\": \"OPEN_LONG | OPEN_SHORT | CLOSE_LONG | CLOSE_SHORT | HOLD | WAIT\", \
         \"confidence\": 0-100, \"reasoning\": \"key evidence, brief\", \
         \"entry_price\": 0.0, \"stop_loss\": 0.0, \"take_profit\": 0.0}\n",
    );
    p
}

/// Pulls the signal object out of a reply, preferring a fenced ```json block.
pub fn parse_signal(raw: &str, symbol: &str) -> Result<TradingSignal, MalformedResponse> {
    let malformed = |reason: String, fragment: Option<&str>| MalformedResponse {
        reason,
        fragment: fragment.map(str::to_string),
        cot_trace: String::new(),
    };

    let fenced = raw.find("```json").and_then(|start| {
        let body = &raw[start + "```json".len()..];
        body.find("```").map(|end| body[..end].trim())
    });
    let json = match fenced {
        Some(json) => json,
        None => {
            let start = raw
                .find('{')
                .ok_or_else(|| malformed("no JSON object found in response".to_string(), None))?;
            let end = find_matching_brace(raw, start).ok_or_else(|| {
                malformed("unterminated JSON object".to_string(), Some(&raw[start..]))
            })?;
            &raw[start..=end]
        }
    };

    let mut signal: TradingSignal = serde_json::from_str(&normalize_quotes(json))
        .map_err(|e| malformed(format!("JSON decode failed: {e}"), Some(json)))?;
    if let Err(reason) = signal.action() {
        return Err(malformed(reason, Some(json)));
    }
    if !(0.0..=100.0).contains(&signal.confidence) {
        signal.confidence = 50.0;
    }
    signal.symbol = symbol.to_string();
    Ok(signal)
}

/// Asks the completion endpoint for a signal on each symbol.
pub struct AiSignalSource {
    ai: Arc<dyn AIGateway>,
}

impl AiSignalSource {
    pub fn new(ai: Arc<dyn AIGateway>) -> Self {
        Self { ai }
    }
}

#[async_trait]
impl SignalSource for AiSignalSource {
    async fn signal(&self, snapshot: &MarketSnapshot) -> Result<TradingSignal, AgentError> {
        let raw = self
            .ai
            .complete(SIGNAL_SYSTEM_PROMPT, &build_signal_prompt(snapshot))
            .await?;
        Ok(parse_signal(&raw, &snapshot.symbol)?)
    }
}

/// Counters and ranked output of one scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanReport {
    pub opportunities: Vec<Opportunity>,
    pub scanned: usize,
    pub errors: usize,
}

pub struct OpportunityScanner {
    market: Arc<dyn MarketDataSource>,
    signals: Arc<dyn SignalSource>,
    config: ScanConfig,
    permits: Arc<Semaphore>,
}

impl OpportunityScanner {
    pub fn new(
        market: Arc<dyn MarketDataSource>,
        signals: Arc<dyn SignalSource>,
        config: ScanConfig,
    ) -> Self {
        Self {
            market,
            signals,
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            config,
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    async fn scan_symbol(&self, symbol: &str) -> Result<Option<Opportunity>, AgentError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| AgentError::MarketData {
                symbol: symbol.to_string(),
                reason: format!("scan pool closed: {e}"),
            })?;

        let snapshot = self.market.get_snapshot(symbol).await?;
        let signal = self.signals.signal(&snapshot).await?;
        if !is_valid_signal(&signal, &self.config) {
            debug!("{}: {} signal rejected", symbol, signal.signal);
            return Ok(None);
        }

        let priority = priority_score(&signal, &snapshot);
        let reward_risk = signal.reward_risk();
        if priority < self.config.min_priority || reward_risk < self.config.min_reward_risk {
            debug!(
                "{}: priority {} / R:R {:.2} below threshold",
                symbol, priority, reward_risk
            );
            return Ok(None);
        }

        let Ok(action) = signal.action() else {
            return Ok(None);
        };
        Ok(Some(Opportunity {
            symbol: symbol.to_string(),
            action,
            confidence: signal.confidence,
            reasoning: signal.reasoning,
            entry_price: signal.entry_price,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            current_price: snapshot.current_price,
            priority,
            reward_risk,
            analyzed_at: Utc::now(),
        }))
    }

    /// Scans every symbol concurrently (bounded) and returns the top
    /// opportunities. Per-symbol failures are counted, never raised.
    pub async fn scan(&self, symbols: &[String]) -> ScanReport {
        let start = Instant::now();
        let scans = symbols.iter().map(|s| async move { (s, self.scan_symbol(s).await) });
        let results = futures::future::join_all(scans).await;

        let mut report = ScanReport {
            scanned: symbols.len(),
            ..Default::default()
        };
        let mut found = Vec::new();
        for (symbol, result) in results {
            match result {
                Ok(Some(opportunity)) => found.push(opportunity),
                Ok(None) => {}
                Err(e) => {
                    report.errors += 1;
                    if report.errors <= LOGGED_ERRORS {
                        warn!("Scan of {} failed: {}", symbol, e);
                    }
                }
            }
        }
        if report.errors > LOGGED_ERRORS {
            warn!("{} more scan errors", report.errors - LOGGED_ERRORS);
        }

        report.opportunities = filter_top_n(found, self.config.top_n);
        info!(
            "Scanned {} symbols in {:.1}s: {} opportunities",
            report.scanned,
            start.elapsed().as_secs_f64(),
            report.opportunities.len()
        );
        report
    }
}

/// Wraps a screener so its candidates are re-ranked by scan priority.
pub struct ScreenedCandidates {
    inner: Arc<dyn CandidateProvider>,
    scanner: OpportunityScanner,
}

impl ScreenedCandidates {
    pub fn new(inner: Arc<dyn CandidateProvider>, scanner: OpportunityScanner) -> Self {
        Self { inner, scanner }
    }
}

#[async_trait]
impl CandidateProvider for ScreenedCandidates {
    /// Candidates whose scan produced no opportunity are dropped. When every
    /// scan errored the unranked list passes through unchanged.
    async fn candidates(&self) -> Result<Vec<CandidateCoin>, AgentError> {
        let candidates = self.inner.candidates().await?;
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let symbols: Vec<String> = candidates.iter().map(|c| c.symbol.clone()).collect();
        let report = self.scanner.scan(&symbols).await;
        if report.errors == report.scanned {
            warn!(
                "Scanner produced no signals, passing {} candidates through unranked",
                candidates.len()
            );
            return Ok(candidates);
        }

        let by_symbol: HashMap<&str, &CandidateCoin> =
            candidates.iter().map(|c| (c.symbol.as_str(), c)).collect();
        Ok(report
            .opportunities
            .iter()
            .filter_map(|o| by_symbol.get(o.symbol.as_str()).map(|c| (*c).clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::types::{CandidateSource, LongerTermContext};

    fn snapshot(
        symbol: &str,
        price: f64,
        ema20: f64,
        macd: f64,
        rsi7: f64,
        funding_rate: f64,
        volume: Option<(f64, f64)>,
    ) -> MarketSnapshot {
        MarketSnapshot {
            symbol: symbol.to_string(),
            current_price: price,
            ema20,
            macd,
            rsi7,
            funding_rate,
            open_interest: None,
            price_change_1h: 0.0,
            price_change_4h: 0.0,
            longer_term: volume.map(|(current_volume, average_volume)| LongerTermContext {
                ema20,
                ema50: ema20,
                atr3: 1.0,
                atr14: 1.0,
                current_volume,
                average_volume,
            }),
        }
    }

    fn signal(action: &str, confidence: f64, entry: f64, sl: f64, tp: f64) -> TradingSignal {
        TradingSignal {
            symbol: String::new(),
            signal: action.to_string(),
            confidence,
            reasoning: "setup".to_string(),
            entry_price: entry,
            stop_loss: sl,
            take_profit: tp,
        }
    }

    #[test]
    fn fully_confirmed_long_scores_high() {
        let s = signal("OPEN_LONG", 80.0, 100.0, 95.0, 115.0);
        let snap = snapshot("AAAUSDT", 100.0, 98.0, 1.0, 30.0, -0.0002, Some((250.0, 100.0)));
        // 32 confidence + 25 R:R + 7 RSI + 6 MACD + 6 EMA + 6 funding + 10 volume
        assert_eq!(priority_score(&s, &snap), 92);
    }

    #[test]
    fn partially_confirmed_short() {
        let s = signal("OPEN_SHORT", 70.0, 50.0, 52.0, 46.0);
        let snap = snapshot("EEEUSDT", 50.0, 51.0, 0.5, 60.0, 0.0, None);
        // 28 confidence + 15 R:R + 3 RSI + 6 EMA
        assert_eq!(priority_score(&s, &snap), 52);
    }

    #[test]
    fn signal_gates() {
        let config = ScanConfig::default();
        assert!(is_valid_signal(&signal("OPEN_LONG", 70.0, 100.0, 95.0, 110.0), &config));
        assert!(is_valid_signal(&signal("open_short", 70.0, 100.0, 105.0, 90.0), &config));
        assert!(!is_valid_signal(&signal("OPEN_LONG", 60.0, 100.0, 95.0, 110.0), &config));
        assert!(!is_valid_signal(&signal("OPEN_LONG", 70.0, 100.0, 101.0, 110.0), &config));
        assert!(!is_valid_signal(&signal("OPEN_SHORT", 70.0, 100.0, 95.0, 90.0), &config));
        assert!(!is_valid_signal(&signal("WAIT", 90.0, 100.0, 95.0, 110.0), &config));
        assert!(!is_valid_signal(&signal("OPEN_LONG", 70.0, 100.0, 0.0, 110.0), &config));

        let longs_only = ScanConfig {
            enable_short: false,
            ..ScanConfig::default()
        };
        assert!(!is_valid_signal(&signal("OPEN_SHORT", 70.0, 100.0, 105.0, 90.0), &longs_only));
    }

    #[test]
    fn top_n_keeps_highest_priority() {
        let opp = |symbol: &str, priority| Opportunity {
            symbol: symbol.to_string(),
            action: DecisionAction::OpenLong,
            confidence: 70.0,
            reasoning: String::new(),
            entry_price: 1.0,
            stop_loss: 0.9,
            take_profit: 1.2,
            current_price: 1.0,
            priority,
            reward_risk: 2.0,
            analyzed_at: Utc::now(),
        };
        let ranked = filter_top_n(vec![opp("A", 61), opp("B", 90), opp("C", 75)], 2);
        let symbols: Vec<_> = ranked.iter().map(|o| o.symbol.as_str()).collect();
        assert_eq!(symbols, ["B", "C"]);
    }

    #[test]
    fn parses_fenced_signal() {
        let raw = "Momentum is building.\n```json\n{\"signal\": \"OPEN_LONG\", \"confidence\": 82, \
                   \"reasoning\": \"breakout {retest}\", \"entry_price\": 10.2, \"stop_loss\": 9.8, \
                   \"take_profit\": 11.4}\n```\n";
        let s = parse_signal(raw, "SOLUSDT").unwrap();
        assert_eq!(s.symbol, "SOLUSDT");
        assert_eq!(s.action(), Ok(DecisionAction::OpenLong));
        assert_eq!(s.reasoning, "breakout {retest}");
        assert_eq!(s.take_profit, 11.4);
    }

    #[test]
    fn parses_bare_object_and_clamps_confidence() {
        let raw = "Looks heavy. {\"signal\":\"OPEN_SHORT\",\"confidence\":140,\
                   \"reasoning\":\"lower highs }\",\"entry_price\":5,\"stop_loss\":5.3,\
                   \"take_profit\":4.4} done";
        let s = parse_signal(raw, "DOGEUSDT").unwrap();
        assert_eq!(s.confidence, 50.0);
        assert_eq!(s.reasoning, "lower highs }");
    }

    #[test]
    fn rejects_unknown_signal_and_missing_object() {
        let err = parse_signal("{\"signal\":\"BUY\"}", "BTCUSDT").unwrap_err();
        assert_eq!(err.reason, "invalid action: buy");
        assert_eq!(err.fragment.as_deref(), Some("{\"signal\":\"BUY\"}"));

        let err = parse_signal("no idea", "BTCUSDT").unwrap_err();
        assert!(err.fragment.is_none());
    }

    struct FakeMarket(HashMap<String, MarketSnapshot>);

    #[async_trait]
    impl MarketDataSource for FakeMarket {
        async fn get_snapshot(&self, symbol: &str) -> Result<MarketSnapshot, AgentError> {
            self.0
                .get(symbol)
                .cloned()
                .ok_or_else(|| AgentError::NotFound(symbol.to_string()))
        }
    }

    struct FixedSignals(HashMap<String, TradingSignal>);

    #[async_trait]
    impl SignalSource for FixedSignals {
        async fn signal(&self, snapshot: &MarketSnapshot) -> Result<TradingSignal, AgentError> {
            self.0
                .get(&snapshot.symbol)
                .cloned()
                .ok_or_else(|| AgentError::AIAnalysis("no signal".to_string()))
        }
    }

    fn scanner(signals: HashMap<String, TradingSignal>) -> OpportunityScanner {
        let snapshots = [
            snapshot("AAAUSDT", 100.0, 98.0, 1.0, 30.0, -0.0002, Some((250.0, 100.0))),
            snapshot("BBBUSDT", 100.0, 98.0, 1.0, 30.0, 0.0, None),
            snapshot("CCCUSDT", 10.0, 10.5, -1.0, 50.0, 0.0, None),
            snapshot("DDDUSDT", 1.0, 1.0, 0.0, 50.0, 0.0, None),
            snapshot("EEEUSDT", 50.0, 51.0, -0.2, 70.0, 0.0003, None),
        ];
        let market = FakeMarket(
            snapshots
                .into_iter()
                .map(|s| (s.symbol.clone(), s))
                .collect(),
        );
        OpportunityScanner::new(
            Arc::new(market),
            Arc::new(FixedSignals(signals)),
            ScanConfig {
                enabled: true,
                ..ScanConfig::default()
            },
        )
    }

    fn scripted_signals() -> HashMap<String, TradingSignal> {
        [
            ("AAAUSDT", signal("OPEN_LONG", 80.0, 100.0, 95.0, 115.0)),
            // confidence below the gate
            ("BBBUSDT", signal("OPEN_LONG", 50.0, 100.0, 95.0, 115.0)),
            // valid but scores 38
            ("CCCUSDT", signal("OPEN_LONG", 70.0, 10.0, 9.5, 10.8)),
            ("EEEUSDT", signal("OPEN_SHORT", 90.0, 50.0, 52.0, 45.0)),
        ]
        .into_iter()
        .map(|(symbol, s)| (symbol.to_string(), s))
        .collect()
    }

    fn symbols(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn scan_ranks_and_filters() {
        let scanner = scanner(scripted_signals());
        let report = scanner
            .scan(&symbols(&["CCCUSDT", "EEEUSDT", "BBBUSDT", "DDDUSDT", "AAAUSDT"]))
            .await;

        assert_eq!(report.scanned, 5);
        assert_eq!(report.errors, 1);
        let ranked: Vec<_> = report
            .opportunities
            .iter()
            .map(|o| (o.symbol.as_str(), o.priority))
            .collect();
        assert_eq!(ranked, [("AAAUSDT", 92), ("EEEUSDT", 81)]);
        assert_eq!(report.opportunities[1].action, DecisionAction::OpenShort);
        assert_eq!(report.opportunities[1].reward_risk, 2.5);
    }

    struct FixedCandidates(Vec<CandidateCoin>);

    #[async_trait]
    impl CandidateProvider for FixedCandidates {
        async fn candidates(&self) -> Result<Vec<CandidateCoin>, AgentError> {
            Ok(self.0.clone())
        }
    }

    fn pool() -> Arc<FixedCandidates> {
        Arc::new(FixedCandidates(vec![
            CandidateCoin::new("EEEUSDT", vec![CandidateSource::Ai500]),
            CandidateCoin::new("AAAUSDT", vec![CandidateSource::Ai500, CandidateSource::OiTop]),
            CandidateCoin::new("CCCUSDT", vec![CandidateSource::OiTop]),
        ]))
    }

    #[tokio::test]
    async fn screened_candidates_follow_priority() {
        let screened = ScreenedCandidates::new(pool(), scanner(scripted_signals()));
        let candidates = screened.candidates().await.unwrap();

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].symbol, "AAAUSDT");
        assert!(candidates[0].is_dual_signal());
        assert_eq!(candidates[1].symbol, "EEEUSDT");
    }

    #[tokio::test]
    async fn screened_candidates_pass_through_when_scanner_is_down() {
        let screened = ScreenedCandidates::new(pool(), scanner(HashMap::new()));
        let candidates = screened.candidates().await.unwrap();
        let symbols: Vec<_> = candidates.iter().map(|c| c.symbol.as_str()).collect();
        assert_eq!(symbols, ["EEEUSDT", "AAAUSDT", "CCCUSDT"]);
    }
}
