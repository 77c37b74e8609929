use std::fmt::Write;

use crate::agent::feedback;
use crate::agent::types::{
    MarketSnapshot, OiTopData, PerformanceSummary, PositionInfo, TradingContext,
};

const MAX_RECENT_TRADES: usize = 5;

/// Rendered prompt pair for one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompts {
    pub system: String,
    pub user: String,
}

/// Renders both prompts. Deterministic for identical contexts.
pub fn build_prompts(ctx: &TradingContext) -> Prompts {
    Prompts {
        system: build_system_prompt(ctx.account.total_equity),
        user: build_user_prompt(ctx),
    }
}

/// Fixed rules, workflow and output contract. Only equity varies.
pub fn build_system_prompt(equity: f64) -> String {
    let mut p = String::new();

    p.push_str("You are a professional crypto futures trader running an autonomous USDT-margined perpetuals account.\n\n");

    p.push_str("# Mission\n");
    p.push_str("Maximize risk-adjusted return (Sharpe ratio). Consistent small gains beat occasional large wins paid for with deep drawdowns.\n\n");

    p.push_str("# Sharpe Ratio Interpretation\n");
    p.push_str("The user prompt reports your recent cycle-level Sharpe ratio:\n");
    p.push_str("- below -0.5: sustained losses, trade defensively and rarely\n");
    p.push_str("- -0.5 to 0: slightly negative, be selective\n");
    p.push_str("- 0 to 0.7: positive but volatile, cut losing trades faster\n");
    p.push_str("- 0.7 to 1.0: steady, keep current discipline\n");
    p.push_str("- above 1.0: strong, do not let it make you overconfident\n");
    p.push_str("Always follow the Adaptive Recommendation section when one is present.\n\n");

    p.push_str("# Position Rules\n");
    p.push_str("1. Hold at most 3 positions at the same time.\n");
    let _ = writeln!(
        p,
        "2. Altcoins: position value 0.8-1.5x equity ({:.0}-{:.0} USDT, recommended {:.0}), leverage up to 20x.",
        equity * 0.8,
        equity * 1.5,
        equity * 1.2
    );
    let _ = writeln!(
        p,
        "3. BTC/ETH: position value 3-10x equity ({:.0}-{:.0} USDT, recommended {:.0}), leverage up to 50x.",
        equity * 3.0,
        equity * 10.0,
        equity * 5.0
    );
    p.push_str("4. Total margin used must stay at or below 90% of equity.\n");
    p.push_str("5. Every new position needs reward:risk of at least 1:2.\n\n");

    p.push_str("# Workflow\n");
    p.push_str("1. Review the account: equity, margin usage, open positions.\n");
    p.push_str("2. For each open position decide whether to hold or close (target reached, stop hit, trend reversed).\n");
    p.push_str("3. Read the overall market through BTC.\n");
    p.push_str("4. Scan the candidates for high-probability setups; prefer dual-signal coins.\n");
    p.push_str("5. For any new entry, set stop-loss and take-profit and check reward:risk.\n");
    p.push_str("6. Output your decisions.\n\n");

    p.push_str("# Output Format\n");
    p.push_str("First write your chain of thought as plain text. Then output a JSON array of decisions and nothing after it.\n\n");
    p.push_str("Example:\n");
    p.push_str("BTC is holding above EMA20 with bullish MACD; ETH long has reached its target.\n");
    let _ = writeln!(
        p,
        "[\n  {{\"symbol\": \"BTCUSDT\", \"action\": \"open_long\", \"leverage\": 50, \"position_size_usd\": {:.0}, \"stop_loss\": 92000, \"take_profit\": 98000, \"confidence\": 85, \"risk_usd\": 200, \"reasoning\": \"breakout above resistance with volume\"}},\n  {{\"symbol\": \"ETHUSDT\", \"action\": \"close_long\", \"reasoning\": \"take profit reached\"}}\n]\n",
        equity * 5.0
    );

    p.push_str("# Fields\n");
    p.push_str("- symbol: trading pair, e.g. BTCUSDT\n");
    p.push_str("- action: open_long | open_short | close_long | close_short | hold | wait\n");
    p.push_str("- leverage: integer\n");
    p.push_str("- position_size_usd: position value in USDT (not margin)\n");
    p.push_str("- stop_loss: stop-loss price\n");
    p.push_str("- take_profit: take-profit price\n");
    p.push_str("- confidence: 0-100\n");
    p.push_str("- risk_usd: maximum loss in USDT if the stop is hit\n");
    p.push_str("- reasoning: short justification\n\n");
    p.push_str("open_long and open_short require leverage, position_size_usd, stop_loss, take_profit, confidence and risk_usd. ");
    p.push_str("close_long, close_short, hold and wait only need symbol, action and reasoning.\n");

    p
}

/// Per-cycle state: account, positions, candidates, performance.
pub fn build_user_prompt(ctx: &TradingContext) -> String {
    let mut p = String::new();

    let _ = writeln!(
        p,
        "Time: {} | Cycle: #{} | Runtime: {} min\n",
        ctx.current_time.format("%Y-%m-%d %H:%M:%S UTC"),
        ctx.cycle,
        ctx.runtime_minutes
    );

    p.push_str("## Market (BTC)\n");
    match ctx.market_data.get("BTCUSDT") {
        Some(btc) => {
            let _ = writeln!(
                p,
                "BTC: {:.2} (1h: {:+.2}%, 4h: {:+.2}%) | MACD: {:.4} | RSI7: {:.2} | {}\n",
                btc.current_price,
                btc.price_change_1h,
                btc.price_change_4h,
                btc.macd,
                btc.rsi7,
                price_trend(btc.price_change_1h, btc.price_change_4h)
            );
        }
        None => p.push_str("BTC market data unavailable this cycle.\n\n"),
    }

    let account = &ctx.account;
    let balance_pct = if account.total_equity > 0.0 {
        account.available_balance / account.total_equity * 100.0
    } else {
        0.0
    };
    p.push_str("## Account\n");
    let _ = writeln!(
        p,
        "Equity: {:.2} USDT | Available: {:.2} ({:.1}%) | PnL: {:+.2}% | Margin used: {:.1}% | Positions: {}\n",
        account.total_equity,
        account.available_balance,
        balance_pct,
        account.total_pnl_pct,
        account.margin_used_pct,
        account.position_count
    );

    p.push_str("## Open Positions\n");
    if ctx.positions.is_empty() {
        p.push_str("No positions currently open.\n\n");
    } else {
        for (i, pos) in ctx.positions.iter().enumerate() {
            write_position(&mut p, i + 1, pos, ctx.market_data.get(&pos.symbol));
        }
    }

    let surviving: Vec<_> = ctx
        .candidates
        .iter()
        .filter(|c| !ctx.holds(&c.symbol) && ctx.market_data.contains_key(&c.symbol))
        .collect();
    let _ = writeln!(p, "## Candidates ({})", surviving.len());
    if surviving.is_empty() {
        p.push_str("No candidates passed screening this cycle.\n");
    }
    for (i, coin) in surviving.iter().enumerate() {
        let tag = if coin.is_dual_signal() { " [dual-signal]" } else { "" };
        let _ = writeln!(p, "{}. {}{}", i + 1, coin.symbol, tag);
        if let Some(snapshot) = ctx.market_data.get(&coin.symbol) {
            write_snapshot(&mut p, snapshot);
        }
        if let Some(oi) = ctx.oi_top_data.get(&coin.symbol) {
            write_oi_momentum(&mut p, oi);
        }
    }
    p.push('\n');

    match &ctx.performance {
        Some(perf) => {
            write_performance(&mut p, perf);
            p.push('\n');
            p.push_str(&feedback::recommend(perf.sharpe_ratio, account.total_equity).render());
            p.push('\n');
        }
        None => p.push_str("## Performance\nNo performance history yet.\n\n"),
    }

    p.push_str(
        "Analyze the data above and output your chain of thought followed by the JSON decision array.\n",
    );
    p
}

fn write_position(
    p: &mut String,
    n: usize,
    pos: &PositionInfo,
    snapshot: Option<&MarketSnapshot>,
) {
    let _ = writeln!(
        p,
        "{}. {} {} | Entry: {:.4} -> Mark: {:.4} | PnL: {:+.2}% ({:+.2} USDT) | Leverage: {}x | Margin: {:.2} | Liq: {:.4}",
        n,
        pos.symbol,
        pos.side,
        pos.entry_price,
        pos.mark_price,
        pos.unrealized_pnl_pct,
        pos.unrealized_pnl,
        pos.leverage,
        pos.margin_used,
        pos.liquidation_price
    );
    match snapshot {
        Some(s) => write_snapshot(p, s),
        None => p.push_str("   market data unavailable\n"),
    }
}

pub(crate) fn write_snapshot(p: &mut String, s: &MarketSnapshot) {
    let _ = writeln!(
        p,
        "   Price: {:.4} (1h: {:+.2}%, 4h: {:+.2}%) {}",
        s.current_price,
        s.price_change_1h,
        s.price_change_4h,
        price_trend(s.price_change_1h, s.price_change_4h)
    );
    let _ = writeln!(
        p,
        "   EMA20: {:.4} ({}) | MACD: {:.4} ({}) | RSI7: {:.2} ({})",
        s.ema20,
        price_position(s.current_price, s.ema20),
        s.macd,
        macd_trend(s.macd),
        s.rsi7,
        rsi_status(s.rsi7)
    );
    let _ = write!(
        p,
        "   Funding: {:.6} ({})",
        s.funding_rate,
        funding_signal(s.funding_rate)
    );
    if let Some(oi) = &s.open_interest {
        let _ = write!(p, " | OI: {:.0} ({:+.2}% vs avg)", oi.latest, oi.change_pct());
    }
    p.push('\n');
    if let Some(lt) = &s.longer_term {
        let _ = writeln!(
            p,
            "   4h: EMA20 {:.4} / EMA50 {:.4} ({}) | ATR3 {:.4} / ATR14 {:.4} ({}) | Volume {}",
            lt.ema20,
            lt.ema50,
            ema_cross(lt.ema20, lt.ema50),
            lt.atr3,
            lt.atr14,
            atr_status(lt.atr3, lt.atr14),
            volume_status(lt.current_volume, lt.average_volume)
        );
    }
}

fn write_oi_momentum(p: &mut String, oi: &OiTopData) {
    let _ = writeln!(
        p,
        "   OI rank #{}: OI {:+.2}% ({:+.0} USD) | price {:+.2}% | net long {:.0} / net short {:.0}",
        oi.rank, oi.oi_delta_pct, oi.oi_delta_value, oi.price_delta_pct, oi.net_long, oi.net_short
    );
}

fn write_performance(p: &mut String, perf: &PerformanceSummary) {
    p.push_str("## Performance\n");
    let _ = writeln!(
        p,
        "Sharpe ratio: {:.2} ({})",
        perf.sharpe_ratio,
        feedback::SharpeBand::from_sharpe(perf.sharpe_ratio).label()
    );

    if perf.total_trades == 0 {
        p.push_str("No closed trades yet.\n");
        return;
    }

    let _ = writeln!(
        p,
        "Trades: {} | Wins: {} | Losses: {} | Win rate: {:.1}%",
        perf.total_trades, perf.winning_trades, perf.losing_trades, perf.win_rate
    );
    let _ = writeln!(
        p,
        "Avg win: {:+.2}% | Avg loss: {:+.2}% | Profit factor: {:.2}",
        perf.avg_win_pct, perf.avg_loss_pct, perf.profit_factor
    );

    if !perf.recent_trades.is_empty() {
        p.push_str("Recent trades:\n");
        for trade in perf.recent_trades.iter().take(MAX_RECENT_TRADES) {
            let mark = if trade.pnl >= 0.0 { "WIN " } else { "LOSS" };
            let _ = writeln!(
                p,
                "  {} {} {} {:.4} -> {:.4} | {:+.2} USDT ({:+.2}%)",
                mark,
                trade.symbol,
                trade.side,
                trade.open_price,
                trade.close_price,
                trade.pnl,
                trade.pnl_pct
            );
        }
    }

    for (label, symbol) in [("Best", &perf.best_symbol), ("Worst", &perf.worst_symbol)] {
        let Some(symbol) = symbol else { continue };
        match perf.symbol_stats.get(symbol) {
            Some(stats) => {
                let _ = writeln!(
                    p,
                    "{} symbol: {} (win rate {:.1}%, avg PnL {:+.2})",
                    label, symbol, stats.win_rate, stats.avg_pnl
                );
            }
            None => {
                let _ = writeln!(p, "{} symbol: {}", label, symbol);
            }
        }
    }
}

pub fn price_position(price: f64, ema20: f64) -> &'static str {
    if price > ema20 { "above EMA20" } else { "below EMA20" }
}

pub fn macd_trend(macd: f64) -> &'static str {
    if macd > 0.0 { "bullish" } else { "bearish" }
}

pub fn rsi_status(rsi: f64) -> &'static str {
    if rsi >= 70.0 {
        "overbought"
    } else if rsi <= 30.0 {
        "oversold"
    } else {
        "neutral"
    }
}

pub fn price_trend(change_1h: f64, change_4h: f64) -> &'static str {
    if change_1h > 2.0 && change_4h > 5.0 {
        "strong uptrend"
    } else if change_1h > 0.0 && change_4h > 0.0 {
        "mild uptrend"
    } else if change_1h < -2.0 && change_4h < -5.0 {
        "strong downtrend"
    } else if change_1h < 0.0 && change_4h < 0.0 {
        "mild downtrend"
    } else {
        "ranging"
    }
}

pub fn funding_signal(rate: f64) -> &'static str {
    if rate > 0.001 {
        "longs crowded"
    } else if rate > 0.0005 {
        "long-dominant"
    } else if rate < -0.001 {
        "shorts crowded"
    } else if rate < -0.0005 {
        "short-dominant"
    } else {
        "balanced"
    }
}

pub fn ema_cross(ema20: f64, ema50: f64) -> &'static str {
    if ema20 > ema50 { "golden cross" } else { "death cross" }
}

pub fn atr_status(atr3: f64, atr14: f64) -> &'static str {
    if atr14 <= 0.0 {
        return "volatility unknown";
    }
    let ratio = atr3 / atr14;
    if ratio > 1.2 {
        "volatility rising"
    } else if ratio < 0.8 {
        "volatility falling"
    } else {
        "volatility stable"
    }
}

pub fn volume_status(current: f64, average: f64) -> &'static str {
    if average <= 0.0 {
        return "unknown";
    }
    let ratio = current / average;
    if ratio > 1.5 {
        "surging"
    } else if ratio < 0.5 {
        "thin"
    } else {
        "normal"
    }
}
