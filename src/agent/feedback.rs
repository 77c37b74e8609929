use std::fmt::Write;

use serde::Serialize;

/// Sharpe band the posture was chosen from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SharpeBand {
    /// Below -0.5.
    Losing,
    /// [-0.5, 0).
    SlightlyNegative,
    /// [0, 0.7).
    Weak,
    /// [0.7, 1.0).
    Steady,
    /// 1.0 and above.
    Strong,
}

impl SharpeBand {
    /// A non-finite ratio is treated as the losing band.
    pub fn from_sharpe(sharpe: f64) -> Self {
        if !sharpe.is_finite() || sharpe < -0.5 {
            SharpeBand::Losing
        } else if sharpe < 0.0 {
            SharpeBand::SlightlyNegative
        } else if sharpe < 0.7 {
            SharpeBand::Weak
        } else if sharpe < 1.0 {
            SharpeBand::Steady
        } else {
            SharpeBand::Strong
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SharpeBand::Losing => "sustained losses",
            SharpeBand::SlightlyNegative => "slightly negative",
            SharpeBand::Weak => "positive but volatile",
            SharpeBand::Steady => "steady",
            SharpeBand::Strong => "strong",
        }
    }
}

/// Structured recommendation injected into the next cycle's prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskPosture {
    pub sharpe_ratio: f64,
    pub band: SharpeBand,
    /// Recommended altcoin position value as a multiple of equity.
    pub altcoin_size_multiple: f64,
    /// Recommended BTC/ETH position value as a multiple of equity.
    pub major_size_multiple: f64,
    /// Stop-loss distance from entry, in percent.
    pub stop_loss_pct: f64,
    pub min_confidence: u32,
    /// Minimum reward:risk, expressed as the reward side of 1:N.
    pub min_reward_risk: f64,
    pub max_positions: usize,
    pub altcoin_size_usd: f64,
    pub major_size_usd: f64,
    pub directive: String,
    pub rationale: String,
}

/// Maps a cycle-level Sharpe ratio to a risk posture. Stateless.
pub fn recommend(sharpe_ratio: f64, account_equity: f64) -> RiskPosture {
    let band = SharpeBand::from_sharpe(sharpe_ratio);

    let (alt, major, stop_loss_pct, min_confidence, min_reward_risk, max_positions) = match band {
        SharpeBand::Losing => (0.6, 2.5, 1.0, 95, 3.0, 1),
        SharpeBand::SlightlyNegative | SharpeBand::Weak => (0.8, 3.5, 1.5, 80, 2.5, 2),
        SharpeBand::Steady => (1.2, 5.0, 2.0, 75, 2.0, 3),
        SharpeBand::Strong => (1.5, 6.0, 2.0, 75, 2.0, 3),
    };

    let (directive, rationale) = match band {
        SharpeBand::Losing => (
            "Defensive mode: halve position sizes, hold at most 1 position, open only on near-certain setups.",
            "Returns are consistently negative, so the current approach is losing money. Smaller size and tighter stops cap further drawdown while the strategy is re-evaluated; only trades with confidence of 95 or more and reward:risk of at least 1:3 justify the risk.",
        ),
        SharpeBand::SlightlyNegative => (
            "Conservative mode: reduce size, tighten stops, be selective about new entries.",
            "Results are mildly negative. Losses are outweighing wins, so trade less often and only where the setup is clear; a tighter stop keeps each loss small.",
        ),
        SharpeBand::Weak => (
            "Conservative mode: keep size reduced and focus on cutting losing trades faster.",
            "Returns are positive but too volatile relative to their size. The priority is shrinking the magnitude of losses rather than changing position size: exit failed setups early and let winners run to target.",
        ),
        SharpeBand::Steady => (
            "Standard mode: normal sizing with disciplined stops.",
            "The strategy is producing steady risk-adjusted returns. Keep the current discipline; no change to sizing is warranted.",
        ),
        SharpeBand::Strong => (
            "Expansion mode: sizing may increase modestly, discipline unchanged.",
            "Risk-adjusted returns are strong, which allows slightly larger positions. Warning: a good run is not proof of edge. Do not become overconfident, do not loosen stops, and keep every entry to the same standard as before.",
        ),
    };

    RiskPosture {
        sharpe_ratio,
        band,
        altcoin_size_multiple: alt,
        major_size_multiple: major,
        stop_loss_pct,
        min_confidence,
        min_reward_risk,
        max_positions,
        altcoin_size_usd: account_equity * alt,
        major_size_usd: account_equity * major,
        directive: directive.to_string(),
        rationale: rationale.to_string(),
    }
}

impl RiskPosture {
    /// Prompt block the model reads; this engine never acts on it itself.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "## Adaptive Recommendation (Sharpe {:.2}: {})",
            self.sharpe_ratio,
            self.band.label()
        );
        let _ = writeln!(out, "{}", self.directive);
        let _ = writeln!(
            out,
            "- Altcoin position size: {:.1}x equity (~{:.0} USDT)",
            self.altcoin_size_multiple, self.altcoin_size_usd
        );
        let _ = writeln!(
            out,
            "- BTC/ETH position size: {:.1}x equity (~{:.0} USDT)",
            self.major_size_multiple, self.major_size_usd
        );
        let _ = writeln!(out, "- Stop-loss: -{:.1}% from entry", self.stop_loss_pct);
        let _ = writeln!(out, "- Minimum confidence for new positions: {}", self.min_confidence);
        let _ = writeln!(out, "- Minimum reward:risk: 1:{}", self.min_reward_risk);
        let _ = writeln!(out, "- Maximum concurrent positions: {}", self.max_positions);
        let _ = writeln!(out, "Why: {}", self.rationale);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_edges() {
        assert_eq!(SharpeBand::from_sharpe(-0.51), SharpeBand::Losing);
        assert_eq!(SharpeBand::from_sharpe(-0.5), SharpeBand::SlightlyNegative);
        assert_eq!(SharpeBand::from_sharpe(0.0), SharpeBand::Weak);
        assert_eq!(SharpeBand::from_sharpe(0.7), SharpeBand::Steady);
        assert_eq!(SharpeBand::from_sharpe(1.0), SharpeBand::Strong);
    }

    #[test]
    fn non_finite_sharpe_is_defensive() {
        for sharpe in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let posture = recommend(sharpe, 1000.0);
            assert_eq!(posture.band, SharpeBand::Losing);
            assert_eq!(posture.max_positions, 1);
            assert_eq!(posture.min_confidence, 95);
        }
    }

    #[test]
    fn posture_is_monotonic_across_bands() {
        let samples = [-2.0, -0.8, -0.5, -0.2, 0.0, 0.3, 0.7, 0.9, 1.0, 2.0];
        let postures: Vec<_> = samples.iter().map(|s| recommend(*s, 1000.0)).collect();
        for pair in postures.windows(2) {
            assert!(pair[1].altcoin_size_multiple >= pair[0].altcoin_size_multiple);
            assert!(pair[1].major_size_multiple >= pair[0].major_size_multiple);
            // tighter stop means a smaller distance; it only loosens as Sharpe rises
            assert!(pair[1].stop_loss_pct >= pair[0].stop_loss_pct);
            assert!(pair[1].max_positions >= pair[0].max_positions);
        }
    }

    #[test]
    fn losing_band_is_defensive() {
        let posture = recommend(-0.8, 2000.0);
        assert_eq!(posture.band, SharpeBand::Losing);
        assert_eq!(posture.max_positions, 1);
        assert_eq!(posture.min_confidence, 95);
        assert_eq!(posture.min_reward_risk, 3.0);
        assert_eq!(posture.altcoin_size_usd, 1200.0);

        let text = posture.render();
        assert!(text.contains("Maximum concurrent positions: 1"));
        assert!(text.contains("Minimum confidence for new positions: 95"));
        assert!(text.contains("Why:"));
    }

    #[test]
    fn strong_band_warns_about_overconfidence() {
        let text = recommend(1.4, 1000.0).render();
        assert!(text.contains("overconfident"));
        assert!(text.contains("6.0x equity"));
    }

    #[test]
    fn same_input_same_output() {
        assert_eq!(recommend(0.4, 1000.0), recommend(0.4, 1000.0));
    }
}
