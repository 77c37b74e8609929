use crate::agent::types::{DecisionAction, TradingDecision, ValidationError, is_major};

/// Slack applied on top of the size cap for floating-point drift.
pub const SIZE_TOLERANCE: f64 = 0.01;

/// Per-asset-class leverage and size limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssetCaps {
    pub max_leverage: i64,
    pub max_size_multiple: f64,
}

impl AssetCaps {
    pub const MAJOR: AssetCaps = AssetCaps {
        max_leverage: 50,
        max_size_multiple: 10.0,
    };
    pub const ALTCOIN: AssetCaps = AssetCaps {
        max_leverage: 20,
        max_size_multiple: 1.5,
    };

    pub fn for_symbol(symbol: &str) -> Self {
        if is_major(symbol) {
            Self::MAJOR
        } else {
            Self::ALTCOIN
        }
    }

    /// Largest position value accepted for the given equity.
    pub fn max_position_value(&self, equity: f64) -> f64 {
        let cap = equity * self.max_size_multiple;
        cap + cap * SIZE_TOLERANCE
    }
}

/// Checks a whole batch; the first failing decision rejects all of them.
pub fn validate_decisions(
    decisions: &[TradingDecision],
    account_equity: f64,
) -> Result<(), ValidationError> {
    for (i, decision) in decisions.iter().enumerate() {
        validate_decision(decision, account_equity).map_err(|reason| ValidationError {
            index: i + 1,
            symbol: decision.symbol.clone(),
            reason,
        })?;
    }
    Ok(())
}

pub fn validate_decision(decision: &TradingDecision, account_equity: f64) -> Result<(), String> {
    let action = decision.action_kind()?;
    if !action.is_open() {
        return Ok(());
    }

    let symbol = decision.symbol.as_str();
    let leverage = required(decision.leverage, "leverage", action)?;
    let size = required(decision.position_size_usd, "position_size_usd", action)?;
    let stop_loss = required(decision.stop_loss, "stop_loss", action)?;
    let take_profit = required(decision.take_profit, "take_profit", action)?;
    let confidence = required(decision.confidence, "confidence", action)?;

    let caps = AssetCaps::for_symbol(symbol);

    if leverage < 1 || leverage > caps.max_leverage {
        return Err(format!(
            "leverage must be between 1 and {} for {}: got {}",
            caps.max_leverage, symbol, leverage
        ));
    }

    if size <= 0.0 {
        return Err(format!("position_size_usd must be greater than 0: got {size}"));
    }

    let max_value = caps.max_position_value(account_equity);
    if size > max_value {
        return Err(format!(
            "position_size_usd {:.2} exceeds {:.2} ({}x equity {:.2}) for {}",
            size, max_value, caps.max_size_multiple, account_equity, symbol
        ));
    }

    if stop_loss <= 0.0 || take_profit <= 0.0 {
        return Err(format!(
            "stop_loss and take_profit must be greater than 0: got {stop_loss} / {take_profit}"
        ));
    }

    match action {
        DecisionAction::OpenLong if stop_loss >= take_profit => {
            return Err(format!(
                "long stop_loss must be below take_profit: {stop_loss} >= {take_profit}"
            ));
        }
        DecisionAction::OpenShort if stop_loss <= take_profit => {
            return Err(format!(
                "short stop_loss must be above take_profit: {stop_loss} <= {take_profit}"
            ));
        }
        _ => {}
    }

    if !(0.0..=100.0).contains(&confidence) {
        return Err(format!("confidence must be between 0 and 100: got {confidence}"));
    }

    Ok(())
}

fn required<T>(value: Option<T>, field: &str, action: DecisionAction) -> Result<T, String> {
    value.ok_or_else(|| format!("{field} is required for {action}"))
}
