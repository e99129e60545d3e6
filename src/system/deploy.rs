use crate::{
    runner::TradeMode,
    strategy::EngineParams,
    types::{Granularity, Symbol},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Capital assigned to a strategy: either a fraction of broker account equity or an
/// absolute amount in account currency.
///
/// Mixed forms across strategies are normalised against the broker's account equity at
/// deploy time and held constant thereafter.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Allocation {
    Fraction(Decimal),
    Notional { notional: Decimal },
}

impl Allocation {
    /// Resolve to an absolute cash amount against the account equity.
    pub fn to_cash(&self, account_equity: Decimal) -> Decimal {
        match self {
            Allocation::Fraction(fraction) => *fraction * account_equity,
            Allocation::Notional { notional } => *notional,
        }
    }

    /// Structural validation, independent of account state.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Allocation::Fraction(fraction) => {
                if *fraction <= Decimal::ZERO || *fraction > Decimal::ONE {
                    Err(format!("fraction {fraction} outside (0, 1]"))
                } else {
                    Ok(())
                }
            }
            Allocation::Notional { notional } => {
                if *notional <= Decimal::ZERO {
                    Err(format!("notional {notional} must be positive"))
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Strategy deploy specification accepted by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeploySpec {
    /// Path to the user's strategy source file, consumed by the engine's evaluator.
    pub strategy: PathBuf,
    /// Human-readable id; defaults to the strategy file stem.
    pub strategy_id: Option<String>,
    /// Engine name; may be omitted when exactly one engine is registered.
    pub engine: Option<String>,
    pub symbols: Vec<Symbol>,
    pub granularity: Granularity,
    /// Bars of history the strategy needs per evaluation.
    pub lookback: usize,
    /// Runtime bound in minutes; unbounded when omitted.
    pub duration_mins: Option<u64>,
    pub allocation: Allocation,
    pub data_source: String,
    pub broker: String,
    pub mode: TradeMode,
    #[serde(default)]
    pub allow_short: bool,
    #[serde(default)]
    pub params: EngineParams,
}

impl DeploySpec {
    /// Strategy id: explicit, else derived from the strategy file stem.
    pub fn resolved_id(&self) -> String {
        self.strategy_id.clone().unwrap_or_else(|| {
            self.strategy
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "strategy".to_owned())
        })
    }
}
