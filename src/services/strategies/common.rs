// src/services/strategies/common.rs
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::services::candles::{Candle, Timeframe};
use crate::services::market_data::Tick;
use crate::utils::errors::{ConfigError, StrategyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

/// Directional recommendation. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub strategy: String,
    pub side: Side,
    /// Clamped to `[0, 1]`
    pub confidence: f64,
    /// The unclamped ratio the strategy computed
    pub raw_confidence: f64,
    pub price: f64,
    /// Corrected time (ms) of the tick that triggered the evaluation
    pub timestamp: i64,
    pub created_at: chrono::DateTime<Utc>,
    pub details: Value,
}

/// Confidence policy: a non-finite ratio yields no signal, anything else is
/// clamped into `[0, 1]`.
pub fn clamp_confidence(raw: f64) -> Option<f64> {
    raw.is_finite().then(|| raw.clamp(0.0, 1.0))
}

pub struct SignalDraft<'a> {
    pub strategy: &'a str,
    pub side: Side,
    pub raw_confidence: f64,
    pub details: Value,
}

impl SignalDraft<'_> {
    pub fn emit(self, tick: &Tick, candle: &Candle) -> Option<Signal> {
        let confidence = clamp_confidence(self.raw_confidence)?;
        Some(Signal {
            id: Uuid::new_v4(),
            symbol: candle.symbol.clone(),
            timeframe: candle.timeframe,
            strategy: self.strategy.to_string(),
            side: self.side,
            confidence,
            raw_confidence: self.raw_confidence,
            price: tick.price,
            timestamp: tick.timestamp,
            created_at: Utc::now(),
            details: self.details,
        })
    }
}

/// Polymorphic strategy capability. Each instance owns its indicators.
pub trait Strategy: Send {
    fn name(&self) -> &str;

    fn evaluate(&mut self, tick: &Tick, candle: &Candle) -> Result<Option<Signal>, StrategyError>;

    fn reset(&mut self);
}

/// Rejects inputs no strategy can make sense of.
pub fn check_inputs(tick: &Tick, candle: &Candle) -> Result<(), StrategyError> {
    if tick.symbol != candle.symbol {
        return Err(StrategyError::InvalidInput(format!(
            "tick symbol {} does not match candle symbol {}",
            tick.symbol, candle.symbol
        )));
    }
    let prices = [tick.price, candle.open, candle.high, candle.low, candle.close];
    if prices.iter().any(|p| !p.is_finite()) {
        return Err(StrategyError::InvalidInput(format!(
            "non-finite price for {}",
            tick.symbol
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    EmaCrossover,
    RsiMeanReversion,
    BollingerBands,
    MultiIndicator,
}

impl StrategyKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            StrategyKind::EmaCrossover => "ema_crossover",
            StrategyKind::RsiMeanReversion => "rsi_mean_reversion",
            StrategyKind::BollingerBands => "bollinger_bands",
            StrategyKind::MultiIndicator => "multi_indicator",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ema_crossover" => Ok(StrategyKind::EmaCrossover),
            "rsi_mean_reversion" => Ok(StrategyKind::RsiMeanReversion),
            "bollinger_bands" => Ok(StrategyKind::BollingerBands),
            "multi_indicator" => Ok(StrategyKind::MultiIndicator),
            other => Err(ConfigError::UnknownStrategy(other.to_string())),
        }
    }
}

/// When a strategy slot is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// On every completed candle for the slot's (symbol, timeframe)
    #[default]
    #[serde(alias = "candle")]
    CandleClose,
    /// On every scheduler boundary, against the tick at-or-before it
    Boundary,
}

/// Flat named options. Missing or unusable values fall back to the default
/// passed by the caller; unusable ones are logged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StrategyParams {
    strategy: &'static str,
    map: Map<String, Value>,
}

impl StrategyParams {
    pub fn new(strategy: &'static str, map: Map<String, Value>) -> Self {
        Self { strategy, map }
    }

    fn rejected(&self, key: &str, v: &Value, want: &str) {
        log::warn!(
            "{}: param '{key}' = {v} is not {want}; using default",
            self.strategy
        );
    }

    pub fn f64_or(&self, key: &str, default: f64) -> f64 {
        self.f64_where(key, default, "a finite number", |_| true)
    }

    pub fn positive_or(&self, key: &str, default: f64) -> f64 {
        self.f64_where(key, default, "a positive number", |v| v > 0.0)
    }

    /// A level strictly inside `(0, 100)`.
    pub fn level_or(&self, key: &str, default: f64) -> f64 {
        self.f64_where(key, default, "a level in (0, 100)", |v| v > 0.0 && v < 100.0)
    }

    fn f64_where(&self, key: &str, default: f64, want: &str, ok: impl Fn(f64) -> bool) -> f64 {
        match self.map.get(key) {
            None => default,
            Some(v) => match v.as_f64() {
                Some(x) if x.is_finite() && ok(x) => x,
                _ => {
                    self.rejected(key, v, want);
                    default
                }
            },
        }
    }

    /// Window length: a whole number ≥ 1.
    pub fn period_or(&self, key: &str, default: usize) -> usize {
        match self.map.get(key) {
            None => default,
            Some(v) => match v.as_u64() {
                Some(n) if n >= 1 => n as usize,
                _ => {
                    self.rejected(key, v, "a whole number ≥ 1");
                    default
                }
            },
        }
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        match self.map.get(key) {
            None => default,
            Some(Value::Bool(b)) => *b,
            Some(v) => {
                self.rejected(key, v, "a boolean");
                default
            }
        }
    }
}

/// One configured strategy slot.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategySpec {
    pub kind: StrategyKind,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub trigger: Trigger,
    pub params: Map<String, Value>,
}

/// Wire shape; identity fields stay strings so they can be rejected with a
/// `ConfigError` instead of a serde message.
#[derive(Deserialize)]
struct RawSpec {
    kind: String,
    symbol: String,
    timeframe: String,
    #[serde(default)]
    trigger: Trigger,
    #[serde(default)]
    params: Map<String, Value>,
}

impl StrategySpec {
    pub fn parse_list(raw: &str) -> Result<Vec<Self>, ConfigError> {
        let specs: Vec<RawSpec> =
            serde_json::from_str(raw).map_err(|e| ConfigError::Invalid {
                key: "STRATEGIES",
                reason: e.to_string(),
            })?;
        specs
            .into_iter()
            .map(|s| {
                Ok(Self {
                    kind: s.kind.parse()?,
                    symbol: s.symbol.trim().to_uppercase(),
                    timeframe: s.timeframe.parse()?,
                    trigger: s.trigger,
                    params: s.params,
                })
            })
            .collect()
    }

    /// EMA crossover on candle close plus the multi-indicator strategy on
    /// boundaries, for every (symbol, timeframe).
    pub fn defaults_for(symbols: &[String], timeframes: &[Timeframe]) -> Vec<Self> {
        let mut out = Vec::new();
        for symbol in symbols {
            for tf in timeframes {
                out.push(Self {
                    kind: StrategyKind::EmaCrossover,
                    symbol: symbol.clone(),
                    timeframe: *tf,
                    trigger: Trigger::CandleClose,
                    params: Map::new(),
                });
                out.push(Self {
                    kind: StrategyKind::MultiIndicator,
                    symbol: symbol.clone(),
                    timeframe: *tf,
                    trigger: Trigger::Boundary,
                    params: Map::new(),
                });
            }
        }
        out
    }
}
