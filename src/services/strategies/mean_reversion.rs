//! RSI mean reversion, level-triggered.
//!
//! Fires on every evaluation while RSI sits at or beyond a threshold.

use serde_json::{json, Map, Value};

use crate::services::candles::Candle;
use crate::services::indicators::{Indicator, Rsi};
use crate::services::market_data::Tick;
use crate::services::strategies::common::{
    check_inputs, Side, Signal, SignalDraft, Strategy, StrategyParams,
};
use crate::utils::errors::StrategyError;

const NAME: &str = "rsi_mean_reversion";

#[derive(Debug, Clone, PartialEq)]
pub struct RsiConfig {
    pub period: usize,
    pub oversold: f64,
    pub overbought: f64,
    pub long_only: bool,
}

impl Default for RsiConfig {
    fn default() -> Self {
        Self {
            period: 14,
            oversold: 30.0,
            overbought: 70.0,
            long_only: false,
        }
    }
}

impl RsiConfig {
    pub fn from_params(map: &Map<String, Value>) -> Self {
        let d = Self::default();
        let p = StrategyParams::new(NAME, map.clone());
        let mut cfg = Self {
            period: p.period_or("period", d.period),
            oversold: p.level_or("oversold", d.oversold),
            overbought: p.level_or("overbought", d.overbought),
            long_only: p.bool_or("long_only", d.long_only),
        };
        if cfg.oversold >= cfg.overbought {
            log::warn!("{NAME}: oversold must be below overbought; using default levels");
            cfg.oversold = d.oversold;
            cfg.overbought = d.overbought;
        }
        cfg
    }
}

/// Distance past the threshold as a fraction of the room beyond it.
pub(crate) fn rsi_margin(rsi: f64, oversold: f64, overbought: f64) -> Option<(Side, f64)> {
    if rsi <= oversold {
        Some((Side::Long, (oversold - rsi) / oversold))
    } else if rsi >= overbought {
        Some((Side::Short, (rsi - overbought) / (100.0 - overbought)))
    } else {
        None
    }
}

pub struct RsiMeanReversion {
    cfg: RsiConfig,
    rsi: Rsi,
}

impl RsiMeanReversion {
    pub fn new(cfg: RsiConfig) -> Self {
        Self {
            rsi: Rsi::new(cfg.period),
            cfg,
        }
    }
}

impl Strategy for RsiMeanReversion {
    fn name(&self) -> &str {
        NAME
    }

    fn evaluate(&mut self, tick: &Tick, candle: &Candle) -> Result<Option<Signal>, StrategyError> {
        check_inputs(tick, candle)?;
        let Some(rsi) = self.rsi.update(candle.close) else {
            return Ok(None);
        };
        let Some((side, raw)) = rsi_margin(rsi, self.cfg.oversold, self.cfg.overbought) else {
            return Ok(None);
        };
        if self.cfg.long_only && side == Side::Short {
            return Ok(None);
        }
        Ok(SignalDraft {
            strategy: NAME,
            side,
            raw_confidence: raw,
            details: json!({
                "rsi": rsi,
                "oversold": self.cfg.oversold,
                "overbought": self.cfg.overbought,
            }),
        }
        .emit(tick, candle))
    }

    fn reset(&mut self) {
        self.rsi.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::candles::Timeframe;

    fn step(s: &mut RsiMeanReversion, i: i64, price: f64) -> Option<Signal> {
        let tick = Tick::new("BTCUSDT", i * 60_000, price);
        let candle = Candle::from_first_tick(&tick, Timeframe::M1);
        s.evaluate(&tick, &candle).unwrap()
    }

    #[test]
    fn margins() {
        assert_eq!(rsi_margin(15.0, 30.0, 70.0), Some((Side::Long, 0.5)));
        assert_eq!(rsi_margin(85.0, 30.0, 70.0), Some((Side::Short, 0.5)));
        assert_eq!(rsi_margin(50.0, 30.0, 70.0), None);
    }

    #[test]
    fn fires_every_evaluation_while_overbought() {
        let mut s = RsiMeanReversion::new(RsiConfig {
            period: 3,
            ..RsiConfig::default()
        });
        let out: Vec<_> = (0..6).map(|i| step(&mut s, i, 100.0 + i as f64)).collect();
        assert!(out[..2].iter().all(Option::is_none), "warm-up is a hard skip");
        for sig in &out[2..] {
            let sig = sig.as_ref().expect("level-triggered");
            assert_eq!(sig.side, Side::Short);
            assert_eq!(sig.confidence, 1.0);
        }
    }

    #[test]
    fn falling_prices_go_long() {
        let mut s = RsiMeanReversion::new(RsiConfig {
            period: 3,
            long_only: true,
            ..RsiConfig::default()
        });
        let last = (0..5).filter_map(|i| step(&mut s, i, 100.0 - i as f64)).last();
        assert_eq!(last.map(|s| s.side), Some(Side::Long));
    }
}
