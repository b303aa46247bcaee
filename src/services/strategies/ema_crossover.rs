//! Fast/slow EMA crossover, edge-triggered.
//!
//! Only a *change* in which EMA is on top produces a signal. The first
//! evaluation just records the starting regime (fast ≤ slow counts as
//! bearish).

use serde_json::{json, Map, Value};

use crate::services::candles::Candle;
use crate::services::indicators::{Ema, Indicator};
use crate::services::market_data::Tick;
use crate::services::strategies::common::{
    check_inputs, Side, Signal, SignalDraft, Strategy, StrategyParams,
};
use crate::utils::errors::StrategyError;

const NAME: &str = "ema_crossover";

#[derive(Debug, Clone, PartialEq)]
pub struct EmaCrossoverConfig {
    pub fast: usize,
    pub slow: usize,
    pub long_only: bool,
}

impl Default for EmaCrossoverConfig {
    fn default() -> Self {
        Self {
            fast: 9,
            slow: 21,
            long_only: false,
        }
    }
}

impl EmaCrossoverConfig {
    /// `fast` / `slow` (periods), `long_only`. A fast period that is not
    /// shorter than the slow one resets both to their defaults.
    pub fn from_params(map: &Map<String, Value>) -> Self {
        let d = Self::default();
        let p = StrategyParams::new(NAME, map.clone());
        let mut cfg = Self {
            fast: p.period_or("fast", d.fast),
            slow: p.period_or("slow", d.slow),
            long_only: p.bool_or("long_only", d.long_only),
        };
        if cfg.fast >= cfg.slow {
            log::warn!(
                "{NAME}: fast {} must be below slow {}; using defaults",
                cfg.fast,
                cfg.slow
            );
            cfg.fast = d.fast;
            cfg.slow = d.slow;
        }
        cfg
    }
}

pub struct EmaCrossover {
    cfg: EmaCrossoverConfig,
    fast: Ema,
    slow: Ema,
    /// `Some(true)` = fast above slow at the previous evaluation
    last_bullish: Option<bool>,
}

impl EmaCrossover {
    pub fn new(cfg: EmaCrossoverConfig) -> Self {
        Self {
            fast: Ema::new(cfg.fast),
            slow: Ema::new(cfg.slow),
            cfg,
            last_bullish: None,
        }
    }
}

impl Strategy for EmaCrossover {
    fn name(&self) -> &str {
        NAME
    }

    fn evaluate(&mut self, tick: &Tick, candle: &Candle) -> Result<Option<Signal>, StrategyError> {
        check_inputs(tick, candle)?;
        let (Some(fast), Some(slow)) = (self.fast.update(candle.close), self.slow.update(candle.close))
        else {
            return Ok(None);
        };

        let bullish = fast > slow;
        let side = match (self.last_bullish.replace(bullish), bullish) {
            (Some(false), true) => Side::Long,
            (Some(true), false) => Side::Short,
            _ => return Ok(None),
        };
        if self.cfg.long_only && side == Side::Short {
            return Ok(None);
        }

        Ok(SignalDraft {
            strategy: NAME,
            side,
            raw_confidence: (fast - slow).abs() / slow,
            details: json!({ "fast_ema": fast, "slow_ema": slow }),
        }
        .emit(tick, candle))
    }

    fn reset(&mut self) {
        self.fast.reset();
        self.slow.reset();
        self.last_bullish = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::candles::Timeframe;

    fn step(s: &mut EmaCrossover, i: i64, price: f64) -> Option<Signal> {
        let tick = Tick::new("EURUSD", i * 60_000, price);
        let candle = Candle::from_first_tick(&tick, Timeframe::M1);
        s.evaluate(&tick, &candle).unwrap()
    }

    /// `[1, 2, 3, 10, 1]` is often quoted as a single-signal sequence, but
    /// with `k = 2 / (n + 1)` the closing drop to 1 crosses fast back under
    /// slow. One signal only holds for the first four prices.
    #[test]
    fn fast2_slow3_crosses_up_then_back_down() {
        let mut s = EmaCrossover::new(EmaCrossoverConfig {
            fast: 2,
            slow: 3,
            long_only: false,
        });
        let prices = [1.0, 2.0, 3.0, 10.0, 1.0];
        let out: Vec<Option<Signal>> = prices
            .iter()
            .enumerate()
            .map(|(i, p)| step(&mut s, i as i64, *p))
            .collect();

        // first four prices: exactly one signal, the first time fast > slow
        let early: Vec<_> = out[..4].iter().flatten().collect();
        assert_eq!(early.len(), 1);
        assert!(out[1].is_some());
        assert_eq!(early[0].side, Side::Long);
        // fast 5/3, slow 3/2
        assert!((early[0].raw_confidence - (5.0 / 3.0 - 1.5) / 1.5).abs() < 1e-12);

        // the drop back to 1 pulls fast under slow again
        assert_eq!(out[4].as_ref().map(|s| s.side), Some(Side::Short));
    }

    #[test]
    fn level_does_not_retrigger() {
        let mut s = EmaCrossover::new(EmaCrossoverConfig {
            fast: 2,
            slow: 5,
            long_only: false,
        });
        let fired = (0..20)
            .filter_map(|i| step(&mut s, i, 100.0 + i as f64))
            .count();
        assert_eq!(fired, 1);
    }

    #[test]
    fn long_only_suppresses_shorts_but_tracks_state() {
        let mut s = EmaCrossover::new(EmaCrossoverConfig {
            fast: 2,
            slow: 3,
            long_only: true,
        });
        let sides: Vec<_> = [1.0, 2.0, 3.0, 10.0, 1.0, 20.0]
            .iter()
            .enumerate()
            .filter_map(|(i, p)| step(&mut s, i as i64, *p))
            .map(|s| s.side)
            .collect();
        assert_eq!(sides, vec![Side::Long, Side::Long]);
    }

    #[test]
    fn invalid_periods_fall_back() {
        let map = json!({"fast": 30, "slow": 10}).as_object().cloned().unwrap();
        assert_eq!(EmaCrossoverConfig::from_params(&map), EmaCrossoverConfig::default());
    }
}
