//! Bollinger band touch, level-triggered: long at/below the lower band,
//! short at/above the upper band. Bands come from candle closes, the
//! comparison uses the tick price.

use serde_json::{json, Map, Value};

use crate::services::candles::Candle;
use crate::services::indicators::{BollingerBands, Indicator};
use crate::services::market_data::Tick;
use crate::services::strategies::common::{
    check_inputs, Side, Signal, SignalDraft, Strategy, StrategyParams,
};
use crate::utils::errors::StrategyError;

const NAME: &str = "bollinger_bands";

#[derive(Debug, Clone, PartialEq)]
pub struct BollingerConfig {
    pub period: usize,
    pub std_dev: f64,
    pub long_only: bool,
}

impl Default for BollingerConfig {
    fn default() -> Self {
        Self {
            period: 20,
            std_dev: 2.0,
            long_only: false,
        }
    }
}

impl BollingerConfig {
    pub fn from_params(map: &Map<String, Value>) -> Self {
        let d = Self::default();
        let p = StrategyParams::new(NAME, map.clone());
        Self {
            period: p.period_or("period", d.period),
            std_dev: p.positive_or("std_dev", d.std_dev),
            long_only: p.bool_or("long_only", d.long_only),
        }
    }
}

pub struct BollingerStrategy {
    cfg: BollingerConfig,
    bands: BollingerBands,
}

impl BollingerStrategy {
    pub fn new(cfg: BollingerConfig) -> Self {
        Self {
            bands: BollingerBands::new(cfg.period, cfg.std_dev),
            cfg,
        }
    }
}

impl Strategy for BollingerStrategy {
    fn name(&self) -> &str {
        NAME
    }

    fn evaluate(&mut self, tick: &Tick, candle: &Candle) -> Result<Option<Signal>, StrategyError> {
        check_inputs(tick, candle)?;
        let Some(b) = self.bands.update(candle.close) else {
            return Ok(None);
        };
        let width = b.upper - b.lower;
        // collapsed bands carry no information
        if width <= 0.0 {
            return Ok(None);
        }

        let price = tick.price;
        let (side, raw) = if price <= b.lower {
            (Side::Long, (b.lower - price) / width)
        } else if price >= b.upper {
            (Side::Short, (price - b.upper) / width)
        } else {
            return Ok(None);
        };
        if self.cfg.long_only && side == Side::Short {
            return Ok(None);
        }

        Ok(SignalDraft {
            strategy: NAME,
            side,
            raw_confidence: raw,
            details: json!({ "bands": b }),
        }
        .emit(tick, candle))
    }

    fn reset(&mut self) {
        self.bands.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::candles::Timeframe;

    fn eval(s: &mut BollingerStrategy, close: f64, tick_price: f64) -> Option<Signal> {
        let candle = Candle::from_first_tick(&Tick::new("BTCUSDT", 0, close), Timeframe::M1);
        s.evaluate(&Tick::new("BTCUSDT", 1, tick_price), &candle).unwrap()
    }

    fn warmed() -> BollingerStrategy {
        let mut s = BollingerStrategy::new(BollingerConfig {
            period: 4,
            std_dev: 1.0,
            long_only: false,
        });
        for c in [2.0, 4.0, 4.0] {
            assert!(eval(&mut s, c, c).is_none());
        }
        s
    }

    #[test]
    fn price_below_lower_band_goes_long() {
        let mut s = warmed();
        // window [2,4,4,6]: mean 4, σ √2 → lower ≈ 2.586, width ≈ 2.828
        let sig = eval(&mut s, 6.0, 1.0).expect("outside lower band");
        assert_eq!(sig.side, Side::Long);
        let width = 2.0 * 2.0_f64.sqrt();
        let expected = ((4.0 - 2.0_f64.sqrt()) - 1.0) / width;
        assert!((sig.raw_confidence - expected).abs() < 1e-9);
    }

    #[test]
    fn price_inside_bands_is_quiet() {
        let mut s = warmed();
        assert!(eval(&mut s, 6.0, 4.0).is_none());
    }

    #[test]
    fn far_outside_clamps_confidence() {
        let mut s = warmed();
        let sig = eval(&mut s, 6.0, 100.0).unwrap();
        assert_eq!(sig.side, Side::Short);
        assert!(sig.raw_confidence > 1.0);
        assert_eq!(sig.confidence, 1.0);
    }

    #[test]
    fn flat_window_never_signals() {
        let mut s = BollingerStrategy::new(BollingerConfig {
            period: 3,
            ..BollingerConfig::default()
        });
        for _ in 0..5 {
            assert!(eval(&mut s, 10.0, 10.0).is_none());
        }
    }
}
