//! Trend-filtered RSI reversal with a volatility gate.
//!
//! Long  : price above EMA, RSI ≤ oversold, ATR/price ≥ min_volatility
//! Short : price below EMA, RSI ≥ overbought, same gate
//!
//! With `use_vwap_filter` the price must also sit on the matching side of
//! the cumulative VWAP. Confidence is the weaker of the trend and RSI margins.

use serde_json::{json, Map, Value};

use crate::services::candles::Candle;
use crate::services::indicators::{Atr, Ema, Indicator, Rsi, Vwap};
use crate::services::market_data::Tick;
use crate::services::strategies::common::{
    check_inputs, Side, Signal, SignalDraft, Strategy, StrategyParams,
};
use crate::services::strategies::mean_reversion::rsi_margin;
use crate::utils::errors::StrategyError;

const NAME: &str = "multi_indicator";

#[derive(Debug, Clone, PartialEq)]
pub struct MultiIndicatorConfig {
    pub ema_period: usize,
    pub rsi_period: usize,
    pub atr_period: usize,
    pub oversold: f64,
    pub overbought: f64,
    /// Minimum ATR as a fraction of price
    pub min_volatility: f64,
    pub use_vwap_filter: bool,
    pub long_only: bool,
}

impl Default for MultiIndicatorConfig {
    fn default() -> Self {
        Self {
            ema_period: 50,
            rsi_period: 14,
            atr_period: 14,
            oversold: 30.0,
            overbought: 70.0,
            min_volatility: 0.001,
            use_vwap_filter: false,
            long_only: false,
        }
    }
}

impl MultiIndicatorConfig {
    pub fn from_params(map: &Map<String, Value>) -> Self {
        let d = Self::default();
        let p = StrategyParams::new(NAME, map.clone());
        let mut cfg = Self {
            ema_period: p.period_or("ema_period", d.ema_period),
            rsi_period: p.period_or("rsi_period", d.rsi_period),
            atr_period: p.period_or("atr_period", d.atr_period),
            oversold: p.level_or("oversold", d.oversold),
            overbought: p.level_or("overbought", d.overbought),
            min_volatility: p.positive_or("min_volatility", d.min_volatility),
            use_vwap_filter: p.bool_or("use_vwap_filter", d.use_vwap_filter),
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

pub struct MultiIndicator {
    cfg: MultiIndicatorConfig,
    ema: Ema,
    rsi: Rsi,
    atr: Atr,
    vwap: Vwap,
}

impl MultiIndicator {
    pub fn new(cfg: MultiIndicatorConfig) -> Self {
        Self {
            ema: Ema::new(cfg.ema_period),
            rsi: Rsi::new(cfg.rsi_period),
            atr: Atr::new(cfg.atr_period),
            vwap: Vwap::new(),
            cfg,
        }
    }
}

impl Strategy for MultiIndicator {
    fn name(&self) -> &str {
        NAME
    }

    fn evaluate(&mut self, tick: &Tick, candle: &Candle) -> Result<Option<Signal>, StrategyError> {
        check_inputs(tick, candle)?;

        // every indicator advances even when another is still warming up
        let ema = self.ema.update(candle.close);
        let rsi = self.rsi.update(candle.close);
        let atr = self.atr.update_candle(candle);
        let vwap = self.vwap.update((candle.close, Some(candle.volume)));
        let (Some(ema), Some(rsi), Some(atr)) = (ema, rsi, atr) else {
            return Ok(None);
        };

        let price = tick.price;
        if price <= 0.0 || ema <= 0.0 {
            return Ok(None);
        }
        let volatility = atr / price;
        if volatility < self.cfg.min_volatility {
            return Ok(None);
        }

        let Some((side, rsi_raw)) = rsi_margin(rsi, self.cfg.oversold, self.cfg.overbought) else {
            return Ok(None);
        };
        let trend_ok = match side {
            Side::Long => price > ema,
            Side::Short => price < ema,
        };
        if !trend_ok {
            return Ok(None);
        }
        if self.cfg.use_vwap_filter {
            let agrees = match (side, vwap) {
                (Side::Long, Some(v)) => price >= v,
                (Side::Short, Some(v)) => price <= v,
                (_, None) => false,
            };
            if !agrees {
                return Ok(None);
            }
        }
        if self.cfg.long_only && side == Side::Short {
            return Ok(None);
        }

        let trend_raw = (price - ema).abs() / ema;
        Ok(SignalDraft {
            strategy: NAME,
            side,
            raw_confidence: trend_raw.min(rsi_raw),
            details: json!({
                "ema": ema,
                "rsi": rsi,
                "atr": atr,
                "vwap": vwap,
                "volatility": volatility,
                "trend_margin": trend_raw,
                "rsi_margin": rsi_raw,
            }),
        }
        .emit(tick, candle))
    }

    fn reset(&mut self) {
        self.ema.reset();
        self.rsi.reset();
        self.atr.reset();
        self.vwap.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::candles::Timeframe;

    fn candle(close: f64, range: f64) -> Candle {
        let mut c = Candle::from_first_tick(&Tick::new("BTCUSDT", 0, close), Timeframe::M1);
        c.high = close + range / 2.0;
        c.low = close - range / 2.0;
        c
    }

    fn cfg() -> MultiIndicatorConfig {
        MultiIndicatorConfig {
            ema_period: 3,
            rsi_period: 3,
            atr_period: 2,
            min_volatility: 0.01,
            ..MultiIndicatorConfig::default()
        }
    }

    /// Falling closes make RSI oversold; the tick then trades back above
    /// the EMA.
    fn run(strategy: &mut MultiIndicator, range: f64, tick_price: f64) -> Option<Signal> {
        let closes = [100.0, 98.0, 96.0, 94.0];
        let mut last = None;
        for close in closes {
            last = strategy
                .evaluate(&Tick::new("BTCUSDT", 1, tick_price), &candle(close, range))
                .unwrap();
        }
        last
    }

    #[test]
    fn pullback_in_trend_with_volatility_goes_long() {
        let mut s = MultiIndicator::new(cfg());
        let sig = run(&mut s, 4.0, 99.0).expect("all three filters agree");
        assert_eq!(sig.side, Side::Long);
        let trend = sig.details["trend_margin"].as_f64().unwrap();
        let rsi = sig.details["rsi_margin"].as_f64().unwrap();
        assert_eq!(sig.raw_confidence, trend.min(rsi));
    }

    #[test]
    fn quiet_market_is_gated_out() {
        // ATR 4 on a ~99 price is about 0.04 of price
        let mut s = MultiIndicator::new(MultiIndicatorConfig {
            min_volatility: 0.05,
            ..cfg()
        });
        assert!(run(&mut s, 4.0, 99.0).is_none());
    }

    #[test]
    fn price_below_trend_blocks_long() {
        let mut s = MultiIndicator::new(cfg());
        assert!(run(&mut s, 4.0, 90.0).is_none());
    }

    #[test]
    fn vwap_filter_requires_agreement() {
        let mut s = MultiIndicator::new(MultiIndicatorConfig {
            use_vwap_filter: true,
            ..cfg()
        });
        // VWAP of closes is 97; a tick at 96.5 is above the EMA but below VWAP
        assert!(run(&mut s, 4.0, 96.5).is_none());

        let mut s = MultiIndicator::new(MultiIndicatorConfig {
            use_vwap_filter: true,
            ..cfg()
        });
        assert!(run(&mut s, 4.0, 99.0).is_some());
    }
}
