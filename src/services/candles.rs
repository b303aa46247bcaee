//! Tick → OHLC aggregation per (symbol, timeframe).
//!
//! Period membership is decided purely by
//! `floor(timestamp / duration) * duration` on millisecond timestamps, so two
//! builders fed the same ticks produce identical candles.
//!
//! Boundary crossings are decided in *arrival* order. A late tick whose period
//! precedes the open candle still rolls the candle over, producing a short
//! "backward" candle. That is logged, not repaired.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::services::market_data::Tick;
use crate::utils::errors::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 7] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ];

    pub const fn duration_ms(self) -> i64 {
        const MIN: i64 = 60_000;
        match self {
            Timeframe::M1 => MIN,
            Timeframe::M5 => 5 * MIN,
            Timeframe::M15 => 15 * MIN,
            Timeframe::M30 => 30 * MIN,
            Timeframe::H1 => 60 * MIN,
            Timeframe::H4 => 240 * MIN,
            Timeframe::D1 => 1_440 * MIN,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    /// Start of the period containing `ts_ms` (floor, also for negative input).
    #[inline]
    pub fn period_start(self, ts_ms: i64) -> i64 {
        let d = self.duration_ms();
        ts_ms.div_euclid(d) * d
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::ALL
            .into_iter()
            .find(|tf| tf.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownTimeframe(s.to_string()))
    }
}

/// OHLC aggregate. Only the builder mutates it; emitted copies are frozen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub period_start: i64,
    pub period_end: i64,
    pub tick_count: u64,
}

impl Candle {
    pub fn from_first_tick(tick: &Tick, timeframe: Timeframe) -> Self {
        let period_start = timeframe.period_start(tick.timestamp);
        Self {
            symbol: tick.symbol.clone(),
            timeframe,
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: tick.volume_or_unit(),
            period_start,
            period_end: period_start + timeframe.duration_ms(),
            tick_count: 1,
        }
    }

    fn absorb(&mut self, tick: &Tick) {
        self.high = self.high.max(tick.price);
        self.low = self.low.min(tick.price);
        self.close = tick.price;
        self.volume += tick.volume_or_unit();
        self.tick_count += 1;
    }
}

/// Result of feeding one tick to the builder.
#[derive(Debug, Clone, PartialEq)]
pub enum CandleUpdate {
    /// First tick ever seen for the key.
    Started(Candle),
    /// Tick fell inside the open period.
    Updated(Candle),
    /// Tick's period differs: `completed` is frozen, `current` just opened.
    Rolled { completed: Candle, current: Candle },
}

impl CandleUpdate {
    pub fn current(&self) -> &Candle {
        match self {
            CandleUpdate::Started(c) | CandleUpdate::Updated(c) => c,
            CandleUpdate::Rolled { current, .. } => current,
        }
    }

    pub fn completed(&self) -> Option<&Candle> {
        match self {
            CandleUpdate::Rolled { completed, .. } => Some(completed),
            _ => None,
        }
    }
}

pub type CandleKey = (String, Timeframe);

#[derive(Debug, Default)]
pub struct CandleBuilder {
    open: HashMap<CandleKey, Candle>,
}

impl CandleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, tick: &Tick, timeframe: Timeframe) -> CandleUpdate {
        let start = timeframe.period_start(tick.timestamp);
        let key = (tick.symbol.clone(), timeframe);

        match self.open.get_mut(&key) {
            None => {
                let candle = Candle::from_first_tick(tick, timeframe);
                self.open.insert(key, candle.clone());
                CandleUpdate::Started(candle)
            }
            Some(candle) if candle.period_start == start => {
                candle.absorb(tick);
                CandleUpdate::Updated(candle.clone())
            }
            Some(candle) => {
                if start < candle.period_start {
                    log::warn!(
                        "{} {}: late tick at {} rolls candle back from period {}",
                        tick.symbol,
                        timeframe,
                        tick.timestamp,
                        candle.period_start
                    );
                }
                let current = Candle::from_first_tick(tick, timeframe);
                let completed = std::mem::replace(candle, current.clone());
                CandleUpdate::Rolled { completed, current }
            }
        }
    }

    pub fn current(&self, symbol: &str, timeframe: Timeframe) -> Option<&Candle> {
        self.open.get(&(symbol.to_string(), timeframe))
    }

    pub fn reset(&mut self) {
        self.open.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(ts: i64, price: f64) -> Tick {
        Tick::new("EURUSD", ts, price)
    }

    #[test]
    fn timeframe_parsing() {
        assert_eq!("1m".parse::<Timeframe>().unwrap(), Timeframe::M1);
        assert_eq!("4h".parse::<Timeframe>().unwrap().duration_ms(), 14_400_000);
        assert!(matches!(
            "2m".parse::<Timeframe>(),
            Err(ConfigError::UnknownTimeframe(s)) if s == "2m"
        ));
    }

    #[test]
    fn period_start_floors_negative_timestamps() {
        assert_eq!(Timeframe::M1.period_start(-1), -60_000);
        assert_eq!(Timeframe::M1.period_start(119_999), 60_000);
    }

    #[test]
    fn sole_tick_round_trips_through_candle() {
        let mut b = CandleBuilder::new();
        let up = b.ingest(&tick(1_700_000_000_000, 1.0850), Timeframe::M1);
        let c = up.current();
        assert_eq!(c.open, 1.0850);
        assert_eq!(c.close, 1.0850);
        assert_eq!(c.period_start, 1_699_999_980_000);
        assert_eq!(c.period_end - c.period_start, 60_000);
        assert_eq!(c.tick_count, 1);
    }

    #[test]
    fn ohlc_tracks_ticks_and_rolls_on_boundary() {
        let mut b = CandleBuilder::new();
        b.ingest(&tick(0, 10.0), Timeframe::M1);
        b.ingest(&tick(10_000, 12.0), Timeframe::M1);
        b.ingest(&tick(20_000, 9.0), Timeframe::M1);
        let up = b.ingest(&tick(59_999, 11.0), Timeframe::M1);
        assert!(matches!(up, CandleUpdate::Updated(_)));

        let up = b.ingest(&tick(60_000, 13.0), Timeframe::M1);
        let done = up.completed().expect("completed candle").clone();
        assert_eq!((done.open, done.high, done.low, done.close), (10.0, 12.0, 9.0, 11.0));
        assert_eq!(done.tick_count, 4);
        assert!(done.low <= done.open && done.open <= done.high);
        assert!(done.low <= done.close && done.close <= done.high);
        assert_eq!(done.period_end - done.period_start, Timeframe::M1.duration_ms());

        let cur = up.current();
        assert_eq!(cur.period_start, 60_000);
        assert_eq!((cur.open, cur.high, cur.low, cur.close), (13.0, 13.0, 13.0, 13.0));
    }

    #[test]
    fn skipped_periods_are_not_filled() {
        let mut b = CandleBuilder::new();
        b.ingest(&tick(0, 1.0), Timeframe::M1);
        let up = b.ingest(&tick(300_000, 2.0), Timeframe::M1);
        assert_eq!(up.completed().unwrap().period_start, 0);
        assert_eq!(up.current().period_start, 300_000);
    }

    #[test]
    fn late_tick_rolls_backwards_in_arrival_order() {
        let mut b = CandleBuilder::new();
        b.ingest(&tick(61_000, 2.0), Timeframe::M1);
        let up = b.ingest(&tick(59_000, 1.0), Timeframe::M1);
        assert_eq!(up.completed().unwrap().period_start, 60_000);
        assert_eq!(up.current().period_start, 0);
    }

    #[test]
    fn keys_are_independent() {
        let mut b = CandleBuilder::new();
        b.ingest(&tick(0, 1.0), Timeframe::M1);
        b.ingest(&tick(0, 1.0), Timeframe::M5);
        let up = b.ingest(&tick(60_000, 2.0), Timeframe::M5);
        assert!(matches!(up, CandleUpdate::Updated(_)));
        assert_eq!(b.current("EURUSD", Timeframe::M1).unwrap().close, 1.0);
    }
}
