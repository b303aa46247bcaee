//! Market-data value types and the outbound event bus.
//! -----------------------------------------------------------------
//! ‣ `RawTick` is what a feed adapter hands in; `Tick` is the corrected,
//!   immutable form everything downstream sees.
//! ‣ `MarketBus` publishes completed candles, signals & boundary events via
//!   `tokio::broadcast`. Store and execution adapters subscribe; the core
//!   never waits on them.
//!
//! Usage from an adapter task:
//! ```ignore
//! let mut rx = bus.signals.subscribe();
//! while let Ok(signal) = rx.recv().await { /* hand to execution */ }
//! ```
//! -----------------------------------------------------------------

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, Sender};

use crate::services::candles::{Candle, Timeframe};
use crate::services::strategies::Signal;

const CAPACITY: usize = 256; // ring‑buffer per topic

/// Tick as delivered by a feed adapter, before time correction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTick {
    pub symbol: String,
    pub price: f64,
    /// Venue timestamp (ms) when the feed carries one
    pub timestamp: Option<i64>,
    pub volume: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    /// Corrected epoch milliseconds
    pub timestamp: i64,
    pub price: f64,
    pub volume: Option<f64>,
}

impl Tick {
    pub fn new(symbol: impl Into<String>, timestamp: i64, price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp,
            price,
            volume: None,
        }
    }

    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume = Some(volume);
        self
    }

    /// Volume for VWAP-style weighting; a tick without volume counts as 1.
    #[inline]
    pub fn volume_or_unit(&self) -> f64 {
        self.volume.unwrap_or(1.0)
    }
}

/// Published every time the scheduler reaches a boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundaryEvent {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub boundary: i64,
    pub timing_error_ms: i64,
    /// Tick at or before the boundary; `None` = no tick data available
    pub tick: Option<Tick>,
}

#[derive(Clone)]
pub struct MarketBus {
    pub candles: Sender<Candle>,
    pub signals: Sender<Signal>,
    pub boundaries: Sender<BoundaryEvent>,
}

impl MarketBus {
    pub fn new() -> Self {
        let (candles, _) = broadcast::channel(CAPACITY);
        let (signals, _) = broadcast::channel(CAPACITY);
        let (boundaries, _) = broadcast::channel(CAPACITY);
        Self {
            candles,
            signals,
            boundaries,
        }
    }
}

impl Default for MarketBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_volume_defaults_to_one() {
        let t = Tick::new("BTCUSDT", 0, 100.0);
        assert_eq!(t.volume_or_unit(), 1.0);
        assert_eq!(t.with_volume(2.5).volume_or_unit(), 2.5);
    }

    #[tokio::test]
    async fn bus_fans_out_to_every_subscriber() {
        let bus = MarketBus::new();
        let mut a = bus.boundaries.subscribe();
        let mut b = bus.boundaries.subscribe();
        let ev = BoundaryEvent {
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::M1,
            boundary: 60_000,
            timing_error_ms: 1,
            tick: None,
        };
        bus.boundaries.send(ev.clone()).unwrap();
        assert_eq!(a.recv().await.unwrap(), ev);
        assert_eq!(b.recv().await.unwrap(), ev);
    }
}
