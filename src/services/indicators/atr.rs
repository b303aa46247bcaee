use super::{Indicator, Window};
use crate::services::candles::Candle;

/// Average true range over consecutive candles, simple mean of the last
/// `period` true ranges.
#[derive(Debug, Clone)]
pub struct Atr {
    window: Window,
    prev_close: Option<f64>,
}

impl Atr {
    pub fn new(period: usize) -> Self {
        Self {
            window: Window::new(period),
            prev_close: None,
        }
    }
}

/// `max(h-l, |h-prevClose|, |l-prevClose|)`; without a previous close, `h-l`.
pub fn true_range(high: f64, low: f64, prev_close: Option<f64>) -> f64 {
    let hl = high - low;
    match prev_close {
        None => hl,
        Some(pc) => hl.max((high - pc).abs()).max((low - pc).abs()),
    }
}

impl Indicator for Atr {
    type Input = (f64, f64, f64);
    type Output = f64;

    /// Input is `(high, low, close)`.
    fn update(&mut self, (high, low, close): (f64, f64, f64)) -> Option<f64> {
        self.window.push(true_range(high, low, self.prev_close));
        self.prev_close = Some(close);
        self.window.is_full().then(|| self.window.mean())
    }

    fn reset(&mut self) {
        self.window.clear();
        self.prev_close = None;
    }
}

impl Atr {
    pub fn update_candle(&mut self, c: &Candle) -> Option<f64> {
        self.update((c.high, c.low, c.close))
    }
}
