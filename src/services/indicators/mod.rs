//! Streaming indicators. Each one consumes a single data point per `update`
//! and answers `None` while it is still warming up.
//!
//! Instances are owned by the strategy that created them; nothing here is
//! shared or synchronised.

pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod rsi;
pub mod vwap;

use std::collections::VecDeque;

pub use atr::Atr;
pub use bollinger::{BollingerBands, Bands};
pub use ema::Ema;
pub use rsi::Rsi;
pub use vwap::Vwap;

pub trait Indicator {
    type Input;
    type Output;

    fn update(&mut self, input: Self::Input) -> Option<Self::Output>;

    /// Back to the "no data" state.
    fn reset(&mut self);
}

/// Fixed-length sliding window keeping running Σx and Σx² so mean and
/// population variance stay O(1) per update.
#[derive(Debug, Clone)]
pub(crate) struct Window {
    values: VecDeque<f64>,
    cap: usize,
    sum: f64,
    sum_sq: f64,
}

impl Window {
    pub(crate) fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            values: VecDeque::with_capacity(cap),
            cap,
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    pub(crate) fn push(&mut self, v: f64) {
        if self.values.len() == self.cap {
            if let Some(old) = self.values.pop_front() {
                self.sum -= old;
                self.sum_sq -= old * old;
            }
        }
        self.values.push_back(v);
        self.sum += v;
        self.sum_sq += v * v;
    }

    pub(crate) fn is_full(&self) -> bool {
        self.values.len() == self.cap
    }

    pub(crate) fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.sum / self.values.len() as f64
    }

    /// Population variance, floored at 0 against cancellation error.
    pub(crate) fn variance(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let n = self.values.len() as f64;
        let mean = self.sum / n;
        (self.sum_sq / n - mean * mean).max(0.0)
    }

    pub(crate) fn clear(&mut self) {
        self.values.clear();
        self.sum = 0.0;
        self.sum_sq = 0.0;
    }
}
