use std::collections::VecDeque;

use super::Indicator;

/// RSI over a sliding window of per-step gains and losses (simple average,
/// not Wilder smoothing).
///
/// The first update has no previous price and records a zero change, so the
/// window holds `period` entries after exactly `period` updates.
#[derive(Debug, Clone)]
pub struct Rsi {
    period: usize,
    prev: Option<f64>,
    gains: VecDeque<f64>,
    losses: VecDeque<f64>,
    gain_sum: f64,
    loss_sum: f64,
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self {
            period,
            prev: None,
            gains: VecDeque::with_capacity(period),
            losses: VecDeque::with_capacity(period),
            gain_sum: 0.0,
            loss_sum: 0.0,
        }
    }

    pub fn period(&self) -> usize {
        self.period
    }
}

impl Indicator for Rsi {
    type Input = f64;
    type Output = f64;

    fn update(&mut self, price: f64) -> Option<f64> {
        let change = price - self.prev.unwrap_or(price);
        self.prev = Some(price);

        let (gain, loss) = if change > 0.0 { (change, 0.0) } else { (0.0, -change) };
        if self.gains.len() == self.period {
            self.gain_sum -= self.gains.pop_front().unwrap_or(0.0);
            self.loss_sum -= self.losses.pop_front().unwrap_or(0.0);
        }
        self.gains.push_back(gain);
        self.losses.push_back(loss);
        self.gain_sum += gain;
        self.loss_sum += loss;

        if self.gains.len() < self.period {
            return None;
        }

        let n = self.period as f64;
        // running sums can drift a hair below zero
        let avg_gain = (self.gain_sum / n).max(0.0);
        let avg_loss = (self.loss_sum / n).max(0.0);
        if avg_loss == 0.0 {
            return Some(100.0);
        }
        Some(100.0 - 100.0 / (1.0 + avg_gain / avg_loss))
    }

    fn reset(&mut self) {
        self.prev = None;
        self.gains.clear();
        self.losses.clear();
        self.gain_sum = 0.0;
        self.loss_sum = 0.0;
    }
}
