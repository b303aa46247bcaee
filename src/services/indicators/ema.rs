use super::Indicator;

/// Exponential moving average, seeded with the first observation.
///
///   update 0  → ema = price
///   update 1+ → ema = price·m + ema·(1−m),   m = 2/(period+1)
///
/// There is no warm-up gate: a value is available after the first update.
#[derive(Debug, Clone)]
pub struct Ema {
    period: usize,
    mult: f64,
    value: Option<f64>,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self {
            period,
            mult: 2.0 / (period as f64 + 1.0),
            value: None,
        }
    }

    pub fn period(&self) -> usize {
        self.period
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

impl Indicator for Ema {
    type Input = f64;
    type Output = f64;

    fn update(&mut self, price: f64) -> Option<f64> {
        let next = match self.value {
            None => price,
            Some(prev) => price * self.mult + prev * (1.0 - self.mult),
        };
        self.value = Some(next);
        self.value
    }

    fn reset(&mut self) {
        self.value = None;
    }
}
