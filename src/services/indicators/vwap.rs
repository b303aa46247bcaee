use super::Indicator;

/// Cumulative volume-weighted average price. Never resets on its own.
#[derive(Debug, Clone, Default)]
pub struct Vwap {
    pv: f64,
    volume: f64,
}

impl Vwap {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Indicator for Vwap {
    /// `(price, volume)`; missing volume weighs 1
    type Input = (f64, Option<f64>);
    type Output = f64;

    fn update(&mut self, (price, volume): (f64, Option<f64>)) -> Option<f64> {
        let v = volume.unwrap_or(1.0);
        self.pv += price * v;
        self.volume += v;
        (self.volume != 0.0).then(|| self.pv / self.volume)
    }

    fn reset(&mut self) {
        self.pv = 0.0;
        self.volume = 0.0;
    }
}
