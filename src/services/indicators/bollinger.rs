use serde::Serialize;

use super::{Indicator, Window};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bands {
    pub middle: f64,
    pub upper: f64,
    pub lower: f64,
    /// `2kσ / mean`; 0 when the mean is 0
    pub bandwidth: f64,
}

/// Bollinger bands over a sliding price window, population σ.
#[derive(Debug, Clone)]
pub struct BollingerBands {
    window: Window,
    k: f64,
}

impl BollingerBands {
    pub fn new(period: usize, std_dev_multiplier: f64) -> Self {
        Self {
            window: Window::new(period),
            k: std_dev_multiplier,
        }
    }
}

impl Indicator for BollingerBands {
    type Input = f64;
    type Output = Bands;

    fn update(&mut self, price: f64) -> Option<Bands> {
        self.window.push(price);
        if !self.window.is_full() {
            return None;
        }
        let mean = self.window.mean();
        let half = self.k * self.window.variance().sqrt();
        Some(Bands {
            middle: mean,
            upper: mean + half,
            lower: mean - half,
            bandwidth: if mean == 0.0 { 0.0 } else { 2.0 * half / mean },
        })
    }

    fn reset(&mut self) {
        self.window.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_match_population_sigma() {
        let mut bb = BollingerBands::new(4, 2.0);
        assert!(bb.update(2.0).is_none());
        assert!(bb.update(4.0).is_none());
        assert!(bb.update(4.0).is_none());
        let b = bb.update(6.0).unwrap();
        // mean 4, var (4+0+0+4)/4 = 2
        let sigma = 2.0_f64.sqrt();
        assert!((b.middle - 4.0).abs() < 1e-12);
        assert!((b.upper - (4.0 + 2.0 * sigma)).abs() < 1e-12);
        assert!((b.lower - (4.0 - 2.0 * sigma)).abs() < 1e-12);
        assert!((b.bandwidth - 4.0 * sigma / 4.0).abs() < 1e-12);
    }

    #[test]
    fn flat_prices_collapse_the_bands() {
        let mut bb = BollingerBands::new(3, 2.0);
        let mut out = None;
        for _ in 0..5 {
            out = bb.update(10.0);
        }
        let b = out.unwrap();
        assert_eq!(b.upper, b.lower);
        assert_eq!(b.bandwidth, 0.0);
    }
}
