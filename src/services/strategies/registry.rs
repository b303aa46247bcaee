//! Strategy factory: kind + flat params → boxed strategy.

use serde_json::{Map, Value};

use crate::services::strategies::bollinger_bands::{BollingerConfig, BollingerStrategy};
use crate::services::strategies::common::{Strategy, StrategyKind, StrategySpec};
use crate::services::strategies::ema_crossover::{EmaCrossover, EmaCrossoverConfig};
use crate::services::strategies::mean_reversion::{RsiConfig, RsiMeanReversion};
use crate::services::strategies::multi_indicator::{MultiIndicator, MultiIndicatorConfig};
use crate::utils::errors::ConfigError;

pub fn build(kind: StrategyKind, params: &Map<String, Value>) -> Box<dyn Strategy> {
    match kind {
        StrategyKind::EmaCrossover => Box::new(EmaCrossover::new(EmaCrossoverConfig::from_params(params))),
        StrategyKind::RsiMeanReversion => Box::new(RsiMeanReversion::new(RsiConfig::from_params(params))),
        StrategyKind::BollingerBands => Box::new(BollingerStrategy::new(BollingerConfig::from_params(params))),
        StrategyKind::MultiIndicator => {
            Box::new(MultiIndicator::new(MultiIndicatorConfig::from_params(params)))
        }
    }
}

/// String-keyed entry point; an unknown kind is rejected, never defaulted.
pub fn build_named(kind: &str, params: &Map<String, Value>) -> Result<Box<dyn Strategy>, ConfigError> {
    Ok(build(kind.parse()?, params))
}

impl StrategySpec {
    pub fn build(&self) -> Box<dyn Strategy> {
        build(self.kind, &self.params)
    }
}
