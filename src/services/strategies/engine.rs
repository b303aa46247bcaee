//! Runs a batch of strategies against one (tick, candle) pair.
//!
//! Output order follows strategy order. A strategy that errors or panics is
//! logged and left out of this batch only.

use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::services::candles::Candle;
use crate::services::market_data::Tick;
use crate::services::strategies::common::{Signal, Strategy};
use crate::utils::errors::StrategyError;

#[derive(Debug, Default, Clone, Copy)]
pub struct StrategyEngine;

impl StrategyEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate<S>(&self, tick: &Tick, candle: &Candle, strategies: &mut [S]) -> Vec<Signal>
    where
        S: AsMut<dyn Strategy>,
    {
        let mut out = Vec::new();
        for strategy in strategies.iter_mut() {
            let strategy = strategy.as_mut();
            let name = strategy.name().to_string();

            let result = catch_unwind(AssertUnwindSafe(|| strategy.evaluate(tick, candle)))
                .unwrap_or_else(|panic| Err(StrategyError::Panicked(panic_message(&*panic))));

            match result {
                Ok(Some(signal)) => {
                    metrics::increment_counter!("signals_emitted_total", "strategy" => name.clone());
                    out.push(signal);
                }
                Ok(None) => {}
                Err(e) => {
                    metrics::increment_counter!("strategy_errors_total", "strategy" => name.clone());
                    log::error!("strategy {name} failed on {} @ {}: {e}", tick.symbol, tick.timestamp);
                }
            }
        }
        out
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into())
}
