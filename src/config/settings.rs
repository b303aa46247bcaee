use dotenv::dotenv;
use std::env;
use std::str::FromStr;

use crate::services::candles::Timeframe;
use crate::services::strategies::StrategySpec;
use crate::utils::errors::ConfigError;

const DEFAULT_FEED_URL: &str = "wss://stream.binance.com:9443/ws";
const DEFAULT_TIME_URL: &str = "https://api.binance.com/api/v3/time";

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_port: u16,
    pub symbols: Vec<String>,
    pub timeframes: Vec<Timeframe>,
    pub feed_url: String,
    pub time_url: String,
    pub clock_sync_interval_secs: u64,
    pub clock_probe_timeout_ms: u64,
    pub scheduler_offset_ms: i64,
    pub tick_buffer_capacity: usize,
    pub feed_max_retries: u32,
    pub feed_backoff_base_ms: u64,
    pub feed_backoff_max_ms: u64,
    pub candle_workers: usize,
    pub strategies: Vec<StrategySpec>,
    /// Name of the env-var holding the feed's HMAC secret; unset = unsigned feed
    pub feed_hmac_secret_env: Option<String>,
    pub metrics_port: Option<u16>,
    pub log_json: bool,
}

impl Settings {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        dotenv().ok(); // loads `.env` file automatically
        Ok(Self::from_lookup(|k| env::var(k).ok())?)
    }

    /// Builds settings from any key lookup; `new()` feeds it the process env.
    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let symbols: Vec<String> = get("SYMBOLS")
            .unwrap_or_else(|| "BTCUSDT".into())
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if symbols.is_empty() {
            return Err(ConfigError::Invalid {
                key: "SYMBOLS",
                reason: "no symbols configured".into(),
            });
        }

        let timeframes = get("TIMEFRAMES")
            .unwrap_or_else(|| "1m".into())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Timeframe::from_str)
            .collect::<Result<Vec<_>, _>>()?;

        let strategies = match get("STRATEGIES") {
            Some(raw) => StrategySpec::parse_list(&raw)?,
            None => StrategySpec::defaults_for(&symbols, &timeframes),
        };

        Ok(Self {
            server_port: parse_or(&get, "SERVER_PORT", 8080)?,
            symbols,
            timeframes,
            feed_url: get("FEED_URL").unwrap_or_else(|| DEFAULT_FEED_URL.into()),
            time_url: get("TIME_URL").unwrap_or_else(|| DEFAULT_TIME_URL.into()),
            clock_sync_interval_secs: parse_or(&get, "CLOCK_SYNC_INTERVAL_SECS", 30)?,
            clock_probe_timeout_ms: parse_or(&get, "CLOCK_PROBE_TIMEOUT_MS", 2_000)?,
            scheduler_offset_ms: parse_or(&get, "SCHEDULER_OFFSET_MS", 5)?,
            tick_buffer_capacity: parse_or(&get, "TICK_BUFFER_CAPACITY", 2_048)?,
            feed_max_retries: parse_or(&get, "FEED_MAX_RETRIES", 8)?,
            feed_backoff_base_ms: parse_or(&get, "FEED_BACKOFF_BASE_MS", 500)?,
            feed_backoff_max_ms: parse_or(&get, "FEED_BACKOFF_MAX_MS", 30_000)?,
            candle_workers: parse_or(&get, "CANDLE_WORKERS", 0)?,
            strategies,
            feed_hmac_secret_env: get("FEED_HMAC_SECRET_ENV").filter(|s| !s.is_empty()),
            metrics_port: get("METRICS_PORT")
                .map(|v| {
                    v.parse::<u16>().map_err(|_| ConfigError::Invalid {
                        key: "METRICS_PORT",
                        reason: format!("'{v}' is not a valid u16"),
                    })
                })
                .transpose()?,
            log_json: get("LOG_FORMAT")
                .map(|f| f.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        })
    }
}

fn parse_or<F, T>(get: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|_| ConfigError::Invalid {
            key,
            reason: format!("'{raw}' could not be parsed"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_apply_when_env_is_empty() {
        let s = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(s.server_port, 8080);
        assert_eq!(s.symbols, vec!["BTCUSDT".to_string()]);
        assert_eq!(s.timeframes, vec![Timeframe::M1]);
        assert_eq!(s.scheduler_offset_ms, 5);
        assert_eq!(s.tick_buffer_capacity, 2048);
        assert!(!s.strategies.is_empty());
        assert!(!s.log_json);
    }

    #[test]
    fn unknown_timeframe_is_fatal() {
        let err = Settings::from_lookup(lookup(&[("TIMEFRAMES", "1m,7m")])).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownTimeframe(tf) if tf == "7m"));
    }

    #[test]
    fn malformed_number_is_rejected() {
        let err = Settings::from_lookup(lookup(&[("SERVER_PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "SERVER_PORT", .. }));
    }

    #[test]
    fn symbols_are_normalised() {
        let s = Settings::from_lookup(lookup(&[
            ("SYMBOLS", " btcusdt, ethusdt ,"),
            ("LOG_FORMAT", "JSON"),
        ]))
        .unwrap();
        assert_eq!(s.symbols, vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
        assert!(s.log_json);
    }
}
