//! ──────────────────────────────────────────────────────────────────────────
//! Server-time correction
//! ──────────────────────────────────────────────────────────────────────────
//! * `ClockOffset`      – the one process-wide offset (ms), atomic
//! * `CorrectedClock`   – cheap read handle: local time + offset
//! * `ClockSynchronizer` – the only writer; round-trip probes on an interval
//!   and opportunistically on feed heartbeats
//!
//! A failed probe is logged and dropped; the next one supersedes it. Until a
//! probe succeeds the offset stays 0 and corrected time equals local time.
//! ──────────────────────────────────────────────────────────────────────────

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::utils::errors::ApiError;

/// Source of raw local wall-clock time (epoch ms).
pub trait LocalClock: Send + Sync {
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl LocalClock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Anything that can answer "what time is it on the server".
#[async_trait]
pub trait TimeAuthority: Send + Sync {
    async fn server_time(&self, client_send_ms: i64) -> Result<i64, ApiError>;
}

/// `GET {url}` → `{"serverTime": 1700000000000}`
pub struct HttpTimeAuthority {
    client: reqwest::Client,
    url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerTimeResponse {
    server_time: i64,
}

impl HttpTimeAuthority {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl TimeAuthority for HttpTimeAuthority {
    async fn server_time(&self, _client_send_ms: i64) -> Result<i64, ApiError> {
        let resp: ServerTimeResponse = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.server_time)
    }
}

#[derive(Debug, Default)]
pub struct ClockOffset {
    offset_ms: AtomicI64,
    last_rtt_ms: AtomicI64,
    synced: AtomicBool,
}

impl ClockOffset {
    pub fn get(&self) -> i64 {
        self.offset_ms.load(Ordering::Acquire)
    }

    pub fn last_rtt_ms(&self) -> i64 {
        self.last_rtt_ms.load(Ordering::Relaxed)
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    fn store(&self, offset_ms: i64, rtt_ms: i64) {
        self.last_rtt_ms.store(rtt_ms, Ordering::Relaxed);
        self.offset_ms.store(offset_ms, Ordering::Release);
        self.synced.store(true, Ordering::Release);
    }
}

/// Read side of the clock. Two reads may straddle a sync and disagree slightly.
#[derive(Clone)]
pub struct CorrectedClock {
    local: Arc<dyn LocalClock>,
    offset: Arc<ClockOffset>,
}

impl CorrectedClock {
    pub fn now_ms(&self) -> i64 {
        self.local.now_ms() + self.offset.get()
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset.get()
    }

    pub fn is_synced(&self) -> bool {
        self.offset.is_synced()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSample {
    pub offset_ms: i64,
    pub rtt_ms: i64,
}

/// `offset = server - recv + rtt/2`
pub fn compute_offset(send_ms: i64, server_ms: i64, recv_ms: i64) -> ProbeSample {
    let rtt_ms = (recv_ms - send_ms).max(0);
    ProbeSample {
        offset_ms: server_ms - recv_ms + rtt_ms / 2,
        rtt_ms,
    }
}

pub struct ClockSynchronizer {
    local: Arc<dyn LocalClock>,
    authority: Arc<dyn TimeAuthority>,
    offset: Arc<ClockOffset>,
    probe_timeout: Duration,
    heartbeat_probe_in_flight: AtomicBool,
}

impl ClockSynchronizer {
    pub fn new(
        local: Arc<dyn LocalClock>,
        authority: Arc<dyn TimeAuthority>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            local,
            authority,
            offset: Arc::new(ClockOffset::default()),
            probe_timeout,
            heartbeat_probe_in_flight: AtomicBool::new(false),
        }
    }

    pub fn clock(&self) -> CorrectedClock {
        CorrectedClock {
            local: Arc::clone(&self.local),
            offset: Arc::clone(&self.offset),
        }
    }

    pub fn now_ms(&self) -> i64 {
        self.local.now_ms() + self.offset.get()
    }

    pub async fn probe(&self) -> Result<ProbeSample, ApiError> {
        let send = self.local.now_ms();
        let server = tokio::time::timeout(self.probe_timeout, self.authority.server_time(send))
            .await
            .map_err(|_| ApiError::Timeout(self.probe_timeout.as_millis() as u64))??;
        let recv = self.local.now_ms();

        let sample = compute_offset(send, server, recv);
        self.apply(sample);
        Ok(sample)
    }

    /// Feed a time exchange observed elsewhere (e.g. a heartbeat carrying
    /// server time) without issuing a request.
    pub fn observe(&self, send_ms: i64, server_ms: i64, recv_ms: i64) -> ProbeSample {
        let sample = compute_offset(send_ms, server_ms, recv_ms);
        self.apply(sample);
        sample
    }

    fn apply(&self, sample: ProbeSample) {
        let previous = self.offset.get();
        self.offset.store(sample.offset_ms, sample.rtt_ms);
        metrics::gauge!("clock_offset_ms", sample.offset_ms as f64);
        tracing::debug!(
            offset_ms = sample.offset_ms,
            rtt_ms = sample.rtt_ms,
            drift_ms = sample.offset_ms - previous,
            "clock offset updated"
        );
    }

    /// Opportunistic probe on a feed heartbeat; skipped while one is running.
    pub fn on_heartbeat(self: &Arc<Self>) {
        if self
            .heartbeat_probe_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.probe().await {
                log::debug!("heartbeat clock probe failed: {e}");
            }
            this.heartbeat_probe_in_flight.store(false, Ordering::Release);
        });
    }

    /// Fixed-interval probe loop. Never returns.
    pub async fn run(self: Arc<Self>, every: Duration) {
        let mut iv = tokio::time::interval(every);
        loop {
            iv.tick().await;
            if let Err(e) = self.probe().await {
                log::warn!("clock probe failed, keeping offset {} ms: {e}", self.offset.get());
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Local clock under test control.
    #[derive(Default)]
    pub struct ManualClock(pub AtomicI64);

    impl ManualClock {
        pub fn at(ms: i64) -> Arc<Self> {
            Arc::new(Self(AtomicI64::new(ms)))
        }
        pub fn set(&self, ms: i64) {
            self.0.store(ms, Ordering::SeqCst);
        }
    }

    impl LocalClock for ManualClock {
        fn now_ms(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }
}
