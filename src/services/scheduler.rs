//! Boundary scheduler
//! -----------------------------------------------------------------
//! One tokio task per job, wrapped in `futures::future::Abortable` so that
//! `cancel()` invalidates the timer synchronously. Each job walks
//!
//!   Idle → Scheduled → Fired → Scheduled → … → Cancelled
//!
//! with CAS transitions; the Fired → Scheduled re-arm fails once the job
//! is cancelled, so a cancel issued from inside the callback (or racing with
//! it) ends the job.
//!
//! Waiting is two-phase: a coarse sleep to `target - offset_ms`, then the
//! remaining `offset_ms` adjusted by however far the sync offset moved while
//! sleeping. Only the sync offset is re-read: a second jittered local reading
//! would turn the fire instant into the max of two noisy estimates.
//! -----------------------------------------------------------------

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{AbortHandle, Abortable};
use serde::Serialize;
use statrs::statistics::{Data, Distribution, Max, Median, Min, OrderStatistics};
use uuid::Uuid;

use crate::services::candles::Timeframe;
use crate::services::clock::CorrectedClock;

pub const DEFAULT_OFFSET_MS: i64 = 5;
pub const TIMING_HISTORY: usize = 1_000;

/// `floor(now / T) * T + T`: always a multiple of `T` and strictly after `now`.
pub fn next_boundary(now_ms: i64, period_ms: i64) -> i64 {
    now_ms.div_euclid(period_ms) * period_ms + period_ms
}

/// Boundary the job should aim for next.
///
/// Skips forward when the arm delay would be ≤ 0 and never returns a boundary
/// at or before one this job already fired.
pub fn arm_target(now_ms: i64, period_ms: i64, offset_ms: i64, last_fired: Option<i64>) -> i64 {
    let mut target = next_boundary(now_ms, period_ms);
    if let Some(last) = last_fired {
        if target <= last {
            target = last + period_ms;
        }
    }
    while target - now_ms - offset_ms <= 0 {
        target += period_ms;
    }
    target
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Scheduled,
    Fired,
    Cancelled,
}

impl JobState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => JobState::Idle,
            1 => JobState::Scheduled,
            2 => JobState::Fired,
            _ => JobState::Cancelled,
        }
    }
}

/// Handed to the callback on every firing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundaryFire {
    pub job_id: Uuid,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub boundary: i64,
    pub fired_at: i64,
    pub timing_error_ms: i64,
}

pub type FireCallback = Arc<dyn Fn(BoundaryFire) + Send + Sync>;

pub struct ScheduledJob {
    pub id: Uuid,
    pub symbol: String,
    pub timeframe: Timeframe,
    next_fire_time: AtomicI64,
    state: AtomicU8,
    abort: AbortHandle,
}

impl ScheduledJob {
    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn next_fire_time(&self) -> i64 {
        self.next_fire_time.load(Ordering::Acquire)
    }

    fn transition(&self, from: JobState, to: JobState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn cancel(&self) {
        self.state.store(JobState::Cancelled as u8, Ordering::Release);
        self.abort.abort();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TimingStats {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub p95: f64,
    pub p99: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
}

/// Signed timing errors (`fired_at - boundary`) of the last N firings.
#[derive(Debug)]
pub struct TimingHistory {
    cap: usize,
    samples: Mutex<VecDeque<i64>>,
}

impl TimingHistory {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            samples: Mutex::new(VecDeque::with_capacity(cap.max(1))),
        }
    }

    pub fn record(&self, error_ms: i64) {
        let mut samples = self.samples.lock().unwrap_or_else(|p| p.into_inner());
        if samples.len() == self.cap {
            samples.pop_front();
        }
        samples.push_back(error_ms);
    }

    pub fn len(&self) -> usize {
        self.samples.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> TimingStats {
        let values: Vec<f64> = {
            let samples = self.samples.lock().unwrap_or_else(|p| p.into_inner());
            samples.iter().map(|&v| v as f64).collect()
        };
        if values.is_empty() {
            return TimingStats::default();
        }
        let count = values.len();
        let mut data = Data::new(values);
        TimingStats {
            count,
            mean: data.mean().unwrap_or(0.0),
            median: data.median(),
            p95: data.percentile(95),
            p99: data.percentile(99),
            std_dev: data.std_dev().filter(|s| s.is_finite()).unwrap_or(0.0),
            min: data.min(),
            max: data.max(),
        }
    }
}

pub struct BoundaryScheduler {
    clock: CorrectedClock,
    jobs: DashMap<Uuid, Arc<ScheduledJob>>,
    timing: Arc<TimingHistory>,
    default_offset_ms: i64,
}

impl BoundaryScheduler {
    pub fn new(clock: CorrectedClock) -> Self {
        Self::with_offset(clock, DEFAULT_OFFSET_MS)
    }

    pub fn with_offset(clock: CorrectedClock, default_offset_ms: i64) -> Self {
        Self {
            clock,
            jobs: DashMap::new(),
            timing: Arc::new(TimingHistory::new(TIMING_HISTORY)),
            default_offset_ms: default_offset_ms.max(0),
        }
    }

    /// Arms a job that fires at every `timeframe` boundary until cancelled.
    /// Must be called from inside a tokio runtime.
    pub fn schedule(&self, symbol: &str, timeframe: Timeframe, callback: FireCallback) -> Uuid {
        self.schedule_with_offset(symbol, timeframe, self.default_offset_ms, callback)
    }

    pub fn schedule_with_offset(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        offset_ms: i64,
        callback: FireCallback,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let (abort, registration) = AbortHandle::new_pair();
        let job = Arc::new(ScheduledJob {
            id,
            symbol: symbol.to_string(),
            timeframe,
            next_fire_time: AtomicI64::new(0),
            state: AtomicU8::new(JobState::Idle as u8),
            abort,
        });
        let ctx = JobContext {
            clock: self.clock.clone(),
            timing: Arc::clone(&self.timing),
            period_ms: timeframe.duration_ms(),
            offset_ms: offset_ms.max(0),
            callback,
        };
        let task = Abortable::new(ctx.run(Arc::clone(&job)), registration);
        self.jobs.insert(id, job);

        tokio::spawn(task);
        log::info!("scheduler: armed {symbol} {timeframe} job {id}");
        id
    }

    /// Idempotent. Returns `false` when the id is unknown or already cancelled.
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.jobs.remove(&id) {
            Some((_, job)) => {
                job.cancel();
                log::info!("scheduler: cancelled job {id}");
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let ids: Vec<Uuid> = self.jobs.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.cancel(id);
        }
    }

    pub fn job_state(&self, id: Uuid) -> Option<JobState> {
        self.jobs.get(&id).map(|j| j.state())
    }

    pub fn next_fire_time(&self, id: Uuid) -> Option<i64> {
        self.jobs.get(&id).map(|j| j.next_fire_time())
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn timing_stats(&self) -> TimingStats {
        self.timing.stats()
    }
}

impl Drop for BoundaryScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

struct JobContext {
    clock: CorrectedClock,
    timing: Arc<TimingHistory>,
    period_ms: i64,
    offset_ms: i64,
    callback: FireCallback,
}

impl JobContext {
    async fn run(self, job: Arc<ScheduledJob>) {
        if !job.transition(JobState::Idle, JobState::Scheduled) {
            return;
        }
        let mut last_fired: Option<i64> = None;

        loop {
            let now = self.clock.now_ms();
            let sync_at_arm = self.clock.offset_ms();
            let target = arm_target(now, self.period_ms, self.offset_ms, last_fired);
            job.next_fire_time.store(target, Ordering::Release);

            // coarse wait, aiming `offset_ms` early
            sleep_ms(target - self.offset_ms - now).await;
            // fine wait, minus any clock-sync step taken meanwhile
            let drift = self.clock.offset_ms() - sync_at_arm;
            sleep_ms(self.offset_ms - drift).await;

            if !job.transition(JobState::Scheduled, JobState::Fired) {
                break; // cancelled while waiting
            }
            let fired_at = self.clock.now_ms();
            let timing_error_ms = fired_at - target;
            self.timing.record(timing_error_ms);
            metrics::histogram!("scheduler_timing_error_ms", timing_error_ms as f64);
            tracing::trace!(job = %job.id, boundary = target, timing_error_ms, "boundary fired");

            (self.callback)(BoundaryFire {
                job_id: job.id,
                symbol: job.symbol.clone(),
                timeframe: job.timeframe,
                boundary: target,
                fired_at,
                timing_error_ms,
            });
            last_fired = Some(target);

            if !job.transition(JobState::Fired, JobState::Scheduled) {
                break; // cancelled between fire and re-arm
            }
        }
    }
}

async fn sleep_ms(ms: i64) {
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms as u64)).await;
    }
}
