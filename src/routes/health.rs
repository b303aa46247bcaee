use std::sync::Arc;

use actix_web::{get, web, HttpResponse, Scope};
use serde_json::json;
use tokio::sync::watch;

use crate::services::clock::CorrectedClock;
use crate::services::feed::FeedState;
use crate::services::scheduler::BoundaryScheduler;

/// Read-only handles the HTTP surface reports on.
#[derive(Clone)]
pub struct AppState {
    pub clock: CorrectedClock,
    pub scheduler: Arc<BoundaryScheduler>,
    pub feed: watch::Receiver<FeedState>,
}

#[get("/health")]
async fn health_check() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

#[get("/stats")]
async fn stats(state: web::Data<AppState>) -> HttpResponse {
    let feed = *state.feed.borrow();
    HttpResponse::Ok().json(json!({
        "clock_offset_ms": state.clock.offset_ms(),
        "clock_synced": state.clock.is_synced(),
        "corrected_now_ms": state.clock.now_ms(),
        "scheduled_jobs": state.scheduler.job_count(),
        "timing": state.scheduler.timing_stats(),
        "feed": feed,
    }))
}

pub fn health_scope() -> Scope {
    web::scope("").service(health_check).service(stats)
}
