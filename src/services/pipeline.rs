//! Dispatch pipeline
//! -----------------------------------------------------------------
//! The one task that owns tick history, candle state and every strategy.
//! Feed ticks and scheduler boundaries arrive as `DispatchEvent`s on a single
//! channel and are handled strictly in arrival order; with candle workers
//! enabled, their (re-ordered) responses join the same loop.
//!
//!   RawTick ─► corrected Tick ─► TickBuffer ─► candles ─► candle-close slots
//!   BoundaryFire ─► tick at-or-before ─► boundary slots
//!
//! Everything produced is published on the `MarketBus`.
//! -----------------------------------------------------------------

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::services::candles::{Candle, CandleBuilder, CandleKey, CandleUpdate, Timeframe};
use crate::services::clock::CorrectedClock;
use crate::services::market_data::{BoundaryEvent, MarketBus, RawTick, Tick};
use crate::services::scheduler::BoundaryFire;
use crate::services::strategies::{Signal, Strategy, StrategyEngine, StrategySpec, Trigger};
use crate::services::tick_buffer::TickBuffer;
use crate::services::worker::{CandleResponse, CandleWorkers, OrderedResponses};

#[derive(Debug, Clone)]
pub enum DispatchEvent {
    Tick(RawTick),
    Boundary(BoundaryFire),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    CandleCompleted(Candle),
    Signal(Signal),
    Boundary(BoundaryEvent),
}

pub struct StrategySlot {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub trigger: Trigger,
    pub strategy: Box<dyn Strategy>,
}

impl StrategySlot {
    pub fn from_spec(spec: &StrategySpec) -> Self {
        Self {
            symbol: spec.symbol.clone(),
            timeframe: spec.timeframe,
            trigger: spec.trigger,
            strategy: spec.build(),
        }
    }

    fn matches(&self, symbol: &str, timeframe: Timeframe, trigger: Trigger) -> bool {
        self.trigger == trigger && self.timeframe == timeframe && self.symbol == symbol
    }
}

enum CandleStage {
    Inline(CandleBuilder),
    Offloaded {
        workers: CandleWorkers,
        ordering: OrderedResponses,
        responses: Option<UnboundedReceiver<CandleResponse>>,
    },
}

pub struct Pipeline {
    clock: CorrectedClock,
    ticks: TickBuffer,
    timeframes: Vec<Timeframe>,
    stage: CandleStage,
    /// Latest open candle per key, as last reported by the candle stage
    current: HashMap<CandleKey, Candle>,
    /// Most recently completed candle per key
    closed: HashMap<CandleKey, Candle>,
    slots: Vec<StrategySlot>,
    engine: StrategyEngine,
    bus: Arc<MarketBus>,
}

impl Pipeline {
    pub fn new(
        clock: CorrectedClock,
        ticks: TickBuffer,
        timeframes: Vec<Timeframe>,
        slots: Vec<StrategySlot>,
        bus: Arc<MarketBus>,
    ) -> Self {
        Self {
            clock,
            ticks,
            timeframes,
            stage: CandleStage::Inline(CandleBuilder::new()),
            current: HashMap::new(),
            closed: HashMap::new(),
            slots,
            engine: StrategyEngine::new(),
            bus,
        }
    }

    /// Moves candle building onto `shards` worker tasks. Needs a runtime.
    pub fn with_candle_workers(mut self, shards: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        self.stage = CandleStage::Offloaded {
            workers: CandleWorkers::spawn(shards, tx),
            ordering: OrderedResponses::new(),
            responses: Some(rx),
        };
        self
    }

    pub fn tick_buffer(&self) -> &TickBuffer {
        &self.ticks
    }

    pub fn tick_buffer_mut(&mut self) -> &mut TickBuffer {
        &mut self.ticks
    }

    pub fn current_candle(&self, symbol: &str, timeframe: Timeframe) -> Option<&Candle> {
        self.current.get(&(symbol.to_string(), timeframe))
    }

    /// The candle covering `[boundary - T, boundary)`, whether it is still
    /// open or already rolled. `None` when that period saw no ticks.
    pub fn closing_candle(&self, symbol: &str, timeframe: Timeframe, boundary: i64) -> Option<&Candle> {
        let key = (symbol.to_string(), timeframe);
        [self.current.get(&key), self.closed.get(&key)]
            .into_iter()
            .flatten()
            .find(|c| c.period_end == boundary)
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Runs until the dispatch channel closes, then lets the candle workers
    /// finish and publishes whatever they still return.
    pub async fn run(mut self, mut rx: UnboundedReceiver<DispatchEvent>) {
        let mut responses = match &mut self.stage {
            CandleStage::Offloaded { responses, .. } => responses.take(),
            CandleStage::Inline(_) => None,
        };

        loop {
            tokio::select! {
                ev = rx.recv() => match ev {
                    Some(DispatchEvent::Tick(raw)) => {
                        self.handle_tick(raw);
                    }
                    Some(DispatchEvent::Boundary(fire)) => {
                        self.handle_boundary(fire);
                    }
                    None => break,
                },
                Some(resp) = next_response(&mut responses) => {
                    self.handle_candle_response(resp);
                }
            }
        }
        log::info!("pipeline: dispatch channel closed, stopping");

        if let CandleStage::Offloaded { workers, .. } = &mut self.stage {
            workers.shutdown().await;
        }
        if let Some(rx) = responses.as_mut() {
            while let Some(resp) = rx.recv().await {
                self.handle_candle_response(resp);
            }
        }
    }

    /// Corrects, stores and fans out one tick. Candle completions (inline
    /// stage only) and the signals they trigger are returned and published.
    pub fn handle_tick(&mut self, raw: RawTick) -> Vec<PipelineEvent> {
        if raw.symbol.is_empty() || !raw.price.is_finite() || raw.price <= 0.0 {
            log::warn!("pipeline: dropping malformed tick {raw:?}");
            return Vec::new();
        }
        let tick = Tick {
            timestamp: raw.timestamp.unwrap_or_else(|| self.clock.now_ms()),
            symbol: raw.symbol,
            price: raw.price,
            volume: raw.volume.filter(|v| v.is_finite() && *v >= 0.0),
        };
        self.ticks.push(tick.clone());
        metrics::increment_counter!("ticks_ingested_total", "symbol" => tick.symbol.clone());

        let mut events = Vec::new();
        for i in 0..self.timeframes.len() {
            let tf = self.timeframes[i];
            match &mut self.stage {
                CandleStage::Inline(builder) => {
                    let update = builder.ingest(&tick, tf);
                    events.extend(self.apply_candle_update(&tick, update));
                }
                CandleStage::Offloaded { workers, .. } => {
                    workers.submit(tick.clone(), tf);
                }
            }
        }
        self.publish(&events);
        events
    }

    /// Delivers worker output in per-key order.
    pub fn handle_candle_response(&mut self, resp: CandleResponse) -> Vec<PipelineEvent> {
        let ready = match &mut self.stage {
            CandleStage::Offloaded { ordering, .. } => ordering.accept(resp),
            CandleStage::Inline(_) => {
                log::warn!("pipeline: stray candle response {}", resp.correlation_id);
                return Vec::new();
            }
        };
        let mut events = Vec::new();
        for r in ready {
            events.extend(self.apply_candle_update(&r.tick, r.update));
        }
        self.publish(&events);
        events
    }

    fn apply_candle_update(&mut self, tick: &Tick, update: CandleUpdate) -> Vec<PipelineEvent> {
        let (completed, current) = match update {
            CandleUpdate::Started(c) | CandleUpdate::Updated(c) => (None, c),
            CandleUpdate::Rolled { completed, current } => (Some(completed), current),
        };
        self.current
            .insert((current.symbol.clone(), current.timeframe), current);

        let Some(completed) = completed else {
            return Vec::new();
        };
        metrics::increment_counter!(
            "candles_completed_total",
            "timeframe" => completed.timeframe.as_str()
        );
        let signals = self.evaluate_slots(tick, &completed, Trigger::CandleClose);
        self.closed
            .insert((completed.symbol.clone(), completed.timeframe), completed.clone());

        let mut events = Vec::with_capacity(1 + signals.len());
        events.push(PipelineEvent::CandleCompleted(completed));
        events.extend(signals.into_iter().map(PipelineEvent::Signal));
        events
    }

    /// Evaluates boundary-triggered slots against the candle closing at the
    /// boundary and the last tick inside it. A period without ticks only
    /// publishes the boundary event; indicators are not fed again.
    pub fn handle_boundary(&mut self, fire: BoundaryFire) -> Vec<PipelineEvent> {
        let tick = self.ticks.at_or_before(&fire.symbol, fire.boundary).cloned();
        let mut events = vec![PipelineEvent::Boundary(BoundaryEvent {
            symbol: fire.symbol.clone(),
            timeframe: fire.timeframe,
            boundary: fire.boundary,
            timing_error_ms: fire.timing_error_ms,
            tick,
        })];

        let period_start = fire.boundary - fire.timeframe.duration_ms();
        let closing = self
            .closing_candle(&fire.symbol, fire.timeframe, fire.boundary)
            .cloned()
            .zip(
                self.ticks
                    .at_or_before(&fire.symbol, fire.boundary - 1)
                    .filter(|t| t.timestamp >= period_start)
                    .cloned(),
            );
        match closing {
            None => {
                log::info!(
                    "{} {}: boundary {} reached, no tick data available",
                    fire.symbol,
                    fire.timeframe,
                    fire.boundary
                );
            }
            Some((candle, last)) => {
                let signals = self.evaluate_slots(&last, &candle, Trigger::Boundary);
                events.extend(signals.into_iter().map(PipelineEvent::Signal));
            }
        }
        tracing::debug!(
            symbol = %fire.symbol,
            timeframe = %fire.timeframe,
            boundary = fire.boundary,
            timing_error_ms = fire.timing_error_ms,
            signals = events.len() - 1,
            "boundary handled"
        );
        self.publish(&events);
        events
    }

    fn evaluate_slots(&mut self, tick: &Tick, candle: &Candle, trigger: Trigger) -> Vec<Signal> {
        let mut matching: Vec<&mut Box<dyn Strategy>> = self
            .slots
            .iter_mut()
            .filter(|s| s.matches(&candle.symbol, candle.timeframe, trigger))
            .map(|s| &mut s.strategy)
            .collect();
        if matching.is_empty() {
            return Vec::new();
        }
        self.engine.evaluate(tick, candle, &mut matching)
    }

    fn publish(&self, events: &[PipelineEvent]) {
        // a send error only means nobody is listening right now
        for ev in events {
            match ev {
                PipelineEvent::CandleCompleted(c) => {
                    let _ = self.bus.candles.send(c.clone());
                }
                PipelineEvent::Signal(s) => {
                    let _ = self.bus.signals.send(s.clone());
                }
                PipelineEvent::Boundary(b) => {
                    let _ = self.bus.boundaries.send(b.clone());
                }
            }
        }
    }
}

async fn next_response(rx: &mut Option<UnboundedReceiver<CandleResponse>>) -> Option<CandleResponse> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::test_support::ManualClock;
    use crate::services::clock::{ClockSynchronizer, TimeAuthority};
    use crate::services::strategies::{Side, StrategyKind};
    use crate::utils::errors::ApiError;
    use async_trait::async_trait;
    use serde_json::{json, Map};
    use std::time::Duration;
    use uuid::Uuid;

    struct Offline;

    #[async_trait]
    impl TimeAuthority for Offline {
        async fn server_time(&self, _: i64) -> Result<i64, ApiError> {
            Err(ApiError::Other("offline".into()))
        }
    }

    fn clock(at: i64) -> CorrectedClock {
        ClockSynchronizer::new(ManualClock::at(at), Arc::new(Offline), Duration::from_secs(1)).clock()
    }

    fn spec(kind: StrategyKind, trigger: Trigger, params: serde_json::Value) -> StrategySpec {
        StrategySpec {
            kind,
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::M1,
            trigger,
            params: params.as_object().cloned().unwrap_or_else(Map::new),
        }
    }

    fn pipeline(specs: &[StrategySpec]) -> (Pipeline, Arc<MarketBus>) {
        let bus = Arc::new(MarketBus::new());
        let slots = specs.iter().map(StrategySlot::from_spec).collect();
        let p = Pipeline::new(
            clock(1_000),
            TickBuffer::default(),
            vec![Timeframe::M1],
            slots,
            Arc::clone(&bus),
        );
        (p, bus)
    }

    fn raw(ts: i64, price: f64) -> RawTick {
        RawTick {
            symbol: "BTCUSDT".into(),
            price,
            timestamp: Some(ts),
            volume: None,
        }
    }

    fn fire(boundary: i64) -> BoundaryFire {
        BoundaryFire {
            job_id: Uuid::new_v4(),
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::M1,
            boundary,
            fired_at: boundary + 1,
            timing_error_ms: 1,
        }
    }

    #[test]
    fn candle_close_slots_see_every_completed_candle() {
        let ema = spec(
            StrategyKind::EmaCrossover,
            Trigger::CandleClose,
            json!({"fast": 2, "slow": 3}),
        );
        let (mut p, bus) = pipeline(&[ema]);
        let mut candles = bus.candles.subscribe();

        // one tick per minute; each tick completes the previous minute
        let mut signals = Vec::new();
        for (i, price) in [1.0, 2.0, 3.0, 10.0, 1.0, 1.0].into_iter().enumerate() {
            for ev in p.handle_tick(raw(i as i64 * 60_000, price)) {
                if let PipelineEvent::Signal(s) = ev {
                    signals.push(s);
                }
            }
        }

        let mut closes = Vec::new();
        while let Ok(c) = candles.try_recv() {
            closes.push(c.close);
        }
        assert_eq!(closes, vec![1.0, 2.0, 3.0, 10.0, 1.0]);
        let sides: Vec<Side> = signals.iter().map(|s| s.side).collect();
        assert_eq!(sides, vec![Side::Long, Side::Short]);
        assert!(signals.iter().all(|s| s.strategy == "ema_crossover"));
    }

    #[test]
    fn untimestamped_ticks_use_corrected_time() {
        let (mut p, _bus) = pipeline(&[]);
        p.handle_tick(RawTick {
            symbol: "BTCUSDT".into(),
            price: 5.0,
            timestamp: None,
            volume: None,
        });
        assert_eq!(p.tick_buffer().latest("BTCUSDT").unwrap().timestamp, 1_000);
    }

    #[test]
    fn malformed_ticks_are_dropped() {
        let (mut p, _bus) = pipeline(&[]);
        assert!(p.handle_tick(raw(0, f64::NAN)).is_empty());
        assert!(p.handle_tick(raw(0, -1.0)).is_empty());
        assert!(p.tick_buffer().is_empty("BTCUSDT"));
    }

    #[test]
    fn boundary_without_ticks_still_publishes() {
        let (mut p, bus) = pipeline(&[]);
        let mut rx = bus.boundaries.subscribe();
        let events = p.handle_boundary(fire(60_000));
        assert_eq!(events.len(), 1);
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.boundary, 60_000);
        assert!(ev.tick.is_none());
    }

    #[test]
    fn boundary_event_carries_tick_at_or_before_boundary() {
        let (mut p, _bus) = pipeline(&[]);
        p.handle_tick(raw(10_000, 1.0));
        p.handle_tick(raw(70_000, 2.0));
        let events = p.handle_boundary(fire(60_000));
        let PipelineEvent::Boundary(ev) = &events[0] else {
            panic!("expected boundary event first");
        };
        assert_eq!(ev.tick.as_ref().unwrap().price, 1.0);
    }

    #[test]
    fn boundary_slots_evaluate_each_boundary() {
        let rsi = spec(
            StrategyKind::RsiMeanReversion,
            Trigger::Boundary,
            json!({"period": 2}),
        );
        let (mut p, _bus) = pipeline(&[rsi]);

        let mut signals = Vec::new();
        for (i, price) in [100.0, 90.0, 80.0].into_iter().enumerate() {
            let minute = i as i64 * 60_000;
            p.handle_tick(raw(minute + 500, price));
            for ev in p.handle_boundary(fire(minute + 60_000)) {
                if let PipelineEvent::Signal(s) = ev {
                    signals.push(s);
                }
            }
        }
        // warm-up on the first boundary, then RSI 0 on both falling closes
        let prices: Vec<f64> = signals.iter().map(|s| s.price).collect();
        assert_eq!(prices, vec![90.0, 80.0]);
        assert!(signals.iter().all(|s| s.side == Side::Long && s.confidence == 1.0));
    }

    fn boundary_signals(events: Vec<PipelineEvent>) -> Vec<Signal> {
        events
            .into_iter()
            .filter_map(|ev| match ev {
                PipelineEvent::Signal(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn boundary_slots_read_the_period_that_just_closed() {
        let rsi = spec(
            StrategyKind::RsiMeanReversion,
            Trigger::Boundary,
            json!({"period": 2}),
        );
        let (mut p, _bus) = pipeline(&[rsi]);

        p.handle_tick(raw(500, 100.0));
        assert!(boundary_signals(p.handle_boundary(fire(60_000))).is_empty());

        // a trade of the next period lands before the fire is handled
        p.handle_tick(raw(119_990, 90.0));
        p.handle_tick(raw(120_001, 200.0));
        let signals = boundary_signals(p.handle_boundary(fire(120_000)));

        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].side, Side::Long);
        assert_eq!(signals[0].price, 90.0);
        assert_eq!(signals[0].details["rsi"], 0.0);
    }

    #[test]
    fn empty_period_does_not_refeed_the_previous_candle() {
        let rsi = spec(
            StrategyKind::RsiMeanReversion,
            Trigger::Boundary,
            json!({"period": 2}),
        );
        let (mut p, _bus) = pipeline(&[rsi]);

        p.handle_tick(raw(500, 100.0));
        assert!(boundary_signals(p.handle_boundary(fire(60_000))).is_empty());

        // no trades in [60s, 120s): only the boundary event goes out
        let events = p.handle_boundary(fire(120_000));
        assert_eq!(events.len(), 1);
        let PipelineEvent::Boundary(ev) = &events[0] else {
            panic!("expected boundary event");
        };
        assert_eq!(ev.tick.as_ref().unwrap().price, 100.0);
        assert!(p.closing_candle("BTCUSDT", Timeframe::M1, 120_000).is_none());

        // RSI has seen a single candle, so the next one is its second update
        p.handle_tick(raw(120_500, 90.0));
        let signals = boundary_signals(p.handle_boundary(fire(180_000)));
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].side, Side::Long);
        assert_eq!(signals[0].price, 90.0);
    }

    #[tokio::test]
    async fn offloaded_candles_match_inline_results() {
        let ema = spec(
            StrategyKind::EmaCrossover,
            Trigger::CandleClose,
            json!({"fast": 2, "slow": 3}),
        );
        let bus = Arc::new(MarketBus::new());
        let mut candles = bus.candles.subscribe();
        let p = Pipeline::new(
            clock(0),
            TickBuffer::default(),
            vec![Timeframe::M1, Timeframe::M5],
            vec![StrategySlot::from_spec(&ema)],
            Arc::clone(&bus),
        )
        .with_candle_workers(3);

        let mut signals = bus.signals.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(p.run(rx));
        for (i, price) in [1.0, 2.0, 3.0, 10.0, 1.0, 1.0].into_iter().enumerate() {
            tx.send(DispatchEvent::Tick(raw(i as i64 * 60_000, price))).unwrap();
        }
        // close the dispatch side while worker replies may still be in flight
        drop(tx);
        handle.await.unwrap();

        let mut m1 = Vec::new();
        while let Ok(c) = candles.try_recv() {
            if c.timeframe == Timeframe::M1 {
                m1.push(c.close);
            }
        }
        assert_eq!(m1, vec![1.0, 2.0, 3.0, 10.0, 1.0]);

        let mut sides = Vec::new();
        while let Ok(s) = signals.try_recv() {
            sides.push(s.side);
        }
        assert_eq!(sides, vec![Side::Long, Side::Short]);
    }
}
