//! Sharded candle workers.
//!
//! Each (symbol, timeframe) key hashes onto one shard, and each shard task owns
//! its own `CandleBuilder`, so a key's candle state lives on exactly one task.
//! Requests carry a correlation id plus a per-key sequence number; responses
//! from different shards interleave freely and `OrderedResponses` restores
//! per-key order on the dispatch side.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};

use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;

use crate::services::candles::{CandleBuilder, CandleKey, CandleUpdate, Timeframe};
use crate::services::market_data::Tick;

#[derive(Debug, Clone)]
pub struct CandleRequest {
    pub correlation_id: u64,
    pub seq: u64,
    pub tick: Tick,
    pub timeframe: Timeframe,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandleResponse {
    pub correlation_id: u64,
    pub key: CandleKey,
    pub seq: u64,
    /// Corrected tick that produced this update
    pub tick: Tick,
    pub update: CandleUpdate,
}

pub fn shard_for(key: &CandleKey, shards: usize) -> usize {
    let mut h = DefaultHasher::new();
    key.hash(&mut h);
    (h.finish() % shards.max(1) as u64) as usize
}

pub struct CandleWorkers {
    shards: Vec<UnboundedSender<CandleRequest>>,
    handles: Vec<JoinHandle<()>>,
    next_correlation: u64,
    next_seq: HashMap<CandleKey, u64>,
}

impl CandleWorkers {
    /// Spawns `shards` worker tasks (at least one) answering on `reply`.
    pub fn spawn(shards: usize, reply: UnboundedSender<CandleResponse>) -> Self {
        let n = shards.max(1);
        let mut senders = Vec::with_capacity(n);
        let mut handles = Vec::with_capacity(n);

        for shard in 0..n {
            let (tx, mut rx) = mpsc::unbounded_channel::<CandleRequest>();
            let reply = reply.clone();
            handles.push(tokio::spawn(async move {
                let mut builder = CandleBuilder::new();
                while let Some(req) = rx.recv().await {
                    let update = builder.ingest(&req.tick, req.timeframe);
                    let resp = CandleResponse {
                        correlation_id: req.correlation_id,
                        key: (req.tick.symbol.clone(), req.timeframe),
                        seq: req.seq,
                        tick: req.tick,
                        update,
                    };
                    if reply.send(resp).is_err() {
                        log::debug!("candle worker {shard}: reply channel closed");
                        break;
                    }
                }
            }));
            senders.push(tx);
        }

        log::info!("candle workers: {n} shard(s) running");
        Self {
            shards: senders,
            handles,
            next_correlation: 0,
            next_seq: HashMap::new(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Queues one tick for one timeframe. Returns the correlation id, or
    /// `None` when the owning shard has stopped.
    pub fn submit(&mut self, tick: Tick, timeframe: Timeframe) -> Option<u64> {
        let key: CandleKey = (tick.symbol.clone(), timeframe);
        let shard = shard_for(&key, self.shards.len());
        let Some(sender) = self.shards.get(shard) else {
            log::warn!("candle workers shut down; {key:?} tick dropped");
            return None;
        };

        let correlation_id = self.next_correlation;
        let seq = self.next_seq.get(&key).copied().unwrap_or(0);
        let req = CandleRequest {
            correlation_id,
            seq,
            tick,
            timeframe,
        };
        // the seq is only consumed once a shard holds the request; a gap
        // would stall the key in `OrderedResponses`
        match sender.send(req) {
            Ok(()) => {
                self.next_correlation += 1;
                self.next_seq.insert(key, seq + 1);
                Some(correlation_id)
            }
            Err(_) => {
                log::error!("candle worker {shard} is gone; request {correlation_id} dropped");
                None
            }
        }
    }

    /// Closes the request channels and waits for every shard to drain.
    /// Later submits are refused.
    pub async fn shutdown(&mut self) {
        self.shards.clear();
        for h in self.handles.drain(..) {
            let _ = h.await;
        }
    }
}

/// Per-key reorder buffer keyed on the request sequence number.
#[derive(Debug, Default)]
pub struct OrderedResponses {
    expected: HashMap<CandleKey, u64>,
    pending: HashMap<CandleKey, BTreeMap<u64, CandleResponse>>,
}

impl OrderedResponses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers `resp` and returns every response for its key that is now
    /// deliverable, in sequence order.
    pub fn accept(&mut self, resp: CandleResponse) -> Vec<CandleResponse> {
        let key = resp.key.clone();
        let expected = self.expected.entry(key.clone()).or_insert(0);
        if resp.seq < *expected {
            log::warn!("{:?}: duplicate candle response seq {}", key, resp.seq);
            return Vec::new();
        }

        let queue = self.pending.entry(key.clone()).or_default();
        queue.insert(resp.seq, resp);

        let mut ready = Vec::new();
        while let Some(next) = queue.remove(expected) {
            ready.push(next);
            *expected += 1;
        }
        if queue.is_empty() {
            self.pending.remove(&key);
        }
        ready
    }

    /// Responses held back waiting for an earlier sequence number.
    pub fn pending(&self) -> usize {
        self.pending.values().map(BTreeMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::candles::Candle;

    fn response(symbol: &str, seq: u64) -> CandleResponse {
        let tick = Tick::new(symbol, seq as i64, 1.0);
        CandleResponse {
            correlation_id: seq,
            key: (symbol.to_string(), Timeframe::M1),
            seq,
            update: CandleUpdate::Updated(Candle::from_first_tick(&tick, Timeframe::M1)),
            tick,
        }
    }

    #[test]
    fn reorders_per_key_only() {
        let mut ord = OrderedResponses::new();
        assert!(ord.accept(response("BTC", 1)).is_empty());
        assert!(ord.accept(response("BTC", 2)).is_empty());
        // other keys are not blocked by BTC's gap
        assert_eq!(ord.accept(response("ETH", 0)).len(), 1);
        assert_eq!(ord.pending(), 2);

        let seqs: Vec<u64> = ord.accept(response("BTC", 0)).iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(ord.pending(), 0);
        assert!(ord.accept(response("BTC", 1)).is_empty(), "duplicate dropped");
    }

    #[test]
    fn sharding_is_stable() {
        let key = ("BTCUSDT".to_string(), Timeframe::M5);
        assert_eq!(shard_for(&key, 4), shard_for(&key, 4));
        assert_eq!(shard_for(&key, 0), 0);
    }

    #[tokio::test]
    async fn failed_submit_leaves_no_sequence_gap() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut workers = CandleWorkers::spawn(1, tx);
        let mut ord = OrderedResponses::new();

        assert!(workers.submit(Tick::new("BTCUSDT", 0, 1.0), Timeframe::M1).is_some());
        let first = rx.recv().await.unwrap();
        assert_eq!(ord.accept(first).len(), 1);

        // kill the only shard
        workers.handles[0].abort();
        let _ = (&mut workers.handles[0]).await;
        assert!(workers.submit(Tick::new("BTCUSDT", 10, 2.0), Timeframe::M1).is_none());

        // a replacement shard picks up where the key left off
        let (shard_tx, mut shard_rx) = mpsc::unbounded_channel();
        workers.shards[0] = shard_tx;
        assert!(workers.submit(Tick::new("BTCUSDT", 20, 3.0), Timeframe::M1).is_some());
        let req = shard_rx.recv().await.unwrap();
        assert_eq!(req.seq, 1);

        let mut builder = CandleBuilder::new();
        let resp = CandleResponse {
            correlation_id: req.correlation_id,
            key: ("BTCUSDT".to_string(), Timeframe::M1),
            seq: req.seq,
            update: builder.ingest(&req.tick, req.timeframe),
            tick: req.tick,
        };
        assert_eq!(ord.accept(resp).len(), 1);
        assert_eq!(ord.pending(), 0);
    }

    #[tokio::test]
    async fn per_key_order_survives_multiple_shards() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut workers = CandleWorkers::spawn(4, tx);
        let symbols = ["BTCUSDT", "ETHUSDT", "SOLUSDT", "XRPUSDT", "ADAUSDT"];

        for i in 0..200i64 {
            for s in symbols {
                // every 10th tick lands in a new minute
                let ts = (i / 10) * 60_000 + i;
                assert!(workers.submit(Tick::new(s, ts, i as f64), Timeframe::M1).is_some());
            }
        }
        workers.shutdown().await;

        let mut ord = OrderedResponses::new();
        let mut delivered: HashMap<String, Vec<u64>> = HashMap::new();
        let mut rolls = 0;
        while let Ok(resp) = rx.try_recv() {
            for r in ord.accept(resp) {
                if r.update.completed().is_some() {
                    rolls += 1;
                }
                delivered.entry(r.key.0.clone()).or_default().push(r.seq);
            }
        }

        assert_eq!(ord.pending(), 0);
        for s in symbols {
            let seqs = &delivered[s];
            assert_eq!(seqs.len(), 200);
            assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));
        }
        assert_eq!(rolls, 19 * symbols.len());
    }
}
