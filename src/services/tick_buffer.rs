//! Per-symbol bounded tick history plus synchronous fan-out.
//!
//! Handler registration is reference counted per symbol: the first handler
//! asks the feed for the symbol, removing the last one releases it.

use std::collections::{HashMap, VecDeque};

use tokio::sync::mpsc::UnboundedSender;

use crate::services::market_data::Tick;

pub const DEFAULT_CAPACITY: usize = 2048;

pub type TickHandler = Box<dyn FnMut(&Tick) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Upstream subscription changes driven by the handler ref-count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedCommand {
    Subscribe(String),
    Unsubscribe(String),
}

pub struct TickBuffer {
    capacity: usize,
    rings: HashMap<String, VecDeque<Tick>>,
    handlers: HashMap<String, Vec<(SubscriptionId, TickHandler)>>,
    next_id: u64,
    feed: Option<UnboundedSender<FeedCommand>>,
}

impl TickBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            rings: HashMap::new(),
            handlers: HashMap::new(),
            next_id: 0,
            feed: None,
        }
    }

    /// Route subscribe/unsubscribe decisions to a feed adapter.
    pub fn with_feed_control(mut self, feed: UnboundedSender<FeedCommand>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn push(&mut self, tick: Tick) {
        let ring = self
            .rings
            .entry(tick.symbol.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity.min(DEFAULT_CAPACITY)));
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(tick);

        let Some(stored) = ring.back() else { return };
        if let Some(handlers) = self.handlers.get_mut(&stored.symbol) {
            for (_, handler) in handlers.iter_mut() {
                handler(stored);
            }
        }
    }

    pub fn latest(&self, symbol: &str) -> Option<&Tick> {
        self.rings.get(symbol)?.back()
    }

    /// Newest tick with `timestamp <= time`, scanning backwards.
    pub fn at_or_before(&self, symbol: &str, time: i64) -> Option<&Tick> {
        self.rings
            .get(symbol)?
            .iter()
            .rev()
            .find(|t| t.timestamp <= time)
    }

    pub fn len(&self, symbol: &str) -> usize {
        self.rings.get(symbol).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, symbol: &str) -> bool {
        self.len(symbol) == 0
    }

    pub fn subscribe(&mut self, symbol: &str, handler: TickHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;

        if self.subscriber_count(symbol) == 0 {
            self.notify_feed(FeedCommand::Subscribe(symbol.to_string()));
        }
        self.handlers
            .entry(symbol.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    /// Returns `false` when the id is unknown (already removed).
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let Some(symbol) = self
            .handlers
            .iter()
            .find(|(_, list)| list.iter().any(|(h, _)| *h == id))
            .map(|(s, _)| s.clone())
        else {
            return false;
        };

        let now_empty = match self.handlers.get_mut(&symbol) {
            Some(list) => {
                list.retain(|(h, _)| *h != id);
                list.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.handlers.remove(&symbol);
            self.notify_feed(FeedCommand::Unsubscribe(symbol));
        }
        true
    }

    pub fn subscriber_count(&self, symbol: &str) -> usize {
        self.handlers.get(symbol).map_or(0, Vec::len)
    }

    fn notify_feed(&self, cmd: FeedCommand) {
        if let Some(tx) = &self.feed {
            if tx.send(cmd).is_err() {
                log::debug!("tick buffer: feed control channel closed");
            }
        }
    }
}

impl Default for TickBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
