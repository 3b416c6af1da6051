//! Observable cache events
//!
//! Successful writes emit [`CacheEvent::KeyWritten`]; reads emit
//! [`CacheEvent::CacheHit`] or [`CacheEvent::CacheMissed`]. Sinks receive
//! events synchronously from the emitting task; no ordering is implied
//! across concurrent operations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// An observable cache event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    KeyWritten {
        key: String,
        ttl: Option<Duration>,
        tags: Vec<String>,
    },
    CacheHit {
        key: String,
        tags: Vec<String>,
    },
    CacheMissed {
        key: String,
        tags: Vec<String>,
    },
    KeyForgotten {
        key: String,
        tags: Vec<String>,
    },
    TagsFlushed {
        tags: Vec<String>,
    },
}

/// Sink interface for cache events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: CacheEvent);
}

/// Default sink: structured log lines at debug level.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: CacheEvent) {
        match &event {
            CacheEvent::KeyWritten { key, ttl, tags } => {
                debug!(key = %key, ttl = ?ttl, tags = ?tags, "key written")
            }
            CacheEvent::CacheHit { key, tags } => {
                debug!(key = %key, tags = ?tags, "cache hit")
            }
            CacheEvent::CacheMissed { key, tags } => {
                debug!(key = %key, tags = ?tags, "cache missed")
            }
            CacheEvent::KeyForgotten { key, tags } => {
                debug!(key = %key, tags = ?tags, "key forgotten")
            }
            CacheEvent::TagsFlushed { tags } => {
                debug!(tags = ?tags, "tags flushed")
            }
        }
    }
}

/// Sink that drops every event.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: CacheEvent) {}
}

/// Sink that aggregates hit/miss/write counters.
#[derive(Debug, Default)]
pub struct StatsSink {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    flushes: AtomicU64,
}

/// Counter snapshot taken from a [`StatsSink`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub flushes: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }
}

impl StatsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

impl EventSink for StatsSink {
    fn emit(&self, event: CacheEvent) {
        match event {
            CacheEvent::CacheHit { .. } => self.hits.fetch_add(1, Ordering::Relaxed),
            CacheEvent::CacheMissed { .. } => self.misses.fetch_add(1, Ordering::Relaxed),
            CacheEvent::KeyWritten { .. } => self.writes.fetch_add(1, Ordering::Relaxed),
            CacheEvent::KeyForgotten { .. } => self.writes.fetch_add(1, Ordering::Relaxed),
            CacheEvent::TagsFlushed { .. } => self.flushes.fetch_add(1, Ordering::Relaxed),
        };
    }
}

/// Sink that records events in memory, for assertions in tests and the
/// doctor harness.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<CacheEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<CacheEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: CacheEvent) {
        self.events.lock().unwrap().push(event);
    }
}
