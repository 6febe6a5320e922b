use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::domain::{QueryId, RawResult};

pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub query_id: QueryId,
    pub parameters: BTreeMap<String, String>,
}

impl CacheKey {
    pub fn new(query_id: &QueryId, parameters: &BTreeMap<String, String>) -> Self {
        Self {
            query_id: query_id.clone(),
            parameters: parameters.clone(),
        }
    }
}

/// Process-wide store of fetched query results.
///
/// Implementations must tolerate concurrent readers and writers; a lost race
/// only costs a duplicate fetch.
pub trait ResultCache: Send + Sync {
    fn get(&self, key: &CacheKey, ttl: Duration) -> Option<RawResult>;
    fn set(&self, key: CacheKey, value: RawResult);
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    elapsed: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self
            .elapsed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let elapsed = *self
            .elapsed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.origin + elapsed
    }
}

struct Entry {
    value: RawResult,
    stored_at: Instant,
}

pub struct MemoryCache<C: Clock = SystemClock> {
    entries: Mutex<HashMap<CacheKey, Entry>>,
    clock: C,
}

impl MemoryCache<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for MemoryCache<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> MemoryCache<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<C: Clock> ResultCache for MemoryCache<C> {
    fn get(&self, key: &CacheKey, ttl: Duration) -> Option<RawResult> {
        let now = self.clock.now();
        let mut guard = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(entry) = guard.get(key)
            && now.saturating_duration_since(entry.stored_at) < ttl
        {
            return Some(entry.value.clone());
        }
        guard.remove(key);
        None
    }

    fn set(&self, key: CacheKey, value: RawResult) {
        let stored_at = self.clock.now();
        let mut guard = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.insert(key, Entry { value, stored_at });
    }
}
