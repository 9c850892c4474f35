//! Compilation result cache
//!
//! Results are keyed by (method, device). At most one compile per key is in
//! flight: a second request for a key that is being compiled blocks until
//! the first finishes and then shares its result. Failures are not cached;
//! waiters woken by a failure retry the compile themselves.

use crate::compilation::CompilationResult;
use crate::error::CompileResult;
use crate::ir::MethodId;
use fxhash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub method: MethodId,
    pub device: String,
}

impl CacheKey {
    pub fn new(method: MethodId, device: impl Into<String>) -> Self {
        Self {
            method,
            device: device.into(),
        }
    }
}

enum Slot {
    InFlight,
    Ready(Arc<CompilationResult>),
}

/// Counters since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Requests that blocked on an in-flight compile
    pub waits: u64,
}

#[derive(Default)]
pub struct CompilationCache {
    slots: Mutex<FxHashMap<CacheKey, Slot>>,
    settled: Condvar,
    hits: AtomicU64,
    misses: AtomicU64,
    waits: AtomicU64,
}

/// Clears an in-flight slot if the compile unwinds or fails.
struct InFlight<'a> {
    cache: &'a CompilationCache,
    key: Option<CacheKey>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.cache.lock().remove(&key);
            self.cache.settled.notify_all();
        }
    }
}

impl CompilationCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<CacheKey, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The cached result for `key`, or the result of running `compile`.
    pub fn get_or_compile<F>(&self, key: CacheKey, compile: F) -> CompileResult<Arc<CompilationResult>>
    where
        F: FnOnce() -> CompileResult<CompilationResult>,
    {
        let mut slots = self.lock();
        loop {
            let in_flight = match slots.get(&key) {
                Some(Slot::Ready(result)) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    trace!(method = %key.method, device = %key.device, "cache hit");
                    return Ok(Arc::clone(result));
                }
                Some(Slot::InFlight) => true,
                None => false,
            };
            if !in_flight {
                break;
            }
            self.waits.fetch_add(1, Ordering::Relaxed);
            debug!(method = %key.method, device = %key.device, "waiting for in-flight compile");
            slots = self.settled.wait(slots).unwrap_or_else(PoisonError::into_inner);
        }
        slots.insert(key.clone(), Slot::InFlight);
        drop(slots);
        self.misses.fetch_add(1, Ordering::Relaxed);

        let mut guard = InFlight {
            cache: self,
            key: Some(key),
        };
        let result = Arc::new(compile()?);
        if let Some(key) = guard.key.take() {
            self.lock().insert(key, Slot::Ready(Arc::clone(&result)));
            self.settled.notify_all();
        }
        Ok(result)
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<CompilationResult>> {
        match self.lock().get(key) {
            Some(Slot::Ready(result)) => Some(Arc::clone(result)),
            _ => None,
        }
    }

    /// Drop every device's result for `method`. In-flight compiles are kept.
    pub fn invalidate(&self, method: &MethodId) -> usize {
        let mut slots = self.lock();
        let before = slots.len();
        slots.retain(|key, slot| &key.method != method || matches!(slot, Slot::InFlight));
        before - slots.len()
    }

    pub fn clear(&self) {
        self.lock().retain(|_, slot| matches!(slot, Slot::InFlight));
    }

    /// Number of finished results held.
    pub fn len(&self) -> usize {
        self.lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
        }
    }
}
