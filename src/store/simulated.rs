//! Simulated Object Store with Fault Injection
//!
//! Wraps another store and injects failures through buggify. Failures are
//! injected before the inner operation runs, except timeouts on puts, which
//! fire after the write landed to model a lost acknowledgement.

use super::{ListResult, ObjectStore, PutCondition, StoreFuture};
use crate::buggify::faults::store as faults;
use crate::io::Rng;
use parking_lot::Mutex;
use std::io::{Error as IoError, ErrorKind};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SimulatedStoreConfig {
    pub put_fail_prob: f64,
    pub get_fail_prob: f64,
    pub timeout_prob: f64,
    pub rename_fail_prob: f64,
    /// Latency range in microseconds (min, max)
    pub latency_range_us: (u64, u64),
}

impl Default for SimulatedStoreConfig {
    fn default() -> Self {
        SimulatedStoreConfig {
            put_fail_prob: 0.01,
            get_fail_prob: 0.01,
            timeout_prob: 0.005,
            rename_fail_prob: 0.01,
            latency_range_us: (0, 500),
        }
    }
}

impl SimulatedStoreConfig {
    pub fn high_chaos() -> Self {
        SimulatedStoreConfig {
            put_fail_prob: 0.05,
            get_fail_prob: 0.05,
            timeout_prob: 0.02,
            rename_fail_prob: 0.05,
            latency_range_us: (100, 2_000),
        }
    }

    pub fn no_faults() -> Self {
        SimulatedStoreConfig {
            put_fail_prob: 0.0,
            get_fail_prob: 0.0,
            timeout_prob: 0.0,
            rename_fail_prob: 0.0,
            latency_range_us: (0, 0),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedStoreStats {
    pub put_attempts: u64,
    pub put_failures: u64,
    pub get_attempts: u64,
    pub get_failures: u64,
    pub rename_failures: u64,
    pub timeouts: u64,
}

struct SimulatedStoreInner<R: Rng> {
    rng: R,
    stats: SimulatedStoreStats,
}

/// Fault-injecting wrapper. Clones share the RNG and statistics.
pub struct SimulatedObjectStore<S: ObjectStore, R: Rng> {
    inner_store: Arc<S>,
    config: SimulatedStoreConfig,
    state: Arc<Mutex<SimulatedStoreInner<R>>>,
}

impl<S: ObjectStore, R: Rng> Clone for SimulatedObjectStore<S, R> {
    fn clone(&self) -> Self {
        SimulatedObjectStore {
            inner_store: self.inner_store.clone(),
            config: self.config.clone(),
            state: self.state.clone(),
        }
    }
}

impl<S: ObjectStore, R: Rng> SimulatedObjectStore<S, R> {
    pub fn new(inner_store: S, rng: R, config: SimulatedStoreConfig) -> Self {
        SimulatedObjectStore {
            inner_store: Arc::new(inner_store),
            config,
            state: Arc::new(Mutex::new(SimulatedStoreInner {
                rng,
                stats: SimulatedStoreStats::default(),
            })),
        }
    }

    pub fn stats(&self) -> SimulatedStoreStats {
        self.state.lock().stats.clone()
    }

    pub fn inner(&self) -> &S {
        &self.inner_store
    }

    fn roll(&self, fault: &str, prob: f64) -> bool {
        let mut s = self.state.lock();
        crate::buggify!(&mut s.rng, fault, prob)
    }

    fn latency(&self) -> Option<Duration> {
        let (min, max) = self.config.latency_range_us;
        if max == 0 {
            return None;
        }
        let us = self.state.lock().rng.gen_range(min, max.max(min + 1));
        Some(Duration::from_micros(us))
    }

    async fn delay(&self) {
        if let Some(d) = self.latency() {
            tokio::time::sleep(d).await;
        }
    }

    fn timed_out(&self) -> bool {
        if self.roll(faults::TIMEOUT, self.config.timeout_prob) {
            self.state.lock().stats.timeouts += 1;
            return true;
        }
        false
    }

    fn put_fails(&self) -> bool {
        let mut s = self.state.lock();
        s.stats.put_attempts += 1;
        if crate::buggify!(&mut s.rng, faults::PUT_FAIL, self.config.put_fail_prob) {
            s.stats.put_failures += 1;
            return true;
        }
        false
    }

    fn get_fails(&self) -> bool {
        let mut s = self.state.lock();
        s.stats.get_attempts += 1;
        if crate::buggify!(&mut s.rng, faults::GET_FAIL, self.config.get_fail_prob) {
            s.stats.get_failures += 1;
            return true;
        }
        false
    }
}

fn injected(kind: ErrorKind, what: &str) -> IoError {
    IoError::new(kind, format!("simulated {}", what))
}

impl<S: ObjectStore, R: Rng> ObjectStore for SimulatedObjectStore<S, R> {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.delay().await;
            if self.put_fails() {
                return Err(injected(ErrorKind::Other, "put failure"));
            }
            self.inner_store.put(key, data).await?;
            if self.timed_out() {
                return Err(injected(ErrorKind::TimedOut, "put timeout"));
            }
            Ok(())
        })
    }

    fn put_if<'a>(
        &'a self,
        key: &'a str,
        data: &'a [u8],
        condition: &'a PutCondition,
    ) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            self.delay().await;
            if self.put_fails() {
                return Err(injected(ErrorKind::Other, "conditional put failure"));
            }
            let result = self.inner_store.put_if(key, data, condition).await?;
            if self.timed_out() {
                return Err(injected(ErrorKind::TimedOut, "conditional put timeout"));
            }
            Ok(result)
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.delay().await;
            if self.get_fails() {
                return Err(injected(ErrorKind::Other, "get failure"));
            }
            if self.timed_out() {
                return Err(injected(ErrorKind::TimedOut, "get timeout"));
            }
            self.inner_store.get(key).await
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            if self.get_fails() {
                return Err(injected(ErrorKind::Other, "exists failure"));
            }
            self.inner_store.exists(key).await
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if self.put_fails() {
                return Err(injected(ErrorKind::Other, "delete failure"));
            }
            self.inner_store.delete(key).await
        })
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
        continuation_token: Option<&'a str>,
    ) -> StoreFuture<'a, ListResult> {
        Box::pin(async move {
            self.delay().await;
            if self.get_fails() {
                return Err(injected(ErrorKind::Other, "list failure"));
            }
            self.inner_store.list(prefix, continuation_token).await
        })
    }

    fn rename<'a>(&'a self, from: &'a str, to: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if self.roll(faults::RENAME_FAIL, self.config.rename_fail_prob) {
                self.state.lock().stats.rename_failures += 1;
                return Err(injected(ErrorKind::Other, "rename failure"));
            }
            self.inner_store.rename(from, to).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buggify::{self, FaultConfig};
    use crate::io::SimulatedRng;
    use crate::store::InMemoryObjectStore;

    #[tokio::test]
    async fn test_no_faults_passes_through() {
        let store = SimulatedObjectStore::new(
            InMemoryObjectStore::new(),
            SimulatedRng::new(42),
            SimulatedStoreConfig::no_faults(),
        );
        store.put("key1", b"value1").await.unwrap();
        assert_eq!(store.get("key1").await.unwrap(), b"value1");

        let stats = store.stats();
        assert_eq!(stats.put_attempts, 1);
        assert_eq!(stats.put_failures, 0);
        assert_eq!(stats.get_failures, 0);
    }

    #[tokio::test]
    async fn test_same_seed_same_failures() {
        buggify::set_config(FaultConfig::new());
        let config = SimulatedStoreConfig {
            put_fail_prob: 0.5,
            ..SimulatedStoreConfig::no_faults()
        };
        let a = SimulatedObjectStore::new(InMemoryObjectStore::new(), SimulatedRng::new(7), config.clone());
        let b = SimulatedObjectStore::new(InMemoryObjectStore::new(), SimulatedRng::new(7), config);

        let mut ra = Vec::new();
        let mut rb = Vec::new();
        for i in 0..20 {
            let key = format!("key{}", i);
            ra.push(a.put(&key, b"data").await.is_ok());
            rb.push(b.put(&key, b"data").await.is_ok());
        }
        assert_eq!(ra, rb);
        assert!(ra.iter().any(|ok| !ok));
    }

    #[tokio::test]
    async fn test_timeout_after_write_still_lands() {
        buggify::set_config(FaultConfig::new());
        let store = SimulatedObjectStore::new(
            InMemoryObjectStore::new(),
            SimulatedRng::new(1),
            SimulatedStoreConfig {
                timeout_prob: 1.0,
                ..SimulatedStoreConfig::no_faults()
            },
        );
        let err = store.put("k", b"v").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
        assert_eq!(store.inner().get("k").await.unwrap(), b"v");
    }
}
