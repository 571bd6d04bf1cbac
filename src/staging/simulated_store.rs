//! Simulated Object Store with Fault Injection
//!
//! DST wrapper around any [`ObjectStore`]. Faults are drawn from a seeded
//! ChaCha RNG so a failing seed replays exactly.

use super::object_store::{ListResult, ObjectReader, ObjectStore, PutOptions};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for simulated fault injection
#[derive(Debug, Clone)]
pub struct SimulatedStoreConfig {
    /// Probability of PUT operation failure
    pub put_fail_prob: f64,
    /// Probability of a PUT timing out (nothing is written)
    pub timeout_prob: f64,
    /// Probability of HEAD BUCKET failure
    pub head_fail_prob: f64,
    /// Simulated latency range in microseconds (min, max)
    pub latency_range_us: (u64, u64),
}

impl Default for SimulatedStoreConfig {
    fn default() -> Self {
        SimulatedStoreConfig {
            put_fail_prob: 0.05,           // 5%
            timeout_prob: 0.01,            // 1%
            head_fail_prob: 0.0,
            latency_range_us: (0, 500),    // up to 0.5ms
        }
    }
}

impl SimulatedStoreConfig {
    /// High chaos configuration for stress testing
    pub fn high_chaos() -> Self {
        SimulatedStoreConfig {
            put_fail_prob: 0.3,
            timeout_prob: 0.1,
            head_fail_prob: 0.05,
            latency_range_us: (0, 2_000),
        }
    }

    /// No faults - for baseline testing
    pub fn no_faults() -> Self {
        SimulatedStoreConfig {
            put_fail_prob: 0.0,
            timeout_prob: 0.0,
            head_fail_prob: 0.0,
            latency_range_us: (0, 0),
        }
    }
}

/// Statistics for fault injection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulatedStoreStats {
    pub put_attempts: u64,
    pub put_failures: u64,
    pub forced_failures: u64,
    pub timeouts: u64,
    pub head_attempts: u64,
    pub head_failures: u64,
    pub list_attempts: u64,
}

struct SimulatedStoreInner {
    rng: ChaCha8Rng,
    stats: SimulatedStoreStats,
    /// Remaining puts that fail unconditionally
    fail_next_puts: u32,
    faults_enabled: bool,
}

/// Simulated object store that wraps another store and injects faults
pub struct SimulatedObjectStore<S: ObjectStore> {
    inner_store: Arc<S>,
    config: SimulatedStoreConfig,
    state: Arc<Mutex<SimulatedStoreInner>>,
}

impl<S: ObjectStore> Clone for SimulatedObjectStore<S> {
    fn clone(&self) -> Self {
        SimulatedObjectStore {
            inner_store: self.inner_store.clone(),
            config: self.config.clone(),
            state: self.state.clone(),
        }
    }
}

impl<S: ObjectStore> SimulatedObjectStore<S> {
    pub fn new(inner_store: S, seed: u64, config: SimulatedStoreConfig) -> Self {
        SimulatedObjectStore {
            inner_store: Arc::new(inner_store),
            config,
            state: Arc::new(Mutex::new(SimulatedStoreInner {
                rng: ChaCha8Rng::seed_from_u64(seed),
                stats: SimulatedStoreStats::default(),
                fail_next_puts: 0,
                faults_enabled: true,
            })),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner_store
    }

    /// Get current statistics
    pub fn stats(&self) -> SimulatedStoreStats {
        self.state.lock().stats.clone()
    }

    /// Make the next `n` puts fail regardless of probabilities
    pub fn fail_next_puts(&self, n: u32) {
        self.state.lock().fail_next_puts = n;
    }

    /// Turn probabilistic faults on or off (forced failures still apply)
    pub fn set_faults_enabled(&self, enabled: bool) {
        self.state.lock().faults_enabled = enabled;
    }

    /// Decide the fate of one put before it reaches the inner store
    fn put_fault(&self) -> Option<IoError> {
        let mut s = self.state.lock();
        s.stats.put_attempts += 1;

        if s.fail_next_puts > 0 {
            s.fail_next_puts -= 1;
            s.stats.forced_failures += 1;
            return Some(IoError::new(ErrorKind::Other, "forced put failure"));
        }
        if !s.faults_enabled {
            return None;
        }
        if s.rng.gen_bool(self.config.timeout_prob) {
            s.stats.timeouts += 1;
            return Some(IoError::new(ErrorKind::TimedOut, "simulated timeout"));
        }
        if s.rng.gen_bool(self.config.put_fail_prob) {
            s.stats.put_failures += 1;
            return Some(IoError::new(ErrorKind::Other, "simulated put failure"));
        }
        None
    }

    fn latency(&self) -> Duration {
        let (min, max) = self.config.latency_range_us;
        let mut s = self.state.lock();
        if !s.faults_enabled {
            return Duration::ZERO;
        }
        let us = if max > min { s.rng.gen_range(min..max) } else { min };
        Duration::from_micros(us)
    }

    async fn delay(&self) {
        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

impl<S: ObjectStore> ObjectStore for SimulatedObjectStore<S> {
    fn put<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        data: &'a [u8],
        options: &'a PutOptions,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.delay().await;
            if let Some(fault) = self.put_fault() {
                return Err(fault);
            }
            self.inner_store.put(bucket, key, data, options).await
        })
    }

    fn put_stream<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        reader: ObjectReader,
        size: u64,
        options: &'a PutOptions,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.delay().await;
            if let Some(fault) = self.put_fault() {
                return Err(fault);
            }
            self.inner_store
                .put_stream(bucket, key, reader, size, options)
                .await
        })
    }

    fn list<'a>(
        &'a self,
        bucket: &'a str,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<ListResult>> + Send + 'a>> {
        Box::pin(async move {
            self.state.lock().stats.list_attempts += 1;
            self.inner_store.list(bucket, prefix).await
        })
    }

    fn head_bucket<'a>(
        &'a self,
        bucket: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let should_fail = {
                let mut s = self.state.lock();
                s.stats.head_attempts += 1;
                let fail = s.faults_enabled && s.rng.gen_bool(self.config.head_fail_prob);
                if fail {
                    s.stats.head_failures += 1;
                }
                fail
            };
            if should_fail {
                return Err(IoError::new(ErrorKind::Other, "simulated head bucket failure"));
            }
            self.inner_store.head_bucket(bucket).await
        })
    }
}
