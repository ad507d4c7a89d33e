//! # Circuit Breaker
//!
//! Fault isolation for calls into external systems. Three states:
//! Closed (calls pass), Open (calls fail fast) and Half-Open (a limited number of
//! trial calls decide whether to close again).

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Open,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CircuitBreakerError<E> {
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitBreakerError::CircuitOpen { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time spent open before trial calls are let through
    pub timeout: Duration,
    /// Successful trial calls needed to close again
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::for_external_system()
    }
}

impl CircuitBreakerConfig {
    pub fn for_external_system() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be greater than 0".to_string());
        }
        if self.timeout.is_zero() {
            return Err("timeout must be greater than 0".to_string());
        }
        if self.success_threshold == 0 {
            return Err("success_threshold must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CircuitBreakerMetrics {
    pub total_calls: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub rejected_count: u64,
    pub consecutive_failures: u64,
    pub half_open_calls: u64,
}

#[derive(Debug, Default)]
struct BreakerBook {
    metrics: CircuitBreakerMetrics,
    opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    state: AtomicU8,
    config: CircuitBreakerConfig,
    book: Mutex<BreakerBook>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        debug!(
            component = %name,
            failure_threshold = config.failure_threshold,
            timeout_ms = config.timeout.as_millis() as u64,
            "Circuit breaker initialized"
        );
        Self {
            name,
            state: AtomicU8::new(CircuitState::Closed as u8),
            config,
            book: Mutex::new(BreakerBook::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        self.book.lock().metrics
    }

    /// Run `operation` under protection; every error counts as a failure
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_with(operation, |_| true).await
    }

    /// Like [`call`](Self::call), but only errors accepted by `counts_as_failure`
    /// move the breaker toward Open. Other errors are passed through as neutral.
    pub async fn call_with<F, Fut, T, E, C>(
        &self,
        operation: F,
        counts_as_failure: C,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&E) -> bool,
    {
        if !self.should_allow_call() {
            self.book.lock().metrics.rejected_count += 1;
            return Err(CircuitBreakerError::CircuitOpen {
                component: self.name.clone(),
            });
        }

        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(error) if counts_as_failure(error) => self.record_failure(),
            Err(_) => self.record_neutral(),
        }
        result.map_err(CircuitBreakerError::OperationFailed)
    }

    fn should_allow_call(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let mut book = self.book.lock();
                let elapsed = book
                    .opened_at
                    .map_or(true, |opened_at| opened_at.elapsed() >= self.config.timeout);
                if elapsed {
                    self.transition_to_half_open(&mut book);
                    book.metrics.half_open_calls += 1;
                }
                elapsed
            }
            CircuitState::HalfOpen => {
                let mut book = self.book.lock();
                if book.metrics.half_open_calls < u64::from(self.config.success_threshold) {
                    book.metrics.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&self) {
        let mut book = self.book.lock();
        book.metrics.total_calls += 1;
        book.metrics.success_count += 1;
        book.metrics.consecutive_failures = 0;

        if self.state() == CircuitState::HalfOpen {
            // trial calls are counted on admission; closing needs that many successes
            let successes_needed = u64::from(self.config.success_threshold);
            if book.metrics.half_open_calls >= successes_needed {
                self.transition_to_closed(&mut book);
            }
        }
    }

    fn record_failure(&self) {
        let mut book = self.book.lock();
        book.metrics.total_calls += 1;
        book.metrics.failure_count += 1;
        book.metrics.consecutive_failures += 1;

        match self.state() {
            CircuitState::Closed
                if book.metrics.consecutive_failures >= u64::from(self.config.failure_threshold) =>
            {
                self.transition_to_open(&mut book);
            }
            CircuitState::HalfOpen => self.transition_to_open(&mut book),
            _ => {}
        }
    }

    fn record_neutral(&self) {
        let mut book = self.book.lock();
        book.metrics.total_calls += 1;
        if self.state() == CircuitState::HalfOpen {
            // a trial that proved nothing frees its slot
            book.metrics.half_open_calls = book.metrics.half_open_calls.saturating_sub(1);
        }
    }

    fn transition_to_closed(&self, book: &mut BreakerBook) {
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        book.metrics.consecutive_failures = 0;
        book.metrics.half_open_calls = 0;
        book.opened_at = None;
        info!(component = %self.name, "Circuit breaker closed");
    }

    fn transition_to_open(&self, book: &mut BreakerBook) {
        self.state.store(CircuitState::Open as u8, Ordering::Release);
        book.opened_at = Some(Instant::now());
        book.metrics.half_open_calls = 0;
        warn!(
            component = %self.name,
            consecutive_failures = book.metrics.consecutive_failures,
            timeout_ms = self.config.timeout.as_millis() as u64,
            "Circuit breaker opened"
        );
    }

    fn transition_to_half_open(&self, book: &mut BreakerBook) {
        self.state.store(CircuitState::HalfOpen as u8, Ordering::Release);
        book.metrics.half_open_calls = 0;
        info!(component = %self.name, "Circuit breaker half-open");
    }

    pub fn force_open(&self) {
        warn!(component = %self.name, "Circuit breaker forced open");
        let mut book = self.book.lock();
        self.transition_to_open(&mut book);
    }

    pub fn force_closed(&self) {
        warn!(component = %self.name, "Circuit breaker forced closed");
        let mut book = self.book.lock();
        self.transition_to_closed(&mut book);
    }
}
