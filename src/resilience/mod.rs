//! # Resilience
//!
//! Circuit breakers guarding calls into external systems, so a failing resource
//! makes items fail fast as retryable instead of stalling every worker.
//!
//! ```rust
//! use activity_engine::resilience::{CircuitBreaker, CircuitBreakerConfig};
//!
//! # async fn example() {
//! let breaker = CircuitBreaker::new("ldap-connector", CircuitBreakerConfig::for_external_system());
//! let result = breaker.call(|| async { Ok::<_, String>("applied") }).await;
//! assert!(result.is_ok());
//! # }
//! ```

pub mod circuit_breaker;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerMetrics, CircuitState,
};
