//! # Resilience Module
//!
//! Per-stage circuit breaking. Each stage owns one [`CircuitBreaker`] whose
//! counter is independent of every other stage, so concurrent orchestration
//! runs contend only on the stages they share.
//!
//! ## Usage
//!
//! ```rust
//! use agentflow_core::resilience::{CircuitBreaker, CircuitState};
//!
//! let breaker = CircuitBreaker::new("fraud_screen", 5);
//! for _ in 0..5 {
//!     breaker.record_error();
//! }
//! assert_eq!(breaker.state(), CircuitState::Open);
//!
//! breaker.reset();
//! assert_eq!(breaker.state(), CircuitState::Closed);
//! ```

pub mod circuit_breaker;
pub mod metrics;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use metrics::CircuitBreakerMetrics;
