//! Resilience primitives for outbound calls

pub mod circuit_breaker;
pub mod rolling_window;
pub mod settings;

pub use circuit_breaker::{CallOutcome, CallResult, CircuitBreakerEngine, CircuitSnapshot, CircuitState};
pub use rolling_window::{Outcome, RollingWindow, WindowCounts};
pub use settings::{BackoffStrategy, BreakerConfig, BreakerOverride, BreakerSettings};
