//! Unit tests module organization

pub mod config;
pub mod health_aggregator;
pub mod middleware;
pub mod rate_limiter;

// Test utilities and helpers
pub mod helpers;
