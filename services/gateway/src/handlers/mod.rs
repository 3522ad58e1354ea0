//! HTTP handlers for the health and administration surface

pub mod admin;
pub mod health;

pub use admin::AdminHandlers;
pub use health::HealthHandlers;
