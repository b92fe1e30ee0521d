//! Admission control for flowgate runs.
//!
//! Two gates decide whether a run may start: a sliding-window
//! [`RateLimiter`] and a per-workflow [`ConcurrencyManager`]. The
//! [`AdmissionController`] consults both as a single decision and hands out
//! an [`AdmissionToken`] that holds the concurrency slot until dropped.

pub mod concurrency;
pub mod config;
pub mod controller;
pub mod error;
pub mod rate_limit;

pub use concurrency::{AdmissionToken, ConcurrencyManager};
pub use config::AdmissionConfig;
pub use controller::AdmissionController;
pub use error::AdmissionError;
pub use rate_limit::{RateLimitPolicy, RateLimitResult, RateLimiter};
