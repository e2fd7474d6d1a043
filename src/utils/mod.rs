//! # Utility Modules
//!
//! Supporting utilities for deadlines, logging and observability.
//!
//! ## Components
//! - **Timeout**: Async timeout and deadline wrappers mapping expiry to `VotifierError::Timeout`
//! - **Logging**: `tracing-subscriber` setup driven by `LoggingConfig`
//! - **Metrics**: Thread-safe connection and vote counters

pub mod logging;
pub mod metrics;
pub mod timeout;

pub use metrics::Metrics;
