//! KlineHub Library
//!
//! Reconciles quotes from many price providers into one canonical point per
//! instrument per second, stores multi-resolution candles and publishes
//! tick events to a message broker.

pub mod bcmath;
pub mod config;
pub mod error;
pub mod hub;
pub mod logging;
pub mod oracle;
pub mod persistence;
pub mod pipeline;
pub mod publisher;
pub mod risk;
pub mod transport;
pub mod types;
