//! Fault-tolerant calls to external dependencies and an audited status
//! workflow for framing orders.

pub mod config;
pub mod demo;
pub mod error;
pub mod logging;
pub mod resilience;
pub mod ui;
pub mod workflow;

pub use error::{Classify, ErrorClass, FramewrightError};
