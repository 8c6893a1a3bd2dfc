//! Shared utilities for the tlsrelay workspace
//!
//! Configuration validation, tracing initialization and a small in-process
//! metrics registry used by the proxy and its binary.

pub mod validation;

#[cfg(feature = "tracing")]
pub mod tracing;

pub use validation::{ValidateConfig, validators};
