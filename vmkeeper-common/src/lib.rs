//! # vmkeeper Common
//!
//! Shared utilities for vmkeeper components.
//!
//! ## Logging
//!
//! ```rust
//! vmkeeper_common::init_logging("info").unwrap();
//! tracing::info!(vm_name = "web-1", "Provisioning server");
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json};
