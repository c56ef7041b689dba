//! # Waterfall Common
//!
//! Shared utilities for the Waterfall workflow service components.
//!
//! ## Logging
//!
//! ```rust,ignore
//! use waterfall_common::{init_logging, TimedOperation};
//!
//! // Initialize with level
//! init_logging("info").unwrap();
//!
//! let op = TimedOperation::new("create_job");
//! // ... long running work ...
//! op.finish();
//! ```

pub mod logging;

// Re-export logging functions
pub use logging::{
    init_logging,
    init_logging_json,
    TimedOperation,
};
