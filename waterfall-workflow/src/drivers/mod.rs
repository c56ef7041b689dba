//! Concrete backend drivers.

pub mod simple;

pub use simple::{SimpleDriver, DEFAULT_BACKUP_PATH};
