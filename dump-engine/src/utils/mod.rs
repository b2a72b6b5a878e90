//! Utility modules for the dump engine.

pub mod errors;
pub mod format;
pub mod logger;

pub use errors::{DumpError, Result};
