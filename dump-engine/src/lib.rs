//! Dump Engine Library
//!
//! Exports an application's collections into a single compressed archive,
//! coordinating concurrent runs through lock files and reporting durable,
//! monotonic progress.

pub mod config;
pub mod dumper;
pub mod events;
pub mod fs;
pub mod lock;
pub mod progress;
pub mod repository;
pub mod service;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use dumper::{DumpEngine, DumpOutput, DumpRequest, DumpSettings};
pub use events::{DumpEvent, DumpEvents};
pub use lock::{BackupFileStatus, BackupStorage};
pub use repository::{MemoryRepository, Repository, ValueSerializer};
pub use service::DumpService;
pub use utils::errors::DumpError;
pub type Result<T> = std::result::Result<T, DumpError>;
