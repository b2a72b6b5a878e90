//! File system helpers: work directories, traversal, and stat.

pub mod metadata;
pub mod walker;
pub mod workdir;
