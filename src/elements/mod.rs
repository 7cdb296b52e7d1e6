//! Built-in stages.
//!
//! Everything here is expressed through the [`Stage`](crate::element::Stage)
//! trait, exactly like an external implementation would be: file-backed
//! source and sink, a byte-chunk passthrough, a sample gain filter, and
//! in-memory stages for tests and demos.

pub mod file;
pub mod gain;
pub mod passthrough;
pub mod testing;

pub use file::{FileSink, FileSrc};
pub use gain::Gain;
pub use passthrough::PassThrough;
pub use testing::{MemSink, MemSrc, NullSink, StarvedSrc};
