//! # Riffle
//!
//! A bounded-memory streaming pipeline core for constrained devices.
//!
//! Riffle moves byte streams through a directed chain of processing
//! stages (source → filters → sink) with cooperative backpressure,
//! deterministic startup and teardown, and centralized event reporting.
//!
//! ## Features
//!
//! - **Bounded memory**: fixed-capacity ring buffers are the only data
//!   channel between stages
//! - **Worker-per-element**: each stage runs on its own named thread
//! - **Deterministic lifecycle**: forward start order, reverse stop
//!   order, synchronous joins
//! - **Abort-based cancellation**: no blocked worker ever outlives a
//!   stop request
//! - **Event bus**: every state change and fault is observable by any
//!   number of listeners, in post order
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use riffle::prelude::*;
//!
//! # fn main() -> riffle::Result<()> {
//! let mut pipeline = Pipeline::new();
//! pipeline.register(Element::new(FileSrc::new("track.pcm")), "src")?;
//! pipeline.register(Element::new(Gain::new(80)), "gain")?;
//! pipeline.register(Element::new(FileSink::new("out.pcm")), "sink")?;
//! pipeline.link(&["src", "gain", "sink"])?;
//!
//! let listener = pipeline.set_listener();
//! pipeline.run()?;
//! while let Ok(event) = listener.listen(None) {
//!     println!("{}: {:?}", event.source, event.kind);
//! }
//! pipeline.wait_for_stop(None)?;
//! pipeline.terminate()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod element;
pub mod elements;
pub mod error;
pub mod event;
pub mod pipeline;
pub mod ringbuf;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::element::{
        Element, ElementConfig, Progress, Stage, StageCommand, StageIo, StageType, State,
    };
    pub use crate::elements::{
        FileSink, FileSrc, Gain, MemSink, MemSrc, NullSink, PassThrough, StarvedSrc,
    };
    pub use crate::error::{Error, Result};
    pub use crate::event::{BusEvent, BusListener, EventBus, EventKind, OverflowPolicy};
    pub use crate::pipeline::{Pipeline, PipelineState};
    pub use crate::ringbuf::RingBuffer;
}

pub use error::{Error, Result};
