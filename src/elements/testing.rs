//! In-memory stages for tests, demos, and benchmarks.

use crate::element::{Progress, Stage, StageIo, StageType};
use crate::error::Result;
use std::sync::{Arc, Mutex};

const CHUNK: usize = 1024;

/// Streams a fixed byte vector, then signals end-of-stream.
pub struct MemSrc {
    data: Vec<u8>,
    pos: usize,
}

impl MemSrc {
    /// Source producing exactly `data`.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }
}

impl Stage for MemSrc {
    fn stage_type(&self) -> StageType {
        StageType::Source
    }

    fn process(&mut self, io: &mut StageIo<'_>) -> Result<Progress> {
        if self.pos >= self.data.len() {
            return Ok(Progress::Done);
        }
        let end = (self.pos + CHUNK).min(self.data.len());
        // Partial writes are fine; pos advances by what was accepted.
        let n = io.write(&self.data[self.pos..end])?;
        self.pos += n;
        Ok(Progress::Continue)
    }

    fn name(&self) -> &str {
        "mem_src"
    }
}

/// Collects every received byte into a shared vector.
pub struct MemSink {
    data: Arc<Mutex<Vec<u8>>>,
    buf: [u8; CHUNK],
}

impl MemSink {
    /// Empty sink; grab [`MemSink::data`] before registering it.
    pub fn new() -> Self {
        Self {
            data: Arc::new(Mutex::new(Vec::new())),
            buf: [0; CHUNK],
        }
    }

    /// Handle to the collected bytes, usable after the element stops.
    pub fn data(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.data)
    }
}

impl Default for MemSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for MemSink {
    fn stage_type(&self) -> StageType {
        StageType::Sink
    }

    fn process(&mut self, io: &mut StageIo<'_>) -> Result<Progress> {
        let n = io.read(&mut self.buf)?;
        if n == 0 {
            return Ok(Progress::Done);
        }
        self.data.lock().unwrap().extend_from_slice(&self.buf[..n]);
        Ok(Progress::Continue)
    }

    fn name(&self) -> &str {
        "mem_sink"
    }
}

/// Discards everything it receives.
#[derive(Default)]
pub struct NullSink {
    buf: Vec<u8>,
}

impl Stage for NullSink {
    fn stage_type(&self) -> StageType {
        StageType::Sink
    }

    fn init(&mut self) -> Result<()> {
        self.buf.resize(CHUNK, 0);
        Ok(())
    }

    fn process(&mut self, io: &mut StageIo<'_>) -> Result<Progress> {
        let n = io.read(&mut self.buf)?;
        if n == 0 {
            return Ok(Progress::Done);
        }
        Ok(Progress::Continue)
    }

    fn name(&self) -> &str {
        "null_sink"
    }
}

/// A source whose external input never arrives.
///
/// Every process step reports [`Progress::Idle`]; the hosting element
/// sits in its idle throttle forever. Exists to prove that stop does
/// not depend on data ever flowing.
#[derive(Default)]
pub struct StarvedSrc;

impl Stage for StarvedSrc {
    fn stage_type(&self) -> StageType {
        StageType::Source
    }

    fn process(&mut self, _io: &mut StageIo<'_>) -> Result<Progress> {
        Ok(Progress::Idle)
    }

    fn name(&self) -> &str {
        "starved_src"
    }
}
