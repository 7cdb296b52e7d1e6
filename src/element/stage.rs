//! The stage capability interface.
//!
//! A [`Stage`] is what an external source/filter/sink implementation
//! supplies to be hosted as an element: an init/deinit pair, a single
//! process step invoked repeatedly by the element's worker, and a
//! control-command handler for out-of-band operations the process step
//! would not otherwise see.
//!
//! The process step must not block beyond the ring-buffer calls it
//! performs through [`StageIo`] — stop responsiveness depends on it.

use crate::error::{Error, Result};
use crate::event::{EventBus, EventKind};
use crate::ringbuf::RingBuffer;
use std::time::Duration;

/// Direction of a stage, resolved at construction.
///
/// Keeps the element's execution loop branch-free: the element
/// allocates an output ring for sources and filters, never for sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageType {
    /// Produces bytes from an external origin; no input ring.
    Source,
    /// Consumes input bytes and produces output bytes.
    Filter,
    /// Consumes bytes into an external destination; no output ring.
    Sink,
}

/// Outcome of one process step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Work was done; call again immediately.
    Continue,
    /// Nothing to do right now (external input not ready); the worker
    /// throttles before the next step.
    Idle,
    /// The stage is finished: upstream end-of-stream was drained or the
    /// external origin is exhausted. The element marks its own output
    /// done and transitions toward `Stopped`.
    Done,
}

/// Out-of-band control delivered between process steps.
///
/// Commands reach the stage through the element's control queue, so
/// they are handled even while the element is paused.
#[derive(Debug, Clone, PartialEq)]
pub enum StageCommand {
    /// Change the stage's target location (file path, URI, ...).
    SetLocation(String),
    /// Set an output level in percent (100 = unity).
    SetVolume(i32),
    /// Application-defined command.
    Custom {
        /// Opaque discriminator agreed between application and stage.
        tag: u32,
        /// Small inline value.
        value: i64,
    },
}

/// A processing stage hosted by an element.
pub trait Stage: Send {
    /// The stage's direction. Must be constant for the stage's lifetime.
    fn stage_type(&self) -> StageType;

    /// Called once on the worker before the first process step.
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// One processing step: read from the input ring if any, transform
    /// or produce, write to the output ring if any.
    fn process(&mut self, io: &mut StageIo<'_>) -> Result<Progress>;

    /// Called once on the worker after the last process step.
    fn deinit(&mut self) -> Result<()> {
        Ok(())
    }

    /// Handle an out-of-band command.
    ///
    /// The default rejects every command; stages opt in per variant.
    fn handle_command(&mut self, command: StageCommand) -> Result<()> {
        let _ = command;
        Err(Error::UnsupportedCommand("stage accepts no commands"))
    }

    /// Name used for the default element tag and in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// The data-plane surface a stage sees during one process step.
///
/// Wraps the element's bound ring-buffer endpoints and the element's
/// configured operation timeout, and accounts bytes moved for the
/// element's info record.
pub struct StageIo<'a> {
    input: Option<&'a RingBuffer>,
    output: Option<&'a RingBuffer>,
    timeout: Option<Duration>,
    events: Option<(&'a EventBus, &'a str)>,
    bytes_in: u64,
    bytes_out: u64,
}

impl<'a> StageIo<'a> {
    pub(crate) fn new(
        input: Option<&'a RingBuffer>,
        output: Option<&'a RingBuffer>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            input,
            output,
            timeout,
            events: None,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    pub(crate) fn with_events(mut self, bus: &'a EventBus, source: &'a str) -> Self {
        self.events = Some((bus, source));
        self
    }

    /// Whether an input ring is bound.
    pub fn has_input(&self) -> bool {
        self.input.is_some()
    }

    /// Whether an output ring is bound.
    pub fn has_output(&self) -> bool {
        self.output.is_some()
    }

    /// Read from the input ring. `Ok(0)` is end-of-stream.
    ///
    /// Fails with [`Error::Stage`] if the stage has no input bound —
    /// that is a wiring bug, not a runtime condition.
    pub fn read(&mut self, into: &mut [u8]) -> Result<usize> {
        let input = self
            .input
            .ok_or_else(|| Error::Stage("no input ring bound".into()))?;
        let n = input.read(into, self.timeout)?;
        self.bytes_in += n as u64;
        Ok(n)
    }

    /// Write to the output ring, possibly partially (see
    /// [`RingBuffer::write`]). Returns bytes accepted.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        let output = self
            .output
            .ok_or_else(|| Error::Stage("no output ring bound".into()))?;
        let n = output.write(bytes, self.timeout)?;
        self.bytes_out += n as u64;
        Ok(n)
    }

    /// Write all of `bytes`, waiting out downstream stalls until
    /// everything is accepted or the ring reports abort/done.
    ///
    /// Never returns [`Error::Timeout`]: the caller has typically
    /// already consumed these bytes from its input, so surfacing a
    /// timeout here would lose them. A stage that wants to stay
    /// responsive under a stalled consumer should use [`write`](Self::write)
    /// and keep its own resume offset.
    pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let mut offset = 0;
        while offset < bytes.len() {
            match self.write(&bytes[offset..]) {
                Ok(n) => offset += n,
                // Stalled, no progress this round. Abort remains the
                // escape hatch for shutdown.
                Err(Error::Timeout) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Post an application-defined event on the pipeline's bus,
    /// attributed to this element. No-op when the stage runs outside a
    /// worker (unit tests driving `process` directly).
    pub fn post_event(&self, tag: u32, value: i64) {
        if let Some((bus, source)) = self.events {
            bus.post(source, EventKind::Custom { tag, value });
        }
    }

    pub(crate) fn counters(&self) -> (u64, u64) {
        (self.bytes_in, self.bytes_out)
    }
}
