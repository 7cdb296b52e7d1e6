//! Pipeline: an ordered, linked collection of elements with coarse
//! lifecycle control.
//!
//! The pipeline is the orchestrator: it owns the registry (tag →
//! element), the link table (chains of tags wired output-to-input), and
//! the shared [`EventBus`]. Control operations run in the caller's
//! context and only signal or join workers; data never flows through
//! the pipeline itself.
//!
//! Cross-element sequencing contract: `run` starts elements in link
//! order (sources first), `stop` stops them in reverse link order
//! (sinks first). Those are the only ordering guarantees between
//! elements.
//!
//! ```no_run
//! use riffle::prelude::*;
//!
//! # fn main() -> riffle::Result<()> {
//! let mut pipeline = Pipeline::new();
//! pipeline.register(Element::new(FileSrc::new("in.pcm")), "src")?;
//! pipeline.register(Element::new(PassThrough::default()), "mid")?;
//! pipeline.register(Element::new(FileSink::new("out.pcm")), "sink")?;
//! pipeline.link(&["src", "mid", "sink"])?;
//!
//! let listener = pipeline.set_listener();
//! pipeline.run()?;
//! pipeline.wait_for_stop(None)?;
//! pipeline.terminate()?;
//! # Ok(())
//! # }
//! ```

use crate::element::{Element, StageCommand, State};
use crate::error::{Error, Result};
use crate::event::{BusListener, EventBus};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Overall pipeline run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// No worker is running. The initial state, and the state after
    /// `stop`.
    Stopped,
    /// Elements have been started.
    Running,
    /// Elements are suspended.
    Paused,
}

impl PipelineState {
    fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Stopped => "Stopped",
            PipelineState::Running => "Running",
            PipelineState::Paused => "Paused",
        }
    }
}

struct Entry {
    tag: String,
    element: Element,
}

/// An ordered, linked collection of elements.
///
/// See the [module docs](self) for the orchestration contract.
pub struct Pipeline {
    entries: Vec<Entry>,
    /// Link table: each chain is a sequence of tags wired
    /// output-to-input, left to right.
    links: Vec<Vec<String>>,
    bus: EventBus,
    state: PipelineState,
}

impl Pipeline {
    /// Create an empty pipeline with a default event bus.
    pub fn new() -> Self {
        Self::with_bus(EventBus::new())
    }

    /// Create an empty pipeline around an existing bus (shared with
    /// other pipelines or application code).
    pub fn with_bus(bus: EventBus) -> Self {
        Self {
            entries: Vec::new(),
            links: Vec::new(),
            bus,
            state: PipelineState::Stopped,
        }
    }

    /// The pipeline's event bus.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Current run state.
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Number of link chains currently established.
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Look up a registered element by tag.
    pub fn element(&self, tag: &str) -> Option<&Element> {
        self.entries
            .iter()
            .find(|entry| entry.tag == tag)
            .map(|entry| &entry.element)
    }

    /// Register `element` under `tag`.
    ///
    /// Fails if the tag is taken, the element is not `Initialized`, or
    /// the pipeline is running.
    pub fn register(&mut self, element: Element, tag: &str) -> Result<()> {
        self.require_stopped("register")?;
        if self.entries.iter().any(|entry| entry.tag == tag) {
            return Err(Error::DuplicateTag(tag.to_string()));
        }
        let state = element.state();
        if state != State::Initialized {
            return Err(Error::InvalidState {
                expected: "Initialized",
                actual: state.as_str(),
            });
        }
        element.set_tag(tag);
        debug!(tag, "element registered");
        self.entries.push(Entry {
            tag: tag.to_string(),
            element,
        });
        Ok(())
    }

    /// Remove `tag` from the pipeline, detaching its buffers from
    /// neighbors. Any chain through the element is split at its
    /// position.
    pub fn unregister(&mut self, tag: &str) -> Result<Element> {
        self.require_stopped("unregister")?;
        let index = self
            .entries
            .iter()
            .position(|entry| entry.tag == tag)
            .ok_or_else(|| Error::UnknownTag(tag.to_string()))?;
        let state = self.entries[index].element.state();
        if matches!(state, State::Running | State::Paused) {
            return Err(Error::InvalidState {
                expected: "Initialized or Stopped",
                actual: state.as_str(),
            });
        }

        // Unwire neighbors before dropping the chain entries.
        let chains = std::mem::take(&mut self.links);
        let mut split = Vec::new();
        for chain in chains {
            match chain.iter().position(|t| t == tag) {
                None => split.push(chain),
                Some(pos) => {
                    if pos > 0 {
                        if let Some(upstream) = self.entry(&chain[pos - 1]) {
                            upstream.release_output();
                        }
                    }
                    if pos + 1 < chain.len() {
                        if let Some(downstream) = self.entry(&chain[pos + 1]) {
                            downstream.unbind_input();
                        }
                    }
                    let (head, tail) = chain.split_at(pos);
                    for part in [head, &tail[1..]] {
                        if part.len() >= 2 {
                            split.push(part.to_vec());
                        }
                    }
                }
            }
        }
        self.links = split;

        let entry = self.entries.remove(index);
        entry.element.detach();
        debug!(tag, "element unregistered");
        Ok(entry.element)
    }

    /// Wire a chain of registered elements output-to-input.
    ///
    /// Validated before any endpoint is touched: on error the link
    /// table and every element are left exactly as they were.
    pub fn link(&mut self, tags: &[&str]) -> Result<()> {
        self.require_stopped("link")?;
        if tags.len() < 2 {
            return Err(Error::Lifecycle(
                "a link chain needs at least two tags".into(),
            ));
        }
        for (i, tag) in tags.iter().enumerate() {
            if tags[..i].contains(tag) {
                return Err(Error::Lifecycle(format!(
                    "tag '{tag}' appears twice in one chain"
                )));
            }
            if self.entry(tag).is_none() {
                return Err(Error::UnknownTag(tag.to_string()));
            }
        }
        for pair in tags.windows(2) {
            let (Some(upstream), Some(downstream)) = (self.entry(pair[0]), self.entry(pair[1]))
            else {
                return Err(Error::UnknownTag(pair[0].to_string()));
            };
            let output = upstream.output().ok_or_else(|| {
                Error::Lifecycle(format!("element '{}' is a sink; it cannot feed '{}'",
                    pair[0], pair[1]))
            })?;
            if upstream.is_output_claimed() {
                return Err(Error::EndpointBound {
                    tag: pair[0].to_string(),
                    endpoint: "output",
                });
            }
            if downstream.input_bound() {
                return Err(Error::EndpointBound {
                    tag: pair[1].to_string(),
                    endpoint: "input",
                });
            }
            if let Some(required) = downstream.config().required_in_capacity {
                if output.capacity() != required {
                    return Err(Error::CapacityMismatch {
                        upstream: pair[0].to_string(),
                        downstream: pair[1].to_string(),
                        produced: output.capacity(),
                        required,
                    });
                }
            }
        }

        // Validation passed; binding cannot fail now.
        for pair in tags.windows(2) {
            let (Some(upstream), Some(downstream)) = (self.entry(pair[0]), self.entry(pair[1]))
            else {
                return Err(Error::UnknownTag(pair[0].to_string()));
            };
            let ring = upstream.claim_output()?;
            downstream.bind_input(ring)?;
        }
        debug!(chain = ?tags, "link established");
        self.links.push(tags.iter().map(|t| t.to_string()).collect());
        Ok(())
    }

    /// Start every auto-start element, sources first.
    ///
    /// On any element failure, already-started elements are rolled
    /// back to `Stopped` and the error is returned. A paused pipeline
    /// resumes instead.
    pub fn run(&mut self) -> Result<()> {
        match self.state {
            PipelineState::Running => {
                return Err(Error::InvalidState {
                    expected: "Stopped or Paused",
                    actual: self.state.as_str(),
                })
            }
            PipelineState::Paused => return self.resume(),
            PipelineState::Stopped => {}
        }
        let order = self.start_order();
        let mut started: Vec<String> = Vec::new();
        for tag in &order {
            let element = match self.entry(tag) {
                Some(e) => e,
                None => continue,
            };
            if !element.config().auto_start {
                debug!(tag, "skipped: auto_start disabled");
                continue;
            }
            if let Err(e) = element.start(&self.bus) {
                warn!(tag, error = %e, "start failed; rolling back");
                for tag in started.iter().rev() {
                    if let Some(element) = self.entry(tag) {
                        if let Err(e) = element.stop(&self.bus) {
                            warn!(tag, error = %e, "rollback stop failed");
                        }
                    }
                }
                return Err(e);
            }
            started.push(tag.clone());
        }
        self.state = PipelineState::Running;
        debug!(elements = started.len(), "pipeline running");
        Ok(())
    }

    /// Suspend every running element. Order is irrelevant; no buffers
    /// are touched.
    pub fn pause(&mut self) -> Result<()> {
        if self.state != PipelineState::Running {
            return Err(Error::InvalidState {
                expected: "Running",
                actual: self.state.as_str(),
            });
        }
        for entry in &self.entries {
            if matches!(entry.element.state(), State::Running | State::Paused) {
                entry.element.pause()?;
            }
        }
        self.state = PipelineState::Paused;
        debug!("pipeline paused");
        Ok(())
    }

    /// Resume every paused element.
    pub fn resume(&mut self) -> Result<()> {
        if self.state != PipelineState::Paused {
            return Err(Error::InvalidState {
                expected: "Paused",
                actual: self.state.as_str(),
            });
        }
        // Also signal elements still reported Running: a worker that
        // was blocked in a ring call when pause was requested has the
        // pause queued but not yet applied; the resume cancels it.
        for entry in &self.entries {
            if matches!(entry.element.state(), State::Running | State::Paused) {
                entry.element.resume()?;
            }
        }
        self.state = PipelineState::Running;
        debug!("pipeline resumed");
        Ok(())
    }

    /// Stop every element synchronously, sinks first.
    ///
    /// Each element aborts its own buffers as part of its stop, so no
    /// cross-element deadlock on a full or empty ring is possible.
    /// Idempotent once stopped.
    pub fn stop(&mut self) -> Result<()> {
        if self.state == PipelineState::Stopped && self.all_quiescent() {
            return Ok(());
        }
        let order = self.start_order();
        for tag in order.iter().rev() {
            if let Some(element) = self.entry(tag) {
                element.stop(&self.bus)?;
            }
        }
        self.state = PipelineState::Stopped;
        debug!("pipeline stopped");
        Ok(())
    }

    /// Block until every element has reached `Stopped` or `Error`.
    ///
    /// The deterministic join point before `terminate`; also the way
    /// to wait for a finite stream to drain on its own.
    pub fn wait_for_stop(&mut self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|d| Instant::now() + d);
        for entry in &self.entries {
            let remaining = match deadline {
                None => None,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    Some(deadline - now)
                }
            };
            entry.element.wait_stopped(remaining)?;
        }
        self.state = PipelineState::Stopped;
        Ok(())
    }

    /// Release all ring-buffer wiring. Requires a prior `stop` (every
    /// element quiescent); the registry survives so elements can be
    /// unregistered or inspected afterwards.
    pub fn terminate(&mut self) -> Result<()> {
        if self.state != PipelineState::Stopped || !self.all_quiescent() {
            return Err(Error::Lifecycle(
                "terminate requires every element stopped".into(),
            ));
        }
        for entry in &self.entries {
            entry.element.detach();
        }
        self.links.clear();
        debug!("pipeline terminated");
        Ok(())
    }

    /// Return every stopped element to `Initialized` so the pipeline
    /// can run again. Links survive; output rings are cleared.
    pub fn reset(&mut self) -> Result<()> {
        self.require_stopped("reset")?;
        for entry in &self.entries {
            match entry.element.state() {
                State::Initialized => {}
                _ => entry.element.reset()?,
            }
        }
        debug!("pipeline reset");
        Ok(())
    }

    /// Route an out-of-band command to one element's stage.
    pub fn send_command(&self, tag: &str, command: StageCommand) -> Result<()> {
        self.entry(tag)
            .ok_or_else(|| Error::UnknownTag(tag.to_string()))?
            .send_command(command)
    }

    /// Attach a listener to the pipeline's bus.
    pub fn set_listener(&self) -> BusListener {
        self.bus.subscribe()
    }

    /// Detach a listener. Fails loudly if it is not attached.
    pub fn remove_listener(&self, listener: &BusListener) -> Result<()> {
        self.bus.unsubscribe(listener)
    }

    fn entry(&self, tag: &str) -> Option<&Element> {
        self.element(tag)
    }

    fn require_stopped(&self, op: &str) -> Result<()> {
        if self.state != PipelineState::Stopped {
            return Err(Error::Lifecycle(format!(
                "{op} is only allowed while the pipeline is stopped"
            )));
        }
        Ok(())
    }

    fn all_quiescent(&self) -> bool {
        self.entries.iter().all(|entry| {
            !matches!(entry.element.state(), State::Running | State::Paused)
        })
    }

    /// Start order: linked chains left-to-right (first occurrence
    /// wins), then unlinked elements in registration order.
    fn start_order(&self) -> Vec<String> {
        let mut order: Vec<String> = Vec::new();
        for chain in &self.links {
            for tag in chain {
                if !order.contains(tag) {
                    order.push(tag.clone());
                }
            }
        }
        for entry in &self.entries {
            if !order.contains(&entry.tag) {
                order.push(entry.tag.clone());
            }
        }
        order
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.state != PipelineState::Stopped || !self.all_quiescent() {
            warn!("pipeline dropped while running; forcing stop");
            let _ = self.stop();
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("state", &self.state)
            .field("elements", &self.entries.len())
            .field("links", &self.links.len())
            .finish()
    }
}
