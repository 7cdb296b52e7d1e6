//! Elements: the unit of processing in a pipeline.
//!
//! An [`Element`] hosts a [`Stage`] implementation on a dedicated
//! worker thread, owns its output [`RingBuffer`], holds a non-owning
//! reference to the upstream element's output as its input, and runs a
//! small state machine:
//!
//! ```text
//! Initialized ──▶ Running ⇄ Paused ──▶ Stopped
//!                    │                    ▲
//!                    └──▶ Error ──────────┘ (via stop)
//! ```
//!
//! There is no separate "uninitialized" phase: an `Element` value only
//! exists once its stage and buffers are in place. Every
//! transition posts one best-effort event on the bus. Stop aborts both
//! ring endpoints and joins the worker, so teardown order is
//! deterministic from the caller's perspective.

mod runner;
mod stage;

pub use stage::{Progress, Stage, StageCommand, StageIo, StageType};

use crate::error::{Error, Result};
use crate::event::{EventBus, EventKind};
use crate::ringbuf::{RingBuffer, DEFAULT_RING_CAPACITY};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Element lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Constructed and ready to be registered/started.
    Initialized,
    /// Worker is executing process steps.
    Running,
    /// Worker is suspended between process steps.
    Paused,
    /// Worker has exited; buffers are quiescent.
    Stopped,
    /// A processing fault occurred; worker has exited.
    Error,
}

impl State {
    /// Short name for error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Initialized => "Initialized",
            State::Running => "Running",
            State::Paused => "Paused",
            State::Stopped => "Stopped",
            State::Error => "Error",
        }
    }
}

/// Byte counters and last fault for one element.
#[derive(Debug, Clone, Default)]
pub struct ElementInfo {
    /// Total bytes consumed from the input ring.
    pub bytes_in: u64,
    /// Total bytes produced into the output ring.
    pub bytes_out: u64,
    /// Message of the most recent fault, if any.
    pub last_error: Option<String>,
}

/// Per-element construction configuration. All fields defaulted.
#[derive(Debug, Clone)]
pub struct ElementConfig {
    /// Capacity of the element's output ring (ignored for sinks).
    pub out_capacity: usize,
    /// If set, linking fails unless the upstream output ring has
    /// exactly this capacity (the link-time capacity contract).
    pub required_in_capacity: Option<usize>,
    /// Timeout for the stage's ring-buffer reads and writes.
    /// `None` waits forever; abort remains the shutdown path.
    pub op_timeout: Option<Duration>,
    /// Throttle between process steps while the stage reports
    /// [`Progress::Idle`].
    pub idle_wait: Duration,
    /// Worker priority hint. Carried and logged; std threads cannot
    /// apply it portably.
    pub priority: Option<i32>,
    /// Processor/core affinity hint. Carried and logged.
    pub core_affinity: Option<usize>,
    /// Worker stack size, applied via `std::thread::Builder`.
    pub stack_size: Option<usize>,
    /// Whether `Pipeline::run` starts this element at all. Elements
    /// with this cleared must be started individually.
    pub auto_start: bool,
}

impl Default for ElementConfig {
    fn default() -> Self {
        Self {
            out_capacity: DEFAULT_RING_CAPACITY,
            required_in_capacity: None,
            op_timeout: None,
            idle_wait: Duration::from_millis(10),
            priority: None,
            core_affinity: None,
            stack_size: None,
            auto_start: true,
        }
    }
}

impl ElementConfig {
    /// Set the output ring capacity.
    pub fn with_out_capacity(mut self, capacity: usize) -> Self {
        self.out_capacity = capacity;
        self
    }

    /// Require a specific input ring capacity at link time.
    pub fn with_required_in_capacity(mut self, capacity: usize) -> Self {
        self.required_in_capacity = Some(capacity);
        self
    }

    /// Set the ring operation timeout.
    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = Some(timeout);
        self
    }

    /// Set the worker stack size.
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Set the worker priority hint.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Exclude this element from `Pipeline::run`.
    pub fn manual_start(mut self) -> Self {
        self.auto_start = false;
        self
    }
}

/// Control messages delivered to the worker between process steps.
#[derive(Debug)]
pub(crate) enum Ctrl {
    Pause,
    Resume,
    Stop,
    Command(StageCommand),
}

/// State shared between the element handle and its worker.
struct Shared {
    tag: Mutex<String>,
    state: Mutex<State>,
    state_cv: Condvar,
    stop: AtomicBool,
    info: Mutex<ElementInfo>,
    /// Input endpoint: the upstream element's output ring, bound at
    /// link time. Non-owning in spirit; the Arc keeps it alive while
    /// this worker may still be draining it.
    input: Mutex<Option<Arc<RingBuffer>>>,
    /// Output endpoint, allocated at construction unless the stage is
    /// a sink. Exclusive ownership lives here.
    output: Option<Arc<RingBuffer>>,
    /// Stage slot: taken by the worker at start, returned at exit so a
    /// stopped element can be reset and run again.
    stage: Mutex<Option<Box<dyn Stage>>>,
}

impl Shared {
    fn tag(&self) -> String {
        self.tag.lock().unwrap().clone()
    }

    /// Set the state, wake waiters, and post the transition event.
    fn transition(&self, to: State, bus: &EventBus) {
        let from = {
            let mut state = self.state.lock().unwrap();
            let from = *state;
            *state = to;
            from
        };
        self.state_cv.notify_all();
        if from != to {
            let tag = self.tag();
            debug!(tag, from = from.as_str(), to = to.as_str(), "state changed");
            bus.post(&tag, EventKind::StateChanged { from, to });
        }
    }
}

/// A processing stage hosted on its own worker thread.
///
/// See the [module docs](self) for the state machine and ownership
/// rules. Elements are normally driven through a
/// [`Pipeline`](crate::pipeline::Pipeline), but work standalone given
/// an [`EventBus`].
pub struct Element {
    shared: Arc<Shared>,
    stage_type: StageType,
    config: ElementConfig,
    ctrl_tx: Sender<Ctrl>,
    /// Kept alive on the handle side so control sends cannot fail.
    ctrl_rx: Receiver<Ctrl>,
    worker: Mutex<Option<JoinHandle<()>>>,
    output_claimed: AtomicBool,
}

impl Element {
    /// Create an element hosting `stage` with default configuration.
    pub fn new(stage: impl Stage + 'static) -> Self {
        Self::with_config(stage, ElementConfig::default())
    }

    /// Create an element with explicit configuration.
    pub fn with_config(stage: impl Stage + 'static, config: ElementConfig) -> Self {
        let stage_type = stage.stage_type();
        let tag = stage.name().to_string();
        let output = match stage_type {
            StageType::Sink => None,
            _ => Some(Arc::new(RingBuffer::new(config.out_capacity))),
        };
        let (ctrl_tx, ctrl_rx) = unbounded();
        Self {
            shared: Arc::new(Shared {
                tag: Mutex::new(tag),
                state: Mutex::new(State::Initialized),
                state_cv: Condvar::new(),
                stop: AtomicBool::new(false),
                info: Mutex::new(ElementInfo::default()),
                input: Mutex::new(None),
                output,
                stage: Mutex::new(Some(Box::new(stage))),
            }),
            stage_type,
            config,
            ctrl_tx,
            ctrl_rx,
            worker: Mutex::new(None),
            output_claimed: AtomicBool::new(false),
        }
    }

    /// The element's tag (unique within a pipeline once registered).
    pub fn tag(&self) -> String {
        self.shared.tag()
    }

    /// Rename the element. Meaningful before start; the pipeline sets
    /// this at registration.
    pub fn set_tag(&self, tag: impl Into<String>) {
        *self.shared.tag.lock().unwrap() = tag.into();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        *self.shared.state.lock().unwrap()
    }

    /// Snapshot of byte counters and last error.
    pub fn info(&self) -> ElementInfo {
        self.shared.info.lock().unwrap().clone()
    }

    /// The hosted stage's direction.
    pub fn stage_type(&self) -> StageType {
        self.stage_type
    }

    /// The element's configuration.
    pub fn config(&self) -> &ElementConfig {
        &self.config
    }

    /// Start the worker: `Initialized → Running` (or resume if paused).
    ///
    /// The transition event is posted from the caller's context before
    /// the worker spawns, so pipeline start order is observable on the
    /// bus.
    pub fn start(&self, bus: &EventBus) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        match *state {
            State::Initialized => {}
            State::Paused => {
                drop(state);
                return self.resume();
            }
            other => {
                return Err(Error::InvalidState {
                    expected: "Initialized or Paused",
                    actual: other.as_str(),
                })
            }
        }
        let stage = self
            .shared
            .stage
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Lifecycle("stage already taken by a worker".into()))?;
        self.shared.stop.store(false, Ordering::Release);
        // Discard control messages left over from a previous run.
        while self.ctrl_rx.try_recv().is_ok() {}
        *state = State::Running;
        drop(state);
        self.shared.state_cv.notify_all();

        let tag = self.tag();
        bus.post(
            &tag,
            EventKind::StateChanged {
                from: State::Initialized,
                to: State::Running,
            },
        );
        if let Some(priority) = self.config.priority {
            debug!(tag, priority, "worker priority hint (best effort)");
        }
        if let Some(core) = self.config.core_affinity {
            debug!(tag, core, "worker affinity hint (best effort)");
        }

        let runner = runner::Runner::new(
            Arc::clone(&self.shared),
            stage,
            self.ctrl_rx.clone(),
            bus.clone(),
            self.config.op_timeout,
            self.config.idle_wait,
        );
        let mut builder = std::thread::Builder::new().name(tag.clone());
        if let Some(stack) = self.config.stack_size {
            builder = builder.stack_size(stack);
        }
        match builder.spawn(move || runner.run()) {
            Ok(handle) => {
                *self.worker.lock().unwrap() = Some(handle);
                debug!(tag, "worker spawned");
                Ok(())
            }
            Err(e) => {
                self.shared.info.lock().unwrap().last_error = Some(e.to_string());
                self.shared.transition(State::Error, bus);
                Err(e.into())
            }
        }
    }

    /// Suspend the worker before its next process step.
    ///
    /// Signals only; the `Paused` transition is posted by the worker
    /// when it takes effect.
    pub fn pause(&self) -> Result<()> {
        self.signal_running(Ctrl::Pause)
    }

    /// Resume a paused worker.
    pub fn resume(&self) -> Result<()> {
        self.signal_running(Ctrl::Resume)
    }

    /// Deliver an out-of-band command to the stage.
    ///
    /// Handled between process steps, including while paused.
    pub fn send_command(&self, command: StageCommand) -> Result<()> {
        self.signal_running(Ctrl::Command(command))
    }

    fn signal_running(&self, msg: Ctrl) -> Result<()> {
        match self.state() {
            State::Running | State::Paused => self
                .ctrl_tx
                .send(msg)
                .map_err(|_| Error::Lifecycle("control channel closed".into())),
            other => Err(Error::InvalidState {
                expected: "Running or Paused",
                actual: other.as_str(),
            }),
        }
    }

    /// Request the worker to stop without waiting for it.
    ///
    /// Aborts both ring endpoints as an atomic part of the request, so
    /// a worker blocked in a buffer operation wakes immediately. Safe
    /// to call at any time, repeatedly.
    pub fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(input) = self.shared.input.lock().unwrap().as_ref() {
            input.abort();
        }
        if let Some(output) = &self.shared.output {
            output.abort();
        }
        let _ = self.ctrl_tx.send(Ctrl::Stop);
    }

    /// Stop the element synchronously: request, then join the worker.
    ///
    /// Idempotent for already-stopped elements; an element that never
    /// started transitions straight to `Stopped`.
    pub fn stop(&self, bus: &EventBus) -> Result<()> {
        match self.state() {
            State::Running | State::Paused => {
                self.request_stop();
                self.join();
                Ok(())
            }
            State::Error => {
                self.join();
                self.shared.transition(State::Stopped, bus);
                Ok(())
            }
            State::Initialized => {
                self.shared.transition(State::Stopped, bus);
                Ok(())
            }
            State::Stopped => {
                self.join();
                Ok(())
            }
        }
    }

    /// Block until the element reaches `Stopped` or `Error`, then join
    /// the worker. `Err(Timeout)` if the deadline passes first.
    pub fn wait_stopped(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut state = self.shared.state.lock().unwrap();
        while !matches!(*state, State::Stopped | State::Error) {
            state = match deadline {
                None => self.shared.state_cv.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    let (guard, _) = self
                        .shared
                        .state_cv
                        .wait_timeout(state, deadline - now)
                        .unwrap();
                    guard
                }
            };
        }
        drop(state);
        self.join();
        Ok(())
    }

    /// Return a stopped element to `Initialized` for another run.
    ///
    /// Clears the output ring and the stop flag. Does not post an
    /// event; reset is bookkeeping, not a lifecycle transition.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        if *state != State::Stopped {
            return Err(Error::InvalidState {
                expected: "Stopped",
                actual: state.as_str(),
            });
        }
        if self.shared.stage.lock().unwrap().is_none() {
            return Err(Error::Lifecycle(
                "worker still holds the stage; join it first".into(),
            ));
        }
        if let Some(output) = &self.shared.output {
            output.reset();
        }
        self.shared.stop.store(false, Ordering::Release);
        while self.ctrl_rx.try_recv().is_ok() {}
        *state = State::Initialized;
        drop(state);
        self.shared.state_cv.notify_all();
        Ok(())
    }

    fn join(&self) {
        if let Some(handle) = self.worker.lock().unwrap().take() {
            if handle.join().is_err() {
                let tag = self.tag();
                warn!(tag, "worker panicked");
                self.shared.info.lock().unwrap().last_error =
                    Some("worker panicked".to_string());
                let mut state = self.shared.state.lock().unwrap();
                *state = State::Stopped;
                drop(state);
                self.shared.state_cv.notify_all();
            }
        }
    }

    // ---- link plumbing (pipeline-side) ----

    /// The element's output ring, if it has one.
    pub fn output(&self) -> Option<&Arc<RingBuffer>> {
        self.shared.output.as_ref()
    }

    /// Whether the input endpoint is bound.
    pub(crate) fn input_bound(&self) -> bool {
        self.shared.input.lock().unwrap().is_some()
    }

    /// Whether the output endpoint has been claimed by a link.
    pub(crate) fn is_output_claimed(&self) -> bool {
        self.output_claimed.load(Ordering::Acquire)
    }

    /// Claim the output endpoint for a link.
    pub(crate) fn claim_output(&self) -> Result<Arc<RingBuffer>> {
        let output = self.shared.output.as_ref().ok_or_else(|| Error::Lifecycle(
            format!("element '{}' is a sink and has no output", self.tag()),
        ))?;
        if self.output_claimed.swap(true, Ordering::AcqRel) {
            return Err(Error::EndpointBound {
                tag: self.tag(),
                endpoint: "output",
            });
        }
        Ok(Arc::clone(output))
    }

    /// Bind the input endpoint to an upstream ring.
    pub(crate) fn bind_input(&self, ring: Arc<RingBuffer>) -> Result<()> {
        let mut input = self.shared.input.lock().unwrap();
        if input.is_some() {
            return Err(Error::EndpointBound {
                tag: self.tag(),
                endpoint: "input",
            });
        }
        *input = Some(ring);
        Ok(())
    }

    /// Release a previously claimed output endpoint.
    pub(crate) fn release_output(&self) {
        self.output_claimed.store(false, Ordering::Release);
    }

    /// Drop the input binding.
    pub(crate) fn unbind_input(&self) {
        *self.shared.input.lock().unwrap() = None;
    }

    /// Detach both endpoints (unregister/terminate bookkeeping).
    pub(crate) fn detach(&self) {
        self.unbind_input();
        self.release_output();
    }
}

impl std::fmt::Debug for Element {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Element")
            .field("tag", &self.tag())
            .field("stage_type", &self.stage_type)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Emits `left` bytes in small bursts, then finishes.
    struct ByteSrc {
        left: usize,
    }

    impl Stage for ByteSrc {
        fn stage_type(&self) -> StageType {
            StageType::Source
        }

        fn process(&mut self, io: &mut StageIo<'_>) -> Result<Progress> {
            if self.left == 0 {
                return Ok(Progress::Done);
            }
            let burst = self.left.min(8);
            io.write_all(&vec![0xAA; burst])?;
            self.left -= burst;
            Ok(Progress::Continue)
        }

        fn name(&self) -> &str {
            "byte_src"
        }
    }

    #[test]
    fn test_standalone_element_runs_to_completion() {
        let bus = EventBus::new();
        let element = Element::new(ByteSrc { left: 32 });

        element.start(&bus).unwrap();
        element
            .wait_stopped(Some(Duration::from_secs(2)))
            .unwrap();

        assert_eq!(element.state(), State::Stopped);
        assert_eq!(element.info().bytes_out, 32);
        // End-of-stream propagated to the output ring.
        assert!(element.output().unwrap().is_done());
    }

    #[test]
    fn test_stop_before_start_is_legal_but_restart_is_not() {
        let bus = EventBus::new();
        let element = Element::new(ByteSrc { left: 1 });

        element.stop(&bus).unwrap();
        assert_eq!(element.state(), State::Stopped);
        assert!(matches!(
            element.start(&bus),
            Err(Error::InvalidState { .. })
        ));
    }

    #[test]
    fn test_reset_permits_a_second_run() {
        let bus = EventBus::new();
        let element = Element::new(ByteSrc { left: 4 });

        element.start(&bus).unwrap();
        element
            .wait_stopped(Some(Duration::from_secs(2)))
            .unwrap();

        element.reset().unwrap();
        assert_eq!(element.state(), State::Initialized);

        // The stage is spent, so the second run finishes immediately,
        // but the lifecycle must accept it.
        element.start(&bus).unwrap();
        element
            .wait_stopped(Some(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(element.state(), State::Stopped);
    }

    #[test]
    fn test_control_requires_a_worker() {
        let element = Element::new(ByteSrc { left: 1 });
        assert!(matches!(element.pause(), Err(Error::InvalidState { .. })));
        assert!(matches!(
            element.send_command(StageCommand::SetVolume(10)),
            Err(Error::InvalidState { .. })
        ));
    }
}
