//! The element worker loop.
//!
//! One `Runner` executes on the element's dedicated thread: it drains
//! control messages, invokes the stage's process step, flushes byte
//! counters, and drives the terminal transition when the stage
//! finishes, is stopped, or fails.

use super::stage::{Progress, Stage, StageCommand, StageIo};
use super::{Ctrl, Shared, State};
use crate::error::Error;
use crate::event::{EventBus, EventKind};
use crate::ringbuf::RingBuffer;
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// How the worker loop ended.
enum Exit {
    /// The stage reported `Progress::Done`.
    Finished,
    /// Stop was requested (or the control channel vanished).
    Stopped,
    /// init or a process step failed.
    Failed(String),
}

pub(super) struct Runner {
    shared: Arc<Shared>,
    stage: Box<dyn Stage>,
    ctrl: Receiver<Ctrl>,
    bus: EventBus,
    /// Input endpoint snapshot taken at start; links are frozen while
    /// the pipeline runs.
    input: Option<Arc<RingBuffer>>,
    timeout: Option<Duration>,
    idle_wait: Duration,
}

impl Runner {
    pub(super) fn new(
        shared: Arc<Shared>,
        stage: Box<dyn Stage>,
        ctrl: Receiver<Ctrl>,
        bus: EventBus,
        timeout: Option<Duration>,
        idle_wait: Duration,
    ) -> Self {
        let input = shared.input.lock().unwrap().clone();
        Self {
            shared,
            stage,
            ctrl,
            bus,
            input,
            timeout,
            idle_wait,
        }
    }

    pub(super) fn run(mut self) {
        let tag = self.shared.tag();
        debug!(tag, "worker started");

        let exit = match self.stage.init() {
            Ok(()) => self.drive(&tag),
            Err(e) => {
                warn!(tag, error = %e, "stage init failed");
                Exit::Failed(e.to_string())
            }
        };
        if let Err(e) = self.stage.deinit() {
            warn!(tag, error = %e, "stage deinit failed");
        }

        let terminal = match exit {
            Exit::Finished => {
                if let Some(output) = &self.shared.output {
                    output.mark_done();
                }
                debug!(tag, "worker finished: end of stream");
                State::Stopped
            }
            Exit::Stopped => {
                debug!(tag, "worker stopped");
                State::Stopped
            }
            Exit::Failed(message) => {
                // Fault isolation: wake only our own neighbors, report,
                // and leave the rest of the pipeline running.
                if let Some(input) = &self.input {
                    input.abort();
                }
                if let Some(output) = &self.shared.output {
                    output.abort();
                }
                warn!(tag, error = %message, "worker failed");
                self.shared.info.lock().unwrap().last_error = Some(message.clone());
                self.bus.post(&tag, EventKind::Error { message });
                State::Error
            }
        };

        // Return the stage so the element can be reset and restarted.
        *self.shared.stage.lock().unwrap() = Some(self.stage);
        self.shared.transition(terminal, &self.bus);
    }

    fn drive(&mut self, tag: &str) -> Exit {
        loop {
            // Control first, so stop/pause win over the next step.
            loop {
                match self.ctrl.try_recv() {
                    Ok(msg) => {
                        if let Some(exit) = self.handle_ctrl(msg, tag) {
                            return exit;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return Exit::Stopped,
                }
            }
            if self.shared.stop.load(Ordering::Acquire) {
                return Exit::Stopped;
            }

            let mut io = StageIo::new(
                self.input.as_deref(),
                self.shared.output.as_deref(),
                self.timeout,
            )
            .with_events(&self.bus, tag);
            let step = self.stage.process(&mut io);
            let (bytes_in, bytes_out) = io.counters();
            if bytes_in > 0 || bytes_out > 0 {
                let mut info = self.shared.info.lock().unwrap();
                info.bytes_in += bytes_in;
                info.bytes_out += bytes_out;
            }

            match step {
                Ok(Progress::Continue) => {}
                Ok(Progress::Idle) => match self.ctrl.recv_timeout(self.idle_wait) {
                    Ok(msg) => {
                        if let Some(exit) = self.handle_ctrl(msg, tag) {
                            return exit;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => return Exit::Stopped,
                },
                Ok(Progress::Done) => return Exit::Finished,
                Err(Error::Aborted) => {
                    if self.shared.stop.load(Ordering::Acquire) {
                        return Exit::Stopped;
                    }
                    // A neighbor aborted its ring (it stopped or
                    // failed). Our own stop was not requested, so park
                    // until the pipeline tells us what to do.
                    trace!(tag, "neighbor ring aborted; parking");
                    return self.park(tag);
                }
                Err(Error::Timeout) => {
                    trace!(tag, "ring operation timed out; retrying");
                }
                Err(e) => return Exit::Failed(e.to_string()),
            }
        }
    }

    /// Wait for control after a neighbor abort. The rings are dead, so
    /// there is no data work left; only Stop matters here.
    fn park(&mut self, tag: &str) -> Exit {
        loop {
            match self.ctrl.recv() {
                Ok(msg) => {
                    if let Some(exit) = self.handle_ctrl(msg, tag) {
                        return exit;
                    }
                }
                Err(_) => return Exit::Stopped,
            }
        }
    }

    /// Dispatch one control message. `Some` means the loop must exit.
    fn handle_ctrl(&mut self, msg: Ctrl, tag: &str) -> Option<Exit> {
        match msg {
            Ctrl::Stop => Some(Exit::Stopped),
            // Resume while already running is stale; ignore.
            Ctrl::Resume => None,
            Ctrl::Pause => self.paused(tag),
            Ctrl::Command(command) => {
                self.dispatch(command, tag);
                None
            }
        }
    }

    /// Blocked-on-control pause loop. Commands still get through.
    fn paused(&mut self, tag: &str) -> Option<Exit> {
        self.shared.transition(State::Paused, &self.bus);
        loop {
            match self.ctrl.recv() {
                Ok(Ctrl::Resume) => {
                    self.shared.transition(State::Running, &self.bus);
                    return None;
                }
                Ok(Ctrl::Stop) => return Some(Exit::Stopped),
                Ok(Ctrl::Pause) => {}
                Ok(Ctrl::Command(command)) => self.dispatch(command, tag),
                Err(_) => return Some(Exit::Stopped),
            }
        }
    }

    fn dispatch(&mut self, command: StageCommand, tag: &str) {
        if let Err(e) = self.stage.handle_command(command.clone()) {
            warn!(tag, ?command, error = %e, "command rejected");
            self.shared.info.lock().unwrap().last_error = Some(e.to_string());
        }
    }
}
