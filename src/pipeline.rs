//! The command pipeline engine.
//!
//! A [`Pipeline`] runs its sequential stages strictly one after another and,
//! once they have all passed, fires its background stages and leaves them to
//! run on their own. Progress is published on the [`Exchange`] as
//! [`StageStatus`] events.
//!
//! Cancellation is cooperative: a shared [`CancellationToken`] is checked
//! before every stage starts, and every live child is sent a termination
//! signal, escalated to a forced kill if it hasn't exited within the
//! pipeline's kill timeout.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::command::{StageKind, StageSpec};
use crate::error::{Error, Result};
use crate::exchange::{Event, Exchange};
use crate::process::{Process, POLL_INTERVAL};
use crate::signal::Signal;

/// Default grace period between the termination signal and a forced kill.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to wait for a force-killed process to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(1);

/// How long to wait for output streams to close once a process has exited.
const OUTPUT_SETTLE: Duration = Duration::from_millis(500);

/// How often a background stage's new output is published while it runs.
pub const FORWARD_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Queued,
    Running,
    Passed,
    Failed,
    /// Never started because an earlier stage failed.
    Skipped,
    Killed,
}

impl StageState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Killed => "killed",
        }
    }

    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of [`Event::StageStatus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageStatus {
    /// Position in the pipeline's command list; background stages follow the
    /// sequential ones.
    pub index: usize,
    pub command: String,
    pub kind: StageKind,
    pub state: StageState,
    /// Captured output: present on failure, or always in verbose mode. A
    /// running background stage also reports its new output as it comes.
    pub output: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Passed,
    Failed,
    Canceled,
}

impl PipelineState {
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Idle | Self::Running)
    }
}

/// Shared, monotonic cancellation flag.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` only for the call that actually flipped the flag.
    pub fn cancel(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One command execution. Owns at most one child process for its lifetime.
pub struct Stage {
    index: usize,
    spec: StageSpec,
    command: String,
    killed: AtomicBool,
    state: Mutex<StageState>,
    process: Mutex<Option<Arc<Process>>>,
    output: Mutex<Option<String>>,
}

impl Stage {
    fn new(index: usize, spec: StageSpec) -> Self {
        Self {
            index,
            command: spec.to_string(),
            spec,
            killed: AtomicBool::new(false),
            state: Mutex::new(StageState::Queued),
            process: Mutex::new(None),
            output: Mutex::new(None),
        }
    }

    pub const fn index(&self) -> usize {
        self.index
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub const fn spec(&self) -> &StageSpec {
        &self.spec
    }

    pub fn state(&self) -> StageState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Captured output, once the stage has finished.
    pub fn output(&self) -> Option<String> {
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Pid of the child, if one was ever started.
    pub fn process_id(&self) -> Option<u32> {
        self.process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|p| p.id())
    }

    fn set_state(&self, state: StageState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn set_output(&self, output: String) {
        *self.output.lock().unwrap_or_else(PoisonError::into_inner) = Some(output);
    }

    /// Starts the child unless the stage or its pipeline has been killed.
    ///
    /// The kill check and the spawn happen under the same lock that
    /// [`Stage::terminate`] takes, so a kill either prevents the start or
    /// sees the new process.
    fn launch(&self, token: &CancellationToken) -> std::result::Result<Arc<Process>, StageState> {
        let mut slot = self.process.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_killed() || token.is_canceled() {
            self.set_state(StageState::Killed);
            return Err(StageState::Killed);
        }

        match Process::spawn(&self.spec) {
            Ok(process) => {
                info!("Started [{}] {} (pid {})", self.index, self.command, process.id());
                let process = Arc::new(process);
                *slot = Some(Arc::clone(&process));
                self.set_state(StageState::Running);
                Ok(process)
            }
            Err(err) => {
                warn!("Couldn't start [{}] {}: {}", self.index, self.command, err);
                self.set_output(format!("{}: {}\n", self.spec.program, err));
                self.set_state(StageState::Failed);
                Err(StageState::Failed)
            }
        }
    }

    /// Blocks, polling, until the child exits.
    fn wait(&self, process: &Process) -> StageState {
        let result = loop {
            match process.try_wait() {
                Ok(Some(status)) => break Ok(status),
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(err) => break Err(err),
            }
        };

        let mut output = process.output(OUTPUT_SETTLE);
        let state = if self.is_killed() {
            StageState::Killed
        } else {
            match result {
                Ok(status) if status.success() => StageState::Passed,
                Ok(status) => {
                    debug!("[{}] {} exited with {}", self.index, self.command, status);
                    StageState::Failed
                }
                Err(err) => {
                    error!("Lost track of [{}] {}: {}", self.index, self.command, err);
                    output.push_str(&format!("{}\n", err));
                    StageState::Failed
                }
            }
        };

        info!("[{}] {} {}", self.index, self.command, state);
        self.set_output(output);
        self.set_state(state);
        state
    }

    /// Like [`Stage::wait`], but hands whatever the process wrote to
    /// `forward` every [`FORWARD_INTERVAL`] while it is still running.
    fn follow<F: FnMut(String)>(&self, process: &Process, mut forward: F) -> StageState {
        let mut last = Instant::now();
        while let Ok(None) = process.try_wait() {
            if last.elapsed() >= FORWARD_INTERVAL {
                let chunk = process.take_output();
                if !chunk.is_empty() && !self.is_killed() {
                    forward(chunk);
                }
                last = Instant::now();
            }
            thread::sleep(POLL_INTERVAL);
        }

        self.wait(process)
    }

    /// Launches and waits for completion.
    fn run(&self, token: &CancellationToken) -> StageState {
        match self.launch(token) {
            Ok(process) => self.wait(&process),
            Err(state) => state,
        }
    }

    /// Marks the stage killed and signals its process, if any.
    ///
    /// Returns the process for the caller to reap, or `None` if there was no
    /// process or the stage had already been killed.
    fn terminate(&self) -> Option<Arc<Process>> {
        if self.killed.swap(true, Ordering::SeqCst) {
            return None;
        }

        let slot = self.process.lock().unwrap_or_else(PoisonError::into_inner);
        let process = slot.as_ref()?;
        if let Ok(Some(_)) = process.try_wait() {
            return None;
        }

        process.signal(Signal::Terminate);
        Some(Arc::clone(process))
    }

    /// Waits up to `grace` for a terminated process to exit, then kills it.
    fn reap(&self, process: &Process, grace: Duration) {
        self.escalate(process, grace);
        self.set_state(StageState::Killed);
    }

    fn escalate(&self, process: &Process, grace: Duration) {
        match process.wait_timeout(grace) {
            Ok(Some(_)) => return,
            Ok(None) => warn!(
                "[{}] {} ignored termination for {:?}, killing it",
                self.index, self.command, grace
            ),
            Err(err) => warn!("Couldn't wait for [{}] {}: {}", self.index, self.command, err),
        }

        process.signal(Signal::Kill);
        match process.wait_timeout(REAP_TIMEOUT) {
            Ok(Some(_)) => {}
            Ok(None) => error!(
                "[{}] {} (pid {}) is still running after being killed",
                self.index,
                self.command,
                process.id()
            ),
            Err(err) => warn!("Couldn't wait for [{}] {}: {}", self.index, self.command, err),
        }
    }

    fn status(&self, state: StageState, verbose: bool) -> StageStatus {
        let output = match state {
            StageState::Failed => self.output(),
            StageState::Passed if verbose => self.output(),
            _ => None,
        };

        StageStatus {
            index: self.index,
            command: self.command.clone(),
            kind: self.spec.kind,
            state,
            output,
        }
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Stage")
            .field("index", &self.index)
            .field("command", &self.command)
            .field("state", &self.state())
            .field("killed", &self.is_killed())
            .finish()
    }
}

/// One logical build: ordered sequential stages plus background stages.
pub struct Pipeline {
    sequential: Vec<Arc<Stage>>,
    background: Vec<Arc<Stage>>,
    token: CancellationToken,
    started: AtomicBool,
    state: Mutex<PipelineState>,
    exchange: Exchange,
    kill_timeout: Duration,
}

impl Pipeline {
    /// Builds a pipeline and announces its command list on the exchange.
    ///
    /// Stages keep their relative order within each kind; at least one
    /// sequential stage is required.
    pub fn new<I>(specs: I, exchange: Exchange) -> Result<Self>
    where
        I: IntoIterator<Item = StageSpec>,
    {
        let (sequential, background): (Vec<_>, Vec<_>) =
            specs.into_iter().partition(|spec| !spec.is_background());

        if sequential.is_empty() {
            return Err(Error::Config(
                "a pipeline needs at least one sequential command".into(),
            ));
        }

        let offset = sequential.len();
        let sequential: Vec<_> = sequential
            .into_iter()
            .enumerate()
            .map(|(i, spec)| Arc::new(Stage::new(i, spec)))
            .collect();
        let background: Vec<_> = background
            .into_iter()
            .enumerate()
            .map(|(i, spec)| Arc::new(Stage::new(offset + i, spec)))
            .collect();

        let pipeline = Self {
            sequential,
            background,
            token: CancellationToken::new(),
            started: AtomicBool::new(false),
            state: Mutex::new(PipelineState::Idle),
            exchange,
            kill_timeout: DEFAULT_KILL_TIMEOUT,
        };

        pipeline
            .exchange
            .send(Event::CommandList(pipeline.commands()));
        Ok(pipeline)
    }

    pub fn with_kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    fn stages(&self) -> impl Iterator<Item = &Arc<Stage>> {
        self.sequential.iter().chain(self.background.iter())
    }

    /// Human-readable commands, sequential first.
    pub fn commands(&self) -> Vec<String> {
        self.stages().map(|s| s.command().to_string()).collect()
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stage_states(&self) -> Vec<StageState> {
        self.stages().map(|s| s.state()).collect()
    }

    pub fn stage(&self, index: usize) -> Option<&Stage> {
        self.stages().nth(index).map(|stage| &**stage)
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_canceled()
    }

    /// Runs the pipeline on a new thread.
    pub fn start(self: &Arc<Self>, verbose: bool) -> io::Result<JoinHandle<PipelineState>> {
        let pipeline = Arc::clone(self);
        thread::Builder::new()
            .name("pipeline".into())
            .spawn(move || pipeline.run(verbose))
    }

    /// Runs the sequential chain on the calling thread, then fires the
    /// background stages. Returns the pipeline's final state.
    ///
    /// A pipeline only runs once; later calls return its current state.
    pub fn run(&self, verbose: bool) -> PipelineState {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Pipeline already started");
            return self.state();
        }

        if !self.transition(PipelineState::Idle, PipelineState::Running) {
            debug!("Pipeline canceled before it started");
            return self.state();
        }

        for (i, stage) in self.sequential.iter().enumerate() {
            if self.token.is_canceled() {
                return self.finish(PipelineState::Canceled);
            }

            self.publish(stage, StageState::Running, verbose);
            match stage.run(&self.token) {
                StageState::Passed => self.publish(stage, StageState::Passed, verbose),
                StageState::Killed => return self.finish(PipelineState::Canceled),
                state => {
                    self.publish(stage, state, verbose);
                    self.skip(self.sequential[i + 1..].iter().chain(self.background.iter()));
                    return self.finish(PipelineState::Failed);
                }
            }
        }

        if self.token.is_canceled() {
            return self.finish(PipelineState::Canceled);
        }

        for stage in &self.background {
            self.fire(stage, verbose);
        }

        self.finish(PipelineState::Passed)
    }

    /// Starts a background stage and leaves a monitor thread waiting on it.
    ///
    /// The monitor publishes the stage's output as `Running` statuses while
    /// it runs, so a long-lived process doesn't hoard it until it exits.
    fn fire(&self, stage: &Arc<Stage>, verbose: bool) {
        self.publish(stage, StageState::Running, verbose);
        let process = match stage.launch(&self.token) {
            Ok(process) => process,
            Err(state) => {
                self.publish(stage, state, verbose);
                return;
            }
        };

        let monitor_stage = Arc::clone(stage);
        let exchange = self.exchange.clone();
        let spawned = thread::Builder::new()
            .name(format!("background-{}", stage.index()))
            .spawn(move || {
                let state = monitor_stage.follow(&process, |chunk| {
                    let mut status = monitor_stage.status(StageState::Running, verbose);
                    status.output = Some(chunk);
                    exchange.send(Event::StageStatus(status));
                });
                if !monitor_stage.is_killed() {
                    exchange.send(Event::StageStatus(monitor_stage.status(state, verbose)));
                }
            });

        if let Err(err) = spawned {
            error!("Couldn't monitor [{}] {}: {}", stage.index(), stage.command(), err);
        }
    }

    fn skip<'a>(&self, stages: impl Iterator<Item = &'a Arc<Stage>>) {
        for stage in stages {
            stage.set_state(StageState::Skipped);
            self.publish(stage, StageState::Skipped, false);
        }
    }

    /// Killed stages, and every stage of a canceled pipeline, go quiet.
    fn publish(&self, stage: &Stage, state: StageState, verbose: bool) {
        if stage.is_killed() || self.token.is_canceled() {
            return;
        }
        self.exchange
            .send(Event::StageStatus(stage.status(state, verbose)));
    }

    fn transition(&self, from: PipelineState, to: PipelineState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    /// Moves a running pipeline to `outcome`; a cancellation that got there
    /// first wins.
    fn finish(&self, outcome: PipelineState) -> PipelineState {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == PipelineState::Running {
            *state = outcome;
        }
        debug!("Pipeline finished: {:?}", *state);
        *state
    }

    /// Stops the pipeline: no further stage will start, and every live child
    /// is terminated and reaped.
    ///
    /// Safe to call at any time and from any thread; only the first call has
    /// an effect. Returns once the children have exited, which is bounded by
    /// the kill timeout plus a short reaping window.
    pub fn cancel(&self) {
        if !self.token.cancel() {
            return;
        }

        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if !state.is_terminal() {
                *state = PipelineState::Canceled;
            }
        }

        let live: Vec<_> = self
            .stages()
            .filter_map(|stage| stage.terminate().map(|process| (stage, process)))
            .collect();

        for (stage, process) in live {
            stage.reap(&process, self.kill_timeout);
        }
        debug!("Pipeline canceled");
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("state", &self.state())
            .field("sequential", &self.sequential)
            .field("background", &self.background)
            .field("canceled", &self.token.is_canceled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{CancellationToken, Pipeline, PipelineState, StageState};
    use crate::command::{StageKind, StageSpec};
    use crate::exchange::Exchange;

    #[test]
    fn token_cancels_once() {
        let token = CancellationToken::new();
        let other = token.clone();

        assert!(!token.is_canceled());
        assert!(other.cancel());
        assert!(!token.cancel());
        assert!(token.is_canceled());
    }

    #[test]
    fn needs_a_sequential_stage() {
        let specs = vec![StageSpec::new("true", vec![], StageKind::Background)];
        assert!(Pipeline::new(specs, Exchange::new()).is_err());
        assert!(Pipeline::new(Vec::new(), Exchange::new()).is_err());
    }

    #[test]
    fn background_stages_are_indexed_after_sequential() {
        let specs = vec![
            StageSpec::new("server", vec![], StageKind::Background),
            StageSpec::new("make", vec![], StageKind::Sequential),
            StageSpec::new("make", vec!["test".into()], StageKind::Sequential),
        ];
        let pipeline = Pipeline::new(specs, Exchange::new()).unwrap();

        assert_eq!(pipeline.commands(), vec!["make", "make test", "server"]);
        assert_eq!(pipeline.stage(2).unwrap().index(), 2);
        assert_eq!(pipeline.state(), PipelineState::Idle);
        assert!(pipeline
            .stage_states()
            .iter()
            .all(|s| *s == StageState::Queued));
    }

    #[test]
    fn cancel_before_start_runs_nothing() {
        let specs = vec![StageSpec::new("true", vec![], StageKind::Sequential)];
        let pipeline = Pipeline::new(specs, Exchange::new()).unwrap();

        pipeline.cancel();
        pipeline.cancel();

        assert_eq!(pipeline.run(false), PipelineState::Canceled);
        assert_eq!(pipeline.stage(0).unwrap().process_id(), None);
        assert_eq!(pipeline.stage_states(), vec![StageState::Queued]);
    }

    #[test]
    fn state_names() {
        assert_eq!(StageState::Passed.to_string(), "passed");
        assert!(StageState::Skipped.is_terminal());
        assert!(!StageState::Running.is_terminal());
        assert!(PipelineState::Canceled.is_terminal());
        assert!(!PipelineState::Idle.is_terminal());
    }
}
