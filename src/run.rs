use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::command::StageSpec;
use crate::config::Config;
use crate::error::Result;
use crate::exchange::{Exchange, Topic};
use crate::monitor::{Closer, Monitor};
use crate::pipeline::{Pipeline, DEFAULT_KILL_TIMEOUT};
use crate::signal;

/// Keeps at most one pipeline running: every rebuild request cancels the
/// current pipeline and starts a fresh one.
pub struct Orchestrator {
    exchange: Exchange,
    specs: Vec<StageSpec>,
    verbose: bool,
    kill_timeout: Duration,
    current: Mutex<Option<Arc<Pipeline>>>,
}

impl Orchestrator {
    pub fn new(exchange: Exchange, specs: Vec<StageSpec>) -> Self {
        Self {
            exchange,
            specs,
            verbose: false,
            kill_timeout: DEFAULT_KILL_TIMEOUT,
            current: Mutex::new(None),
        }
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    /// Subscribes to rebuild requests on the exchange.
    pub fn listen(self: &Arc<Self>) {
        let orchestrator = Arc::clone(self);
        self.exchange.listen(Topic::RebuildRequested, move |_| {
            if let Err(err) = orchestrator.trigger() {
                error!("Couldn't start the pipeline: {}", err);
            }
        });
    }

    /// Cancels the running pipeline, if any, and starts a new one.
    ///
    /// Concurrent calls are serialized: the old pipeline is always canceled
    /// before its replacement starts, and the last caller's pipeline is the
    /// one left running.
    pub fn trigger(&self) -> Result<Arc<Pipeline>> {
        // cancel outside the lock so a slow kill doesn't hold up other triggers
        if let Some(previous) = self.current() {
            previous.cancel();
        }

        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = current.take() {
            previous.cancel();
        }

        let pipeline = Arc::new(
            Pipeline::new(self.specs.iter().cloned(), self.exchange.clone())?
                .with_kill_timeout(self.kill_timeout),
        );
        pipeline.start(self.verbose)?;
        info!("Started pipeline: {}", pipeline.commands().join(" -> "));

        *current = Some(Arc::clone(&pipeline));
        Ok(pipeline)
    }

    pub fn current(&self) -> Option<Arc<Pipeline>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn cancel_current(&self) {
        if let Some(pipeline) = self.current() {
            pipeline.cancel();
        }
    }
}

/// Watches `config.path` and reruns the configured pipeline on every change
/// until SIGINT or SIGTERM.
pub fn run(config: Config) -> Result<()> {
    run_with_exchange(config, Exchange::new())
}

/// Like [`run`], but publishes on a caller-supplied exchange so that
/// progress can be observed.
pub fn run_with_exchange(config: Config, exchange: Exchange) -> Result<()> {
    let specs = config.stage_specs()?;
    let orchestrator = Arc::new(
        Orchestrator::new(exchange.clone(), specs)
            .verbose(config.verbose)
            .kill_timeout(config.kill_timeout),
    );

    // the handler goes in before the watcher starts any thread of its own
    let closer: Arc<Mutex<Option<Closer>>> = Arc::new(Mutex::new(None));
    let weak = Arc::downgrade(&orchestrator);
    let handler_closer = Arc::clone(&closer);
    signal::install_handler(move || {
        if let Some(orchestrator) = weak.upgrade() {
            orchestrator.cancel_current();
        }
        let closer = handler_closer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(ref closer) = *closer {
            closer.close();
        }
    });

    let mut monitor = Monitor::new(exchange, &config.ignores, config.polling())?
        .run_initially(config.run_initially);
    *closer.lock().unwrap_or_else(PoisonError::into_inner) = Some(monitor.closer());

    orchestrator.listen();
    let result = monitor.watch(&config.path);
    orchestrator.cancel_current();
    result
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::Orchestrator;
    use crate::command::{StageKind, StageSpec};
    use crate::exchange::{Event, Exchange, Topic};
    use crate::pipeline::{PipelineState, StageState};
    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn specs(cmds: &[&str]) -> Vec<StageSpec> {
        cmds.iter()
            .map(|cmd| StageSpec::parse(cmd, StageKind::Sequential).unwrap())
            .collect()
    }

    fn wait_for(pipeline: &crate::pipeline::Pipeline, timeout: Duration) -> PipelineState {
        let deadline = Instant::now() + timeout;
        while !pipeline.state().is_terminal() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        pipeline.state()
    }

    #[test]
    fn trigger_replaces_running_pipeline() {
        let orchestrator = Orchestrator::new(Exchange::new(), specs(&["sleep 5"]))
            .kill_timeout(Duration::from_millis(500));

        let first = orchestrator.trigger().unwrap();
        thread::sleep(Duration::from_millis(100));
        let second = orchestrator.trigger().unwrap();

        assert_eq!(first.state(), PipelineState::Canceled);
        let deadline = Instant::now() + Duration::from_secs(2);
        while first.stage_states() != vec![StageState::Killed] && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(first.stage_states(), vec![StageState::Killed]);
        assert!(!second.is_canceled());
        assert!(Arc::ptr_eq(&orchestrator.current().unwrap(), &second));

        orchestrator.cancel_current();
        assert_eq!(wait_for(&second, Duration::from_secs(2)), PipelineState::Canceled);
    }

    #[test]
    fn concurrent_triggers_leave_one_pipeline_running() {
        let orchestrator = Arc::new(Orchestrator::new(Exchange::new(), specs(&["sleep 5"])));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let orchestrator = Arc::clone(&orchestrator);
                thread::spawn(move || orchestrator.trigger().unwrap())
            })
            .collect();
        let pipelines: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let current = orchestrator.current().unwrap();
        let live = pipelines.iter().filter(|p| !p.is_canceled()).count();
        assert_eq!(live, 1);
        assert!(!current.is_canceled());

        orchestrator.cancel_current();
    }

    #[test]
    fn rebuild_request_starts_a_pipeline() {
        let exchange = Exchange::new();
        let (tx, rx) = channel();
        exchange.listen(Topic::StageStatus, move |event| {
            let _ = tx.send(event);
        });

        let orchestrator = Arc::new(Orchestrator::new(exchange.clone(), specs(&["true"])));
        orchestrator.listen();
        exchange.send(Event::RebuildRequested);

        let mut states = Vec::new();
        while let Ok(Event::StageStatus(status)) = rx.recv_timeout(Duration::from_secs(2)) {
            states.push(status.state);
            if status.state.is_terminal() {
                break;
            }
        }
        assert!(states.contains(&StageState::Passed));

        let pipeline = orchestrator.current().unwrap();
        assert_eq!(wait_for(&pipeline, Duration::from_secs(2)), PipelineState::Passed);
    }
}
