//! Shared orchestration for the diagnostics tests.
//!
//! Each orchestrator owns a [`TestHandle`] and describes one run as a
//! [`TestRun`]. The handle spawns a driver task that feeds events through
//! [`state::transition`] and executes the resulting effects: launching the
//! probes, ticking, tearing down and publishing the report to the
//! [`ResultStore`].

pub mod errors;
pub mod state;

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::report::TestReport;
use crate::storage::ResultStore;

pub use errors::{ErrorCollector, ErrorEvent, ErrorKind};
pub use state::{transition, Effect, TestEvent, TestState};

/// Identity of one run, stamped on its report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunMeta {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launch {
    /// Probes are in flight.
    Ready,
    /// Nothing to measure; go straight to teardown.
    Halted,
}

/// One run of a diagnostics test.
#[async_trait::async_trait]
pub trait TestRun: Send + 'static {
    /// Message a spawned probe sends back when it settles.
    type Settlement: Send + 'static;

    fn name(&self) -> &'static str;

    /// Overall bound on the run, armed at launch.
    fn deadline(&self) -> Option<Duration> {
        None
    }

    /// Period of [`tick`](Self::tick) while running.
    fn tick_interval(&self) -> Option<Duration> {
        None
    }

    async fn launch(&mut self, settlements: mpsc::UnboundedSender<Self::Settlement>) -> Launch;

    /// Periodic work while running. Returns true to request a stop.
    async fn tick(&mut self) -> bool {
        false
    }

    /// Fold one settlement in. Returns true once every probe has settled.
    fn settle(&mut self, settlement: Self::Settlement) -> bool;

    /// Release every in-flight resource. Must not fail.
    async fn teardown(&mut self);

    fn report(&mut self, meta: RunMeta) -> TestReport;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Stop,
    Abort,
}

/// Lifecycle handle owned by an orchestrator.
pub struct TestHandle {
    name: &'static str,
    state: Arc<watch::Sender<TestState>>,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    last_run: Mutex<Option<RunMeta>>,
    store: ResultStore,
}

impl TestHandle {
    pub fn new(name: &'static str, store: ResultStore) -> Self {
        let (state, _) = watch::channel(TestState::Idle);
        Self {
            name,
            state: Arc::new(state),
            commands: Mutex::new(None),
            last_run: Mutex::new(None),
            store,
        }
    }

    pub fn state(&self) -> TestState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<TestState> {
        self.state.subscribe()
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    /// Identity of the most recently started run.
    pub fn last_run(&self) -> Option<RunMeta> {
        *self.last_run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start `run` unless a run is already in flight. Returns whether it
    /// started.
    pub fn start<R: TestRun>(&self, run: R) -> bool {
        // Held across the state swap so a concurrent stop lands on the new
        // channel.
        let mut commands = self.commands();
        let mut accepted = None;
        self.state.send_if_modified(|current| match transition(*current, TestEvent::Start) {
            Some((next, effects)) => {
                *current = next;
                accepted = Some((next, effects));
                true
            }
            None => {
                debug!(test = self.name, state = %current, "start ignored");
                false
            }
        });
        let Some((next, effects)) = accepted else {
            return false;
        };
        let (tx, rx) = mpsc::unbounded_channel();
        *commands = Some(tx);
        drop(commands);

        let meta = RunMeta {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
        };
        *self.last_run.lock().unwrap_or_else(PoisonError::into_inner) = Some(meta);
        info!(test = self.name, id = %meta.id, "test started");
        let machine = Machine {
            name: self.name,
            current: next,
            state: Arc::clone(&self.state),
            effects: effects.into(),
        };
        tokio::spawn(drive(run, machine, rx, self.store.clone(), meta));
        true
    }

    /// Request a graceful stop. A no-op unless a run is in flight.
    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    /// Tear the run down without publishing a report.
    pub fn abort(&self) {
        self.send(Command::Abort);
    }

    /// Wait until no run is in flight and return the resulting state.
    pub async fn wait(&self) -> TestState {
        let mut rx = self.subscribe();
        let state = match rx.wait_for(TestState::is_settled).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }

    fn send(&self, command: Command) {
        let state = self.state();
        if !state.is_active() {
            debug!(test = self.name, %state, ?command, "command ignored");
            return;
        }
        if let Some(tx) = self.commands().as_ref() {
            let _ = tx.send(command);
        }
    }

    fn commands(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Command>>> {
        self.commands.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Machine {
    name: &'static str,
    current: TestState,
    state: Arc<watch::Sender<TestState>>,
    effects: VecDeque<Effect>,
}

impl Machine {
    fn fire(&mut self, event: TestEvent) {
        match transition(self.current, event) {
            Some((next, effects)) => {
                debug!(test = self.name, from = %self.current, to = %next, ?event, "state transition");
                self.current = next;
                // Settled states are announced by the driver once teardown
                // and publish have run.
                if !next.is_settled() {
                    self.state.send_replace(next);
                }
                self.effects.extend(effects);
            }
            None => trace!(test = self.name, state = %self.current, ?event, "event ignored"),
        }
    }
}

fn command_event(command: Option<Command>) -> TestEvent {
    match command {
        Some(Command::Stop) => TestEvent::Stop,
        // A dropped handle cannot observe the run anymore.
        Some(Command::Abort) | None => TestEvent::Abort,
    }
}

async fn until(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn drive<R: TestRun>(
    mut run: R,
    mut machine: Machine,
    mut commands: mpsc::UnboundedReceiver<Command>,
    store: ResultStore,
    meta: RunMeta,
) {
    let (settle_tx, mut settle_rx) = mpsc::unbounded_channel();
    let mut deadline: Option<Pin<Box<Sleep>>> = None;
    let mut ticker: Option<Interval> = None;

    loop {
        while let Some(effect) = machine.effects.pop_front() {
            match effect {
                Effect::Launch => {
                    deadline = run.deadline().map(|d| Box::pin(tokio::time::sleep(d)));
                    let launched = tokio::select! {
                        outcome = run.launch(settle_tx.clone()) => Ok(outcome),
                        command = commands.recv() => Err(command),
                    };
                    let event = match launched {
                        Ok(Launch::Ready) => TestEvent::Launched,
                        Ok(Launch::Halted) => TestEvent::PreconditionFailed,
                        Err(command) => command_event(command),
                    };
                    machine.fire(event);
                }
                Effect::Monitor => {
                    ticker = run.tick_interval().map(|period| {
                        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        interval
                    });
                }
                Effect::Teardown => {
                    deadline = None;
                    ticker = None;
                    run.teardown().await;
                    machine.fire(TestEvent::TornDown);
                }
                Effect::Publish => {
                    let report = run.report(meta);
                    info!(test = machine.name, id = %meta.id, result = %report.result_str(), "test finished");
                    store.publish(report);
                }
            }
        }

        if machine.current.is_settled() {
            if machine.current == TestState::Aborted {
                info!(test = machine.name, id = %meta.id, "test aborted");
            }
            machine.state.send_replace(machine.current);
            break;
        }

        let event = tokio::select! {
            command = commands.recv() => command_event(command),
            Some(settlement) = settle_rx.recv() => {
                if run.settle(settlement) {
                    TestEvent::AllSettled
                } else {
                    continue;
                }
            }
            _ = until(&mut deadline) => {
                deadline = None;
                debug!(test = machine.name, "deadline reached");
                TestEvent::Deadline
            }
            _ = next_tick(&mut ticker) => {
                if run.tick().await {
                    TestEvent::Stop
                } else {
                    continue;
                }
            }
        };
        machine.fire(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Verdict;
    use crate::report::{ReachabilityReport, ReportKey};

    /// Run with `n` probes that settle after `delay` each.
    struct Scripted {
        probes: usize,
        settled: usize,
        delay: Duration,
        torn_down: Arc<Mutex<usize>>,
    }

    #[async_trait::async_trait]
    impl TestRun for Scripted {
        type Settlement = ();

        fn name(&self) -> &'static str {
            "scripted"
        }

        fn deadline(&self) -> Option<Duration> {
            Some(Duration::from_secs(30))
        }

        async fn launch(&mut self, settlements: mpsc::UnboundedSender<()>) -> Launch {
            if self.probes == 0 {
                return Launch::Halted;
            }
            for _ in 0..self.probes {
                let tx = settlements.clone();
                let delay = self.delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(());
                });
            }
            Launch::Ready
        }

        fn settle(&mut self, _: ()) -> bool {
            self.settled += 1;
            self.settled == self.probes
        }

        async fn teardown(&mut self) {
            *self.torn_down.lock().unwrap() += 1;
        }

        fn report(&mut self, meta: RunMeta) -> TestReport {
            TestReport::Reachability(ReachabilityReport {
                result: if self.settled == self.probes { Verdict::Passed } else { Verdict::Failed },
                passed_regions: Vec::new(),
                failed_regions: Vec::new(),
                errors: Vec::new(),
                started_at: meta.started_at,
                id: meta.id,
            })
        }
    }

    fn scripted(probes: usize, delay_secs: u64) -> (Scripted, Arc<Mutex<usize>>) {
        let torn_down = Arc::new(Mutex::new(0));
        let run = Scripted {
            probes,
            settled: 0,
            delay: Duration::from_secs(delay_secs),
            torn_down: Arc::clone(&torn_down),
        };
        (run, torn_down)
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_finishes_when_all_settled() {
        let store = ResultStore::new();
        let handle = TestHandle::new("scripted", store.clone());
        let (run, torn_down) = scripted(3, 1);
        assert!(handle.start(run));
        assert_eq!(handle.state(), TestState::Starting);

        assert_eq!(handle.wait().await, TestState::Finished);
        assert_eq!(*torn_down.lock().unwrap(), 1);
        let report = store.get(ReportKey::Reachability).unwrap();
        assert_eq!(report.result(), Some(Verdict::Passed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_run() {
        let store = ResultStore::new();
        let handle = TestHandle::new("scripted", store.clone());
        let (run, _) = scripted(2, 120);
        handle.start(run);

        let before = Instant::now();
        assert_eq!(handle.wait().await, TestState::Finished);
        assert!(before.elapsed() >= Duration::from_secs(30));
        assert!(before.elapsed() < Duration::from_secs(120));
        let report = store.get(ReportKey::Reachability).unwrap();
        assert_eq!(report.result(), Some(Verdict::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_halted_launch_still_publishes() {
        let store = ResultStore::new();
        let handle = TestHandle::new("scripted", store.clone());
        let (run, torn_down) = scripted(0, 1);
        handle.start(run);
        assert_eq!(handle.wait().await, TestState::Finished);
        assert_eq!(*torn_down.lock().unwrap(), 1);
        assert!(store.get(ReportKey::Reachability).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_skips_publish() {
        let store = ResultStore::new();
        let handle = TestHandle::new("scripted", store.clone());
        let (run, torn_down) = scripted(2, 10);
        handle.start(run);
        tokio::task::yield_now().await;
        handle.abort();

        assert_eq!(handle.wait().await, TestState::Aborted);
        assert_eq!(*torn_down.lock().unwrap(), 1);
        assert!(store.get(ReportKey::Reachability).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_when_finished_is_noop() {
        let store = ResultStore::new();
        let handle = TestHandle::new("scripted", store.clone());
        let (run, _) = scripted(1, 1);
        handle.start(run);
        handle.wait().await;
        let before = store.get(ReportKey::Reachability).unwrap();

        handle.stop();
        tokio::task::yield_now().await;
        assert_eq!(handle.state(), TestState::Finished);
        assert_eq!(store.get(ReportKey::Reachability).unwrap(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_ignored_while_running() {
        let handle = TestHandle::new("scripted", ResultStore::new());
        let (first, _) = scripted(1, 5);
        let (second, second_torn) = scripted(1, 5);
        assert!(handle.start(first));
        assert!(!handle.start(second));
        handle.wait().await;
        assert_eq!(*second_torn.lock().unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_wait_returns_after_teardown_and_publish() {
        let store = ResultStore::new();
        let handle = TestHandle::new("scripted", store.clone());
        let mut previous = None;
        for round in 1..=200 {
            let (run, torn_down) = scripted(1, 0);
            assert!(handle.start(run));
            assert_eq!(handle.wait().await, TestState::Finished);
            assert_eq!(*torn_down.lock().unwrap(), 1, "round {round}");
            let id = store.get(ReportKey::Reachability).unwrap().id();
            assert_ne!(Some(id), previous, "round {round} saw the previous report");
            previous = Some(id);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_aborted_is_announced_after_teardown() {
        let handle = TestHandle::new("scripted", ResultStore::new());
        for _ in 0..50 {
            let (run, torn_down) = scripted(1, 60);
            assert!(handle.start(run));
            handle.abort();
            assert_eq!(handle.wait().await, TestState::Aborted);
            assert_eq!(*torn_down.lock().unwrap(), 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_admit_one_run() {
        let handle = Arc::new(TestHandle::new("scripted", ResultStore::new()));
        let attempts: Vec<_> = (0..16)
            .map(|_| {
                let handle = Arc::clone(&handle);
                tokio::spawn(async move {
                    let (run, _) = scripted(1, 60);
                    handle.start(run)
                })
            })
            .collect();
        let mut started = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                started += 1;
            }
        }
        assert_eq!(started, 1);

        handle.abort();
        assert_eq!(handle.wait().await, TestState::Aborted);
    }
}
