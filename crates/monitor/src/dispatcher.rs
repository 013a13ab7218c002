#![forbid(unsafe_code)]

//! Analysis worker consuming classification tokens.
//!
//! The dispatcher never touches the introspection session. For every changed
//! class it asks the poll thread to rescan (over `rescans`) and then runs the
//! class's forensic check itself. Checks run one at a time, so a slow check
//! holds back the tokens behind it. A running check is abandoned once the
//! shared abort flag is raised, so shutdown never waits on one.

use crate::domain::ClassificationToken;
use crate::error::Error;
use crate::forensic::{CheckOutcome, ForensicCheck};
use crate::queue::EventQueue;
use config::ObjectClass;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

const THREAD_NAME: &str = "hawk-dispatch";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    /// A token for a class that is not being monitored.
    UnrecognizedToken(ClassificationToken),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Tokens handled, per class.
    pub handled: [u64; ObjectClass::ALL.len()],
    /// Tokens folded into the rescan of an identical token ahead of them.
    pub coalesced: u64,
    pub checks_run: u64,
    pub check_failures: u64,
    pub checks_timed_out: u64,
    /// Checks killed, or skipped, because of shutdown.
    pub checks_aborted: u64,
    pub stop: Option<StopReason>,
}

pub struct AnalysisDispatcher {
    queue: Arc<EventQueue>,
    classes: Vec<ObjectClass>,
    rescans: flume::Sender<ObjectClass>,
    abort: Arc<AtomicBool>,
    check: Box<dyn ForensicCheck + Send>,
    state: DispatcherState,
    report: DispatchReport,
}

impl AnalysisDispatcher {
    pub fn new(
        queue: Arc<EventQueue>,
        classes: Vec<ObjectClass>,
        rescans: flume::Sender<ObjectClass>,
        abort: Arc<AtomicBool>,
        check: Box<dyn ForensicCheck + Send>,
    ) -> Self {
        Self {
            queue,
            classes,
            rescans,
            abort,
            check,
            state: DispatcherState::Running,
            report: DispatchReport::default(),
        }
    }

    pub fn state(&self) -> DispatcherState {
        self.state
    }

    /// Handle one token, blocking until there is one.
    pub fn step(&mut self) -> DispatcherState {
        if self.state == DispatcherState::Stopped {
            return self.state;
        }

        let token = self.queue.pop();
        let class = match token.class() {
            None => {
                debug!("shutdown token received");
                return self.stop(StopReason::Shutdown);
            }
            Some(class) if self.classes.contains(&class) => class,
            Some(_) => {
                error!(?token, "token for a class that is not monitored; halting analysis");
                return self.stop(StopReason::UnrecognizedToken(token));
            }
        };

        let coalesced = self.queue.drain_while(|next| *next == token);
        self.report.coalesced += coalesced as u64;
        self.report.handled[class.index()] += 1 + coalesced as u64;

        if self.rescans.send(class).is_err() {
            debug!(%class, "poll thread gone; rescan dropped");
        }

        match self.check.run(class, &self.abort) {
            Ok(CheckOutcome::Completed) => self.report.checks_run += 1,
            Ok(CheckOutcome::NotConfigured) => {}
            Ok(CheckOutcome::TimedOut) => self.report.checks_timed_out += 1,
            Ok(CheckOutcome::Aborted) => self.report.checks_aborted += 1,
            Err(err) => {
                self.report.check_failures += 1;
                warn!(%err, "forensic check failed");
            }
        }
        self.state
    }

    /// Consume tokens until stopped.
    pub fn run(mut self) -> DispatchReport {
        info!(classes = ?self.classes, "analysis dispatcher started");
        while self.step() == DispatcherState::Running {}
        info!(stop = ?self.report.stop, checks = self.report.checks_run, "analysis dispatcher stopped");
        self.report
    }

    /// Run on a dedicated thread.
    pub fn spawn(self) -> Result<DispatcherHandle, Error> {
        let handle = std::thread::Builder::new()
            .name(THREAD_NAME.into())
            .spawn(move || self.run())
            .map_err(|source| Error::ThreadSpawn {
                name: THREAD_NAME,
                source,
            })?;
        Ok(DispatcherHandle { handle })
    }

    fn stop(&mut self, reason: StopReason) -> DispatcherState {
        self.state = DispatcherState::Stopped;
        self.report.stop = Some(reason);
        self.state
    }
}

pub struct DispatcherHandle {
    handle: JoinHandle<DispatchReport>,
}

impl DispatcherHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> Result<DispatchReport, Error> {
        self.handle.join().map_err(|_| Error::DispatcherPanicked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forensic::{CheckError, CommandCheck};
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};
    use ClassificationToken::*;
    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<ObjectClass>>>);

    impl ForensicCheck for Recorder {
        fn run(&mut self, class: ObjectClass, _abort: &AtomicBool) -> Result<CheckOutcome, CheckError> {
            self.0.lock().push(class);
            Ok(CheckOutcome::Completed)
        }
    }

    fn dispatcher(
        classes: &[ObjectClass],
    ) -> (
        AnalysisDispatcher,
        Arc<EventQueue>,
        flume::Receiver<ObjectClass>,
        Recorder,
    ) {
        let queue = Arc::new(EventQueue::new());
        let (tx, rx) = flume::unbounded();
        let recorder = Recorder::default();
        let dispatcher = AnalysisDispatcher::new(
            Arc::clone(&queue),
            classes.to_vec(),
            tx,
            Arc::new(AtomicBool::new(false)),
            Box::new(recorder.clone()),
        );
        (dispatcher, queue, rx, recorder)
    }

    #[test]
    fn rescans_and_checks_each_changed_class() {
        let (dispatcher, queue, rescans, recorder) = dispatcher(&ObjectClass::ALL);
        for token in [Process, Module, Shutdown] {
            queue.push_back(token);
        }

        let report = dispatcher.run();

        assert_eq!(report.stop, Some(StopReason::Shutdown));
        assert_eq!(report.checks_run, 2);
        assert_eq!(
            rescans.try_iter().collect::<Vec<_>>(),
            [ObjectClass::Process, ObjectClass::Module]
        );
        assert_eq!(*recorder.0.lock(), [ObjectClass::Process, ObjectClass::Module]);
    }

    #[test]
    fn burst_of_one_class_is_coalesced() {
        let (dispatcher, queue, rescans, recorder) = dispatcher(&ObjectClass::ALL);
        for token in [Module, Module, Module, Process, Module, Shutdown] {
            queue.push_back(token);
        }

        let report = dispatcher.run();

        assert_eq!(report.coalesced, 2);
        assert_eq!(report.handled[ObjectClass::Module.index()], 4);
        assert_eq!(recorder.0.lock().len(), 3);
        assert_eq!(rescans.len(), 3);
    }

    #[test]
    fn urgent_shutdown_skips_pending_tokens() {
        let (dispatcher, queue, _rescans, recorder) = dispatcher(&ObjectClass::ALL);
        queue.push_back(Process);
        queue.push_back(Module);
        queue.push_front(Shutdown);

        let report = dispatcher.run();

        assert_eq!(report.stop, Some(StopReason::Shutdown));
        assert!(recorder.0.lock().is_empty());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn token_for_unmonitored_class_halts() {
        let (mut dispatcher, queue, _rescans, _) = dispatcher(&[ObjectClass::Process]);
        queue.push_back(SocketInfo);
        queue.push_back(Process);

        assert_eq!(dispatcher.step(), DispatcherState::Stopped);
        assert_eq!(dispatcher.step(), DispatcherState::Stopped);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn shutdown_from_another_thread_stops_worker() {
        let (dispatcher, queue, _rescans, _) = dispatcher(&ObjectClass::ALL);
        let handle = dispatcher.spawn().unwrap();
        queue.push_back(OpenFiles);
        queue.push_front(Shutdown);

        let report = handle.join().unwrap();
        assert_eq!(report.stop, Some(StopReason::Shutdown));
    }

    #[test]
    fn shutdown_does_not_wait_for_a_hung_check() {
        let queue = Arc::new(EventQueue::new());
        let abort = Arc::new(AtomicBool::new(false));
        let (tx, _rescans) = flume::unbounded();
        let checks = config::Checks {
            process: Some(vec!["sleep".into(), "10".into()]),
            ..Default::default()
        };
        let handle = AnalysisDispatcher::new(
            Arc::clone(&queue),
            ObjectClass::ALL.to_vec(),
            tx,
            Arc::clone(&abort),
            Box::new(CommandCheck::new("victim", checks)),
        )
        .spawn()
        .unwrap();

        queue.push_back(Process);
        std::thread::sleep(Duration::from_millis(200));
        let started = Instant::now();
        abort.store(true, Ordering::SeqCst);
        queue.push_front(Shutdown);
        let report = handle.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(report.stop, Some(StopReason::Shutdown));
        assert_eq!(report.checks_run, 0);
        assert_eq!(report.checks_aborted, 1);
    }
}
