#![forbid(unsafe_code)]

use crate::classifier::WriteClassifier;
use crate::discovery::discover;
use crate::dispatcher::{AnalysisDispatcher, DispatchReport, DispatcherHandle};
use crate::domain::ClassificationToken;
use crate::error::Error;
use crate::forensic::ForensicCheck;
use crate::introspection::{Connector, IntrospectionError, Introspector};
use crate::queue::EventQueue;
use crate::registry::WatchpointRegistry;
use crate::stats::Statistics;
use config::{Config, ObjectClass};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

/// Stops a running [`Monitor`] from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    interrupt: Arc<AtomicBool>,
    queue: Arc<EventQueue>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
        self.queue.push_front(ClassificationToken::Shutdown);
    }

    pub fn is_triggered(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub stats: Statistics,
    pub dispatch: Option<DispatchReport>,
    /// Watchpoints cleared at teardown.
    pub cleared: usize,
    /// Rescans performed on behalf of the dispatcher.
    pub rescans: usize,
    /// Set when polling ended because the session failed.
    pub poll_error: Option<IntrospectionError>,
}

/// One monitoring session against one guest.
///
/// Owns everything the poll thread touches: the introspection session, the
/// registry and the counters. The dispatcher thread only shares the queue
/// and the rescan channel.
pub struct Monitor<S: Introspector> {
    config: Config,
    session: S,
    registry: WatchpointRegistry,
    stats: Statistics,
    queue: Arc<EventQueue>,
    interrupt: Arc<AtomicBool>,
    rescan_tx: flume::Sender<ObjectClass>,
    rescan_rx: flume::Receiver<ObjectClass>,
    dispatcher: Option<DispatcherHandle>,
    paused: bool,
    rescans: usize,
}

impl<S: Introspector> Monitor<S> {
    pub fn new(config: Config, session: S) -> Self {
        let (rescan_tx, rescan_rx) = flume::unbounded();
        Self {
            config,
            session,
            registry: WatchpointRegistry::new(),
            stats: Statistics::default(),
            queue: Arc::new(EventQueue::new()),
            interrupt: Arc::new(AtomicBool::new(false)),
            rescan_tx,
            rescan_rx,
            dispatcher: None,
            paused: false,
            rescans: 0,
        }
    }

    /// Open a session to `guest` through `connector`.
    pub fn open<C>(connector: &C, guest: &str, config: Config) -> Result<Self, Error>
    where
        C: Connector<Session = S>,
    {
        let session = connector
            .connect(guest)
            .map_err(|source| Error::CollaboratorInit {
                guest: guest.to_string(),
                source,
            })?;
        info!(guest, "introspection session open");
        Ok(Self::new(config, session))
    }

    /// Share an externally owned interruption flag, e.g. one set from a
    /// signal handler.
    pub fn with_interrupt(mut self, interrupt: Arc<AtomicBool>) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            interrupt: Arc::clone(&self.interrupt),
            queue: Arc::clone(&self.queue),
        }
    }

    pub fn registry(&self) -> &WatchpointRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    /// Start up, poll until interrupted, then tear down.
    ///
    /// Startup failures still tear down whatever was set up before
    /// returning the error.
    pub fn run(mut self, check: Box<dyn ForensicCheck + Send>) -> Result<RunReport, Error> {
        if let Err(err) = self.start(check) {
            error!(%err, "startup failed");
            self.teardown(None);
            return Err(err);
        }
        let poll_error = self.poll_loop();
        Ok(self.teardown(poll_error))
    }

    /// Pause the guest if configured, start the dispatcher and install the
    /// initial watchpoints.
    pub fn start(&mut self, check: Box<dyn ForensicCheck + Send>) -> Result<(), Error> {
        if self.config.session.pause_during_setup {
            self.session.pause().map_err(Error::Pause)?;
            self.paused = true;
            debug!("guest paused for setup");
        }

        let classes = self.config.session.classes.clone();
        let dispatcher = AnalysisDispatcher::new(
            Arc::clone(&self.queue),
            classes.clone(),
            self.rescan_tx.clone(),
            Arc::clone(&self.interrupt),
            check,
        );
        self.dispatcher = Some(dispatcher.spawn()?);

        for class in classes {
            self.register_class(class)?;
        }

        if self.paused {
            self.session.resume()?;
            self.paused = false;
        }
        info!(
            guest = self.session.guest_name(),
            watchpoints = self.registry.len(),
            targets = self.registry.target_count(),
            mode = ?self.config.session.mode,
            "monitoring started"
        );
        Ok(())
    }

    /// Discover and watch every object of `class`. Returns the number of
    /// targets registered.
    pub fn register_class(&mut self, class: ObjectClass) -> Result<usize, Error> {
        let targets = discover(&mut self.session, &self.config.layout, class)
            .map_err(|source| Error::WalkAbort { class, source })?;
        let attempted = targets.len();
        let registered = self.registry.register_batch(&mut self.session, targets);
        if attempted > 0 && registered == 0 {
            return Err(Error::Register { class, attempted });
        }
        info!(%class, registered, attempted, "registration pass complete");
        Ok(registered)
    }

    fn poll_loop(&mut self) -> Option<IntrospectionError> {
        let timeout = self.config.session.poll_timeout;
        let mode = self.config.session.mode;
        let mut dispatcher_gone = false;

        while !self.interrupt.load(Ordering::SeqCst) {
            let mut classifier =
                WriteClassifier::new(&mut self.registry, &mut self.stats, &self.queue, mode);
            if let Err(err) = self.session.poll(timeout, &mut classifier) {
                error!(%err, "event poll failed; shutting down");
                self.interrupt.store(true, Ordering::SeqCst);
                return Some(err);
            }

            self.service_rescans();

            if !dispatcher_gone
                && self
                    .dispatcher
                    .as_ref()
                    .is_some_and(DispatcherHandle::is_finished)
            {
                warn!("analysis dispatcher exited; writes are still counted but not analysed");
                dispatcher_gone = true;
            }
        }
        info!("interrupted; stopping");
        None
    }

    /// Run the rescans the dispatcher asked for since the last poll slice,
    /// once per class.
    fn service_rescans(&mut self) {
        let pending: BTreeSet<ObjectClass> = self.rescan_rx.try_iter().collect();
        if pending.is_empty() {
            return;
        }

        let paused = self.config.session.pause_during_setup
            && match self.session.pause() {
                Ok(()) => true,
                Err(err) => {
                    warn!(%err, "rescanning without pausing the guest");
                    false
                }
            };

        for class in pending {
            match discover(&mut self.session, &self.config.layout, class) {
                Ok(targets) => {
                    let outcome = self.registry.reconcile(&mut self.session, class, targets);
                    self.rescans += 1;
                    debug!(%class, ?outcome, "rescan complete");
                }
                Err(err) => warn!(%class, %err, "rescan aborted; keeping current watchpoints"),
            }
        }

        if paused
            && let Err(err) = self.session.resume()
        {
            error!(%err, "failed to resume guest after rescan; shutting down");
            self.interrupt.store(true, Ordering::SeqCst);
        }
    }

    /// Stop the dispatcher, clear every watchpoint and close the session.
    fn teardown(&mut self, poll_error: Option<IntrospectionError>) -> RunReport {
        self.interrupt.store(true, Ordering::SeqCst);
        self.queue.push_front(ClassificationToken::Shutdown);

        let dispatch = match self.dispatcher.take().map(DispatcherHandle::join) {
            Some(Ok(report)) => Some(report),
            Some(Err(err)) => {
                error!(%err, "failed to join dispatcher");
                None
            }
            None => None,
        };

        if self.config.session.pause_during_setup && !self.paused {
            match self.session.pause() {
                Ok(()) => self.paused = true,
                Err(err) => warn!(%err, "clearing watchpoints on a running guest"),
            }
        }

        let cleared = self.registry.unregister_all(&mut self.session);
        debug!(cleared, "watchpoints cleared");

        if self.config.session.resume_on_exit {
            match self.session.resume() {
                Ok(()) => self.paused = false,
                Err(err) => error!(%err, "failed to resume guest"),
            }
        }
        if let Err(err) = self.session.close() {
            warn!(%err, "failed to close introspection session");
        }

        let stats = std::mem::take(&mut self.stats);
        info!(
            monitored = stats.monitored_total,
            irrelevant = stats.irrelevant_total,
            irrelevant_pct = stats.irrelevant_percentage(),
            rearm_failures = stats.rearm_failures,
            rescans = self.rescans,
            "final statistics"
        );

        RunReport {
            stats,
            dispatch,
            cleared,
            rescans: self.rescans,
            poll_error,
        }
    }
}

impl<S: Introspector> Drop for Monitor<S> {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            self.interrupt.store(true, Ordering::SeqCst);
            self.queue.push_front(ClassificationToken::Shutdown);
            if let Err(err) = dispatcher.join() {
                error!(%err, "failed to join dispatcher");
            }
        }
    }
}
