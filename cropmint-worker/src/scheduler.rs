use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use cropmint_core::config::SchedulerSettings;
use cropmint_core::context::WorkerContext;
use cropmint_core::error::WorkerError;

use crate::orchestrator::{RecordOutcome, TokenizationOrchestrator};

/// Counts for one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    pub abandoned: usize,
    /// Outcomes the store could not record
    pub unrecorded: usize,
}

/// Result of one scheduler firing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiringReport {
    /// Another firing was still in flight; nothing was read
    Skipped,
    Ran(BatchSummary),
}

enum SchedulerEvent {
    ScanNow,
    Shutdown,
    Finished(Result<FiringReport, WorkerError>),
}

/// Handle for controlling a running scheduler from another thread
#[derive(Clone)]
pub struct SchedulerHandle {
    events: Sender<SchedulerEvent>,
}

impl SchedulerHandle {
    /// Stop ticking. An in-flight firing finishes its current record first.
    pub fn shutdown(&self) {
        let _ = self.events.send(SchedulerEvent::Shutdown);
    }

    /// Fire now instead of waiting for the next tick
    pub fn trigger_scan(&self) {
        let _ = self.events.send(SchedulerEvent::ScanNow);
    }
}

/// Clears the in-flight flag when the firing ends, including by panic
struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightGuard(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// State shared between the ticking loop and firing threads
struct Firing {
    orchestrator: Arc<TokenizationOrchestrator>,
    settings: SchedulerSettings,
    in_flight: AtomicBool,
    stopping: AtomicBool,
}

impl Firing {
    fn fire(&self) -> Result<FiringReport, WorkerError> {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            log::info!("Previous scan is still running; skipping this one");
            return Ok(FiringReport::Skipped);
        };

        let batch = self
            .orchestrator
            .store()
            .claim_next_batch(self.settings.batch_size)?;
        let mut summary = BatchSummary {
            claimed: batch.len(),
            ..Default::default()
        };
        if batch.is_empty() {
            log::debug!("No pending tokenization requests");
            return Ok(FiringReport::Ran(summary));
        }
        log::info!("Processing {} pending tokenization requests", batch.len());

        // Strictly one record at a time: token id recovery relies on it
        for (i, request) in batch.iter().enumerate() {
            if self.stopping.load(Ordering::Acquire) {
                log::info!(
                    "Shutdown requested; leaving {} requests pending",
                    batch.len() - i
                );
                break;
            }
            if i > 0 && !self.settings.record_delay.is_zero() {
                thread::sleep(self.settings.record_delay);
            }

            match self.orchestrator.process(request)? {
                RecordOutcome::Completed { .. } => summary.completed += 1,
                RecordOutcome::Failed { .. } => summary.failed += 1,
                RecordOutcome::Abandoned { .. } => summary.abandoned += 1,
                RecordOutcome::Unrecorded { .. } => summary.unrecorded += 1,
            }
        }

        log::info!(
            "Scan finished: {} claimed, {} completed, {} failed, {} abandoned, {} unrecorded",
            summary.claimed,
            summary.completed,
            summary.failed,
            summary.abandoned,
            summary.unrecorded
        );
        Ok(FiringReport::Ran(summary))
    }
}

/// Recurring single-flight polling loop over the tokenization queue
pub struct Scheduler {
    firing: Arc<Firing>,
    events_tx: Sender<SchedulerEvent>,
    events_rx: Mutex<Receiver<SchedulerEvent>>,
}

impl Scheduler {
    pub fn new(ctx: &WorkerContext, orchestrator: Arc<TokenizationOrchestrator>) -> Self {
        Self::with_settings(ctx.config().scheduler, orchestrator)
    }

    pub fn with_settings(
        settings: SchedulerSettings,
        orchestrator: Arc<TokenizationOrchestrator>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            firing: Arc::new(Firing {
                orchestrator,
                settings,
                in_flight: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
            }),
            events_tx,
            events_rx: Mutex::new(events_rx),
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            events: self.events_tx.clone(),
        }
    }

    /// Process one batch on the calling thread.
    ///
    /// Returns [`FiringReport::Skipped`] without touching the store if
    /// another firing is in flight.
    pub fn fire(&self) -> Result<FiringReport, WorkerError> {
        self.firing.fire()
    }

    /// Startup recovery followed by a single firing
    pub fn run_once(&self) -> Result<FiringReport, WorkerError> {
        self.firing.orchestrator.recover_interrupted()?;
        self.fire()
    }

    /// Startup recovery, an immediate scan, then one scan per poll interval until shutdown.
    ///
    /// Returns early with [`WorkerError::Halted`] when a ledger error makes
    /// further processing pointless.
    pub fn run(self) -> Result<(), WorkerError> {
        self.firing.orchestrator.recover_interrupted()?;

        let poll_interval = self.firing.settings.poll_interval;
        log::info!(
            "Scheduler started: batch size {}, poll interval {:?}",
            self.firing.settings.batch_size,
            poll_interval
        );

        let events = self
            .events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut threads = vec![self.dispatch()?];
        let mut next_tick = Instant::now() + poll_interval;
        let result = loop {
            let wait = next_tick.saturating_duration_since(Instant::now());
            match events.recv_timeout(wait) {
                Ok(SchedulerEvent::Shutdown) => break Ok(()),
                Ok(SchedulerEvent::Finished(result)) => {
                    if let Err(e) = handle_finished(result) {
                        break Err(e);
                    }
                    continue;
                }
                Ok(SchedulerEvent::ScanNow) => {}
                Err(RecvTimeoutError::Timeout) => next_tick = Instant::now() + poll_interval,
                // The scheduler holds a sender itself
                Err(RecvTimeoutError::Disconnected) => break Ok(()),
            }

            threads.retain(|handle| !handle.is_finished());
            match self.dispatch() {
                Ok(handle) => threads.push(handle),
                Err(e) => break Err(e),
            }
        };

        self.firing.stopping.store(true, Ordering::Release);
        if !threads.is_empty() {
            log::info!("Waiting for in-flight scan to finish");
        }
        for handle in threads {
            if handle.join().is_err() {
                log::error!("A scan thread panicked");
            }
        }

        // A firing that ended during shutdown may still carry a halting error
        let mut result = result;
        while let Ok(event) = events.try_recv() {
            if let SchedulerEvent::Finished(finished) = event {
                if let Err(e) = handle_finished(finished) {
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }

        log::info!("Scheduler stopped");
        result
    }

    fn dispatch(&self) -> Result<JoinHandle<()>, WorkerError> {
        let firing = Arc::clone(&self.firing);
        let events = self.events_tx.clone();
        thread::Builder::new()
            .name("cropmint-scan".to_string())
            .spawn(move || {
                let result = firing.fire();
                let _ = events.send(SchedulerEvent::Finished(result));
            })
            .map_err(|e| WorkerError::Thread(format!("failed to spawn scan thread: {}", e)))
    }
}

/// Log a finished firing; only a halting error is passed on
fn handle_finished(result: Result<FiringReport, WorkerError>) -> Result<(), WorkerError> {
    match result {
        Ok(FiringReport::Skipped) | Ok(FiringReport::Ran(_)) => Ok(()),
        Err(WorkerError::Halted(e)) => Err(WorkerError::Halted(e)),
        Err(e) => {
            log::error!("Scan failed: {}", e);
            Ok(())
        }
    }
}
