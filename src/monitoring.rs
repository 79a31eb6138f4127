//! Card observation state machine and its monitoring jobs.
//!
//! Each observable reader owns one state service. The service reacts to the
//! internal events posted by the monitoring jobs, the driver callbacks and
//! the application, and runs at most one monitoring job at a time on the
//! reader's single-worker executor.

// ───── Std Lib ─────
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

// ───── Crates ─────
use log::{debug, trace, warn};

// ───── Local Modules ─────
use crate::error::BoxedError;
use crate::executor::{lock, Executor};
use crate::observable::{DetectionMode, ObservableReaderCore};
use crate::observation::ReaderEvent;
use crate::spi::MonitoringCapability;

/// Current position of a reader in the card observation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitoringState {
    WaitForStartDetection,
    WaitForCardInsertion,
    WaitForCardProcessing,
    WaitForCardRemoval,
}

/// The events that drive the observation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InternalEvent {
    CardInserted,
    CardRemoved,
    CardProcessed,
    StartDetect,
    StopDetect,
}

enum JobKind {
    ActiveInsertion,
    PassiveInsertion,
    ActiveRemoval,
    PassiveRemoval,
    PresenceMonitor,
}

struct RunningJob {
    should_stop: Arc<AtomicBool>,
    kind: JobKind,
}

struct CurrentState {
    state: MonitoringState,
    job: Option<RunningJob>,
}

/// Serializes the state transitions of one observable reader and manages
/// the monitoring job attached to the current state.
pub(crate) struct ReaderStateService {
    reader: Weak<ObservableReaderCore>,
    executor: Executor,
    current: Mutex<CurrentState>,
}

impl ReaderStateService {
    pub(crate) fn new(reader: Weak<ObservableReaderCore>, reader_name: &str) -> Self {
        ReaderStateService {
            reader,
            executor: Executor::new(reader_name),
            current: Mutex::new(CurrentState {
                state: MonitoringState::WaitForStartDetection,
                job: None,
            }),
        }
    }

    pub(crate) fn current_monitoring_state(&self) -> MonitoringState {
        lock(&self.current).state
    }

    /// Applies one internal event to the current state. Transitions are
    /// serialized; observer notifications happen after the transition
    /// completed so that an observer may post the next event synchronously.
    pub(crate) fn on_event(&self, event: InternalEvent) {
        let Some(reader) = self.reader.upgrade() else {
            return;
        };
        let mut notifications: Vec<ReaderEvent> = Vec::new();
        {
            let mut current = lock(&self.current);
            debug!(
                "Reader [{}] in state [{:?}] processes internal event [{:?}]",
                reader.name(),
                current.state,
                event
            );
            match (current.state, event) {
                (MonitoringState::WaitForStartDetection, InternalEvent::StartDetect) => {
                    self.switch_state_locked(&reader, &mut current, MonitoringState::WaitForCardInsertion);
                }
                (MonitoringState::WaitForCardInsertion, InternalEvent::CardInserted) => {
                    match reader.process_card_inserted() {
                        Some(reader_event) => {
                            self.switch_state_locked(
                                &reader,
                                &mut current,
                                MonitoringState::WaitForCardProcessing,
                            );
                            notifications.push(reader_event);
                        }
                        None => {
                            // no event for the application, re-arm detection
                            self.switch_state_locked(
                                &reader,
                                &mut current,
                                MonitoringState::WaitForCardInsertion,
                            );
                        }
                    }
                }
                (MonitoringState::WaitForCardInsertion, InternalEvent::CardRemoved) => {
                    trace!("Reader [{}] already waits for an insertion", reader.name());
                }
                (MonitoringState::WaitForCardInsertion, InternalEvent::StopDetect) => {
                    self.switch_state_locked(&reader, &mut current, MonitoringState::WaitForStartDetection);
                }
                (MonitoringState::WaitForCardProcessing, InternalEvent::CardProcessed) => {
                    let next = if reader.detection_mode() == DetectionMode::Repeating {
                        MonitoringState::WaitForCardRemoval
                    } else {
                        MonitoringState::WaitForStartDetection
                    };
                    self.switch_state_locked(&reader, &mut current, next);
                }
                (MonitoringState::WaitForCardProcessing, InternalEvent::CardRemoved)
                | (MonitoringState::WaitForCardRemoval, InternalEvent::CardRemoved) => {
                    if let Some(reader_event) = reader.process_card_removed() {
                        notifications.push(reader_event);
                    }
                    let next = if reader.detection_mode() == DetectionMode::Repeating {
                        MonitoringState::WaitForCardInsertion
                    } else {
                        MonitoringState::WaitForStartDetection
                    };
                    self.switch_state_locked(&reader, &mut current, next);
                }
                (MonitoringState::WaitForCardProcessing, InternalEvent::StopDetect)
                | (MonitoringState::WaitForCardRemoval, InternalEvent::StopDetect) => {
                    self.switch_state_locked(&reader, &mut current, MonitoringState::WaitForStartDetection);
                }
                (state, event) => {
                    debug!(
                        "Reader [{}] ignores event [{:?}] in state [{:?}]",
                        reader.name(),
                        event,
                        state
                    );
                }
            }
        }
        for reader_event in notifications {
            reader.notify_observers(&reader_event);
        }
    }

    /// Cancels the running job and shuts the executor down. Invoked when
    /// the reader is unregistered.
    pub(crate) fn shutdown(&self) {
        {
            let mut current = lock(&self.current);
            if let Some(job) = current.job.take() {
                self.stop_job(job);
            }
            current.state = MonitoringState::WaitForStartDetection;
        }
        self.executor.shutdown();
    }

    fn switch_state_locked(
        &self,
        reader: &Arc<ObservableReaderCore>,
        current: &mut CurrentState,
        new_state: MonitoringState,
    ) {
        if let Some(job) = current.job.take() {
            self.stop_job(job);
        }
        trace!(
            "Reader [{}] switches monitoring state from [{:?}] to [{:?}]",
            reader.name(),
            current.state,
            new_state
        );
        current.state = new_state;
        current.job = self.start_job(reader, new_state);
    }

    /// Cooperative cancellation: raise the stop flag, then unblock the
    /// driver when the job sits in a blocking wait.
    fn stop_job(&self, job: RunningJob) {
        job.should_stop.store(true, Ordering::SeqCst);
        let Some(reader) = self.reader.upgrade() else {
            return;
        };
        let Some(observable_spi) = reader.observable_spi() else {
            return;
        };
        let unblock_result = match job.kind {
            JobKind::PassiveInsertion => observable_spi.stop_wait_for_card_insertion(),
            JobKind::PassiveRemoval => observable_spi.stop_wait_for_card_removal(),
            JobKind::PresenceMonitor => observable_spi.stop_presence_monitoring(),
            JobKind::ActiveInsertion | JobKind::ActiveRemoval => Ok(()),
        };
        if let Err(e) = unblock_result {
            warn!(
                "Reader [{}] failed to unblock the monitoring driver: {}",
                reader.name(),
                e
            );
        }
    }

    /// Starts the monitoring job matching the new state and the driver's
    /// capability set.
    fn start_job(
        &self,
        reader: &Arc<ObservableReaderCore>,
        state: MonitoringState,
    ) -> Option<RunningJob> {
        let observable_spi = reader.observable_spi()?;
        match state {
            MonitoringState::WaitForStartDetection => None,
            MonitoringState::WaitForCardInsertion => match observable_spi.insertion_monitoring() {
                MonitoringCapability::Asynchronous => None,
                MonitoringCapability::Blocking => {
                    self.spawn(reader, JobKind::PassiveInsertion, |reader, stop| {
                        passive_insertion_job(reader, stop)
                    })
                }
                MonitoringCapability::Polling(sleep) => {
                    self.spawn(reader, JobKind::ActiveInsertion, move |reader, stop| {
                        active_insertion_job(reader, stop, sleep)
                    })
                }
            },
            MonitoringState::WaitForCardProcessing => {
                if observable_spi.supports_presence_monitoring() {
                    self.spawn(reader, JobKind::PresenceMonitor, |reader, stop| {
                        presence_monitor_job(reader, stop)
                    })
                } else {
                    None
                }
            }
            MonitoringState::WaitForCardRemoval => match observable_spi.removal_monitoring() {
                MonitoringCapability::Asynchronous => None,
                MonitoringCapability::Blocking => {
                    self.spawn(reader, JobKind::PassiveRemoval, |reader, stop| {
                        passive_removal_job(reader, stop)
                    })
                }
                MonitoringCapability::Polling(sleep) => {
                    self.spawn(reader, JobKind::ActiveRemoval, move |reader, stop| {
                        active_removal_job(reader, stop, sleep)
                    })
                }
            },
        }
    }

    fn spawn(
        &self,
        reader: &Arc<ObservableReaderCore>,
        kind: JobKind,
        body: impl FnOnce(Weak<ObservableReaderCore>, Arc<AtomicBool>) + Send + 'static,
    ) -> Option<RunningJob> {
        let should_stop = Arc::new(AtomicBool::new(false));
        let weak = Arc::downgrade(reader);
        let stop = Arc::clone(&should_stop);
        if let Err(e) = self.executor.execute(move || body(weak, stop)) {
            warn!(
                "Reader [{}] could not start its monitoring job: {}",
                reader.name(),
                e
            );
            return None;
        }
        Some(RunningJob { should_stop, kind })
    }
}

/// Polls the driver's presence check until a card shows up.
fn active_insertion_job(
    reader: Weak<ObservableReaderCore>,
    should_stop: Arc<AtomicBool>,
    sleep: Duration,
) {
    trace!("Card insertion polling starts");
    loop {
        if should_stop.load(Ordering::SeqCst) {
            break;
        }
        let Some(reader) = reader.upgrade() else {
            break;
        };
        match reader.local_core().spi().check_card_presence() {
            Ok(true) => {
                if !should_stop.load(Ordering::SeqCst) {
                    reader.state_service().on_event(InternalEvent::CardInserted);
                }
                break;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(
                    "Reader [{}] presence polling failed: {}",
                    reader.name(),
                    e
                );
                reader.forward_observation_error(Box::new(e) as BoxedError);
                break;
            }
        }
        drop(reader);
        thread::sleep(sleep);
    }
    trace!("Card insertion polling stops");
}

/// Parks in the driver's blocking wait until a card shows up.
fn passive_insertion_job(reader: Weak<ObservableReaderCore>, should_stop: Arc<AtomicBool>) {
    let Some(reader) = reader.upgrade() else {
        return;
    };
    let Some(observable_spi) = reader.observable_spi() else {
        return;
    };
    trace!("Reader [{}] waits for a card insertion", reader.name());
    match observable_spi.wait_for_card_insertion() {
        Ok(()) => {
            if !should_stop.load(Ordering::SeqCst) {
                reader.state_service().on_event(InternalEvent::CardInserted);
            }
        }
        Err(e) => {
            if !should_stop.load(Ordering::SeqCst) {
                warn!(
                    "Reader [{}] insertion wait failed: {}",
                    reader.name(),
                    e
                );
                reader.forward_observation_error(Box::new(e) as BoxedError);
            }
        }
    }
}

/// Pings the card until it stops responding.
fn active_removal_job(
    reader: Weak<ObservableReaderCore>,
    should_stop: Arc<AtomicBool>,
    sleep: Duration,
) {
    trace!("Card removal polling starts");
    loop {
        if should_stop.load(Ordering::SeqCst) {
            break;
        }
        let Some(reader) = reader.upgrade() else {
            break;
        };
        if !reader.local_core().is_card_present_ping() {
            if !should_stop.load(Ordering::SeqCst) {
                reader.state_service().on_event(InternalEvent::CardRemoved);
            }
            break;
        }
        drop(reader);
        thread::sleep(sleep);
    }
    trace!("Card removal polling stops");
}

/// Parks in the driver's blocking wait until the card goes away.
fn passive_removal_job(reader: Weak<ObservableReaderCore>, should_stop: Arc<AtomicBool>) {
    let Some(reader) = reader.upgrade() else {
        return;
    };
    let Some(observable_spi) = reader.observable_spi() else {
        return;
    };
    trace!("Reader [{}] waits for the card removal", reader.name());
    match observable_spi.wait_for_card_removal() {
        Ok(()) => {
            if !should_stop.load(Ordering::SeqCst) {
                reader.state_service().on_event(InternalEvent::CardRemoved);
            }
        }
        Err(e) => {
            if !should_stop.load(Ordering::SeqCst) {
                warn!("Reader [{}] removal wait failed: {}", reader.name(), e);
                reader.forward_observation_error(Box::new(e) as BoxedError);
            }
        }
    }
}

/// Watches the card presence with the driver's blocking monitor while the
/// application processes the card.
fn presence_monitor_job(reader: Weak<ObservableReaderCore>, should_stop: Arc<AtomicBool>) {
    let Some(reader) = reader.upgrade() else {
        return;
    };
    let Some(observable_spi) = reader.observable_spi() else {
        return;
    };
    trace!(
        "Reader [{}] monitors the card presence during processing",
        reader.name()
    );
    match observable_spi.monitor_card_presence_during_processing() {
        Ok(()) => {
            if !should_stop.load(Ordering::SeqCst) {
                reader.state_service().on_event(InternalEvent::CardRemoved);
            }
        }
        Err(e) => {
            if !should_stop.load(Ordering::SeqCst) {
                warn!(
                    "Reader [{}] presence monitoring failed: {}",
                    reader.name(),
                    e
                );
                reader.forward_observation_error(Box::new(e) as BoxedError);
            }
        }
    }
}
