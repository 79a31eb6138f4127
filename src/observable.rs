//! Observable reader adapter: owns the observation state machine, the
//! scheduled selection scenario and the event fan-out to observers.

// ───── Std Lib ─────
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

// ───── Crates ─────
use log::{debug, error, warn};

// ───── Local Modules ─────
use crate::apdu::{CardRequest, CardResponse, CardSelectionResponse};
use crate::error::{BoxedError, ServiceError};
use crate::executor::lock;
use crate::monitoring::{InternalEvent, MonitoringState, ReaderStateService};
use crate::observation::{
    ObservationManager, ReaderEvent, ReaderEventType, ReaderObservationExceptionHandler,
    ReaderObserver,
};
use crate::reader::{LocalReader, ReaderCore};
use crate::selection::{
    CardSelectionRequest, ChannelControl, MultiSelectionProcessing,
    ScheduledCardSelectionsResponse,
};
use crate::selector::CardSelector;
use crate::spi::{ObservableReaderSpi, ReaderSpi};

/// Card detection lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionMode {
    /// Detection re-arms itself after each card removal.
    Repeating,
    /// Detection stops once the first card has been processed.
    SingleShot,
}

/// Notification policy applied when a card shows up while a selection
/// scenario is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationMode {
    /// Notify every insertion, matched or not.
    Always,
    /// Stay silent and re-arm detection when no case matched.
    MatchedOnly,
}

/// Handle given to asynchronous drivers so they can push card insertion and
/// removal events into the reader's state machine.
#[derive(Clone)]
pub struct CardEventNotifier {
    core: Weak<ObservableReaderCore>,
}

impl CardEventNotifier {
    pub fn on_card_inserted(&self) {
        if let Some(core) = self.core.upgrade() {
            core.state_service().on_event(InternalEvent::CardInserted);
        }
    }

    pub fn on_card_removed(&self) {
        if let Some(core) = self.core.upgrade() {
            core.state_service().on_event(InternalEvent::CardRemoved);
        }
    }
}

struct ScheduledScenario {
    selectors: Vec<CardSelector>,
    requests: Vec<CardSelectionRequest>,
    multi_selection_processing: MultiSelectionProcessing,
    channel_control: ChannelControl,
    notification_mode: NotificationMode,
}

/// A reader whose card insertions and removals are observed.
///
/// Cheap to clone; all clones share the same state machine and observer
/// set.
#[derive(Clone)]
pub struct ObservableReader {
    pub(crate) core: Arc<ObservableReaderCore>,
}

pub(crate) struct ObservableReaderCore {
    local: LocalReader,
    observation:
        Mutex<ObservationManager<dyn ReaderObserver, dyn ReaderObservationExceptionHandler>>,
    state_service: ReaderStateService,
    scenario: Mutex<Option<ScheduledScenario>>,
    detection_mode: Mutex<Option<DetectionMode>>,
    card_removed_notification_enabled: AtomicBool,
}

impl ObservableReader {
    pub(crate) fn new(spi: Arc<dyn ReaderSpi>, plugin_name: &str) -> Self {
        let reader_name = spi.name().to_string();
        let core = Arc::new_cyclic(|weak: &Weak<ObservableReaderCore>| ObservableReaderCore {
            local: LocalReader::new(Arc::clone(&spi), plugin_name),
            observation: Mutex::new(ObservationManager::new()),
            state_service: ReaderStateService::new(weak.clone(), &reader_name),
            scenario: Mutex::new(None),
            detection_mode: Mutex::new(None),
            card_removed_notification_enabled: AtomicBool::new(true),
        });
        if let Some(observable_spi) = spi.observable() {
            observable_spi.connect_card_event_notifier(CardEventNotifier {
                core: Arc::downgrade(&core),
            });
        }
        ObservableReader { core }
    }

    pub fn name(&self) -> &str {
        self.core.local.name()
    }

    pub fn plugin_name(&self) -> &str {
        self.core.local.plugin_name()
    }

    pub fn is_registered(&self) -> bool {
        self.core.local.is_registered()
    }

    pub fn is_contactless(&self) -> Result<bool, ServiceError> {
        self.core.local.is_contactless()
    }

    pub fn is_logical_channel_open(&self) -> bool {
        self.core.local.is_logical_channel_open()
    }

    pub fn activate_reader_protocol(
        &self,
        reader_protocol: &str,
        application_protocol: &str,
    ) -> Result<(), ServiceError> {
        self.core
            .local
            .activate_reader_protocol(reader_protocol, application_protocol)
    }

    pub fn deactivate_reader_protocol(&self, reader_protocol: &str) -> Result<(), ServiceError> {
        self.core.local.deactivate_reader_protocol(reader_protocol)
    }

    pub fn release_channel(&self) -> Result<(), ServiceError> {
        self.core.local.release_channel()
    }

    pub fn current_protocol(&self) -> Option<String> {
        self.core.local.current_protocol()
    }

    pub fn transmit_card_selection_requests(
        &self,
        card_selectors: &[CardSelector],
        card_selection_requests: &[CardSelectionRequest],
        multi_selection_processing: MultiSelectionProcessing,
        channel_control: ChannelControl,
    ) -> Result<Vec<CardSelectionResponse>, ServiceError> {
        self.core.local.transmit_card_selection_requests(
            card_selectors,
            card_selection_requests,
            multi_selection_processing,
            channel_control,
        )
    }

    pub fn transmit_card_request(
        &self,
        card_request: &CardRequest,
        channel_control: ChannelControl,
    ) -> Result<CardResponse, ServiceError> {
        self.core.local.transmit_card_request(card_request, channel_control)
    }

    /// Checks the card presence. When the card went away while a channel
    /// was still open, the removal sequence runs before returning false.
    pub fn is_card_present(&self) -> Result<bool, ServiceError> {
        self.core.local.check_registered()?;
        let present = self.core.local.is_card_present()?;
        if !present && self.core.local.core.is_any_channel_open() {
            if let Some(event) = self.core.process_card_removed() {
                self.core.notify_observers(&event);
            }
        }
        Ok(present)
    }

    /// Registers an observer. An observation exception handler must have
    /// been set beforehand.
    pub fn add_observer(&self, observer: Arc<dyn ReaderObserver>) -> Result<(), ServiceError> {
        self.core.local.check_registered()?;
        let mut observation = lock(&self.core.observation);
        if observation.exception_handler().is_none() {
            return Err(ServiceError::illegal_state(
                "no reader observation exception handler has been set",
            ));
        }
        observation.add_observer(observer);
        Ok(())
    }

    pub fn remove_observer(&self, observer: &Arc<dyn ReaderObserver>) {
        lock(&self.core.observation).remove_observer(observer);
    }

    pub fn clear_observers(&self) {
        lock(&self.core.observation).clear_observers();
    }

    pub fn count_observers(&self) -> usize {
        lock(&self.core.observation).count_observers()
    }

    pub fn set_observation_exception_handler(
        &self,
        handler: Arc<dyn ReaderObservationExceptionHandler>,
    ) -> Result<(), ServiceError> {
        self.core.local.check_registered()?;
        lock(&self.core.observation).set_exception_handler(handler);
        Ok(())
    }

    /// Starts the card detection cycle.
    pub fn start_card_detection(&self, detection_mode: DetectionMode) -> Result<(), ServiceError> {
        self.core.local.check_registered()?;
        debug!(
            "Reader [{}] starts card detection in mode [{:?}]",
            self.name(),
            detection_mode
        );
        *lock(&self.core.detection_mode) = Some(detection_mode);
        if let Some(observable_spi) = self.core.observable_spi() {
            observable_spi.on_start_detection();
        }
        self.core.state_service.on_event(InternalEvent::StartDetect);
        Ok(())
    }

    /// Stops the card detection cycle. The call returns immediately; the
    /// monitoring job observes its cancellation flag asynchronously.
    pub fn stop_card_detection(&self) -> Result<(), ServiceError> {
        self.core.local.check_registered()?;
        debug!("Reader [{}] stops card detection", self.name());
        if let Some(observable_spi) = self.core.observable_spi() {
            observable_spi.on_stop_detection();
        }
        self.core.state_service.on_event(InternalEvent::StopDetect);
        Ok(())
    }

    /// Tells the state machine that the application is done with the card.
    pub fn finalize_card_processing(&self) -> Result<(), ServiceError> {
        self.core.local.check_registered()?;
        debug!("Reader [{}] finalizes the card processing", self.name());
        self.core.state_service.on_event(InternalEvent::CardProcessed);
        Ok(())
    }

    pub fn current_monitoring_state(&self) -> MonitoringState {
        self.core.state_service.current_monitoring_state()
    }

    pub fn detection_mode(&self) -> Option<DetectionMode> {
        *lock(&self.core.detection_mode)
    }

    /// Entry point for drivers pushing insertion events themselves.
    pub fn on_card_inserted(&self) {
        self.core.state_service.on_event(InternalEvent::CardInserted);
    }

    /// Entry point for drivers pushing removal events themselves.
    pub fn on_card_removed(&self) {
        self.core.state_service.on_event(InternalEvent::CardRemoved);
    }

    pub(crate) fn schedule_card_selection_scenario(
        &self,
        selectors: Vec<CardSelector>,
        requests: Vec<CardSelectionRequest>,
        multi_selection_processing: MultiSelectionProcessing,
        channel_control: ChannelControl,
        notification_mode: NotificationMode,
    ) -> Result<(), ServiceError> {
        self.core.local.check_registered()?;
        debug!(
            "Reader [{}] schedules a card selection scenario of {} case(s)",
            self.name(),
            selectors.len()
        );
        *lock(&self.core.scenario) = Some(ScheduledScenario {
            selectors,
            requests,
            multi_selection_processing,
            channel_control,
            notification_mode,
        });
        Ok(())
    }

    /// Drops the scheduled scenario; subsequent insertions notify a plain
    /// detection event.
    pub fn clear_card_selection_scenario(&self) {
        *lock(&self.core.scenario) = None;
    }

    pub(crate) fn do_register(&self) {
        self.core.local.do_register();
    }

    /// Notifies UNAVAILABLE, stops the monitoring machinery and releases
    /// the reader resources.
    pub(crate) fn do_unregister(&self) {
        let event = ReaderEvent::new(
            self.plugin_name(),
            self.name(),
            ReaderEventType::Unavailable,
            None,
        );
        self.core.notify_observers(&event);
        if let Some(observable_spi) = self.core.observable_spi() {
            observable_spi.on_stop_detection();
        }
        self.core.state_service.shutdown();
        self.clear_observers();
        self.core.local.do_unregister();
    }
}

impl ObservableReaderCore {
    pub(crate) fn name(&self) -> &str {
        self.local.name()
    }

    pub(crate) fn local_core(&self) -> &ReaderCore {
        &self.local.core
    }

    pub(crate) fn state_service(&self) -> &ReaderStateService {
        &self.state_service
    }

    pub(crate) fn observable_spi(&self) -> Option<&dyn ObservableReaderSpi> {
        self.local.spi().observable()
    }

    pub(crate) fn detection_mode(&self) -> DetectionMode {
        lock(&self.detection_mode).unwrap_or(DetectionMode::Repeating)
    }

    /// Runs the scheduled scenario, if any, and shapes the event to notify.
    ///
    /// Returns `None` when nothing must reach the application: matched-only
    /// policy without a match, or a card that broke off during the
    /// selection. The state machine then re-arms the insertion detection.
    pub(crate) fn process_card_inserted(&self) -> Option<ReaderEvent> {
        debug!("Reader [{}] processes the inserted card", self.name());
        let scenario_guard = lock(&self.scenario);
        let Some(scenario) = scenario_guard.as_ref() else {
            self.card_removed_notification_enabled
                .store(true, Ordering::SeqCst);
            return Some(ReaderEvent::new(
                self.local.plugin_name(),
                self.name(),
                ReaderEventType::CardInserted,
                None,
            ));
        };
        match self.local.transmit_card_selection_requests(
            &scenario.selectors,
            &scenario.requests,
            scenario.multi_selection_processing,
            scenario.channel_control,
        ) {
            Ok(responses) => {
                let matched = responses.iter().any(CardSelectionResponse::has_matched);
                if matched {
                    self.card_removed_notification_enabled
                        .store(true, Ordering::SeqCst);
                    Some(ReaderEvent::new(
                        self.local.plugin_name(),
                        self.name(),
                        ReaderEventType::CardMatched,
                        Some(ScheduledCardSelectionsResponse::new(responses)),
                    ))
                } else if scenario.notification_mode == NotificationMode::Always {
                    self.card_removed_notification_enabled
                        .store(true, Ordering::SeqCst);
                    Some(ReaderEvent::new(
                        self.local.plugin_name(),
                        self.name(),
                        ReaderEventType::CardInserted,
                        Some(ScheduledCardSelectionsResponse::new(responses)),
                    ))
                } else {
                    debug!(
                        "Reader [{}] no selection case matched, insertion stays silent",
                        self.name()
                    );
                    self.card_removed_notification_enabled
                        .store(false, Ordering::SeqCst);
                    None
                }
            }
            Err(
                e @ (ServiceError::ReaderBrokenCommunication { .. }
                | ServiceError::CardBrokenCommunication { .. }),
            ) => {
                debug!(
                    "Reader [{}] communication broke during the scheduled scenario: {}",
                    self.name(),
                    e
                );
                self.local.core.close_channels_silently();
                self.card_removed_notification_enabled
                    .store(false, Ordering::SeqCst);
                None
            }
            Err(e) => {
                warn!(
                    "Reader [{}] scheduled scenario failed: {}",
                    self.name(),
                    e
                );
                self.forward_observation_error(Box::new(e));
                self.card_removed_notification_enabled
                    .store(false, Ordering::SeqCst);
                None
            }
        }
    }

    /// Releases the channels and shapes the removal event, unless the last
    /// silent insertion suppressed it.
    pub(crate) fn process_card_removed(&self) -> Option<ReaderEvent> {
        debug!("Reader [{}] processes the card removal", self.name());
        self.local.core.close_channels_silently();
        if self
            .card_removed_notification_enabled
            .swap(true, Ordering::SeqCst)
        {
            Some(ReaderEvent::new(
                self.local.plugin_name(),
                self.name(),
                ReaderEventType::CardRemoved,
                None,
            ))
        } else {
            None
        }
    }

    /// Serial observer fan-out; a failing callback reaches the exception
    /// handler and does not stop the remaining observers.
    pub(crate) fn notify_observers(&self, event: &ReaderEvent) {
        let (observers, handler) = {
            let observation = lock(&self.observation);
            (observation.observers(), observation.exception_handler())
        };
        debug!(
            "Reader [{}] notifies event [{:?}] to {} observer(s)",
            self.name(),
            event.event_type(),
            observers.len()
        );
        for observer in observers {
            if let Err(e) = observer.on_reader_event(event) {
                match &handler {
                    Some(handler) => handler.on_reader_observation_error(
                        self.local.plugin_name(),
                        self.name(),
                        e,
                    ),
                    None => error!(
                        "Reader [{}] observer failed with no exception handler set: {}",
                        self.name(),
                        e
                    ),
                }
            }
        }
    }

    pub(crate) fn forward_observation_error(&self, error: BoxedError) {
        let handler = lock(&self.observation).exception_handler();
        match handler {
            Some(handler) => {
                handler.on_reader_observation_error(self.local.plugin_name(), self.name(), error)
            }
            None => error!(
                "Reader [{}] observation error with no exception handler set: {}",
                self.name(),
                error
            ),
        }
    }
}
