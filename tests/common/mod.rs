//! Controllable mock drivers and observers shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use smart_card_service::error::{
    BoxedError, CardIoError, PluginIoError, ReaderIoError, TransmitError,
};
use smart_card_service::observable::CardEventNotifier;
use smart_card_service::observation::{
    PluginEvent, PluginEventType, PluginObservationExceptionHandler, PluginObserver, ReaderEvent,
    ReaderEventType, ReaderObservationExceptionHandler, ReaderObserver,
};
use smart_card_service::selection::SmartCard;
use smart_card_service::service::{PluginFactory, PoolPluginFactory};
use smart_card_service::spi::{
    ConfigurableReaderSpi, MonitoringCapability, ObservablePluginSpi, ObservableReaderSpi,
    PluginSpi, PoolPluginSpi, ReaderSpi,
};
use smart_card_service::service::{PLUGIN_API_VERSION, READER_API_VERSION};

pub const POLLING_INTERVAL: Duration = Duration::from_millis(10);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Polls a predicate until it holds or the timeout elapses.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

/// How the mock reader advertises its observation support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationStyle {
    NotObservable,
    Asynchronous,
    Blocking,
    Polling,
}

struct ReaderInner {
    card_present: bool,
    physical_open: bool,
    power_on_data: String,
    responses: VecDeque<Vec<u8>>,
    stop_insertion_wait: bool,
    stop_removal_wait: bool,
    stop_presence_monitoring: bool,
    activated_protocols: Vec<String>,
    current_protocol: Option<String>,
    notifier: Option<CardEventNotifier>,
    detection_started: bool,
}

/// Controllable reader driver covering the asynchronous, blocking and
/// polling observation styles, plus protocol configuration.
pub struct MockReaderSpi {
    name: String,
    style: ObservationStyle,
    presence_monitoring: bool,
    supported_protocols: Vec<String>,
    inner: Mutex<ReaderInner>,
    condvar: Condvar,
}

impl MockReaderSpi {
    pub fn new(name: &str, style: ObservationStyle) -> Self {
        MockReaderSpi {
            name: name.to_string(),
            style,
            presence_monitoring: false,
            supported_protocols: vec!["ISO_14443_4".to_string(), "ISO_7816_3_T0".to_string()],
            inner: Mutex::new(ReaderInner {
                card_present: false,
                physical_open: false,
                power_on_data: "3B8880010000000000718100F9".to_string(),
                responses: VecDeque::new(),
                stop_insertion_wait: false,
                stop_removal_wait: false,
                stop_presence_monitoring: false,
                activated_protocols: Vec::new(),
                current_protocol: None,
                notifier: None,
                detection_started: false,
            }),
            condvar: Condvar::new(),
        }
    }

    pub fn with_presence_monitoring(mut self) -> Self {
        self.presence_monitoring = true;
        self
    }

    /// Simulates the card arriving or leaving, waking any blocked wait.
    pub fn set_card_present(&self, present: bool) {
        let mut inner = lock(&self.inner);
        inner.card_present = present;
        self.condvar.notify_all();
    }

    pub fn is_card_inserted(&self) -> bool {
        lock(&self.inner).card_present
    }

    pub fn set_power_on_data(&self, power_on_data: &str) {
        lock(&self.inner).power_on_data = power_on_data.to_string();
    }

    pub fn set_current_protocol(&self, protocol: Option<&str>) {
        lock(&self.inner).current_protocol = protocol.map(str::to_string);
    }

    pub fn push_response(&self, response: &[u8]) {
        lock(&self.inner).responses.push_back(response.to_vec());
    }

    pub fn notifier(&self) -> Option<CardEventNotifier> {
        lock(&self.inner).notifier.clone()
    }

    pub fn detection_started(&self) -> bool {
        lock(&self.inner).detection_started
    }
}

impl ReaderSpi for MockReaderSpi {
    fn name(&self) -> &str {
        &self.name
    }

    fn open_physical_channel(&self) -> Result<(), ReaderIoError> {
        lock(&self.inner).physical_open = true;
        Ok(())
    }

    fn close_physical_channel(&self) -> Result<(), ReaderIoError> {
        lock(&self.inner).physical_open = false;
        Ok(())
    }

    fn is_physical_channel_open(&self) -> bool {
        lock(&self.inner).physical_open
    }

    fn check_card_presence(&self) -> Result<bool, ReaderIoError> {
        Ok(lock(&self.inner).card_present)
    }

    fn power_on_data(&self) -> String {
        lock(&self.inner).power_on_data.clone()
    }

    fn is_contactless(&self) -> bool {
        true
    }

    fn transmit_apdu(&self, _apdu: &[u8]) -> Result<Vec<u8>, TransmitError> {
        let mut inner = lock(&self.inner);
        if !inner.card_present {
            return Err(TransmitError::Card(CardIoError::new(
                "the card does not respond",
            )));
        }
        let scripted = inner.responses.pop_front();
        Ok(scripted.unwrap_or_else(|| vec![0x90, 0x00]))
    }

    fn configurable(&self) -> Option<&dyn ConfigurableReaderSpi> {
        Some(self)
    }

    fn observable(&self) -> Option<&dyn ObservableReaderSpi> {
        if self.style == ObservationStyle::NotObservable {
            None
        } else {
            Some(self)
        }
    }
}

impl ConfigurableReaderSpi for MockReaderSpi {
    fn is_protocol_supported(&self, reader_protocol: &str) -> bool {
        self.supported_protocols
            .iter()
            .any(|protocol| protocol == reader_protocol)
    }

    fn activate_protocol(&self, reader_protocol: &str) {
        lock(&self.inner)
            .activated_protocols
            .push(reader_protocol.to_string());
    }

    fn deactivate_protocol(&self, reader_protocol: &str) {
        lock(&self.inner)
            .activated_protocols
            .retain(|protocol| protocol != reader_protocol);
    }

    fn is_current_protocol(&self, reader_protocol: &str) -> bool {
        lock(&self.inner).current_protocol.as_deref() == Some(reader_protocol)
    }
}

impl ObservableReaderSpi for MockReaderSpi {
    fn on_start_detection(&self) {
        lock(&self.inner).detection_started = true;
    }

    fn on_stop_detection(&self) {
        lock(&self.inner).detection_started = false;
    }

    fn insertion_monitoring(&self) -> MonitoringCapability {
        match self.style {
            ObservationStyle::Asynchronous => MonitoringCapability::Asynchronous,
            ObservationStyle::Blocking => MonitoringCapability::Blocking,
            _ => MonitoringCapability::Polling(POLLING_INTERVAL),
        }
    }

    fn removal_monitoring(&self) -> MonitoringCapability {
        self.insertion_monitoring()
    }

    fn wait_for_card_insertion(&self) -> Result<(), ReaderIoError> {
        let mut inner = lock(&self.inner);
        inner.stop_insertion_wait = false;
        loop {
            if inner.card_present {
                return Ok(());
            }
            if inner.stop_insertion_wait {
                return Err(ReaderIoError::new("insertion wait interrupted"));
            }
            inner = self
                .condvar
                .wait(inner)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn stop_wait_for_card_insertion(&self) -> Result<(), ReaderIoError> {
        lock(&self.inner).stop_insertion_wait = true;
        self.condvar.notify_all();
        Ok(())
    }

    fn wait_for_card_removal(&self) -> Result<(), ReaderIoError> {
        let mut inner = lock(&self.inner);
        inner.stop_removal_wait = false;
        loop {
            if !inner.card_present {
                return Ok(());
            }
            if inner.stop_removal_wait {
                return Err(ReaderIoError::new("removal wait interrupted"));
            }
            inner = self
                .condvar
                .wait(inner)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn stop_wait_for_card_removal(&self) -> Result<(), ReaderIoError> {
        lock(&self.inner).stop_removal_wait = true;
        self.condvar.notify_all();
        Ok(())
    }

    fn supports_presence_monitoring(&self) -> bool {
        self.presence_monitoring
    }

    fn monitor_card_presence_during_processing(&self) -> Result<(), ReaderIoError> {
        let mut inner = lock(&self.inner);
        inner.stop_presence_monitoring = false;
        loop {
            if !inner.card_present {
                return Ok(());
            }
            if inner.stop_presence_monitoring {
                return Err(ReaderIoError::new("presence monitoring interrupted"));
            }
            inner = self
                .condvar
                .wait(inner)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn stop_presence_monitoring(&self) -> Result<(), ReaderIoError> {
        lock(&self.inner).stop_presence_monitoring = true;
        self.condvar.notify_all();
        Ok(())
    }

    fn connect_card_event_notifier(&self, notifier: CardEventNotifier) {
        lock(&self.inner).notifier = Some(notifier);
    }
}

/// Plain plugin driver exposing a fixed reader set.
pub struct MockPluginSpi {
    name: String,
    autonomous: bool,
    readers: Mutex<Vec<Arc<dyn ReaderSpi>>>,
}

impl MockPluginSpi {
    pub fn new(name: &str, readers: Vec<Arc<dyn ReaderSpi>>) -> Self {
        MockPluginSpi {
            name: name.to_string(),
            autonomous: false,
            readers: Mutex::new(readers),
        }
    }

    pub fn autonomous(name: &str) -> Self {
        MockPluginSpi {
            name: name.to_string(),
            autonomous: true,
            readers: Mutex::new(Vec::new()),
        }
    }
}

impl PluginSpi for MockPluginSpi {
    fn name(&self) -> &str {
        &self.name
    }

    fn search_available_readers(&self) -> Result<Vec<Arc<dyn ReaderSpi>>, PluginIoError> {
        Ok(lock(&self.readers).clone())
    }

    fn is_autonomous(&self) -> bool {
        self.autonomous
    }
}

/// Pollable plugin driver whose reader-name list the test scripts.
pub struct MockObservablePluginSpi {
    name: String,
    cycle: Duration,
    names: Mutex<Vec<String>>,
    enumeration_failure: Mutex<Option<PluginIoError>>,
}

impl MockObservablePluginSpi {
    pub fn new(name: &str, reader_names: &[&str]) -> Self {
        MockObservablePluginSpi {
            name: name.to_string(),
            cycle: POLLING_INTERVAL,
            names: Mutex::new(reader_names.iter().map(|n| n.to_string()).collect()),
            enumeration_failure: Mutex::new(None),
        }
    }

    pub fn set_reader_names(&self, reader_names: &[&str]) {
        *lock(&self.names) = reader_names.iter().map(|n| n.to_string()).collect();
    }

    pub fn fail_next_enumeration(&self, error: PluginIoError) {
        *lock(&self.enumeration_failure) = Some(error);
    }
}

impl PluginSpi for MockObservablePluginSpi {
    fn name(&self) -> &str {
        &self.name
    }

    fn search_available_readers(&self) -> Result<Vec<Arc<dyn ReaderSpi>>, PluginIoError> {
        let names = lock(&self.names).clone();
        Ok(names
            .iter()
            .map(|name| {
                Arc::new(MockReaderSpi::new(name, ObservationStyle::NotObservable))
                    as Arc<dyn ReaderSpi>
            })
            .collect())
    }

    fn observable(&self) -> Option<&dyn ObservablePluginSpi> {
        Some(self)
    }
}

impl ObservablePluginSpi for MockObservablePluginSpi {
    fn monitoring_cycle_duration(&self) -> Duration {
        self.cycle
    }

    fn search_available_reader_names(&self) -> Result<Vec<String>, PluginIoError> {
        if let Some(error) = lock(&self.enumeration_failure).take() {
            return Err(error);
        }
        Ok(lock(&self.names).clone())
    }

    fn search_reader(&self, reader_name: &str) -> Result<Option<Arc<dyn ReaderSpi>>, PluginIoError> {
        if lock(&self.names).iter().any(|name| name == reader_name) {
            Ok(Some(Arc::new(MockReaderSpi::new(
                reader_name,
                ObservationStyle::NotObservable,
            ))))
        } else {
            Ok(None)
        }
    }
}

/// Pool plugin driver with one reader per group reference.
pub struct MockPoolPluginSpi {
    name: String,
    groups: Vec<String>,
    selected_card: Option<Arc<dyn SmartCard>>,
    released: Mutex<Vec<String>>,
}

impl MockPoolPluginSpi {
    pub fn new(name: &str, groups: &[&str]) -> Self {
        MockPoolPluginSpi {
            name: name.to_string(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
            selected_card: Some(Arc::new(MockSmartCard::default())),
            released: Mutex::new(Vec::new()),
        }
    }

    pub fn released_readers(&self) -> Vec<String> {
        lock(&self.released).clone()
    }
}

impl PoolPluginSpi for MockPoolPluginSpi {
    fn name(&self) -> &str {
        &self.name
    }

    fn reader_group_references(&self) -> Result<Vec<String>, PluginIoError> {
        Ok(self.groups.clone())
    }

    fn allocate_reader(
        &self,
        reader_group_reference: &str,
    ) -> Result<Arc<dyn ReaderSpi>, PluginIoError> {
        if !self.groups.iter().any(|g| g == reader_group_reference) {
            return Err(PluginIoError::new(format!(
                "unknown reader group '{}'",
                reader_group_reference
            )));
        }
        let spi = MockReaderSpi::new(
            &format!("{}-reader", reader_group_reference),
            ObservationStyle::NotObservable,
        );
        spi.set_card_present(true);
        Ok(Arc::new(spi))
    }

    fn release_reader(&self, reader_name: &str) -> Result<(), PluginIoError> {
        lock(&self.released).push(reader_name.to_string());
        Ok(())
    }

    fn selected_smart_card(&self, _reader_name: &str) -> Option<Arc<dyn SmartCard>> {
        self.selected_card.clone()
    }
}

#[derive(Default)]
pub struct MockSmartCard;

impl SmartCard for MockSmartCard {
    fn power_on_data(&self) -> Option<String> {
        Some("3B8880010000000000718100F9".to_string())
    }
}

pub struct MockPluginFactory {
    name: String,
    spi: Arc<dyn PluginSpi>,
}

impl MockPluginFactory {
    pub fn new(name: &str, spi: Arc<dyn PluginSpi>) -> Self {
        MockPluginFactory {
            name: name.to_string(),
            spi,
        }
    }
}

impl PluginFactory for MockPluginFactory {
    fn plugin_name(&self) -> String {
        self.name.clone()
    }

    fn plugin_api_version(&self) -> String {
        PLUGIN_API_VERSION.to_string()
    }

    fn reader_api_version(&self) -> String {
        READER_API_VERSION.to_string()
    }

    fn plugin(&self) -> Arc<dyn PluginSpi> {
        Arc::clone(&self.spi)
    }
}

pub struct MockPoolPluginFactory {
    name: String,
    spi: Arc<dyn PoolPluginSpi>,
}

impl MockPoolPluginFactory {
    pub fn new(name: &str, spi: Arc<dyn PoolPluginSpi>) -> Self {
        MockPoolPluginFactory {
            name: name.to_string(),
            spi,
        }
    }
}

impl PoolPluginFactory for MockPoolPluginFactory {
    fn plugin_name(&self) -> String {
        self.name.clone()
    }

    fn plugin_api_version(&self) -> String {
        PLUGIN_API_VERSION.to_string()
    }

    fn reader_api_version(&self) -> String {
        READER_API_VERSION.to_string()
    }

    fn pool_plugin(&self) -> Arc<dyn PoolPluginSpi> {
        Arc::clone(&self.spi)
    }
}

/// Observer recording every reader event it receives.
#[derive(Default)]
pub struct CollectingReaderObserver {
    events: Mutex<Vec<ReaderEvent>>,
}

impl CollectingReaderObserver {
    pub fn events(&self) -> Vec<ReaderEvent> {
        lock(&self.events).clone()
    }

    pub fn count_of(&self, event_type: ReaderEventType) -> usize {
        lock(&self.events)
            .iter()
            .filter(|event| event.event_type() == event_type)
            .count()
    }

    pub fn last_of(&self, event_type: ReaderEventType) -> Option<ReaderEvent> {
        lock(&self.events)
            .iter()
            .rev()
            .find(|event| event.event_type() == event_type)
            .cloned()
    }

    pub fn wait_for(&self, event_type: ReaderEventType, timeout: Duration) -> Option<ReaderEvent> {
        wait_until(timeout, || self.last_of(event_type).is_some());
        self.last_of(event_type)
    }
}

impl ReaderObserver for CollectingReaderObserver {
    fn on_reader_event(&self, event: &ReaderEvent) -> Result<(), BoxedError> {
        lock(&self.events).push(event.clone());
        Ok(())
    }
}

/// Observer failing on purpose, to exercise the exception handler path.
pub struct FailingReaderObserver;

impl ReaderObserver for FailingReaderObserver {
    fn on_reader_event(&self, _event: &ReaderEvent) -> Result<(), BoxedError> {
        Err("the observer is broken".into())
    }
}

/// Observer recording every plugin event it receives.
#[derive(Default)]
pub struct CollectingPluginObserver {
    events: Mutex<Vec<PluginEvent>>,
}

impl CollectingPluginObserver {
    pub fn events(&self) -> Vec<PluginEvent> {
        lock(&self.events).clone()
    }

    pub fn last_of(&self, event_type: PluginEventType) -> Option<PluginEvent> {
        lock(&self.events)
            .iter()
            .rev()
            .find(|event| event.event_type() == event_type)
            .cloned()
    }

    pub fn wait_for(&self, event_type: PluginEventType, timeout: Duration) -> Option<PluginEvent> {
        wait_until(timeout, || self.last_of(event_type).is_some());
        self.last_of(event_type)
    }
}

impl PluginObserver for CollectingPluginObserver {
    fn on_plugin_event(&self, event: &PluginEvent) -> Result<(), BoxedError> {
        lock(&self.events).push(event.clone());
        Ok(())
    }
}

/// Handler recording the observation errors it is given.
#[derive(Default)]
pub struct CollectingReaderHandler {
    errors: Mutex<Vec<String>>,
}

impl CollectingReaderHandler {
    pub fn errors(&self) -> Vec<String> {
        lock(&self.errors).clone()
    }
}

impl ReaderObservationExceptionHandler for CollectingReaderHandler {
    fn on_reader_observation_error(
        &self,
        _plugin_name: &str,
        _reader_name: &str,
        error: BoxedError,
    ) {
        lock(&self.errors).push(error.to_string());
    }
}

#[derive(Default)]
pub struct CollectingPluginHandler {
    errors: Mutex<Vec<String>>,
}

impl CollectingPluginHandler {
    pub fn errors(&self) -> Vec<String> {
        lock(&self.errors).clone()
    }
}

impl PluginObservationExceptionHandler for CollectingPluginHandler {
    fn on_plugin_observation_error(&self, _plugin_name: &str, error: BoxedError) {
        lock(&self.errors).push(error.to_string());
    }
}
