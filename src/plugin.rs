//! Plugin adapters: reader registry, reader-list observation fan-out, the
//! autonomous push interface and the pool allocate/release interface.

// ───── Std Lib ─────
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

// ───── Crates ─────
use log::{debug, error, info, warn};
use regex::Regex;

// ───── Local Modules ─────
use crate::apdu::{CardRequest, CardResponse, CardSelectionResponse};
use crate::error::{BoxedError, ServiceError};
use crate::executor::lock;
use crate::observable::ObservableReader;
use crate::observation::{
    ObservationManager, PluginEvent, PluginEventType, PluginObservationExceptionHandler,
    PluginObserver,
};
use crate::reader::LocalReader;
use crate::selection::{
    CardSelectionRequest, ChannelControl, MultiSelectionProcessing, SmartCard,
};
use crate::selector::CardSelector;
use crate::spi::{PluginSpi, PoolPluginSpi, ReaderSpi};

/// Pace at which the plugin monitoring thread re-checks its stop flag while
/// waiting for the next cycle.
const MONITORING_STOP_CHECK: Duration = Duration::from_millis(50);

/// A reader exposed by a plugin, observable or not.
#[derive(Clone)]
pub enum CardReader {
    Local(LocalReader),
    Observable(ObservableReader),
}

impl CardReader {
    pub fn name(&self) -> &str {
        match self {
            CardReader::Local(reader) => reader.name(),
            CardReader::Observable(reader) => reader.name(),
        }
    }

    pub fn plugin_name(&self) -> &str {
        match self {
            CardReader::Local(reader) => reader.plugin_name(),
            CardReader::Observable(reader) => reader.plugin_name(),
        }
    }

    pub fn is_observable(&self) -> bool {
        matches!(self, CardReader::Observable(_))
    }

    /// The observation surface of the reader, when it has one.
    pub fn as_observable(&self) -> Option<&ObservableReader> {
        match self {
            CardReader::Local(_) => None,
            CardReader::Observable(reader) => Some(reader),
        }
    }

    pub fn is_registered(&self) -> bool {
        match self {
            CardReader::Local(reader) => reader.is_registered(),
            CardReader::Observable(reader) => reader.is_registered(),
        }
    }

    pub fn is_contactless(&self) -> Result<bool, ServiceError> {
        match self {
            CardReader::Local(reader) => reader.is_contactless(),
            CardReader::Observable(reader) => reader.is_contactless(),
        }
    }

    pub fn is_card_present(&self) -> Result<bool, ServiceError> {
        match self {
            CardReader::Local(reader) => reader.is_card_present(),
            CardReader::Observable(reader) => reader.is_card_present(),
        }
    }

    pub fn activate_reader_protocol(
        &self,
        reader_protocol: &str,
        application_protocol: &str,
    ) -> Result<(), ServiceError> {
        match self {
            CardReader::Local(reader) => {
                reader.activate_reader_protocol(reader_protocol, application_protocol)
            }
            CardReader::Observable(reader) => {
                reader.activate_reader_protocol(reader_protocol, application_protocol)
            }
        }
    }

    pub fn deactivate_reader_protocol(&self, reader_protocol: &str) -> Result<(), ServiceError> {
        match self {
            CardReader::Local(reader) => reader.deactivate_reader_protocol(reader_protocol),
            CardReader::Observable(reader) => reader.deactivate_reader_protocol(reader_protocol),
        }
    }

    pub fn release_channel(&self) -> Result<(), ServiceError> {
        match self {
            CardReader::Local(reader) => reader.release_channel(),
            CardReader::Observable(reader) => reader.release_channel(),
        }
    }

    pub fn current_protocol(&self) -> Option<String> {
        match self {
            CardReader::Local(reader) => reader.current_protocol(),
            CardReader::Observable(reader) => reader.current_protocol(),
        }
    }

    pub fn transmit_card_selection_requests(
        &self,
        card_selectors: &[CardSelector],
        card_selection_requests: &[CardSelectionRequest],
        multi_selection_processing: MultiSelectionProcessing,
        channel_control: ChannelControl,
    ) -> Result<Vec<CardSelectionResponse>, ServiceError> {
        match self {
            CardReader::Local(reader) => reader.transmit_card_selection_requests(
                card_selectors,
                card_selection_requests,
                multi_selection_processing,
                channel_control,
            ),
            CardReader::Observable(reader) => reader.transmit_card_selection_requests(
                card_selectors,
                card_selection_requests,
                multi_selection_processing,
                channel_control,
            ),
        }
    }

    pub fn transmit_card_request(
        &self,
        card_request: &CardRequest,
        channel_control: ChannelControl,
    ) -> Result<CardResponse, ServiceError> {
        match self {
            CardReader::Local(reader) => reader.transmit_card_request(card_request, channel_control),
            CardReader::Observable(reader) => {
                reader.transmit_card_request(card_request, channel_control)
            }
        }
    }

    fn do_unregister(&self) {
        match self {
            CardReader::Local(reader) => reader.do_unregister(),
            CardReader::Observable(reader) => reader.do_unregister(),
        }
    }
}

struct MonitoringThread {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

/// A plugin registered to the service, holding its readers by name.
///
/// Cheap to clone; all clones share the same registry.
#[derive(Clone)]
pub struct Plugin {
    core: Arc<PluginCore>,
}

struct PluginCore {
    name: String,
    spi: Arc<dyn PluginSpi>,
    registered: AtomicBool,
    readers: Mutex<BTreeMap<String, CardReader>>,
    observation:
        Mutex<ObservationManager<dyn PluginObserver, dyn PluginObservationExceptionHandler>>,
    monitoring: Mutex<Option<MonitoringThread>>,
}

impl Plugin {
    pub(crate) fn new(spi: Arc<dyn PluginSpi>) -> Self {
        Plugin {
            core: Arc::new(PluginCore {
                name: spi.name().to_string(),
                spi,
                registered: AtomicBool::new(false),
                readers: Mutex::new(BTreeMap::new()),
                observation: Mutex::new(ObservationManager::new()),
                monitoring: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn is_registered(&self) -> bool {
        self.core.registered.load(Ordering::SeqCst)
    }

    /// Names of the readers currently known, sorted.
    pub fn reader_names(&self) -> Result<Vec<String>, ServiceError> {
        self.core.check_registered()?;
        Ok(lock(&self.core.readers).keys().cloned().collect())
    }

    pub fn readers(&self) -> Result<Vec<CardReader>, ServiceError> {
        self.core.check_registered()?;
        Ok(lock(&self.core.readers).values().cloned().collect())
    }

    pub fn get_reader(&self, name: &str) -> Result<CardReader, ServiceError> {
        self.core.check_registered()?;
        lock(&self.core.readers).get(name).cloned().ok_or_else(|| {
            ServiceError::illegal_argument(format!(
                "no reader named '{}' in plugin '{}'",
                name, self.core.name
            ))
        })
    }

    /// First reader whose name matches the given regular expression.
    pub fn find_reader(&self, reader_name_regex: &str) -> Result<CardReader, ServiceError> {
        self.core.check_registered()?;
        let regex = Regex::new(reader_name_regex).map_err(|e| {
            ServiceError::illegal_argument(format!(
                "invalid reader name regex '{}': {}",
                reader_name_regex, e
            ))
        })?;
        lock(&self.core.readers)
            .iter()
            .find(|(name, _)| regex.is_match(name))
            .map(|(_, reader)| reader.clone())
            .ok_or_else(|| {
                ServiceError::illegal_argument(format!(
                    "no reader matching '{}' in plugin '{}'",
                    reader_name_regex, self.core.name
                ))
            })
    }

    /// Registers an observer. An observation exception handler must have
    /// been set beforehand. For pollable plugins the first observer starts
    /// the monitoring thread.
    pub fn add_observer(&self, observer: Arc<dyn PluginObserver>) -> Result<(), ServiceError> {
        self.core.check_registered()?;
        {
            let mut observation = lock(&self.core.observation);
            if observation.exception_handler().is_none() {
                return Err(ServiceError::illegal_state(
                    "no plugin observation exception handler has been set",
                ));
            }
            observation.add_observer(observer);
        }
        if self.core.spi.observable().is_some() {
            self.core.start_monitoring();
        }
        Ok(())
    }

    pub fn remove_observer(&self, observer: &Arc<dyn PluginObserver>) {
        let remaining = {
            let mut observation = lock(&self.core.observation);
            observation.remove_observer(observer);
            observation.count_observers()
        };
        if remaining == 0 {
            self.core.stop_monitoring();
        }
    }

    pub fn clear_observers(&self) {
        lock(&self.core.observation).clear_observers();
        self.core.stop_monitoring();
    }

    pub fn count_observers(&self) -> usize {
        lock(&self.core.observation).count_observers()
    }

    pub fn set_observation_exception_handler(
        &self,
        handler: Arc<dyn PluginObservationExceptionHandler>,
    ) -> Result<(), ServiceError> {
        self.core.check_registered()?;
        lock(&self.core.observation).set_exception_handler(handler);
        Ok(())
    }

    /// Push entry point for autonomous drivers: wraps and registers the
    /// provided readers, then notifies one connection event.
    pub fn on_reader_connected(
        &self,
        reader_spis: Vec<Arc<dyn ReaderSpi>>,
    ) -> Result<(), ServiceError> {
        self.core.check_registered()?;
        if !self.core.spi.is_autonomous() {
            return Err(ServiceError::illegal_state(format!(
                "the plugin '{}' is not autonomous",
                self.core.name
            )));
        }
        if reader_spis.is_empty() {
            return Err(ServiceError::illegal_argument(
                "the connected reader list is empty",
            ));
        }
        let mut added = Vec::with_capacity(reader_spis.len());
        {
            let mut readers = lock(&self.core.readers);
            for spi in reader_spis {
                let reader = self.core.build_reader(spi);
                added.push(reader.name().to_string());
                readers.insert(reader.name().to_string(), reader);
            }
        }
        added.sort();
        self.core.notify_observers(&PluginEvent::new(
            &self.core.name,
            added,
            PluginEventType::ReaderConnected,
        ));
        Ok(())
    }

    /// Push entry point for autonomous drivers: unregisters the named
    /// readers, then notifies one disconnection event.
    pub fn on_reader_disconnected(&self, reader_names: &[String]) -> Result<(), ServiceError> {
        self.core.check_registered()?;
        if !self.core.spi.is_autonomous() {
            return Err(ServiceError::illegal_state(format!(
                "the plugin '{}' is not autonomous",
                self.core.name
            )));
        }
        let mut removed = Vec::with_capacity(reader_names.len());
        {
            let mut readers = lock(&self.core.readers);
            for name in reader_names {
                match readers.remove(name) {
                    Some(reader) => {
                        reader.do_unregister();
                        removed.push(name.clone());
                    }
                    None => warn!(
                        "Plugin [{}] cannot disconnect unknown reader [{}]",
                        self.core.name, name
                    ),
                }
            }
        }
        if removed.is_empty() {
            return Ok(());
        }
        removed.sort();
        self.core.notify_observers(&PluginEvent::new(
            &self.core.name,
            removed,
            PluginEventType::ReaderDisconnected,
        ));
        Ok(())
    }

    /// Opens the driver and wraps every reader it currently exposes.
    pub(crate) fn do_register(&self) -> Result<(), ServiceError> {
        self.core.registered.store(true, Ordering::SeqCst);
        let spis = self.core.spi.search_available_readers()?;
        let mut readers = lock(&self.core.readers);
        for spi in spis {
            let reader = self.core.build_reader(spi);
            info!(
                "Plugin [{}] registers reader [{}]",
                self.core.name,
                reader.name()
            );
            readers.insert(reader.name().to_string(), reader);
        }
        Ok(())
    }

    /// Stops the monitoring, unregisters every reader and notifies the
    /// plugin unavailability.
    pub(crate) fn do_unregister(&self) {
        self.core.stop_monitoring();
        let reader_names: Vec<String> = lock(&self.core.readers).keys().cloned().collect();
        self.core.notify_observers(&PluginEvent::new(
            &self.core.name,
            reader_names,
            PluginEventType::Unavailable,
        ));
        lock(&self.core.observation).clear_observers();
        let readers: Vec<CardReader> = {
            let mut map = lock(&self.core.readers);
            let drained: Vec<CardReader> = map.values().cloned().collect();
            map.clear();
            drained
        };
        for reader in readers {
            reader.do_unregister();
        }
        self.core.registered.store(false, Ordering::SeqCst);
        self.core.spi.on_unregister();
        info!("Plugin [{}] unregistered", self.core.name);
    }
}

impl PluginCore {
    fn check_registered(&self) -> Result<(), ServiceError> {
        if self.registered.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ServiceError::illegal_state(format!(
                "the plugin '{}' is no longer registered",
                self.name
            )))
        }
    }

    /// Wraps a driver reader, observable when the driver says so.
    fn build_reader(&self, spi: Arc<dyn ReaderSpi>) -> CardReader {
        if spi.observable().is_some() {
            let reader = ObservableReader::new(spi, &self.name);
            reader.do_register();
            CardReader::Observable(reader)
        } else {
            let reader = LocalReader::new(spi, &self.name);
            reader.do_register();
            CardReader::Local(reader)
        }
    }

    fn notify_observers(&self, event: &PluginEvent) {
        let (observers, handler) = {
            let observation = lock(&self.observation);
            (observation.observers(), observation.exception_handler())
        };
        debug!(
            "Plugin [{}] notifies event [{:?}] to {} observer(s)",
            self.name,
            event.event_type(),
            observers.len()
        );
        for observer in observers {
            if let Err(e) = observer.on_plugin_event(event) {
                match &handler {
                    Some(handler) => handler.on_plugin_observation_error(&self.name, e),
                    None => error!(
                        "Plugin [{}] observer failed with no exception handler set: {}",
                        self.name, e
                    ),
                }
            }
        }
    }

    fn forward_observation_error(&self, error: BoxedError) {
        let handler = lock(&self.observation).exception_handler();
        match handler {
            Some(handler) => handler.on_plugin_observation_error(&self.name, error),
            None => error!(
                "Plugin [{}] observation error with no exception handler set: {}",
                self.name, error
            ),
        }
    }

    fn start_monitoring(self: &Arc<Self>) {
        let mut monitoring = lock(&self.monitoring);
        if monitoring.is_some() {
            return;
        }
        let stop = Arc::new(AtomicBool::new(false));
        let thread_core = Arc::clone(self);
        let thread_stop = Arc::clone(&stop);
        let spawned = thread::Builder::new()
            .name(format!("{}-monitoring", self.name))
            .spawn(move || run_monitoring_loop(thread_core, thread_stop));
        match spawned {
            Ok(handle) => {
                *monitoring = Some(MonitoringThread {
                    stop,
                    handle: Some(handle),
                });
            }
            Err(e) => error!(
                "Plugin [{}] failed to spawn its monitoring thread: {}",
                self.name, e
            ),
        }
    }

    fn stop_monitoring(&self) {
        let thread = lock(&self.monitoring).take();
        if let Some(mut thread) = thread {
            thread.stop.store(true, Ordering::SeqCst);
            if let Some(handle) = thread.handle.take() {
                if handle.thread().id() == thread::current().id() {
                    // the monitoring thread stops itself, joining would hang
                    return;
                }
                if handle.join().is_err() {
                    error!("Plugin [{}] monitoring thread panicked", self.name);
                }
            }
        }
    }

    /// One snapshot cycle: reconcile the driver's reader-name list with the
    /// registry and emit at most one connection then one disconnection
    /// event.
    fn process_reader_name_changes(&self, actual_names: &[String]) {
        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut failures: Vec<BoxedError> = Vec::new();
        {
            let mut readers = lock(&self.readers);
            let known: Vec<String> = readers.keys().cloned().collect();
            for name in &known {
                if !actual_names.contains(name) {
                    if let Some(reader) = readers.remove(name) {
                        reader.do_unregister();
                        info!("Plugin [{}] reader [{}] disconnected", self.name, name);
                        removed.push(name.clone());
                    }
                }
            }
            let Some(observable_spi) = self.spi.observable() else {
                return;
            };
            for name in actual_names {
                if readers.contains_key(name) {
                    continue;
                }
                match observable_spi.search_reader(name) {
                    Ok(Some(spi)) => {
                        let reader = self.build_reader(spi);
                        info!("Plugin [{}] reader [{}] connected", self.name, name);
                        readers.insert(name.clone(), reader);
                        added.push(name.clone());
                    }
                    Ok(None) => warn!(
                        "Plugin [{}] driver no longer knows reader [{}]",
                        self.name, name
                    ),
                    Err(e) => failures.push(Box::new(e)),
                }
            }
        }
        for failure in failures {
            self.forward_observation_error(failure);
        }
        added.sort();
        removed.sort();
        if !added.is_empty() {
            self.notify_observers(&PluginEvent::new(
                &self.name,
                added,
                PluginEventType::ReaderConnected,
            ));
        }
        if !removed.is_empty() {
            self.notify_observers(&PluginEvent::new(
                &self.name,
                removed,
                PluginEventType::ReaderDisconnected,
            ));
        }
    }
}

/// Body of the plugin monitoring thread: polls the driver's reader-name
/// snapshot at the driver's cycle duration until stopped.
fn run_monitoring_loop(core: Arc<PluginCore>, stop: Arc<AtomicBool>) {
    debug!("Plugin [{}] monitoring thread started", core.name);
    let cycle = match core.spi.observable() {
        Some(observable_spi) => observable_spi.monitoring_cycle_duration(),
        None => {
            error!(
                "Plugin [{}] has no reader-list observation capability",
                core.name
            );
            return;
        }
    };
    while !stop.load(Ordering::SeqCst) {
        let names = {
            let Some(observable_spi) = core.spi.observable() else {
                break;
            };
            observable_spi.search_available_reader_names()
        };
        match names {
            Ok(names) => core.process_reader_name_changes(&names),
            Err(e) => {
                warn!(
                    "Plugin [{}] failed to enumerate its readers: {}",
                    core.name, e
                );
                let fatal = e.is_fatal();
                core.forward_observation_error(Box::new(e));
                if fatal {
                    // drop the thread registration first so that a later
                    // observer registration spawns a replacement
                    *lock(&core.monitoring) = None;
                    let reader_names: Vec<String> =
                        lock(&core.readers).keys().cloned().collect();
                    core.notify_observers(&PluginEvent::new(
                        &core.name,
                        reader_names,
                        PluginEventType::Unavailable,
                    ));
                    break;
                }
            }
        }
        sleep_with_stop(cycle, &stop);
    }
    debug!("Plugin [{}] monitoring thread stopped", core.name);
}

/// Sleeps for the given duration in small slices so a stop request is
/// honored promptly.
fn sleep_with_stop(duration: Duration, stop: &AtomicBool) {
    let mut remaining = duration;
    while !remaining.is_zero() {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let slice = remaining.min(MONITORING_STOP_CHECK);
        thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
}

/// A plugin managing a pool of readers allocated on demand.
#[derive(Clone)]
pub struct PoolPlugin {
    core: Arc<PoolPluginCore>,
}

struct PoolPluginCore {
    name: String,
    spi: Arc<dyn PoolPluginSpi>,
    registered: AtomicBool,
    readers: Mutex<BTreeMap<String, CardReader>>,
}

impl PoolPlugin {
    pub(crate) fn new(spi: Arc<dyn PoolPluginSpi>) -> Self {
        PoolPlugin {
            core: Arc::new(PoolPluginCore {
                name: spi.name().to_string(),
                spi,
                registered: AtomicBool::new(false),
                readers: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn is_registered(&self) -> bool {
        self.core.registered.load(Ordering::SeqCst)
    }

    pub fn reader_group_references(&self) -> Result<Vec<String>, ServiceError> {
        self.core.check_registered()?;
        Ok(self.core.spi.reader_group_references()?)
    }

    /// Names of the readers currently allocated, sorted.
    pub fn reader_names(&self) -> Result<Vec<String>, ServiceError> {
        self.core.check_registered()?;
        Ok(lock(&self.core.readers).keys().cloned().collect())
    }

    /// Obtains a reader from the pool backend and registers it until it is
    /// released.
    pub fn allocate_reader(&self, reader_group_reference: &str) -> Result<CardReader, ServiceError> {
        self.core.check_registered()?;
        if reader_group_reference.is_empty() {
            return Err(ServiceError::illegal_argument(
                "the reader group reference is empty",
            ));
        }
        let spi = self.core.spi.allocate_reader(reader_group_reference)?;
        let reader = if spi.observable().is_some() {
            let reader = ObservableReader::new(spi, &self.core.name);
            reader.do_register();
            CardReader::Observable(reader)
        } else {
            let reader = LocalReader::new(spi, &self.core.name);
            reader.do_register();
            CardReader::Local(reader)
        };
        info!(
            "Pool plugin [{}] allocated reader [{}] from group [{}]",
            self.core.name,
            reader.name(),
            reader_group_reference
        );
        lock(&self.core.readers).insert(reader.name().to_string(), reader.clone());
        Ok(reader)
    }

    /// Returns a reader to the pool backend and unregisters it.
    pub fn release_reader(&self, reader: &CardReader) -> Result<(), ServiceError> {
        self.core.check_registered()?;
        self.core.spi.release_reader(reader.name())?;
        if lock(&self.core.readers).remove(reader.name()).is_some() {
            reader.do_unregister();
            info!(
                "Pool plugin [{}] released reader [{}]",
                self.core.name,
                reader.name()
            );
        }
        Ok(())
    }

    /// The card pre-selected by the pool backend on the given reader, if
    /// any.
    pub fn get_selected_smart_card(&self, reader: &CardReader) -> Option<Arc<dyn SmartCard>> {
        self.core.spi.selected_smart_card(reader.name())
    }

    pub(crate) fn do_register(&self) {
        self.core.registered.store(true, Ordering::SeqCst);
    }

    pub(crate) fn do_unregister(&self) {
        let readers: Vec<CardReader> = {
            let mut map = lock(&self.core.readers);
            let drained: Vec<CardReader> = map.values().cloned().collect();
            map.clear();
            drained
        };
        for reader in readers {
            if let Err(e) = self.core.spi.release_reader(reader.name()) {
                debug!(
                    "Pool plugin [{}] failed to release reader [{}]: {}",
                    self.core.name,
                    reader.name(),
                    e
                );
            }
            reader.do_unregister();
        }
        self.core.registered.store(false, Ordering::SeqCst);
        self.core.spi.on_unregister();
        info!("Pool plugin [{}] unregistered", self.core.name);
    }
}

impl PoolPluginCore {
    fn check_registered(&self) -> Result<(), ServiceError> {
        if self.registered.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ServiceError::illegal_state(format!(
                "the pool plugin '{}' is no longer registered",
                self.name
            )))
        }
    }
}
