// ───── Std Lib ─────
use std::sync::Arc;

// ───── Local Modules ─────
use crate::error::BoxedError;
use crate::selection::ScheduledCardSelectionsResponse;

/// Kind of a reader event notified to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderEventType {
    /// A card has been inserted with no scenario defined, or a scenario ran
    /// without any match while the notification policy requires the event.
    CardInserted,
    /// A card has been inserted and at least one selection case matched.
    CardMatched,
    CardRemoved,
    /// The reader became unusable (unregistered or driver failure).
    Unavailable,
}

/// Event notified to reader observers.
#[derive(Debug, Clone)]
pub struct ReaderEvent {
    plugin_name: String,
    reader_name: String,
    event_type: ReaderEventType,
    scheduled_card_selections_response: Option<ScheduledCardSelectionsResponse>,
}

impl ReaderEvent {
    pub(crate) fn new(
        plugin_name: impl Into<String>,
        reader_name: impl Into<String>,
        event_type: ReaderEventType,
        scheduled_card_selections_response: Option<ScheduledCardSelectionsResponse>,
    ) -> Self {
        ReaderEvent {
            plugin_name: plugin_name.into(),
            reader_name: reader_name.into(),
            event_type,
            scheduled_card_selections_response,
        }
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    pub fn reader_name(&self) -> &str {
        &self.reader_name
    }

    pub fn event_type(&self) -> ReaderEventType {
        self.event_type
    }

    /// The selection responses produced by the scheduled scenario, attached
    /// to `CardInserted` and `CardMatched` events when a scenario ran.
    pub fn scheduled_card_selections_response(&self) -> Option<&ScheduledCardSelectionsResponse> {
        self.scheduled_card_selections_response.as_ref()
    }
}

/// Kind of a plugin event notified to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginEventType {
    ReaderConnected,
    ReaderDisconnected,
    /// The plugin became unusable (unregistered or driver failure).
    Unavailable,
}

/// Event notified to plugin observers. Reader names are sorted.
#[derive(Debug, Clone)]
pub struct PluginEvent {
    plugin_name: String,
    reader_names: Vec<String>,
    event_type: PluginEventType,
}

impl PluginEvent {
    pub(crate) fn new(
        plugin_name: impl Into<String>,
        reader_names: Vec<String>,
        event_type: PluginEventType,
    ) -> Self {
        PluginEvent {
            plugin_name: plugin_name.into(),
            reader_names,
            event_type,
        }
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    pub fn reader_names(&self) -> &[String] {
        &self.reader_names
    }

    pub fn event_type(&self) -> PluginEventType {
        self.event_type
    }
}

/// Reader event callback. The callback runs on the reader's monitoring
/// worker and must stay fast; observers needing to block offload themselves.
pub trait ReaderObserver: Send + Sync {
    fn on_reader_event(&self, event: &ReaderEvent) -> Result<(), BoxedError>;
}

/// Plugin event callback, invoked from the plugin monitoring thread.
pub trait PluginObserver: Send + Sync {
    fn on_plugin_event(&self, event: &PluginEvent) -> Result<(), BoxedError>;
}

/// Receives the errors raised during reader observation: failing observer
/// callbacks and monitoring job failures.
pub trait ReaderObservationExceptionHandler: Send + Sync {
    fn on_reader_observation_error(&self, plugin_name: &str, reader_name: &str, error: BoxedError);
}

/// Receives the errors raised during plugin observation.
pub trait PluginObservationExceptionHandler: Send + Sync {
    fn on_plugin_observation_error(&self, plugin_name: &str, error: BoxedError);
}

/// Owner of an observer set and of the observation exception handler, shared
/// by the plugin and reader observation implementations.
///
/// Observers compare by identity; adding the same observer twice is a no-op,
/// removing an unknown one as well. Notification works on a snapshot so that
/// an observer may remove itself while a notification is in flight.
pub(crate) struct ObservationManager<O: ?Sized, H: ?Sized> {
    observers: Vec<Arc<O>>,
    exception_handler: Option<Arc<H>>,
}

impl<O: ?Sized, H: ?Sized> ObservationManager<O, H> {
    pub(crate) fn new() -> Self {
        ObservationManager {
            observers: Vec::new(),
            exception_handler: None,
        }
    }

    pub(crate) fn add_observer(&mut self, observer: Arc<O>) {
        if !self.observers.iter().any(|o| Arc::ptr_eq(o, &observer)) {
            self.observers.push(observer);
        }
    }

    pub(crate) fn remove_observer(&mut self, observer: &Arc<O>) {
        self.observers.retain(|o| !Arc::ptr_eq(o, observer));
    }

    pub(crate) fn clear_observers(&mut self) {
        self.observers.clear();
    }

    pub(crate) fn count_observers(&self) -> usize {
        self.observers.len()
    }

    /// Snapshot of the current observer set.
    pub(crate) fn observers(&self) -> Vec<Arc<O>> {
        self.observers.clone()
    }

    pub(crate) fn set_exception_handler(&mut self, handler: Arc<H>) {
        self.exception_handler = Some(handler);
    }

    pub(crate) fn exception_handler(&self) -> Option<Arc<H>> {
        self.exception_handler.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingObserver;

    impl ReaderObserver for CountingObserver {
        fn on_reader_event(&self, _event: &ReaderEvent) -> Result<(), BoxedError> {
            Ok(())
        }
    }

    #[test]
    fn adding_the_same_observer_twice_is_a_no_op() {
        let mut manager: ObservationManager<dyn ReaderObserver, ()> = ObservationManager::new();
        let observer: Arc<dyn ReaderObserver> = Arc::new(CountingObserver);
        manager.add_observer(Arc::clone(&observer));
        manager.add_observer(Arc::clone(&observer));
        assert_eq!(manager.count_observers(), 1);
    }

    #[test]
    fn removing_a_never_added_observer_is_a_no_op() {
        let mut manager: ObservationManager<dyn ReaderObserver, ()> = ObservationManager::new();
        let registered: Arc<dyn ReaderObserver> = Arc::new(CountingObserver);
        let stranger: Arc<dyn ReaderObserver> = Arc::new(CountingObserver);
        manager.add_observer(Arc::clone(&registered));
        manager.remove_observer(&stranger);
        assert_eq!(manager.count_observers(), 1);
        manager.remove_observer(&registered);
        assert_eq!(manager.count_observers(), 0);
    }

    #[test]
    fn distinct_observers_are_kept_apart() {
        let mut manager: ObservationManager<dyn ReaderObserver, ()> = ObservationManager::new();
        manager.add_observer(Arc::new(CountingObserver));
        manager.add_observer(Arc::new(CountingObserver));
        assert_eq!(manager.count_observers(), 2);
        manager.clear_observers();
        assert_eq!(manager.count_observers(), 0);
    }
}
