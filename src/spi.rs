//! Driver-side interfaces.
//!
//! A driver exposes one `ReaderSpi` per physical or virtual reader and one
//! `PluginSpi` (or `PoolPluginSpi`) per backend. Optional capabilities are
//! discovered through the `configurable()` / `observable()` probes instead
//! of downcasting: a driver implementing a capability trait returns `Some`
//! from the matching probe.

// ───── Std Lib ─────
use std::sync::Arc;
use std::time::Duration;

// ───── Local Modules ─────
use crate::error::{PluginIoError, ReaderIoError, TransmitError};
use crate::observable::CardEventNotifier;
use crate::selection::SmartCard;

/// How an observable reader signals card arrival or departure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitoringCapability {
    /// The driver pushes events itself through the `CardEventNotifier` it
    /// received at registration.
    Asynchronous,
    /// The driver offers blocking waits (`wait_for_card_insertion` /
    /// `wait_for_card_removal`).
    Blocking,
    /// The driver offers none of the above; the service polls with the given
    /// sleep interval.
    Polling(Duration),
}

/// Core reader driver interface.
pub trait ReaderSpi: Send + Sync {
    /// Unique reader name inside its plugin.
    fn name(&self) -> &str;

    fn open_physical_channel(&self) -> Result<(), ReaderIoError>;

    fn close_physical_channel(&self) -> Result<(), ReaderIoError>;

    fn is_physical_channel_open(&self) -> bool;

    fn check_card_presence(&self) -> Result<bool, ReaderIoError>;

    /// Identification data available once the physical channel is open
    /// (e.g. the ATR with PC/SC). Empty when the driver provides none.
    fn power_on_data(&self) -> String;

    fn is_contactless(&self) -> bool;

    /// Transmits a raw APDU and returns the raw response.
    fn transmit_apdu(&self, apdu: &[u8]) -> Result<Vec<u8>, TransmitError>;

    /// Invoked when the reader is unregistered from the service.
    fn on_unregister(&self) {}

    /// Protocol management capability, when supported.
    fn configurable(&self) -> Option<&dyn ConfigurableReaderSpi> {
        None
    }

    /// Card observation capability, when supported.
    fn observable(&self) -> Option<&dyn ObservableReaderSpi> {
        None
    }
}

/// Capability of a reader whose communication protocols can be selected.
pub trait ConfigurableReaderSpi: Send + Sync {
    fn is_protocol_supported(&self, reader_protocol: &str) -> bool;

    fn activate_protocol(&self, reader_protocol: &str);

    fn deactivate_protocol(&self, reader_protocol: &str);

    /// Tells whether the current card communicates with the given
    /// reader-level protocol.
    fn is_current_protocol(&self, reader_protocol: &str) -> bool;
}

/// Capability of a reader whose card insertions and removals can be
/// observed.
///
/// The blocking wait methods are only invoked when the matching
/// `MonitoringCapability::Blocking` is declared; their `stop_wait_for_*`
/// counterparts must be callable from another thread, must unblock a pending
/// wait and must stay harmless when no wait is in progress.
pub trait ObservableReaderSpi: Send + Sync {
    /// Invoked when the application starts card detection.
    fn on_start_detection(&self) {}

    /// Invoked when the application stops card detection.
    fn on_stop_detection(&self) {}

    fn insertion_monitoring(&self) -> MonitoringCapability;

    fn removal_monitoring(&self) -> MonitoringCapability;

    /// Blocks until a card is inserted.
    fn wait_for_card_insertion(&self) -> Result<(), ReaderIoError> {
        Err(ReaderIoError::new(
            "blocking card insertion wait is not supported by this reader",
        ))
    }

    fn stop_wait_for_card_insertion(&self) -> Result<(), ReaderIoError> {
        Ok(())
    }

    /// Blocks until the card is removed.
    fn wait_for_card_removal(&self) -> Result<(), ReaderIoError> {
        Err(ReaderIoError::new(
            "blocking card removal wait is not supported by this reader",
        ))
    }

    fn stop_wait_for_card_removal(&self) -> Result<(), ReaderIoError> {
        Ok(())
    }

    /// Tells whether the driver can monitor card presence with a blocking
    /// call while the application processes the card.
    fn supports_presence_monitoring(&self) -> bool {
        false
    }

    /// Blocks for as long as the card stays present; returns when it is
    /// removed. Only invoked when `supports_presence_monitoring` is true.
    fn monitor_card_presence_during_processing(&self) -> Result<(), ReaderIoError> {
        Err(ReaderIoError::new(
            "card presence monitoring is not supported by this reader",
        ))
    }

    fn stop_presence_monitoring(&self) -> Result<(), ReaderIoError> {
        Ok(())
    }

    /// Invoked at registration for asynchronous drivers; the notifier is the
    /// handle through which the driver pushes insertion and removal events.
    fn connect_card_event_notifier(&self, _notifier: CardEventNotifier) {}
}

/// Core plugin driver interface.
pub trait PluginSpi: Send + Sync {
    /// Unique plugin name inside the service.
    fn name(&self) -> &str;

    /// Enumerates the readers currently available from the driver.
    fn search_available_readers(&self) -> Result<Vec<Arc<dyn ReaderSpi>>, PluginIoError>;

    /// Invoked when the plugin is unregistered from the service.
    fn on_unregister(&self) {}

    /// Reader-list observation capability, when supported.
    fn observable(&self) -> Option<&dyn ObservablePluginSpi> {
        None
    }

    /// Tells whether the driver pushes reader connections itself through the
    /// plugin handle instead of being polled.
    fn is_autonomous(&self) -> bool {
        false
    }
}

/// Capability of a plugin whose reader list is observed by polling.
pub trait ObservablePluginSpi: Send + Sync {
    /// Interval between two reader-list snapshots.
    fn monitoring_cycle_duration(&self) -> Duration;

    fn search_available_reader_names(&self) -> Result<Vec<String>, PluginIoError>;

    fn search_reader(&self, reader_name: &str) -> Result<Option<Arc<dyn ReaderSpi>>, PluginIoError>;
}

/// Driver interface of a plugin managing a pool of readers allocated on
/// demand.
pub trait PoolPluginSpi: Send + Sync {
    /// Unique plugin name inside the service.
    fn name(&self) -> &str;

    fn reader_group_references(&self) -> Result<Vec<String>, PluginIoError>;

    fn allocate_reader(&self, reader_group_reference: &str)
        -> Result<Arc<dyn ReaderSpi>, PluginIoError>;

    fn release_reader(&self, reader_name: &str) -> Result<(), PluginIoError>;

    /// The card pre-selected by the pool backend on the given reader, if
    /// any.
    fn selected_smart_card(&self, _reader_name: &str) -> Option<Arc<dyn SmartCard>> {
        None
    }

    fn on_unregister(&self) {}
}
