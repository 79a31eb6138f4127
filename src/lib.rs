//! Smart card reader service runtime.
//!
//! This crate sits between application code selecting and exchanging data
//! with ISO 7816 smart cards and the drivers talking to physical or virtual
//! readers. It manages the lifecycle of plugins and readers, drives the
//! card insertion/removal observation state machine of each observable
//! reader, executes ordered card selection scenarios against a freshly
//! inserted card and exposes a uniform APDU transmission primitive
//! regardless of the driver underneath.
//!
//! Drivers plug in through the traits of the [`spi`] module; applications
//! start from [`service::smart_card_service`], register their plugins and
//! build selection scenarios with a [`selection::CardSelectionManager`].

// ───── Modules ─────
pub mod apdu; // APDU value objects and request/response records.
pub mod error; // Error taxonomy of the service API and of the driver SPIs.
mod executor; // Single-worker task queue hosting the monitoring jobs.
pub mod logger; // Optional console logging setup.
pub mod monitoring; // Card observation state machine and monitoring jobs.
pub mod observable; // Observable reader adapter.
pub mod observation; // Observer sets, reader and plugin events.
pub mod plugin; // Plugin adapters and the reader registry.
pub mod reader; // Local reader engine.
pub mod selection; // Card selection manager and scenarios.
pub mod selector; // Card selectors and ISO selection parameters.
pub mod service; // Service root and plugin registration.
pub mod spi; // Driver-side interfaces.

// ───── Re-exports ─────
pub use apdu::{ApduRequest, ApduResponse, CardRequest, CardResponse, CardSelectionResponse};
pub use error::{
    CardIoError, ParseError, PluginIoError, ReaderIoError, ServiceError, TransmitError,
};
pub use monitoring::MonitoringState;
pub use observable::{CardEventNotifier, DetectionMode, NotificationMode, ObservableReader};
pub use observation::{
    PluginEvent, PluginEventType, PluginObservationExceptionHandler, PluginObserver, ReaderEvent,
    ReaderEventType, ReaderObservationExceptionHandler, ReaderObserver,
};
pub use plugin::{CardReader, Plugin, PoolPlugin};
pub use reader::LocalReader;
pub use selection::{
    CardSelectionExtension, CardSelectionManager, CardSelectionRequest, CardSelectionResult,
    ChannelControl, DefaultCardSelectionExtension, GenericSmartCard, MultiSelectionProcessing,
    ScheduledCardSelectionsResponse, SmartCard,
};
pub use selector::{
    BasicCardSelector, CardSelector, FileControlInformation, FileOccurrence, IsoCardSelector,
};
pub use service::{
    smart_card_service, CardExtension, PluginFactory, PoolPluginFactory, SmartCardService,
};
