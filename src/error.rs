// ───── Std Lib ─────
use std::error::Error as StdError;

// ───── Crates ─────
use thiserror::Error;

// ───── Local Modules ─────
use crate::apdu::CardResponse;

/// Boxed source error carried by the I/O error types.
pub type BoxedError = Box<dyn StdError + Send + Sync>;

/// Error raised by a driver when the communication with the reader fails.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ReaderIoError {
    message: String,
    #[source]
    source: Option<BoxedError>,
}

impl ReaderIoError {
    pub fn new(message: impl Into<String>) -> Self {
        ReaderIoError {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(message: impl Into<String>, source: impl Into<BoxedError>) -> Self {
        ReaderIoError {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

/// Error raised by a driver when the card stops responding mid-exchange.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct CardIoError {
    message: String,
    #[source]
    source: Option<BoxedError>,
}

impl CardIoError {
    pub fn new(message: impl Into<String>) -> Self {
        CardIoError {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(message: impl Into<String>, source: impl Into<BoxedError>) -> Self {
        CardIoError {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

/// Error raised by a plugin driver while enumerating or providing readers.
///
/// A `fatal` error means the driver itself became unavailable: the plugin
/// monitoring thread emits an `UNAVAILABLE` event and exits instead of
/// retrying on the next cycle.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct PluginIoError {
    message: String,
    fatal: bool,
    #[source]
    source: Option<BoxedError>,
}

impl PluginIoError {
    pub fn new(message: impl Into<String>) -> Self {
        PluginIoError {
            message: message.into(),
            fatal: false,
            source: None,
        }
    }

    pub fn with_source(message: impl Into<String>, source: impl Into<BoxedError>) -> Self {
        PluginIoError {
            message: message.into(),
            fatal: false,
            source: Some(source.into()),
        }
    }

    /// Marks the error as fatal to the driver.
    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }
}

/// Error returned by `ReaderSpi::transmit_apdu`, keeping the reader-level and
/// card-level failure causes apart.
#[derive(Debug, Error)]
pub enum TransmitError {
    #[error(transparent)]
    Reader(#[from] ReaderIoError),
    #[error(transparent)]
    Card(#[from] CardIoError),
}

/// Error raised by a card selection extension that cannot build a smart card
/// from a selection response.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ParseError(pub String);

impl ParseError {
    pub fn new(message: impl Into<String>) -> Self {
        ParseError(message.into())
    }
}

/// Errors exposed by the service API.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The call is not allowed in the current lifecycle state, e.g. the
    /// reader or plugin is not registered, or the scenario is not prepared.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A provided argument is missing, empty or malformed.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// The communication with the reader failed. Both channels have been
    /// closed; the reader stays registered so a retry is possible.
    #[error("reader communication failure: {message}")]
    ReaderBrokenCommunication {
        message: String,
        #[source]
        source: Option<BoxedError>,
    },

    /// The exchange started but the card stopped responding. Both channels
    /// have been closed.
    #[error("card communication failure: {message}")]
    CardBrokenCommunication {
        message: String,
        #[source]
        source: Option<BoxedError>,
    },

    /// The card returned a status word outside the accepted set while the
    /// request demanded verification. The partial exchange, including the
    /// failing response, is available in `card_response`.
    #[error("unexpected status word 0x{status_word:04X}")]
    UnexpectedStatusWord {
        status_word: u16,
        card_response: CardResponse,
    },

    /// A card selection extension rejected the selection response.
    #[error("invalid card response: {0}")]
    InvalidCardResponse(String),

    /// The driver failed to enumerate or provide readers.
    #[error("plugin I/O failure: {message}")]
    PluginIo {
        message: String,
        #[source]
        source: Option<BoxedError>,
    },

    /// Plugin registration failed: factory misconfigured, name clash or
    /// name mismatch between the factory and the driver.
    #[error("plugin registration failure: {0}")]
    PluginRegistration(String),
}

impl ServiceError {
    pub(crate) fn illegal_state(message: impl Into<String>) -> Self {
        ServiceError::IllegalState(message.into())
    }

    pub(crate) fn illegal_argument(message: impl Into<String>) -> Self {
        ServiceError::IllegalArgument(message.into())
    }
}

impl From<PluginIoError> for ServiceError {
    fn from(error: PluginIoError) -> Self {
        ServiceError::PluginIo {
            message: error.to_string(),
            source: Some(Box::new(error)),
        }
    }
}
