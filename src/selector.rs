// ───── Crates ─────
use regex::Regex;
use serde::{Deserialize, Serialize};

// ───── Local Modules ─────
use crate::apdu::hex_bytes_opt;
use crate::error::ServiceError;

/// Position of the application to select relative to the current one, as
/// defined by ISO 7816-4 for the Select Application command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileOccurrence {
    First,
    Last,
    Next,
    Previous,
}

/// Kind of template expected in the Select Application response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileControlInformation {
    Fci,
    Fcp,
    Fmci,
    NoResponse,
}

/// Computes the P2 parameter of the Select Application command from the file
/// occurrence and the expected file control information.
pub(crate) fn compute_select_application_p2(
    file_occurrence: FileOccurrence,
    file_control_information: FileControlInformation,
) -> u8 {
    let occurrence = match file_occurrence {
        FileOccurrence::First => 0x00,
        FileOccurrence::Last => 0x01,
        FileOccurrence::Next => 0x02,
        FileOccurrence::Previous => 0x03,
    };
    let information = match file_control_information {
        FileControlInformation::Fci => 0x00,
        FileControlInformation::Fcp => 0x04,
        FileControlInformation::Fmci => 0x08,
        FileControlInformation::NoResponse => 0x0C,
    };
    occurrence | information
}

/// Selector filtering cards by logical protocol and power-on data only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicCardSelector {
    logical_protocol_name: Option<String>,
    power_on_data_regex: Option<String>,
}

impl BasicCardSelector {
    pub fn new() -> Self {
        BasicCardSelector::default()
    }

    /// Requires the card to communicate with the given application-level
    /// protocol.
    pub fn filter_by_card_protocol(mut self, logical_protocol_name: impl Into<String>) -> Self {
        self.logical_protocol_name = Some(logical_protocol_name.into());
        self
    }

    /// Requires the power-on data to match the given regular expression. The
    /// expression is matched against the whole power-on data string.
    pub fn filter_by_power_on_data(mut self, power_on_data_regex: impl Into<String>) -> Self {
        self.power_on_data_regex = Some(power_on_data_regex.into());
        self
    }
}

/// Selector adding ISO 7816-4 application selection criteria on top of the
/// basic filters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsoCardSelector {
    logical_protocol_name: Option<String>,
    power_on_data_regex: Option<String>,
    #[serde(with = "hex_bytes_opt", default)]
    aid: Option<Vec<u8>>,
    file_occurrence: FileOccurrence,
    file_control_information: FileControlInformation,
}

impl Default for IsoCardSelector {
    fn default() -> Self {
        IsoCardSelector {
            logical_protocol_name: None,
            power_on_data_regex: None,
            aid: None,
            file_occurrence: FileOccurrence::First,
            file_control_information: FileControlInformation::Fci,
        }
    }
}

impl IsoCardSelector {
    pub fn new() -> Self {
        IsoCardSelector::default()
    }

    pub fn filter_by_card_protocol(mut self, logical_protocol_name: impl Into<String>) -> Self {
        self.logical_protocol_name = Some(logical_protocol_name.into());
        self
    }

    pub fn filter_by_power_on_data(mut self, power_on_data_regex: impl Into<String>) -> Self {
        self.power_on_data_regex = Some(power_on_data_regex.into());
        self
    }

    /// Selects the application by its identifier (5 to 16 bytes).
    pub fn filter_by_dfname(mut self, aid: impl Into<Vec<u8>>) -> Self {
        self.aid = Some(aid.into());
        self
    }

    /// Same as `filter_by_dfname` with a hex-encoded identifier.
    pub fn filter_by_dfname_hex(self, aid: &str) -> Result<Self, ServiceError> {
        let bytes = hex::decode(aid).map_err(|e| {
            ServiceError::IllegalArgument(format!("invalid hex AID '{}': {}", aid, e))
        })?;
        Ok(self.filter_by_dfname(bytes))
    }

    pub fn set_file_occurrence(mut self, file_occurrence: FileOccurrence) -> Self {
        self.file_occurrence = file_occurrence;
        self
    }

    pub fn set_file_control_information(
        mut self,
        file_control_information: FileControlInformation,
    ) -> Self {
        self.file_control_information = file_control_information;
        self
    }
}

/// Filter criteria consumed by the selection engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CardSelector {
    Basic(BasicCardSelector),
    Iso(IsoCardSelector),
}

impl CardSelector {
    pub fn logical_protocol_name(&self) -> Option<&str> {
        match self {
            CardSelector::Basic(selector) => selector.logical_protocol_name.as_deref(),
            CardSelector::Iso(selector) => selector.logical_protocol_name.as_deref(),
        }
    }

    pub fn power_on_data_regex(&self) -> Option<&str> {
        match self {
            CardSelector::Basic(selector) => selector.power_on_data_regex.as_deref(),
            CardSelector::Iso(selector) => selector.power_on_data_regex.as_deref(),
        }
    }

    /// The application identifier, absent for basic selectors.
    pub fn aid(&self) -> Option<&[u8]> {
        match self {
            CardSelector::Basic(_) => None,
            CardSelector::Iso(selector) => selector.aid.as_deref(),
        }
    }

    pub fn file_occurrence(&self) -> FileOccurrence {
        match self {
            CardSelector::Basic(_) => FileOccurrence::First,
            CardSelector::Iso(selector) => selector.file_occurrence,
        }
    }

    pub fn file_control_information(&self) -> FileControlInformation {
        match self {
            CardSelector::Basic(_) => FileControlInformation::Fci,
            CardSelector::Iso(selector) => selector.file_control_information,
        }
    }

    /// Checks the filter criteria: the power-on data regex must compile and
    /// the AID, when present, must be 5 to 16 bytes long.
    pub(crate) fn validate(&self) -> Result<(), ServiceError> {
        if let Some(pattern) = self.power_on_data_regex() {
            Regex::new(pattern).map_err(|e| {
                ServiceError::IllegalArgument(format!(
                    "invalid power-on data regex '{}': {}",
                    pattern, e
                ))
            })?;
        }
        if let Some(aid) = self.aid() {
            if aid.len() < 5 || aid.len() > 16 {
                return Err(ServiceError::IllegalArgument(format!(
                    "invalid AID length {} (expected 5 to 16 bytes)",
                    aid.len()
                )));
            }
        }
        Ok(())
    }
}

impl From<BasicCardSelector> for CardSelector {
    fn from(selector: BasicCardSelector) -> Self {
        CardSelector::Basic(selector)
    }
}

impl From<IsoCardSelector> for CardSelector {
    fn from(selector: IsoCardSelector) -> Self {
        CardSelector::Iso(selector)
    }
}
