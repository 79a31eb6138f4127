// ───── Crates ─────
use serde::{Deserialize, Serialize};

/// Default status word accepted by an APDU request.
pub const SW_SUCCESS: u16 = 0x9000;

/// Hex string (de)serialization for APDU byte fields, so that exported
/// scenarios stay readable and diffable.
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode_upper(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(&text).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod hex_bytes_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&hex::encode_upper(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let text: Option<String> = Option::deserialize(deserializer)?;
        match text {
            Some(text) => hex::decode(&text)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// A single APDU command to transmit, together with the status words treated
/// as successful and a free label used in the logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApduRequest {
    #[serde(with = "hex_bytes")]
    apdu: Vec<u8>,
    successful_status_words: Vec<u16>,
    #[serde(default)]
    info: String,
}

impl ApduRequest {
    pub fn new(apdu: Vec<u8>) -> Self {
        ApduRequest {
            apdu,
            successful_status_words: vec![SW_SUCCESS],
            info: String::new(),
        }
    }

    /// Replaces the accepted status word set (the default is `{0x9000}`).
    pub fn with_successful_status_words(mut self, status_words: Vec<u16>) -> Self {
        self.successful_status_words = status_words;
        self
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = info.into();
        self
    }

    pub fn apdu(&self) -> &[u8] {
        &self.apdu
    }

    pub fn successful_status_words(&self) -> &[u16] {
        &self.successful_status_words
    }

    pub fn info(&self) -> &str {
        &self.info
    }
}

/// An ordered set of APDU requests played on an open logical channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardRequest {
    apdu_requests: Vec<ApduRequest>,
    #[serde(default)]
    stop_on_unsuccessful_status_word: bool,
}

impl CardRequest {
    pub fn new(apdu_requests: Vec<ApduRequest>) -> Self {
        CardRequest {
            apdu_requests,
            stop_on_unsuccessful_status_word: false,
        }
    }

    /// Demands status word verification: a response outside the accepted set
    /// aborts the exchange with an unexpected-status-word error.
    pub fn stop_on_unsuccessful_status_word(mut self) -> Self {
        self.stop_on_unsuccessful_status_word = true;
        self
    }

    pub fn apdu_requests(&self) -> &[ApduRequest] {
        &self.apdu_requests
    }

    pub fn is_status_word_verification_needed(&self) -> bool {
        self.stop_on_unsuccessful_status_word
    }
}

/// Raw response to a single APDU, as received from the driver.
///
/// The buffer is at least two bytes long; the last two bytes form the status
/// word, the leading bytes form the outgoing data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApduResponse {
    #[serde(with = "hex_bytes")]
    apdu: Vec<u8>,
}

impl ApduResponse {
    pub fn new(apdu: Vec<u8>) -> Self {
        debug_assert!(apdu.len() >= 2, "an APDU response holds at least a status word");
        ApduResponse { apdu }
    }

    pub fn apdu(&self) -> &[u8] {
        &self.apdu
    }

    /// The last two bytes as a 16-bit integer, high byte first.
    pub fn status_word(&self) -> u16 {
        let len = self.apdu.len();
        (u16::from(self.apdu[len - 2]) << 8) | u16::from(self.apdu[len - 1])
    }

    /// Everything but the status word.
    pub fn data_out(&self) -> &[u8] {
        &self.apdu[..self.apdu.len() - 2]
    }
}

/// Responses collected while playing a card request.
///
/// The list is shorter than the request list when the exchange was cut short.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardResponse {
    apdu_responses: Vec<ApduResponse>,
    is_logical_channel_open: bool,
}

impl CardResponse {
    pub fn new(apdu_responses: Vec<ApduResponse>, is_logical_channel_open: bool) -> Self {
        CardResponse {
            apdu_responses,
            is_logical_channel_open,
        }
    }

    pub fn apdu_responses(&self) -> &[ApduResponse] {
        &self.apdu_responses
    }

    /// State of the logical channel at the moment the response was built.
    pub fn is_logical_channel_open(&self) -> bool {
        self.is_logical_channel_open
    }
}

/// Outcome of one card selection case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardSelectionResponse {
    #[serde(default)]
    power_on_data: String,
    select_application_response: Option<ApduResponse>,
    has_matched: bool,
    card_response: Option<CardResponse>,
}

impl CardSelectionResponse {
    pub fn new(
        power_on_data: String,
        select_application_response: Option<ApduResponse>,
        has_matched: bool,
        card_response: Option<CardResponse>,
    ) -> Self {
        CardSelectionResponse {
            power_on_data,
            select_application_response,
            has_matched,
            card_response,
        }
    }

    /// Power-on data provided by the driver, possibly empty.
    pub fn power_on_data(&self) -> &str {
        &self.power_on_data
    }

    /// The Select Application response, absent when the selector carried no
    /// AID.
    pub fn select_application_response(&self) -> Option<&ApduResponse> {
        self.select_application_response.as_ref()
    }

    pub fn has_matched(&self) -> bool {
        self.has_matched
    }

    /// Responses to the optional embedded card request, absent when no
    /// request was executed.
    pub fn card_response(&self) -> Option<&CardResponse> {
        self.card_response.as_ref()
    }
}
