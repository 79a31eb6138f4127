//! Card selection scenarios: preparation, synchronous execution, scheduling
//! on observable readers and import/export for later replay.

// ───── Std Lib ─────
use std::collections::BTreeMap;
use std::sync::Arc;

// ───── Crates ─────
use log::{debug, warn};
use serde::{Deserialize, Serialize};

// ───── Local Modules ─────
use crate::apdu::{CardRequest, CardSelectionResponse};
use crate::error::{ParseError, ServiceError};
use crate::observable::{NotificationMode, ObservableReader};
use crate::plugin::CardReader;
use crate::selector::CardSelector;

/// Behavior of the selection loop across the prepared cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MultiSelectionProcessing {
    /// Stop after the first case that matches.
    FirstMatch,
    /// Run every case regardless of the previous outcomes.
    ProcessAll,
}

/// What to do with the channels once an exchange completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelControl {
    KeepOpen,
    CloseAfter,
}

/// Per-case request executed by the selection engine: the accepted Select
/// Application status words and the optional APDUs to play after a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardSelectionRequest {
    successful_selection_status_words: Vec<u16>,
    card_request: Option<CardRequest>,
}

impl Default for CardSelectionRequest {
    fn default() -> Self {
        CardSelectionRequest {
            // 0x6283 is "selected but invalidated", still a match
            successful_selection_status_words: vec![0x9000, 0x6283],
            card_request: None,
        }
    }
}

impl CardSelectionRequest {
    pub fn new() -> Self {
        CardSelectionRequest::default()
    }

    pub fn with_successful_selection_status_words(mut self, status_words: Vec<u16>) -> Self {
        self.successful_selection_status_words = status_words;
        self
    }

    pub fn with_card_request(mut self, card_request: CardRequest) -> Self {
        self.card_request = Some(card_request);
        self
    }

    pub fn successful_selection_status_words(&self) -> &[u16] {
        &self.successful_selection_status_words
    }

    pub fn card_request(&self) -> Option<&CardRequest> {
        self.card_request.as_ref()
    }
}

/// A card application selected by a scenario, as built by a selection
/// extension.
pub trait SmartCard: Send + Sync {
    /// Power-on data captured during the selection, if any.
    fn power_on_data(&self) -> Option<String> {
        None
    }

    /// Raw Select Application response captured during the selection, if
    /// any.
    fn select_application_response(&self) -> Option<Vec<u8>> {
        None
    }
}

/// Card-extension side of a selection case: produces the per-case request
/// and interprets the matched response.
pub trait CardSelectionExtension: Send + Sync {
    fn card_selection_request(&self) -> CardSelectionRequest;

    fn parse(&self, response: &CardSelectionResponse) -> Result<Arc<dyn SmartCard>, ParseError>;
}

/// Smart card with no extension-specific content, produced when a scenario
/// is replayed from an imported export.
#[derive(Debug, Clone)]
pub struct GenericSmartCard {
    power_on_data: Option<String>,
    select_application_response: Option<Vec<u8>>,
}

impl SmartCard for GenericSmartCard {
    fn power_on_data(&self) -> Option<String> {
        self.power_on_data.clone()
    }

    fn select_application_response(&self) -> Option<Vec<u8>> {
        self.select_application_response.clone()
    }
}

/// Extension used for imported scenarios: replays the stored request and
/// parses responses into `GenericSmartCard`s.
pub struct DefaultCardSelectionExtension {
    request: CardSelectionRequest,
}

impl DefaultCardSelectionExtension {
    pub fn new() -> Self {
        DefaultCardSelectionExtension {
            request: CardSelectionRequest::new(),
        }
    }

    fn from_request(request: CardSelectionRequest) -> Self {
        DefaultCardSelectionExtension { request }
    }
}

impl Default for DefaultCardSelectionExtension {
    fn default() -> Self {
        DefaultCardSelectionExtension::new()
    }
}

impl CardSelectionExtension for DefaultCardSelectionExtension {
    fn card_selection_request(&self) -> CardSelectionRequest {
        self.request.clone()
    }

    fn parse(&self, response: &CardSelectionResponse) -> Result<Arc<dyn SmartCard>, ParseError> {
        if !response.has_matched() {
            return Err(ParseError::new("the selection case did not match"));
        }
        Ok(Arc::new(GenericSmartCard {
            power_on_data: if response.power_on_data().is_empty() {
                None
            } else {
                Some(response.power_on_data().to_string())
            },
            select_application_response: response
                .select_application_response()
                .map(|r| r.apdu().to_vec()),
        }))
    }
}

/// Selection responses attached to a reader event after a scheduled
/// scenario ran.
#[derive(Debug, Clone)]
pub struct ScheduledCardSelectionsResponse {
    responses: Vec<CardSelectionResponse>,
}

impl ScheduledCardSelectionsResponse {
    pub(crate) fn new(responses: Vec<CardSelectionResponse>) -> Self {
        ScheduledCardSelectionsResponse { responses }
    }

    pub fn card_selection_responses(&self) -> &[CardSelectionResponse] {
        &self.responses
    }
}

/// Result of a processed selection scenario: one smart card per matched
/// case index, the first matched case being the active one.
#[derive(Default)]
pub struct CardSelectionResult {
    smart_cards: BTreeMap<usize, Arc<dyn SmartCard>>,
    active_selection_index: Option<usize>,
}

impl CardSelectionResult {
    fn add_smart_card(&mut self, selection_index: usize, smart_card: Arc<dyn SmartCard>) {
        if self.active_selection_index.is_none() {
            self.active_selection_index = Some(selection_index);
        }
        self.smart_cards.insert(selection_index, smart_card);
    }

    pub fn smart_cards(&self) -> &BTreeMap<usize, Arc<dyn SmartCard>> {
        &self.smart_cards
    }

    pub fn active_smart_card(&self) -> Option<&Arc<dyn SmartCard>> {
        self.active_selection_index
            .and_then(|index| self.smart_cards.get(&index))
    }

    pub fn active_selection_index(&self) -> Option<usize> {
        self.active_selection_index
    }
}

/// Serialized form of a prepared (and possibly processed) scenario.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CardSelectionScenarioDto {
    multi_selection_processing: MultiSelectionProcessing,
    channel_control: ChannelControl,
    card_selectors: Vec<CardSelector>,
    card_selection_requests: Vec<CardSelectionRequest>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    card_selection_responses: Vec<CardSelectionResponse>,
}

/// Builds an ordered list of selection cases and runs it against a reader,
/// either synchronously or as the scenario replayed on each card insertion
/// of an observable reader.
pub struct CardSelectionManager {
    selectors: Vec<CardSelector>,
    extensions: Vec<Arc<dyn CardSelectionExtension>>,
    requests: Vec<CardSelectionRequest>,
    responses: Vec<CardSelectionResponse>,
    multi_selection_processing: MultiSelectionProcessing,
    channel_control: ChannelControl,
}

impl Default for CardSelectionManager {
    fn default() -> Self {
        CardSelectionManager::new()
    }
}

impl CardSelectionManager {
    pub fn new() -> Self {
        CardSelectionManager {
            selectors: Vec::new(),
            extensions: Vec::new(),
            requests: Vec::new(),
            responses: Vec::new(),
            multi_selection_processing: MultiSelectionProcessing::FirstMatch,
            channel_control: ChannelControl::KeepOpen,
        }
    }

    /// Switches the selection loop to process every case instead of
    /// stopping at the first match.
    pub fn set_multiple_selection_mode(&mut self) {
        self.multi_selection_processing = MultiSelectionProcessing::ProcessAll;
    }

    /// Requests the channels to be closed once the scenario completes.
    pub fn prepare_release_channel(&mut self) {
        self.channel_control = ChannelControl::CloseAfter;
    }

    /// Appends a selection case and returns its index.
    pub fn prepare_selection(
        &mut self,
        card_selector: &CardSelector,
        card_selection_extension: Arc<dyn CardSelectionExtension>,
    ) -> Result<usize, ServiceError> {
        card_selector.validate()?;
        self.selectors.push(card_selector.clone());
        self.requests
            .push(card_selection_extension.card_selection_request());
        self.extensions.push(card_selection_extension);
        Ok(self.selectors.len() - 1)
    }

    /// Runs the prepared cases against the given reader and interprets the
    /// responses through the matching extensions.
    pub fn process_card_selection_scenario(
        &mut self,
        reader: &CardReader,
    ) -> Result<CardSelectionResult, ServiceError> {
        if self.selectors.is_empty() {
            return Err(ServiceError::illegal_state(
                "no card selection has been prepared",
            ));
        }
        debug!(
            "Processing a card selection scenario of {} case(s) on reader [{}]",
            self.selectors.len(),
            reader.name()
        );
        let responses = reader.transmit_card_selection_requests(
            &self.selectors,
            &self.requests,
            self.multi_selection_processing,
            self.channel_control,
        )?;
        self.responses = responses.clone();
        self.process_card_selection_responses(&responses)
    }

    /// Stores a snapshot of the prepared cases inside the observable reader;
    /// the scenario then runs on each card insertion.
    pub fn schedule_card_selection_scenario(
        &self,
        reader: &ObservableReader,
        notification_mode: NotificationMode,
    ) -> Result<(), ServiceError> {
        if self.selectors.is_empty() {
            return Err(ServiceError::illegal_state(
                "no card selection has been prepared",
            ));
        }
        reader.schedule_card_selection_scenario(
            self.selectors.clone(),
            self.requests.clone(),
            self.multi_selection_processing,
            self.channel_control,
            notification_mode,
        )
    }

    /// Interprets the responses carried by a reader event.
    pub fn parse_scheduled_card_selections_response(
        &self,
        response: &ScheduledCardSelectionsResponse,
    ) -> Result<CardSelectionResult, ServiceError> {
        self.process_card_selection_responses(response.card_selection_responses())
    }

    /// A case whose extension rejects the response is dropped; the other
    /// selection cases continue.
    fn process_card_selection_responses(
        &self,
        responses: &[CardSelectionResponse],
    ) -> Result<CardSelectionResult, ServiceError> {
        if responses.is_empty() {
            return Err(ServiceError::illegal_argument(
                "the card selection response list is empty",
            ));
        }
        let mut result = CardSelectionResult::default();
        for (index, response) in responses.iter().enumerate() {
            if !response.has_matched() {
                continue;
            }
            let extension = self.extensions.get(index).ok_or_else(|| {
                ServiceError::illegal_argument(format!(
                    "no selection case prepared at index {}",
                    index
                ))
            })?;
            match extension.parse(response) {
                Ok(smart_card) => result.add_smart_card(index, smart_card),
                Err(e) => warn!(
                    "The selection case at index {} rejected the card selection response: {}",
                    index, e
                ),
            }
        }
        Ok(result)
    }

    /// Exports the prepared cases as an opaque string for later replay.
    pub fn export_card_selection_scenario(&self) -> Result<String, ServiceError> {
        if self.selectors.is_empty() {
            return Err(ServiceError::illegal_state(
                "no card selection has been prepared",
            ));
        }
        self.to_json(Vec::new())
    }

    /// Exports the prepared cases together with the responses of the last
    /// processed scenario.
    pub fn export_processed_card_selection_scenario(&self) -> Result<String, ServiceError> {
        if self.responses.is_empty() {
            return Err(ServiceError::illegal_state(
                "no card selection scenario has been processed",
            ));
        }
        self.to_json(self.responses.clone())
    }

    /// Restores the case list from an exported scenario and returns the
    /// index of the last case. The imported cases parse their responses
    /// into `GenericSmartCard`s.
    pub fn import_card_selection_scenario(&mut self, scenario: &str) -> Result<usize, ServiceError> {
        let dto = Self::from_json(scenario)?;
        self.restore(dto, false)?;
        Ok(self.selectors.len() - 1)
    }

    /// Restores a processed scenario and returns its parsed result.
    pub fn import_processed_card_selection_scenario(
        &mut self,
        scenario: &str,
    ) -> Result<CardSelectionResult, ServiceError> {
        let dto = Self::from_json(scenario)?;
        if dto.card_selection_responses.is_empty() {
            return Err(ServiceError::illegal_argument(
                "the scenario carries no card selection responses",
            ));
        }
        self.restore(dto, true)?;
        let responses = self.responses.clone();
        self.process_card_selection_responses(&responses)
    }

    fn to_json(&self, responses: Vec<CardSelectionResponse>) -> Result<String, ServiceError> {
        let dto = CardSelectionScenarioDto {
            multi_selection_processing: self.multi_selection_processing,
            channel_control: self.channel_control,
            card_selectors: self.selectors.clone(),
            card_selection_requests: self.requests.clone(),
            card_selection_responses: responses,
        };
        serde_json::to_string(&dto).map_err(|e| {
            ServiceError::illegal_state(format!("scenario serialization failed: {}", e))
        })
    }

    fn from_json(scenario: &str) -> Result<CardSelectionScenarioDto, ServiceError> {
        if scenario.trim().is_empty() {
            return Err(ServiceError::illegal_argument(
                "the scenario string is empty",
            ));
        }
        let dto: CardSelectionScenarioDto = serde_json::from_str(scenario).map_err(|e| {
            ServiceError::illegal_argument(format!("malformed card selection scenario: {}", e))
        })?;
        if dto.card_selectors.is_empty()
            || dto.card_selectors.len() != dto.card_selection_requests.len()
        {
            return Err(ServiceError::illegal_argument(
                "the scenario must carry one selection request per selector",
            ));
        }
        for selector in &dto.card_selectors {
            selector.validate()?;
        }
        Ok(dto)
    }

    fn restore(
        &mut self,
        dto: CardSelectionScenarioDto,
        keep_responses: bool,
    ) -> Result<(), ServiceError> {
        self.multi_selection_processing = dto.multi_selection_processing;
        self.channel_control = dto.channel_control;
        self.selectors = dto.card_selectors;
        self.extensions = dto
            .card_selection_requests
            .iter()
            .map(|request| {
                Arc::new(DefaultCardSelectionExtension::from_request(request.clone()))
                    as Arc<dyn CardSelectionExtension>
            })
            .collect();
        self.requests = dto.card_selection_requests;
        self.responses = if keep_responses {
            dto.card_selection_responses
        } else {
            Vec::new()
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apdu::ApduResponse;
    use crate::selector::BasicCardSelector;

    fn prepared_manager() -> CardSelectionManager {
        let mut manager = CardSelectionManager::new();
        let selector = CardSelector::from(BasicCardSelector::new().filter_by_power_on_data("3B.*"));
        manager
            .prepare_selection(&selector, Arc::new(DefaultCardSelectionExtension::new()))
            .expect("case prepared");
        manager
    }

    #[test]
    fn prepare_selection_returns_consecutive_indexes() {
        let mut manager = CardSelectionManager::new();
        let selector = CardSelector::from(BasicCardSelector::new());
        let first = manager
            .prepare_selection(&selector, Arc::new(DefaultCardSelectionExtension::new()))
            .expect("case prepared");
        let second = manager
            .prepare_selection(&selector, Arc::new(DefaultCardSelectionExtension::new()))
            .expect("case prepared");
        assert_eq!((first, second), (0, 1));
    }

    #[test]
    fn export_without_prepared_case_is_an_illegal_state() {
        let manager = CardSelectionManager::new();
        assert!(matches!(
            manager.export_card_selection_scenario(),
            Err(ServiceError::IllegalState(_))
        ));
    }

    #[test]
    fn export_then_import_restores_the_case_list() {
        let manager = prepared_manager();
        let exported = manager
            .export_card_selection_scenario()
            .expect("exportable scenario");
        assert!(!exported.is_empty());

        let mut imported = CardSelectionManager::new();
        let last_index = imported
            .import_card_selection_scenario(&exported)
            .expect("importable scenario");
        assert_eq!(last_index, 0);
        let round_trip = imported
            .export_card_selection_scenario()
            .expect("exportable scenario");
        assert_eq!(round_trip, exported);
    }

    #[test]
    fn malformed_imports_are_rejected() {
        let mut manager = CardSelectionManager::new();
        for input in ["", "null", "test"] {
            assert!(
                matches!(
                    manager.import_card_selection_scenario(input),
                    Err(ServiceError::IllegalArgument(_))
                ),
                "input {:?} must be rejected",
                input
            );
        }
    }

    #[test]
    fn processed_export_requires_a_processed_scenario() {
        let manager = prepared_manager();
        assert!(matches!(
            manager.export_processed_card_selection_scenario(),
            Err(ServiceError::IllegalState(_))
        ));
    }

    #[test]
    fn processed_scenario_round_trips_with_its_responses() {
        let mut manager = prepared_manager();
        manager.responses = vec![CardSelectionResponse::new(
            "3B8880010000000000718100F9".to_string(),
            Some(ApduResponse::new(vec![0x6F, 0x00, 0x90, 0x00])),
            true,
            None,
        )];
        let exported = manager
            .export_processed_card_selection_scenario()
            .expect("exportable processed scenario");

        let mut imported = CardSelectionManager::new();
        let result = imported
            .import_processed_card_selection_scenario(&exported)
            .expect("importable processed scenario");
        assert_eq!(result.active_selection_index(), Some(0));
        let card = result.active_smart_card().expect("active smart card");
        assert_eq!(
            card.power_on_data().as_deref(),
            Some("3B8880010000000000718100F9")
        );
        assert_eq!(
            card.select_application_response(),
            Some(vec![0x6F, 0x00, 0x90, 0x00])
        );
    }

    #[test]
    fn rejected_case_is_dropped_and_the_other_cases_continue() {
        struct RejectingExtension;
        impl CardSelectionExtension for RejectingExtension {
            fn card_selection_request(&self) -> CardSelectionRequest {
                CardSelectionRequest::new()
            }
            fn parse(
                &self,
                _response: &CardSelectionResponse,
            ) -> Result<Arc<dyn SmartCard>, ParseError> {
                Err(ParseError::new("unsupported card"))
            }
        }

        let mut manager = CardSelectionManager::new();
        let selector = CardSelector::from(BasicCardSelector::new());
        manager
            .prepare_selection(&selector, Arc::new(RejectingExtension))
            .expect("case prepared");
        manager
            .prepare_selection(&selector, Arc::new(DefaultCardSelectionExtension::new()))
            .expect("case prepared");

        let responses = vec![
            CardSelectionResponse::new("3B00".to_string(), None, true, None),
            CardSelectionResponse::new("3B00".to_string(), None, true, None),
        ];
        let result = manager
            .process_card_selection_responses(&responses)
            .expect("the remaining cases are processed");
        assert!(!result.smart_cards().contains_key(&0));
        assert!(result.smart_cards().contains_key(&1));
        assert_eq!(result.active_selection_index(), Some(1));
    }
}
