//! Local reader engine: channel management, protocol discovery, application
//! selection and the APDU transmission loop.

// ───── Std Lib ─────
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

// ───── Crates ─────
use log::{debug, trace, warn};
use regex::Regex;

// ───── Local Modules ─────
use crate::apdu::{ApduRequest, ApduResponse, CardRequest, CardResponse, CardSelectionResponse};
use crate::error::{CardIoError, ServiceError, TransmitError};
use crate::executor::lock;
use crate::selection::{CardSelectionRequest, ChannelControl, MultiSelectionProcessing};
use crate::selector::{compute_select_application_p2, CardSelector};
use crate::spi::ReaderSpi;

const SW1_MASK: u16 = 0xFF00;
const SW2_MASK: u16 = 0x00FF;
const SW_6100: u16 = 0x6100;
const SW_6C00: u16 = 0x6C00;

/// Neutral APDU used to check that the card still responds. The status of
/// the response does not matter, only the fact that the card answers.
const APDU_PING_CARD_PRESENCE: [u8; 5] = [0x00, 0xC0, 0x00, 0x00, 0x00];

/// A reader hosted by a local plugin.
///
/// Cheap to clone; all clones share the same engine state and serialize
/// their driver I/O on the engine mutex.
#[derive(Clone)]
pub struct LocalReader {
    pub(crate) core: Arc<ReaderCore>,
}

pub(crate) struct ReaderCore {
    name: String,
    plugin_name: String,
    spi: Arc<dyn ReaderSpi>,
    registered: AtomicBool,
    channel: Mutex<ChannelState>,
}

#[derive(Default)]
struct ChannelState {
    logical_channel_open: bool,
    use_default_protocol: bool,
    current_logical_protocol: Option<String>,
    current_physical_protocol: Option<String>,
    /// Reader protocol token to application protocol token, in activation
    /// order. The first entry accepted by the driver fixes the card's
    /// logical protocol.
    protocol_associations: Vec<(String, String)>,
    channel_release_requested: bool,
}

/// Card selection status gathered while applying the selector filters.
struct SelectionStatus {
    power_on_data: String,
    select_application_response: Option<ApduResponse>,
    has_matched: bool,
}

impl LocalReader {
    pub(crate) fn new(spi: Arc<dyn ReaderSpi>, plugin_name: &str) -> Self {
        LocalReader {
            core: Arc::new(ReaderCore {
                name: spi.name().to_string(),
                plugin_name: plugin_name.to_string(),
                spi,
                registered: AtomicBool::new(false),
                channel: Mutex::new(ChannelState::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn plugin_name(&self) -> &str {
        &self.core.plugin_name
    }

    pub fn is_registered(&self) -> bool {
        self.core.registered.load(Ordering::SeqCst)
    }

    pub fn is_contactless(&self) -> Result<bool, ServiceError> {
        self.core.check_registered()?;
        Ok(self.core.spi.is_contactless())
    }

    /// Delegates the presence check to the driver.
    pub fn is_card_present(&self) -> Result<bool, ServiceError> {
        self.core.check_registered()?;
        self.core
            .spi
            .check_card_presence()
            .map_err(|e| ServiceError::ReaderBrokenCommunication {
                message: format!("reader '{}' failed to check card presence", self.core.name),
                source: Some(Box::new(e)),
            })
    }

    /// State of the logical channel as tracked by the engine.
    pub fn is_logical_channel_open(&self) -> bool {
        lock(&self.core.channel).logical_channel_open
    }

    /// Associates a reader-level protocol with an application-level protocol
    /// name and activates it in the driver. Configurable readers only.
    pub fn activate_reader_protocol(
        &self,
        reader_protocol: &str,
        application_protocol: &str,
    ) -> Result<(), ServiceError> {
        self.core.check_registered()?;
        if reader_protocol.is_empty() || application_protocol.is_empty() {
            return Err(ServiceError::illegal_argument(
                "protocol names must not be empty",
            ));
        }
        let spi = Arc::clone(&self.core.spi);
        let configurable = spi.configurable().ok_or_else(|| {
            ServiceError::illegal_state(format!(
                "reader '{}' does not support protocol configuration",
                self.core.name
            ))
        })?;
        if !configurable.is_protocol_supported(reader_protocol) {
            return Err(ServiceError::illegal_argument(format!(
                "protocol '{}' is not supported by reader '{}'",
                reader_protocol, self.core.name
            )));
        }
        configurable.activate_protocol(reader_protocol);
        let mut state = lock(&self.core.channel);
        state
            .protocol_associations
            .retain(|(reader, _)| reader != reader_protocol);
        state
            .protocol_associations
            .push((reader_protocol.to_string(), application_protocol.to_string()));
        debug!(
            "Reader [{}] activated protocol [{}] as [{}]",
            self.core.name, reader_protocol, application_protocol
        );
        Ok(())
    }

    /// Removes a protocol association and deactivates it in the driver.
    pub fn deactivate_reader_protocol(&self, reader_protocol: &str) -> Result<(), ServiceError> {
        self.core.check_registered()?;
        let spi = Arc::clone(&self.core.spi);
        let configurable = spi.configurable().ok_or_else(|| {
            ServiceError::illegal_state(format!(
                "reader '{}' does not support protocol configuration",
                self.core.name
            ))
        })?;
        {
            let mut state = lock(&self.core.channel);
            state
                .protocol_associations
                .retain(|(reader, _)| reader != reader_protocol);
        }
        configurable.deactivate_protocol(reader_protocol);
        debug!(
            "Reader [{}] deactivated protocol [{}]",
            self.core.name, reader_protocol
        );
        Ok(())
    }

    /// Requests the closure of the channels after the next successful
    /// exchange. The engine honors the flag on the next `transmit_*` call.
    pub fn release_channel(&self) -> Result<(), ServiceError> {
        self.core.check_registered()?;
        lock(&self.core.channel).channel_release_requested = true;
        Ok(())
    }

    /// Application-level protocol of the current card, known once protocol
    /// discovery ran during a selection with a protocol filter.
    pub fn current_protocol(&self) -> Option<String> {
        lock(&self.core.channel).current_logical_protocol.clone()
    }

    /// Runs the provided selection cases against the card, in order.
    ///
    /// The returned list keeps the input order; it is shorter when the
    /// multi-selection policy stops after the first match.
    pub fn transmit_card_selection_requests(
        &self,
        card_selectors: &[CardSelector],
        card_selection_requests: &[CardSelectionRequest],
        multi_selection_processing: MultiSelectionProcessing,
        channel_control: ChannelControl,
    ) -> Result<Vec<CardSelectionResponse>, ServiceError> {
        self.core.check_registered()?;
        if card_selectors.is_empty() || card_selectors.len() != card_selection_requests.len() {
            return Err(ServiceError::illegal_argument(
                "selectors and selection requests must be non-empty lists of the same length",
            ));
        }
        let started = Instant::now();
        let mut state = lock(&self.core.channel);
        let mut responses = Vec::with_capacity(card_selectors.len());
        for (selector, request) in card_selectors.iter().zip(card_selection_requests) {
            let response =
                self.core
                    .process_card_selection_request(&mut state, selector, request)?;
            let matched = response.has_matched();
            responses.push(response);
            if matched && multi_selection_processing == MultiSelectionProcessing::FirstMatch {
                break;
            }
        }
        if channel_control == ChannelControl::CloseAfter || state.channel_release_requested {
            self.core.close_logical_and_physical_silently(&mut state);
            state.channel_release_requested = false;
        }
        debug!(
            "Reader [{}] processed {}/{} selection case(s) in {} ms",
            self.core.name,
            responses.len(),
            card_selectors.len(),
            started.elapsed().as_millis()
        );
        Ok(responses)
    }

    /// Plays a card request on the logical channel, opening the channels on
    /// first use.
    pub fn transmit_card_request(
        &self,
        card_request: &CardRequest,
        channel_control: ChannelControl,
    ) -> Result<CardResponse, ServiceError> {
        self.core.check_registered()?;
        let started = Instant::now();
        let mut state = lock(&self.core.channel);
        self.core.ensure_physical_channel_open(&mut state)?;
        if !state.logical_channel_open {
            debug!("Reader [{}] opens the logical channel", self.core.name);
            state.logical_channel_open = true;
        }
        let response = self
            .core
            .process_card_request(&mut state, card_request, channel_control)?;
        debug!(
            "Reader [{}] processed {} APDU(s) in {} ms",
            self.core.name,
            response.apdu_responses().len(),
            started.elapsed().as_millis()
        );
        Ok(response)
    }

    pub(crate) fn spi(&self) -> &Arc<dyn ReaderSpi> {
        &self.core.spi
    }

    pub(crate) fn check_registered(&self) -> Result<(), ServiceError> {
        self.core.check_registered()
    }

    pub(crate) fn do_register(&self) {
        self.core.registered.store(true, Ordering::SeqCst);
    }

    /// Marks the reader unusable, releases the channels and notifies the
    /// driver.
    pub(crate) fn do_unregister(&self) {
        self.core.registered.store(false, Ordering::SeqCst);
        self.core.close_channels_silently();
        self.core.spi.on_unregister();
        debug!("Reader [{}] unregistered", self.core.name);
    }
}

impl ReaderCore {
    pub(crate) fn spi(&self) -> &Arc<dyn ReaderSpi> {
        &self.spi
    }

    fn check_registered(&self) -> Result<(), ServiceError> {
        if self.registered.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ServiceError::illegal_state(format!(
                "the reader '{}' is no longer registered",
                self.name
            )))
        }
    }

    /// True when either channel is still open from the engine's standpoint.
    pub(crate) fn is_any_channel_open(&self) -> bool {
        lock(&self.channel).logical_channel_open || self.spi.is_physical_channel_open()
    }

    /// Closes both channels, swallowing driver errors.
    pub(crate) fn close_channels_silently(&self) {
        let mut state = lock(&self.channel);
        self.close_logical_and_physical_silently(&mut state);
    }

    /// Sends the presence ping and reports whether the card answered.
    pub(crate) fn is_card_present_ping(&self) -> bool {
        let _guard = lock(&self.channel);
        match self.spi.transmit_apdu(&APDU_PING_CARD_PRESENCE) {
            Ok(_) => true,
            Err(e) => {
                trace!("Reader [{}] card presence ping failed: {}", self.name, e);
                false
            }
        }
    }

    fn ensure_physical_channel_open(&self, state: &mut ChannelState) -> Result<(), ServiceError> {
        if self.spi.is_physical_channel_open() {
            return Ok(());
        }
        debug!("Reader [{}] opens the physical channel", self.name);
        self.spi.open_physical_channel().map_err(|e| {
            self.close_logical_and_physical_silently(state);
            ServiceError::ReaderBrokenCommunication {
                message: format!("reader '{}' failed to open the physical channel", self.name),
                source: Some(Box::new(e)),
            }
        })
    }

    fn close_logical_channel(&self, state: &mut ChannelState) {
        if state.logical_channel_open {
            debug!("Reader [{}] closes the logical channel", self.name);
        }
        state.logical_channel_open = false;
    }

    fn close_logical_and_physical_silently(&self, state: &mut ChannelState) {
        self.close_logical_channel(state);
        if self.spi.is_physical_channel_open() {
            if let Err(e) = self.spi.close_physical_channel() {
                debug!(
                    "Reader [{}] failed to close the physical channel: {}",
                    self.name, e
                );
            }
        }
    }

    /// Determines the application-level protocol of the current card from
    /// the protocol association map. An empty map means any protocol is
    /// acceptable.
    fn compute_current_protocol(&self, state: &mut ChannelState) {
        state.current_logical_protocol = None;
        if state.protocol_associations.is_empty() {
            state.use_default_protocol = true;
            return;
        }
        state.use_default_protocol = false;
        if let Some(configurable) = self.spi.configurable() {
            for (reader_protocol, application_protocol) in &state.protocol_associations {
                if configurable.is_current_protocol(reader_protocol) {
                    state.current_logical_protocol = Some(application_protocol.clone());
                    state.current_physical_protocol = Some(reader_protocol.clone());
                    break;
                }
            }
        }
        debug!(
            "Reader [{}] current protocol is [{:?}] over [{:?}]",
            self.name, state.current_logical_protocol, state.current_physical_protocol
        );
    }

    /// Runs one selection case: filters, optional application selection and
    /// the optional embedded card request.
    fn process_card_selection_request(
        &self,
        state: &mut ChannelState,
        selector: &CardSelector,
        request: &CardSelectionRequest,
    ) -> Result<CardSelectionResponse, ServiceError> {
        self.close_logical_channel(state);
        let status = self.process_selection(state, selector, request)?;
        if !status.has_matched {
            return Ok(CardSelectionResponse::new(
                status.power_on_data,
                status.select_application_response,
                false,
                None,
            ));
        }
        state.logical_channel_open = true;
        let card_response = match request.card_request() {
            Some(card_request) => Some(self.process_card_request(
                state,
                card_request,
                ChannelControl::KeepOpen,
            )?),
            None => None,
        };
        Ok(CardSelectionResponse::new(
            status.power_on_data,
            status.select_application_response,
            true,
            card_response,
        ))
    }

    /// Applies the three selector filters in order: protocol, power-on data,
    /// AID. The first failing filter produces a non-matching status; a case
    /// with no active filter matches.
    fn process_selection(
        &self,
        state: &mut ChannelState,
        selector: &CardSelector,
        request: &CardSelectionRequest,
    ) -> Result<SelectionStatus, ServiceError> {
        self.ensure_physical_channel_open(state)?;
        let power_on_data = self.spi.power_on_data();

        if let Some(wanted_protocol) = selector.logical_protocol_name() {
            self.compute_current_protocol(state);
            if !state.use_default_protocol
                && state.current_logical_protocol.as_deref() != Some(wanted_protocol)
            {
                debug!(
                    "Reader [{}] skips selection, current protocol [{:?}] does not match [{}]",
                    self.name, state.current_logical_protocol, wanted_protocol
                );
                return Ok(SelectionStatus {
                    power_on_data,
                    select_application_response: None,
                    has_matched: false,
                });
            }
        }

        if let Some(pattern) = selector.power_on_data_regex() {
            let regex = Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
                ServiceError::illegal_argument(format!(
                    "invalid power-on data regex '{}': {}",
                    pattern, e
                ))
            })?;
            if power_on_data.is_empty() || !regex.is_match(&power_on_data) {
                debug!(
                    "Reader [{}] skips selection, power-on data [{}] does not match [{}]",
                    self.name, power_on_data, pattern
                );
                return Ok(SelectionStatus {
                    power_on_data,
                    select_application_response: None,
                    has_matched: false,
                });
            }
        }

        if let Some(aid) = selector.aid() {
            if aid.len() < 5 || aid.len() > 16 {
                return Err(ServiceError::illegal_argument(format!(
                    "invalid AID length {} (expected 5 to 16 bytes)",
                    aid.len()
                )));
            }
            let response = self.select_by_aid(state, selector, aid)?;
            let accepted = request
                .successful_selection_status_words()
                .contains(&response.status_word());
            if !accepted {
                debug!(
                    "Reader [{}] application selection rejected with status word 0x{:04X}",
                    self.name,
                    response.status_word()
                );
            }
            return Ok(SelectionStatus {
                power_on_data,
                select_application_response: Some(response),
                has_matched: accepted,
            });
        }

        Ok(SelectionStatus {
            power_on_data,
            select_application_response: None,
            has_matched: true,
        })
    }

    /// Sends the ISO 7816-4 Select Application command built from the
    /// selector attributes.
    fn select_by_aid(
        &self,
        state: &mut ChannelState,
        selector: &CardSelector,
        aid: &[u8],
    ) -> Result<ApduResponse, ServiceError> {
        let p2 = compute_select_application_p2(
            selector.file_occurrence(),
            selector.file_control_information(),
        );
        let mut apdu = Vec::with_capacity(6 + aid.len());
        apdu.extend_from_slice(&[0x00, 0xA4, 0x04, p2, aid.len() as u8]);
        apdu.extend_from_slice(aid);
        apdu.push(0x00);
        debug!(
            "Reader [{}] selects application [{}]",
            self.name,
            hex::encode_upper(aid)
        );
        let request = ApduRequest::new(apdu).with_info("Select Application");
        self.process_apdu_request(state, &request).map_err(|e| {
            self.close_logical_and_physical_silently(state);
            self.map_transmit_error(e, "selecting the application")
        })
    }

    /// Plays every APDU of the request, stopping early on a rejected status
    /// word when verification is demanded.
    fn process_card_request(
        &self,
        state: &mut ChannelState,
        card_request: &CardRequest,
        channel_control: ChannelControl,
    ) -> Result<CardResponse, ServiceError> {
        let mut apdu_responses = Vec::with_capacity(card_request.apdu_requests().len());
        for apdu_request in card_request.apdu_requests() {
            match self.process_apdu_request(state, apdu_request) {
                Ok(response) => {
                    let status_word = response.status_word();
                    let accepted = apdu_request
                        .successful_status_words()
                        .contains(&status_word);
                    apdu_responses.push(response);
                    if !accepted && card_request.is_status_word_verification_needed() {
                        warn!(
                            "Reader [{}] unexpected status word 0x{:04X} for [{}]",
                            self.name,
                            status_word,
                            apdu_request.info()
                        );
                        let card_response =
                            CardResponse::new(apdu_responses, state.logical_channel_open);
                        return Err(ServiceError::UnexpectedStatusWord {
                            status_word,
                            card_response,
                        });
                    }
                }
                Err(e) => {
                    self.close_logical_and_physical_silently(state);
                    return Err(self.map_transmit_error(e, "transmitting an APDU"));
                }
            }
        }
        if channel_control == ChannelControl::CloseAfter || state.channel_release_requested {
            self.close_logical_and_physical_silently(state);
            state.channel_release_requested = false;
        }
        Ok(CardResponse::new(apdu_responses, state.logical_channel_open))
    }

    /// Transmits one APDU, handling the 0x6Cxx length correction and the
    /// 0x61xx GET RESPONSE chaining for case 4 commands.
    fn process_apdu_request(
        &self,
        state: &mut ChannelState,
        apdu_request: &ApduRequest,
    ) -> Result<ApduResponse, TransmitError> {
        let started = Instant::now();
        let mut response = self.transmit_raw(apdu_request.apdu())?;

        if response.status_word() & SW1_MASK == SW_6C00 {
            // The card indicated the exact expected length: reissue with Le
            // set to SW2.
            let expected_length = (response.status_word() & SW2_MASK) as u8;
            let mut retry = apdu_request.apdu().to_vec();
            if let Some(last) = retry.last_mut() {
                *last = expected_length;
            }
            debug!(
                "Reader [{}] reissues [{}] with Le={}",
                self.name,
                apdu_request.info(),
                expected_length
            );
            response = self.transmit_raw(&retry)?;
        }

        if response.status_word() & SW1_MASK == SW_6100 && is_case4(apdu_request.apdu()) {
            let mut data = response.data_out().to_vec();
            loop {
                let available = (response.status_word() & SW2_MASK) as u8;
                let get_response = [0x00, 0xC0, 0x00, 0x00, available];
                response = self.transmit_raw(&get_response)?;
                data.extend_from_slice(response.data_out());
                if response.status_word() & SW1_MASK != SW_6100 {
                    break;
                }
            }
            let status_word = response.status_word();
            data.push((status_word >> 8) as u8);
            data.push((status_word & 0x00FF) as u8);
            response = ApduResponse::new(data);
        }

        trace!(
            "Reader [{}] APDU [{}] processed in {} us",
            self.name,
            apdu_request.info(),
            started.elapsed().as_micros()
        );
        Ok(response)
    }

    fn transmit_raw(&self, apdu: &[u8]) -> Result<ApduResponse, TransmitError> {
        trace!("Reader [{}] --> [{}]", self.name, hex::encode_upper(apdu));
        let bytes = self.spi.transmit_apdu(apdu)?;
        if bytes.len() < 2 {
            return Err(TransmitError::Card(CardIoError::new(format!(
                "incomplete APDU response of {} byte(s)",
                bytes.len()
            ))));
        }
        trace!("Reader [{}] <-- [{}]", self.name, hex::encode_upper(&bytes));
        Ok(ApduResponse::new(bytes))
    }

    fn map_transmit_error(&self, error: TransmitError, action: &str) -> ServiceError {
        match error {
            TransmitError::Reader(e) => ServiceError::ReaderBrokenCommunication {
                message: format!("reader '{}' failed while {}", self.name, action),
                source: Some(Box::new(e)),
            },
            TransmitError::Card(e) => ServiceError::CardBrokenCommunication {
                message: format!(
                    "the card in reader '{}' stopped responding while {}",
                    self.name, action
                ),
                source: Some(Box::new(e)),
            },
        }
    }
}

/// A command is case 4 when it carries both command data and an expected
/// response length: header, Lc, Lc data bytes, then Le.
fn is_case4(apdu: &[u8]) -> bool {
    if apdu.len() < 6 {
        return false;
    }
    let lc = apdu[4] as usize;
    apdu.len() == 5 + lc + 1
}
