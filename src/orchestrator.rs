//! Provisioning control plane.
//!
//! The [`Orchestrator`] is the only mutator of the state machine and
//! the session crypto. It routes GATT writes by characteristic, runs
//! the key exchange, decrypts and parses credentials, drives the WiFi
//! driver and emits authenticated status notifications back to the
//! peer.
//!
//! All collaborators are injected as trait objects; the state machine
//! reports transitions into a function-typed sink (no back-pointer),
//! which the orchestrator drains after every dispatched event.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::ProvisioningConfig;
use crate::credentials::WifiCredentials;
use crate::crypto::{
    public_key_frame, CryptoError, EncryptedMessage, SessionCrypto, WireFrame, IV_LEN,
    PUBLIC_KEY_LEN,
};
use crate::error::ErrorKind;
use crate::gatt::{BleNotifier, Characteristic, ControlCommand, EventQueue, LinkEvent,
    DRAIN_BATCH_MAX};
use crate::state::{
    ProvisioningState, StateContext, StateEvent, StateMachine, StateTransition,
};
use crate::storage::CredentialStore;
use crate::wifi::{ConnectionInfo, DisconnectReason, WifiDriver};

/// Recoverable crypto/parse failures tolerated per session before the
/// machine escalates to `Error`.
const MAX_SESSION_FAILURES: u8 = 3;

/// Status label for success notifications.
const STATUS_SUCCESS: &str = "SUCCESS";

/// Status label for error notifications.
const STATUS_ERROR: &str = "ERROR";

/// Fired on every reported failure with `(kind, message, can_retry)`.
pub type ErrorCallback = Box<dyn FnMut(ErrorKind, &str, bool)>;

/// Fired on every state transition with `(from, to)`.
pub type StateChangeCallback = Box<dyn FnMut(ProvisioningState, ProvisioningState)>;

/// Fired for writes on the data characteristic.
pub type DataReceivedCallback = Box<dyn FnMut(&[u8])>;

/// Fired once provisioning succeeds, with the SSID and elapsed time.
pub type ProvisioningCompleteCallback = Box<dyn FnMut(&str, Duration)>;

type TransitionRecord = (ProvisioningState, ProvisioningState, StateEvent);

/// Coordinates the state machine, session crypto and radio
/// collaborators for one provisioning ceremony at a time.
pub struct Orchestrator {
    config: ProvisioningConfig,
    state: StateMachine,
    crypto: SessionCrypto,
    wifi: Box<dyn WifiDriver>,
    notifier: Box<dyn BleNotifier>,
    store: Option<Box<dyn CredentialStore>>,
    queue: Arc<EventQueue>,
    transitions: Rc<RefCell<VecDeque<TransitionRecord>>>,
    error_callback: Option<ErrorCallback>,
    state_callback: Option<StateChangeCallback>,
    data_callback: Option<DataReceivedCallback>,
    complete_callback: Option<ProvisioningCompleteCallback>,
    session_failures: u8,
    started_at: Option<Instant>,
}

impl Orchestrator {
    /// Build the control plane around its collaborators.
    ///
    /// Fails when the crypto subsystem cannot be seeded.
    pub fn new(
        config: ProvisioningConfig,
        wifi: Box<dyn WifiDriver>,
        notifier: Box<dyn BleNotifier>,
        store: Option<Box<dyn CredentialStore>>,
    ) -> Result<Self, CryptoError> {
        let mut crypto = SessionCrypto::new(&config)?;
        crypto.generate_keypair();

        let mut state = StateMachine::new();
        Self::register_extra_transitions(&mut state);
        Self::arm_state_timeouts(&mut state, &config);

        let transitions: Rc<RefCell<VecDeque<TransitionRecord>>> =
            Rc::new(RefCell::new(VecDeque::new()));
        let sink = Rc::clone(&transitions);
        state.on_transition(move |from, to, event| {
            sink.borrow_mut().push_back((from, to, event));
        });

        Ok(Self {
            config,
            state,
            crypto,
            wifi,
            notifier,
            store,
            queue: Arc::new(EventQueue::new()),
            transitions,
            error_callback: None,
            state_callback: None,
            data_callback: None,
            complete_callback: None,
            session_failures: 0,
            started_at: None,
        })
    }

    /// Transitions beyond the canonical table: stop-advertising and
    /// the configured timeout exits.
    fn register_extra_transitions(state: &mut StateMachine) {
        use ProvisioningState::*;
        use StateEvent::*;

        state.add_transition(StateTransition::new(Advertising, StopAdvertising, Idle));
        state.add_transition(StateTransition::new(Connected, ConnectionTimeout, Advertising));
        state.add_transition(StateTransition::new(
            Authenticating,
            ConnectionTimeout,
            Advertising,
        ));
        state.add_transition(StateTransition::new(
            ReceivingCredentials,
            ProvisioningTimeout,
            Error,
        ));
        state.add_transition(StateTransition::new(
            ConnectingWifi,
            ProvisioningTimeout,
            Error,
        ));
    }

    fn arm_state_timeouts(state: &mut StateMachine, config: &ProvisioningConfig) {
        use ProvisioningState::*;
        use StateEvent::*;

        state.set_state_timeout(Connected, config.auth_timeout_ms, ConnectionTimeout);
        state.set_state_timeout(Authenticating, config.auth_timeout_ms, ConnectionTimeout);
        state.set_state_timeout(
            ReceivingCredentials,
            config.session_timeout_ms,
            ProvisioningTimeout,
        );
        state.set_state_timeout(ConnectingWifi, config.session_timeout_ms, ProvisioningTimeout);
    }

    // ==================== Callback registration ====================

    pub fn on_error(&mut self, callback: impl FnMut(ErrorKind, &str, bool) + 'static) {
        self.error_callback = Some(Box::new(callback));
    }

    pub fn on_state_change(
        &mut self,
        callback: impl FnMut(ProvisioningState, ProvisioningState) + 'static,
    ) {
        self.state_callback = Some(Box::new(callback));
    }

    pub fn on_data_received(&mut self, callback: impl FnMut(&[u8]) + 'static) {
        self.data_callback = Some(Box::new(callback));
    }

    pub fn on_provisioning_complete(&mut self, callback: impl FnMut(&str, Duration) + 'static) {
        self.complete_callback = Some(Box::new(callback));
    }

    // ==================== Queries ====================

    pub fn state(&self) -> ProvisioningState {
        self.state.current_state()
    }

    pub fn previous_state(&self) -> ProvisioningState {
        self.state.previous_state()
    }

    pub fn context(&self) -> &StateContext {
        self.state.context()
    }

    pub fn state_history(&self, max_count: usize) -> Vec<ProvisioningState> {
        self.state.state_history(max_count)
    }

    pub fn is_provisioned(&self) -> bool {
        self.state.is_in_state(ProvisioningState::Provisioned)
    }

    pub fn is_session_established(&self) -> bool {
        self.crypto.is_established()
    }

    /// Device public key for out-of-band display, if one exists.
    pub fn public_key(&self) -> Option<[u8; PUBLIC_KEY_LEN]> {
        self.crypto.public_key()
    }

    /// Constant-time check of an out-of-band PIN.
    pub fn verify_pin(&self, candidate: &str) -> bool {
        self.crypto.verify_pin(candidate)
    }

    /// Queue handle for platforms whose radio callbacks arrive off the
    /// main loop; [`poll`](Self::poll) drains it.
    pub fn event_queue(&self) -> Arc<EventQueue> {
        Arc::clone(&self.queue)
    }

    // ==================== Lifecycle ====================

    /// Open the provisioning window (start advertising).
    pub fn start_provisioning(&mut self) -> bool {
        info!(
            "starting provisioning as {} (security {})",
            self.config.device_name, self.config.security_level
        );
        self.started_at = Some(Instant::now());
        self.fire(StateEvent::StartAdvertising)
    }

    /// Close the provisioning window.
    pub fn stop_provisioning(&mut self) -> bool {
        self.fire(StateEvent::StopAdvertising)
    }

    /// Leave the `Error` state after the embedder resolved the cause.
    pub fn recover_from_error(&mut self) -> bool {
        self.fire(StateEvent::ErrorRecovered)
    }

    /// Drop the session, wipe key material and return to `Idle`.
    pub fn reset(&mut self) {
        info!("resetting provisioning core");
        self.crypto.terminate_session();
        self.session_failures = 0;
        self.state.reset();
        self.drain_transitions();
        self.started_at = None;
    }

    /// Attempt to rejoin the stored network before advertising.
    ///
    /// Returns true when a stored record exists and the join succeeds;
    /// the machine stays in `Idle` either way.
    pub fn try_stored_reconnect(&mut self) -> bool {
        if !self.config.auto_reconnect {
            return false;
        }
        let loaded = match self.store.as_ref() {
            Some(store) => store.load(),
            None => return false,
        };
        let credentials = match loaded {
            Ok(Some(credentials)) => credentials,
            Ok(None) => return false,
            Err(e) => {
                self.report_error(e.kind(), &e.to_string());
                return false;
            }
        };

        info!("rejoining stored network {}", credentials.ssid);
        match self.wifi.connect(&credentials) {
            Ok(link) => {
                let ctx = self.state.context_mut();
                ctx.ssid = link.ssid.clone();
                ctx.ip_address = link.ip_address.clone();
                info!("rejoined {} at {}", link.ssid, link.ip_address);
                true
            }
            Err(e) => {
                warn!("stored-network rejoin failed: {}", e);
                false
            }
        }
    }

    /// One cooperative loop iteration: drain queued radio events in a
    /// bounded batch, then check the state deadline.
    pub fn poll(&mut self) {
        let events = self.queue.drain_batch(DRAIN_BATCH_MAX);
        for event in events {
            self.dispatch_link_event(event);
        }
        if let Some(event) = self.state.check_timeouts() {
            self.drain_transitions();
            self.enforce_session_invariant();
            self.report_error(
                ErrorKind::TimeoutError,
                &format!("{} deadline exceeded", event),
            );
        }
    }

    fn dispatch_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::BleWrite {
                characteristic,
                data,
            } => self.dispatch_write(characteristic, &data),
            LinkEvent::BleConnected { peer } => self.on_ble_connect(&peer),
            LinkEvent::BleDisconnected { peer, reason } => self.on_ble_disconnect(&peer, &reason),
            LinkEvent::WifiConnected(link) => self.on_wifi_connected(&link),
            LinkEvent::WifiDisconnected(reason) => self.on_wifi_disconnected(reason),
        }
    }

    // ==================== BLE entry points ====================

    /// A central connected; begin the authentication window.
    pub fn on_ble_connect(&mut self, peer_address: &str) {
        info!("BLE central {} connected", peer_address);
        if !self.fire(StateEvent::BleClientConnected) {
            warn!(
                "BLE connection ignored in state {}",
                self.state.current_state()
            );
            return;
        }
        self.state.context_mut().peer_address = peer_address.to_string();
        // Fresh asymmetric material for every peer.
        self.crypto.generate_keypair();
        self.session_failures = 0;
    }

    /// The central dropped; tear the session down.
    pub fn on_ble_disconnect(&mut self, peer_address: &str, reason: &str) {
        info!("BLE central {} disconnected: {}", peer_address, reason);
        let handled = self.fire(StateEvent::BleClientDisconnected);
        self.crypto.terminate_session();
        self.session_failures = 0;
        let ctx = self.state.context_mut();
        ctx.peer_address.clear();
        ctx.secure_session = false;
        if handled && self.state.is_in_state(ProvisioningState::Advertising) {
            self.report_error(ErrorKind::BleConnectionLost, reason);
        }
    }

    /// A peer wrote to one of the service characteristics.
    pub fn on_ble_write(&mut self, characteristic_uuid: &str, data: &[u8]) {
        match Characteristic::from_uuid(characteristic_uuid) {
            Some(characteristic) => self.dispatch_write(characteristic, data),
            None => warn!("write to unknown characteristic {}", characteristic_uuid),
        }
    }

    fn dispatch_write(&mut self, characteristic: Characteristic, data: &[u8]) {
        debug!("{} write ({} bytes)", characteristic, data.len());
        match characteristic {
            Characteristic::Credentials => self.handle_credentials_write(data),
            Characteristic::Control => self.handle_control_write(data),
            Characteristic::Data => {
                // Reserved for post-provision traffic; echoed out, no
                // state change.
                if let Some(callback) = self.data_callback.as_mut() {
                    callback(data);
                }
            }
            Characteristic::Status => warn!("status characteristic is notify-only"),
        }
    }

    fn handle_credentials_write(&mut self, data: &[u8]) {
        match WireFrame::parse(data) {
            Ok(WireFrame::PublicKey(peer_key)) => self.handle_key_exchange(&peer_key),
            Ok(WireFrame::Ciphertext(body)) => self.handle_encrypted_credentials(body),
            Err(_) => {
                self.send_status(STATUS_ERROR, "Malformed frame");
                self.record_session_failure(
                    ErrorKind::CryptoDecryptFailed,
                    "malformed credentials frame",
                );
            }
        }
    }

    fn handle_control_write(&mut self, data: &[u8]) {
        let byte = match data.first() {
            Some(byte) => *byte,
            None => {
                warn!("empty control write");
                return;
            }
        };
        match ControlCommand::from_byte(byte) {
            Some(ControlCommand::Reset) => {
                info!("reset requested by peer");
                self.reset();
            }
            Some(command) => debug!("advisory control command {:?}", command),
            None => warn!("unknown control command 0x{:02X}", byte),
        }
    }

    // ==================== Key exchange ====================

    fn handle_key_exchange(&mut self, peer_key: &[u8; PUBLIC_KEY_LEN]) {
        if self.crypto.is_established() {
            warn!("public key received with a session already live; ignoring");
            return;
        }
        let started = self.fire(StateEvent::AuthStarted);
        if !started && !self.state.is_in_state(ProvisioningState::Authenticating) {
            warn!(
                "key exchange attempted in state {}",
                self.state.current_state()
            );
            return;
        }

        let result = self
            .crypto
            .compute_shared_secret(peer_key)
            .and_then(|_| self.crypto.derive_session_key());
        match result {
            Ok(()) => {
                // Answer with our public key before anything travels
                // encrypted; the only plaintext bootstrap frame.
                if let Some(our_key) = self.crypto.public_key() {
                    let frame = public_key_frame(&our_key);
                    self.notifier.notify(Characteristic::Status, &frame);
                }
                self.state.context_mut().secure_session = true;
                self.fire(StateEvent::AuthSuccess);
                info!("secure session established");
            }
            Err(e) => {
                self.send_status(STATUS_ERROR, "Key exchange failed");
                self.fire(StateEvent::AuthFailed);
                self.fire_with(StateEvent::ErrorOccurred, Some("key exchange failed"));
                self.report_error(e.kind(), &e.to_string());
            }
        }
    }

    // ==================== Credentials ====================

    fn handle_encrypted_credentials(&mut self, body: &[u8]) {
        if !self.crypto.is_established() {
            warn!("ciphertext received before key exchange");
            self.send_status(STATUS_ERROR, "Session not established");
            self.report_error(
                ErrorKind::AuthenticationFailed,
                "ciphertext before key exchange",
            );
            return;
        }
        if body.len() <= IV_LEN {
            self.send_status(STATUS_ERROR, "Decryption failed");
            self.record_session_failure(
                ErrorKind::CryptoDecryptFailed,
                "invalid encrypted packet size",
            );
            return;
        }

        let plaintext = match EncryptedMessage::from_wire(body)
            .and_then(|message| self.crypto.decrypt(&message))
        {
            Ok(plaintext) => plaintext,
            Err(_) => {
                self.send_status(STATUS_ERROR, "Decryption failed");
                self.record_session_failure(
                    ErrorKind::CryptoDecryptFailed,
                    "credential decryption failed",
                );
                return;
            }
        };

        let payload = match std::str::from_utf8(&plaintext) {
            Ok(payload) => payload,
            Err(_) => {
                self.send_status(STATUS_ERROR, "Invalid format");
                self.fire(StateEvent::CredentialsInvalid);
                self.record_session_failure(
                    ErrorKind::CredentialFormatInvalid,
                    "credential payload is not UTF-8",
                );
                return;
            }
        };
        let credentials = match WifiCredentials::from_json(payload) {
            Ok(credentials) => credentials,
            Err(e) => {
                self.send_status(STATUS_ERROR, "Invalid format");
                self.fire(StateEvent::CredentialsInvalid);
                let message = e.to_string();
                self.record_session_failure(ErrorKind::CredentialFormatInvalid, &message);
                return;
            }
        };

        info!("credentials received for {}", credentials.ssid);
        self.session_failures = 0;
        self.state.context_mut().ssid = credentials.ssid.clone();
        self.state.context_mut().retry_count = 0;
        self.fire(StateEvent::CredentialsReceived);
        self.fire(StateEvent::WifiConnectStarted);
        self.connect_wifi(credentials);
    }

    /// Hand the credentials to the driver and settle the outcome.
    ///
    /// The plaintext credential value lives exactly as long as this
    /// frame: persistence (gated on reaching `Provisioned`) happens
    /// before it drops and zeroizes.
    fn connect_wifi(&mut self, credentials: WifiCredentials) {
        info!("connecting to {}", credentials.ssid);
        match self.wifi.connect(&credentials) {
            Ok(link) => {
                self.finish_wifi_connected(&link);
                if self.config.persist_credentials
                    && self.state.is_in_state(ProvisioningState::Provisioned)
                {
                    self.persist_credentials(&credentials);
                }
            }
            Err(e) => {
                self.send_status(STATUS_ERROR, "WiFi connection failed");
                self.fire(StateEvent::WifiConnectionFailed);
                self.report_error(e.kind(), &e.to_string());
            }
        }
    }

    fn persist_credentials(&mut self, credentials: &WifiCredentials) {
        let result = match self.store.as_mut() {
            Some(store) => store.save(&credentials.ssid, &credentials.password),
            None => return,
        };
        if let Err(e) = result {
            // Non-fatal for the provisioning outcome.
            self.report_error(e.kind(), &e.to_string());
        }
    }

    // ==================== WiFi entry points ====================

    /// The station link came up.
    pub fn on_wifi_connected(&mut self, link: &ConnectionInfo) {
        self.finish_wifi_connected(link);
    }

    /// The station link dropped.
    pub fn on_wifi_disconnected(&mut self, reason: DisconnectReason) {
        warn!("WiFi disconnected: {}", reason);
        let state = self.state.current_state();
        self.fire(StateEvent::WifiDisconnected);
        match state {
            ProvisioningState::ConnectingWifi | ProvisioningState::ValidatingConnection => {
                self.fire_with(StateEvent::ErrorOccurred, Some(reason.as_str()));
                self.report_error(
                    ErrorKind::WifiConnectionFailed,
                    &format!("link lost before provisioning: {}", reason),
                );
            }
            ProvisioningState::Provisioned => {
                self.report_error(
                    ErrorKind::WifiConnectionFailed,
                    &format!("link lost: {}", reason),
                );
            }
            _ => {}
        }
    }

    fn finish_wifi_connected(&mut self, link: &ConnectionInfo) {
        if !self.fire(StateEvent::WifiConnected) {
            warn!("WiFi link up in state {}", self.state.current_state());
            return;
        }
        self.state.context_mut().ip_address = link.ip_address.clone();

        let message = format!("Connected to {}", link.ssid);
        self.send_status(STATUS_SUCCESS, &message);

        let duration = self
            .started_at
            .take()
            .map(|t| t.elapsed())
            .unwrap_or_default();
        info!("provisioned to {} in {} ms", link.ssid, duration.as_millis());
        if let Some(callback) = self.complete_callback.as_mut() {
            callback(&link.ssid, duration);
        }
    }

    // ==================== Internals ====================

    fn fire(&mut self, event: StateEvent) -> bool {
        self.fire_with(event, None)
    }

    fn fire_with(&mut self, event: StateEvent, payload: Option<&str>) -> bool {
        let handled = self.state.handle_event_with(event, payload);
        self.drain_transitions();
        self.enforce_session_invariant();
        handled
    }

    fn drain_transitions(&mut self) {
        let records: Vec<TransitionRecord> = self.transitions.borrow_mut().drain(..).collect();
        for (from, to, event) in records {
            debug!("transition {} -> {} on {}", from, to, event);
            if let Some(callback) = self.state_callback.as_mut() {
                callback(from, to);
            }
        }
    }

    /// A session key may only exist while the machine sits in a
    /// handshake-or-later state; anywhere else it is wiped.
    fn enforce_session_invariant(&mut self) {
        if self.crypto.is_established() && !self.state.current_state().allows_session() {
            debug!(
                "state {} does not allow a live session; terminating",
                self.state.current_state()
            );
            self.crypto.terminate_session();
            self.session_failures = 0;
            self.state.context_mut().secure_session = false;
        }
    }

    fn record_session_failure(&mut self, kind: ErrorKind, message: &str) {
        self.session_failures = self.session_failures.saturating_add(1);
        self.state.context_mut().retry_count = self.session_failures;
        if self.session_failures >= MAX_SESSION_FAILURES {
            warn!("session failure threshold reached");
            self.fire_with(StateEvent::ErrorOccurred, Some(message));
        }
        self.report_error(kind, message);
    }

    fn report_error(&mut self, kind: ErrorKind, message: &str) {
        let can_retry = self.state.is_in_state(ProvisioningState::Advertising);
        warn!("{}: {}", kind, message);
        let ctx = self.state.context_mut();
        ctx.last_error = Some(kind);
        ctx.last_error_message = message.to_string();
        if let Some(callback) = self.error_callback.as_mut() {
            callback(kind, message, can_retry);
        }
    }

    /// Encrypted status once the session is live, plaintext before.
    fn send_status(&mut self, status: &str, message: &str) {
        let json = format!("{{\"status\":\"{}\",\"msg\":\"{}\"}}", status, message);
        if self.crypto.is_established() {
            match self.crypto.encrypt(json.as_bytes()) {
                Ok(message) => self
                    .notifier
                    .notify(Characteristic::Status, &message.to_wire()),
                Err(e) => warn!("could not encrypt status notification: {}", e),
            }
        } else {
            self.notifier.notify(Characteristic::Status, json.as_bytes());
        }
    }

    /// Backdate the current state's entry time.
    #[cfg(test)]
    fn backdate_state(&mut self, by: Duration) {
        self.state.backdate_state_entry(by);
    }
}
