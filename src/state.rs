//! Provisioning finite-state machine.
//!
//! The machine enforces the legal graph of provisioning transitions.
//! It is purely mechanical: it owns no radio or crypto state, only the
//! transition table, the context snapshot, a bounded history and the
//! per-state timeout deadlines. External effects happen in the hooks
//! and the transition sink that the orchestrator registers.
//!
//! # Dispatch order
//!
//! ```text
//! lookup (state, event) -> guard -> exit hook -> action
//!   -> transition sink -> state update -> entry hook
//! ```
//!
//! Events with no registered transition fall through to the global
//! catch-alls (`ResetRequested` -> Idle, `ErrorOccurred` -> Error);
//! anything else is logged and ignored.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::ErrorKind;

/// Maximum states kept in the history ring buffer.
pub const MAX_HISTORY: usize = 10;

/// The nine provisioning states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisioningState {
    Idle,
    Advertising,
    Connected,
    Authenticating,
    ReceivingCredentials,
    ConnectingWifi,
    ValidatingConnection,
    Provisioned,
    Error,
}

impl ProvisioningState {
    /// Every state, for exhaustive table sweeps.
    pub const ALL: [Self; 9] = [
        Self::Idle,
        Self::Advertising,
        Self::Connected,
        Self::Authenticating,
        Self::ReceivingCredentials,
        Self::ConnectingWifi,
        Self::ValidatingConnection,
        Self::Provisioned,
        Self::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Advertising => "ADVERTISING",
            Self::Connected => "CONNECTED",
            Self::Authenticating => "AUTHENTICATING",
            Self::ReceivingCredentials => "RECEIVING_CREDENTIALS",
            Self::ConnectingWifi => "CONNECTING_WIFI",
            Self::ValidatingConnection => "VALIDATING_CONNECTION",
            Self::Provisioned => "PROVISIONED",
            Self::Error => "ERROR",
        }
    }

    /// A session key may only exist while the machine sits in one of
    /// these states.
    pub fn allows_session(&self) -> bool {
        matches!(
            self,
            Self::Authenticating
                | Self::ReceivingCredentials
                | Self::ConnectingWifi
                | Self::ValidatingConnection
                | Self::Provisioned
        )
    }

    /// Terminal success state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Provisioned)
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Events driving the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateEvent {
    // Lifecycle
    InitRequested,
    ResetRequested,
    // BLE
    StartAdvertising,
    StopAdvertising,
    BleClientConnected,
    BleClientDisconnected,
    // Authentication
    AuthStarted,
    AuthSuccess,
    AuthFailed,
    AuthTimeout,
    // Credentials
    CredentialsReceived,
    CredentialsInvalid,
    // WiFi
    WifiConnectStarted,
    WifiConnected,
    WifiConnectionFailed,
    WifiDisconnected,
    // Validation
    ValidationStarted,
    ValidationSuccess,
    ValidationFailed,
    // Errors
    ErrorOccurred,
    ErrorRecovered,
    // Timeouts
    ConnectionTimeout,
    ProvisioningTimeout,
}

impl StateEvent {
    /// Every event, for exhaustive table sweeps.
    pub const ALL: [Self; 23] = [
        Self::InitRequested,
        Self::ResetRequested,
        Self::StartAdvertising,
        Self::StopAdvertising,
        Self::BleClientConnected,
        Self::BleClientDisconnected,
        Self::AuthStarted,
        Self::AuthSuccess,
        Self::AuthFailed,
        Self::AuthTimeout,
        Self::CredentialsReceived,
        Self::CredentialsInvalid,
        Self::WifiConnectStarted,
        Self::WifiConnected,
        Self::WifiConnectionFailed,
        Self::WifiDisconnected,
        Self::ValidationStarted,
        Self::ValidationSuccess,
        Self::ValidationFailed,
        Self::ErrorOccurred,
        Self::ErrorRecovered,
        Self::ConnectionTimeout,
        Self::ProvisioningTimeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InitRequested => "INIT_REQUESTED",
            Self::ResetRequested => "RESET_REQUESTED",
            Self::StartAdvertising => "START_ADVERTISING",
            Self::StopAdvertising => "STOP_ADVERTISING",
            Self::BleClientConnected => "BLE_CLIENT_CONNECTED",
            Self::BleClientDisconnected => "BLE_CLIENT_DISCONNECTED",
            Self::AuthStarted => "AUTH_STARTED",
            Self::AuthSuccess => "AUTH_SUCCESS",
            Self::AuthFailed => "AUTH_FAILED",
            Self::AuthTimeout => "AUTH_TIMEOUT",
            Self::CredentialsReceived => "CREDENTIALS_RECEIVED",
            Self::CredentialsInvalid => "CREDENTIALS_INVALID",
            Self::WifiConnectStarted => "WIFI_CONNECT_STARTED",
            Self::WifiConnected => "WIFI_CONNECTED",
            Self::WifiConnectionFailed => "WIFI_CONNECTION_FAILED",
            Self::WifiDisconnected => "WIFI_DISCONNECTED",
            Self::ValidationStarted => "VALIDATION_STARTED",
            Self::ValidationSuccess => "VALIDATION_SUCCESS",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::ErrorOccurred => "ERROR_OCCURRED",
            Self::ErrorRecovered => "ERROR_RECOVERED",
            Self::ConnectionTimeout => "CONNECTION_TIMEOUT",
            Self::ProvisioningTimeout => "PROVISIONING_TIMEOUT",
        }
    }

    /// Whether this event has a global catch-all transition.
    pub fn is_catch_all(&self) -> bool {
        matches!(self, Self::ResetRequested | Self::ErrorOccurred)
    }
}

impl fmt::Display for StateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Guard predicate evaluated before a transition runs.
pub type TransitionGuard = Box<dyn Fn() -> bool>;

/// Side effect executed while a transition runs.
pub type TransitionAction = Box<dyn Fn()>;

/// Hook invoked on state entry/exit with the current context.
pub type StateHook = Box<dyn FnMut(ProvisioningState, &StateContext)>;

/// Sink receiving `(from, to, event)` for every transition.
pub type TransitionSink = Box<dyn FnMut(ProvisioningState, ProvisioningState, StateEvent)>;

/// Listener invoked when a state exceeds its deadline.
pub type TimeoutListener = Box<dyn FnMut(ProvisioningState, Duration)>;

/// One edge of the transition graph.
pub struct StateTransition {
    pub from: ProvisioningState,
    pub event: StateEvent,
    pub to: ProvisioningState,
    guard: Option<TransitionGuard>,
    action: Option<TransitionAction>,
}

impl StateTransition {
    pub fn new(from: ProvisioningState, event: StateEvent, to: ProvisioningState) -> Self {
        Self {
            from,
            event,
            to,
            guard: None,
            action: None,
        }
    }

    /// Attach a guard predicate; the transition is skipped (and the
    /// event reported unhandled) when it returns false.
    pub fn with_guard(mut self, guard: impl Fn() -> bool + 'static) -> Self {
        self.guard = Some(Box::new(guard));
        self
    }

    /// Attach a side effect that runs between the exit and entry hooks.
    pub fn with_action(mut self, action: impl Fn() + 'static) -> Self {
        self.action = Some(Box::new(action));
        self
    }

    fn can_transition(&self) -> bool {
        self.guard.as_ref().map_or(true, |g| g())
    }

    fn execute_action(&self) {
        if let Some(action) = &self.action {
            action();
        }
    }
}

/// Mutable context carried across transitions.
#[derive(Debug, Clone)]
pub struct StateContext {
    /// Address of the connected BLE peer.
    pub peer_address: String,
    /// SSID of the network last handed to the WiFi driver.
    pub ssid: String,
    /// IP address obtained on the last successful join.
    pub ip_address: String,
    /// Last reported error, if any.
    pub last_error: Option<ErrorKind>,
    /// Human-readable message for the last error.
    pub last_error_message: String,
    /// When the current state was entered.
    pub state_entry_time: Instant,
    /// Recoverable failures seen in the current session.
    pub retry_count: u8,
    /// Whether an encrypted session protects the link.
    pub secure_session: bool,
}

impl StateContext {
    fn new() -> Self {
        Self {
            peer_address: String::new(),
            ssid: String::new(),
            ip_address: String::new(),
            last_error: None,
            last_error_message: String::new(),
            state_entry_time: Instant::now(),
            retry_count: 0,
            secure_session: false,
        }
    }

    /// Clear everything except the entry timestamp.
    pub fn reset(&mut self) {
        self.peer_address.clear();
        self.ssid.clear();
        self.ip_address.clear();
        self.last_error = None;
        self.last_error_message.clear();
        self.state_entry_time = Instant::now();
        self.retry_count = 0;
        self.secure_session = false;
    }
}

type TransitionKey = (ProvisioningState, StateEvent);

/// Event-driven state machine over the provisioning states.
pub struct StateMachine {
    current: ProvisioningState,
    previous: ProvisioningState,
    in_transition: bool,
    context: StateContext,
    transitions: HashMap<TransitionKey, StateTransition>,
    history: VecDeque<ProvisioningState>,
    timeouts: HashMap<ProvisioningState, (Duration, StateEvent)>,
    entry_hook: Option<StateHook>,
    exit_hook: Option<StateHook>,
    transition_sink: Option<TransitionSink>,
    timeout_listener: Option<TimeoutListener>,
}

impl StateMachine {
    /// Create a machine in `Idle` with the canonical transition table
    /// installed.
    pub fn new() -> Self {
        let mut machine = Self {
            current: ProvisioningState::Idle,
            previous: ProvisioningState::Idle,
            in_transition: false,
            context: StateContext::new(),
            transitions: HashMap::new(),
            history: VecDeque::with_capacity(MAX_HISTORY),
            timeouts: HashMap::new(),
            entry_hook: None,
            exit_hook: None,
            transition_sink: None,
            timeout_listener: None,
        };
        machine.install_default_transitions();
        machine
    }

    fn install_default_transitions(&mut self) {
        use ProvisioningState::*;
        use StateEvent::*;

        self.add_transition(StateTransition::new(Idle, StartAdvertising, Advertising));
        self.add_transition(StateTransition::new(Advertising, BleClientConnected, Connected));
        self.add_transition(StateTransition::new(Connected, AuthStarted, Authenticating));
        self.add_transition(StateTransition::new(
            Authenticating,
            AuthSuccess,
            ReceivingCredentials,
        ));
        self.add_transition(StateTransition::new(
            ReceivingCredentials,
            CredentialsReceived,
            ConnectingWifi,
        ));
        self.add_transition(StateTransition::new(ConnectingWifi, WifiConnected, Provisioned));
        self.add_transition(StateTransition::new(
            ConnectingWifi,
            WifiConnectionFailed,
            Error,
        ));
        self.add_transition(StateTransition::new(Error, ErrorRecovered, Idle));

        // A dropped peer mid-handshake returns to advertising.
        self.add_transition(StateTransition::new(
            Connected,
            BleClientDisconnected,
            Advertising,
        ));
        self.add_transition(StateTransition::new(
            Authenticating,
            BleClientDisconnected,
            Advertising,
        ));
        self.add_transition(StateTransition::new(
            ReceivingCredentials,
            BleClientDisconnected,
            Advertising,
        ));
    }

    // ==================== Queries ====================

    pub fn current_state(&self) -> ProvisioningState {
        self.current
    }

    pub fn previous_state(&self) -> ProvisioningState {
        self.previous
    }

    pub fn is_in_state(&self, state: ProvisioningState) -> bool {
        self.current == state
    }

    pub fn is_transitioning(&self) -> bool {
        self.in_transition
    }

    pub fn context(&self) -> &StateContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut StateContext {
        &mut self.context
    }

    /// Time spent in the current state.
    pub fn time_in_current_state(&self) -> Duration {
        self.context.state_entry_time.elapsed()
    }

    /// Last `max_count` states entered, oldest first.
    pub fn state_history(&self, max_count: usize) -> Vec<ProvisioningState> {
        let skip = self.history.len().saturating_sub(max_count);
        self.history.iter().skip(skip).copied().collect()
    }

    /// Events with a registered transition from the current state.
    pub fn valid_events(&self) -> Vec<StateEvent> {
        StateEvent::ALL
            .iter()
            .copied()
            .filter(|event| self.transitions.contains_key(&(self.current, *event)))
            .collect()
    }

    /// Whether an event would be acted on in the current state.
    pub fn is_event_valid(&self, event: StateEvent) -> bool {
        self.transitions.contains_key(&(self.current, event)) || event.is_catch_all()
    }

    // ==================== Transition management ====================

    /// Register a transition; at most one per `(state, event)` pair,
    /// the newest registration wins.
    pub fn add_transition(&mut self, transition: StateTransition) {
        self.transitions
            .insert((transition.from, transition.event), transition);
    }

    /// Remove a registered transition.
    pub fn remove_transition(&mut self, from: ProvisioningState, event: StateEvent) {
        self.transitions.remove(&(from, event));
    }

    // ==================== Hooks ====================

    pub fn on_state_entry(&mut self, hook: impl FnMut(ProvisioningState, &StateContext) + 'static) {
        self.entry_hook = Some(Box::new(hook));
    }

    pub fn on_state_exit(&mut self, hook: impl FnMut(ProvisioningState, &StateContext) + 'static) {
        self.exit_hook = Some(Box::new(hook));
    }

    /// Register the transition sink. The machine keeps no reference to
    /// its owner; this function-typed field is the only way out.
    pub fn on_transition(
        &mut self,
        sink: impl FnMut(ProvisioningState, ProvisioningState, StateEvent) + 'static,
    ) {
        self.transition_sink = Some(Box::new(sink));
    }

    pub fn on_timeout(&mut self, listener: impl FnMut(ProvisioningState, Duration) + 'static) {
        self.timeout_listener = Some(Box::new(listener));
    }

    // ==================== Event handling ====================

    /// Process an event without payload.
    pub fn handle_event(&mut self, event: StateEvent) -> bool {
        self.handle_event_with(event, None)
    }

    /// Process an event; returns true when a transition ran.
    ///
    /// The payload is recorded in the context for `ErrorOccurred`.
    pub fn handle_event_with(&mut self, event: StateEvent, payload: Option<&str>) -> bool {
        debug!("event {} in state {}", event, self.current);

        let key = (self.current, event);
        if self.transitions.contains_key(&key) {
            let transition = &self.transitions[&key];
            if !transition.can_transition() {
                warn!("guard rejected {} in {}", event, self.current);
                return false;
            }
            let to = transition.to;
            return self.run_transition(event, to, true, payload);
        }

        // Global catch-alls apply only after the table misses.
        match event {
            StateEvent::ResetRequested => {
                self.run_transition(event, ProvisioningState::Idle, false, payload)
            }
            StateEvent::ErrorOccurred => {
                self.run_transition(event, ProvisioningState::Error, false, payload)
            }
            _ => {
                warn!("no transition for {} in state {}", event, self.current);
                false
            }
        }
    }

    fn run_transition(
        &mut self,
        event: StateEvent,
        to: ProvisioningState,
        keyed: bool,
        payload: Option<&str>,
    ) -> bool {
        let from = self.current;
        self.in_transition = true;

        if let Some(hook) = self.exit_hook.as_mut() {
            hook(from, &self.context);
        }

        if keyed {
            if let Some(transition) = self.transitions.get(&(from, event)) {
                transition.execute_action();
            }
        }

        if event == StateEvent::ErrorOccurred {
            self.context.last_error_message = payload.unwrap_or("").to_string();
            if self.context.last_error.is_none() {
                self.context.last_error = Some(ErrorKind::UnknownError);
            }
        }

        // The sink observes the transition between exit and entry.
        if let Some(sink) = self.transition_sink.as_mut() {
            sink(from, to, event);
        }

        self.previous = from;
        self.current = to;
        self.enter_state(to);
        self.in_transition = false;
        true
    }

    fn enter_state(&mut self, state: ProvisioningState) {
        self.context.state_entry_time = Instant::now();
        self.record_history(state);
        info!("entering state {}", state);
        if let Some(hook) = self.entry_hook.as_mut() {
            hook(state, &self.context);
        }
    }

    fn record_history(&mut self, state: ProvisioningState) {
        if self.history.len() == MAX_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(state);
    }

    // ==================== Timeouts ====================

    /// Arm a deadline for a state; `event` is injected when the state
    /// is held longer than `timeout_ms`.
    pub fn set_state_timeout(
        &mut self,
        state: ProvisioningState,
        timeout_ms: u32,
        event: StateEvent,
    ) {
        self.timeouts.insert(
            state,
            (Duration::from_millis(u64::from(timeout_ms)), event),
        );
    }

    /// Disarm the deadline for a state.
    pub fn clear_state_timeout(&mut self, state: ProvisioningState) {
        self.timeouts.remove(&state);
    }

    /// Check the current state against its deadline; injects at most
    /// one timeout event per call and returns it.
    pub fn check_timeouts(&mut self) -> Option<StateEvent> {
        let (timeout, event) = *self.timeouts.get(&self.current)?;
        let elapsed = self.context.state_entry_time.elapsed();
        if elapsed <= timeout {
            return None;
        }

        warn!(
            "state {} exceeded its deadline ({} ms)",
            self.current,
            timeout.as_millis()
        );
        if let Some(listener) = self.timeout_listener.as_mut() {
            listener(self.current, elapsed);
        }
        self.handle_event(event);
        Some(event)
    }

    // ==================== Reset ====================

    /// Return to `Idle`, clearing context and history.
    pub fn reset(&mut self) {
        self.context.reset();
        self.history.clear();
        self.handle_event(StateEvent::ResetRequested);
    }

    /// Backdate the current state's entry time.
    #[cfg(test)]
    pub(crate) fn backdate_state_entry(&mut self, by: Duration) {
        self.context.state_entry_time = Instant::now() - by;
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use ProvisioningState::*;
    use StateEvent::*;

    /// The canonical transition table as `(from, event, to)` rows.
    const CANONICAL: [(ProvisioningState, StateEvent, ProvisioningState); 11] = [
        (Idle, StartAdvertising, Advertising),
        (Advertising, BleClientConnected, Connected),
        (Connected, AuthStarted, Authenticating),
        (Authenticating, AuthSuccess, ReceivingCredentials),
        (ReceivingCredentials, CredentialsReceived, ConnectingWifi),
        (ConnectingWifi, WifiConnected, Provisioned),
        (ConnectingWifi, WifiConnectionFailed, Error),
        (Error, ErrorRecovered, Idle),
        (Connected, BleClientDisconnected, Advertising),
        (Authenticating, BleClientDisconnected, Advertising),
        (ReceivingCredentials, BleClientDisconnected, Advertising),
    ];

    /// Drive a fresh machine into the given state along the happy path.
    fn machine_in(state: ProvisioningState) -> StateMachine {
        let mut machine = StateMachine::new();
        let path: &[StateEvent] = match state {
            Idle => &[],
            Advertising => &[StartAdvertising],
            Connected => &[StartAdvertising, BleClientConnected],
            Authenticating => &[StartAdvertising, BleClientConnected, AuthStarted],
            ReceivingCredentials => {
                &[StartAdvertising, BleClientConnected, AuthStarted, AuthSuccess]
            }
            ConnectingWifi => &[
                StartAdvertising,
                BleClientConnected,
                AuthStarted,
                AuthSuccess,
                CredentialsReceived,
            ],
            ValidatingConnection => {
                // Not reachable through the canonical table; force it.
                let mut m = StateMachine::new();
                m.add_transition(StateTransition::new(
                    Idle,
                    ValidationStarted,
                    ValidatingConnection,
                ));
                assert!(m.handle_event(ValidationStarted));
                m.remove_transition(Idle, ValidationStarted);
                return m;
            }
            Provisioned => &[
                StartAdvertising,
                BleClientConnected,
                AuthStarted,
                AuthSuccess,
                CredentialsReceived,
                WifiConnected,
            ],
            Error => &[ErrorOccurred],
        };
        for event in path {
            assert!(machine.handle_event(*event), "setup event {} failed", event);
        }
        assert_eq!(machine.current_state(), state);
        machine
    }

    // ==================== Table Sweep ====================

    #[test]
    fn test_every_canonical_transition() {
        for (from, event, to) in CANONICAL {
            let mut machine = machine_in(from);
            assert!(machine.handle_event(event), "{} in {} not handled", event, from);
            assert_eq!(machine.current_state(), to, "{} in {}", event, from);
            assert_eq!(machine.previous_state(), from);
        }
    }

    #[test]
    fn test_unregistered_events_are_ignored() {
        for from in ProvisioningState::ALL {
            for event in StateEvent::ALL {
                if event.is_catch_all() {
                    continue;
                }
                let in_table = CANONICAL
                    .iter()
                    .any(|(f, e, _)| *f == from && *e == event);
                if in_table {
                    continue;
                }
                let mut machine = machine_in(from);
                assert!(
                    !machine.handle_event(event),
                    "{} in {} unexpectedly handled",
                    event,
                    from
                );
                assert_eq!(machine.current_state(), from, "{} in {} moved", event, from);
            }
        }
    }

    #[test]
    fn test_reset_catch_all_from_every_state() {
        for from in ProvisioningState::ALL {
            let mut machine = machine_in(from);
            assert!(machine.handle_event(ResetRequested));
            assert_eq!(machine.current_state(), Idle);
        }
    }

    #[test]
    fn test_error_catch_all_from_every_state() {
        for from in ProvisioningState::ALL {
            let mut machine = machine_in(from);
            assert!(machine.handle_event_with(ErrorOccurred, Some("boom")));
            assert_eq!(machine.current_state(), Error);
            assert_eq!(machine.context().last_error_message, "boom");
        }
    }

    #[test]
    fn test_provisioned_only_via_wifi_connected() {
        // No canonical row other than (ConnectingWifi, WifiConnected)
        // targets Provisioned.
        let rows: Vec<_> = CANONICAL
            .iter()
            .filter(|(_, _, to)| *to == Provisioned)
            .collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(*rows[0], (ConnectingWifi, WifiConnected, Provisioned));
    }

    // ==================== Guards and Actions ====================

    #[test]
    fn test_guard_blocks_transition() {
        let mut machine = StateMachine::new();
        machine.add_transition(
            StateTransition::new(Idle, StartAdvertising, Advertising).with_guard(|| false),
        );
        assert!(!machine.handle_event(StartAdvertising));
        assert_eq!(machine.current_state(), Idle);
    }

    #[test]
    fn test_guard_allows_transition() {
        let mut machine = StateMachine::new();
        machine.add_transition(
            StateTransition::new(Idle, StartAdvertising, Advertising).with_guard(|| true),
        );
        assert!(machine.handle_event(StartAdvertising));
        assert_eq!(machine.current_state(), Advertising);
    }

    #[test]
    fn test_action_runs_once_per_transition() {
        let count = Rc::new(RefCell::new(0));
        let seen = count.clone();
        let mut machine = StateMachine::new();
        machine.add_transition(
            StateTransition::new(Idle, StartAdvertising, Advertising)
                .with_action(move || *seen.borrow_mut() += 1),
        );
        machine.handle_event(StartAdvertising);
        assert_eq!(*count.borrow(), 1);
        // Not applicable from Advertising; the action must not fire.
        machine.handle_event(StartAdvertising);
        assert_eq!(*count.borrow(), 1);
    }

    // ==================== Hooks and Sink ====================

    #[test]
    fn test_hook_and_sink_ordering() {
        let trace: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let mut machine = StateMachine::new();

        let t = trace.clone();
        machine.on_state_exit(move |state, _| t.borrow_mut().push(format!("exit:{}", state)));
        let t = trace.clone();
        machine.on_transition(move |from, to, _| {
            t.borrow_mut().push(format!("sink:{}->{}", from, to))
        });
        let t = trace.clone();
        machine.on_state_entry(move |state, _| t.borrow_mut().push(format!("enter:{}", state)));

        machine.handle_event(StartAdvertising);
        assert_eq!(
            *trace.borrow(),
            vec![
                "exit:IDLE".to_string(),
                "sink:IDLE->ADVERTISING".to_string(),
                "enter:ADVERTISING".to_string(),
            ]
        );
    }

    #[test]
    fn test_sink_not_called_on_ignored_event() {
        let fired = Rc::new(RefCell::new(false));
        let f = fired.clone();
        let mut machine = StateMachine::new();
        machine.on_transition(move |_, _, _| *f.borrow_mut() = true);
        machine.handle_event(WifiConnected); // no rule in Idle
        assert!(!*fired.borrow());
    }

    // ==================== History ====================

    #[test]
    fn test_history_records_entered_states() {
        let machine = machine_in(Authenticating);
        assert_eq!(
            machine.state_history(10),
            vec![Advertising, Connected, Authenticating]
        );
        assert_eq!(machine.state_history(2), vec![Connected, Authenticating]);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut machine = StateMachine::new();
        for _ in 0..8 {
            machine.handle_event(ErrorOccurred);
            machine.handle_event(ErrorRecovered);
        }
        assert_eq!(machine.state_history(100).len(), MAX_HISTORY);
    }

    // ==================== Timeouts ====================

    #[test]
    fn test_timeout_injects_configured_event() {
        let mut machine = machine_in(Connected);
        machine.add_transition(StateTransition::new(
            Connected,
            ConnectionTimeout,
            Advertising,
        ));
        machine.set_state_timeout(Connected, 50, ConnectionTimeout);

        assert_eq!(machine.check_timeouts(), None);
        machine.backdate_state_entry(Duration::from_millis(60));
        assert_eq!(machine.check_timeouts(), Some(ConnectionTimeout));
        assert_eq!(machine.current_state(), Advertising);
    }

    #[test]
    fn test_timeout_listener_reports_elapsed() {
        let seen: Rc<RefCell<Option<(ProvisioningState, Duration)>>> =
            Rc::new(RefCell::new(None));
        let s = seen.clone();
        let mut machine = machine_in(ConnectingWifi);
        machine.on_timeout(move |state, elapsed| *s.borrow_mut() = Some((state, elapsed)));
        machine.set_state_timeout(ConnectingWifi, 10, ProvisioningTimeout);
        machine.backdate_state_entry(Duration::from_millis(20));

        machine.check_timeouts();
        let (state, elapsed) = seen.borrow().unwrap();
        assert_eq!(state, ConnectingWifi);
        assert!(elapsed >= Duration::from_millis(20));
        // ProvisioningTimeout has no rule from ConnectingWifi by
        // default, so the machine stays put.
        assert_eq!(machine.current_state(), ConnectingWifi);
    }

    #[test]
    fn test_cleared_timeout_does_not_fire() {
        let mut machine = machine_in(Connected);
        machine.set_state_timeout(Connected, 10, ConnectionTimeout);
        machine.clear_state_timeout(Connected);
        machine.backdate_state_entry(Duration::from_millis(100));
        assert_eq!(machine.check_timeouts(), None);
    }

    // ==================== Context and Reset ====================

    #[test]
    fn test_reset_clears_context() {
        let mut machine = machine_in(ConnectingWifi);
        machine.context_mut().ssid = "HomeNet".into();
        machine.context_mut().retry_count = 2;
        machine.context_mut().last_error = Some(ErrorKind::CryptoDecryptFailed);

        machine.reset();
        assert_eq!(machine.current_state(), Idle);
        assert!(machine.context().ssid.is_empty());
        assert_eq!(machine.context().retry_count, 0);
        assert_eq!(machine.context().last_error, None);
    }

    #[test]
    fn test_reset_from_every_non_idle_state_clears_context() {
        for from in ProvisioningState::ALL {
            if from == Idle {
                continue;
            }
            let mut machine = machine_in(from);
            machine.context_mut().retry_count = 3;
            machine.reset();
            assert_eq!(machine.current_state(), Idle);
            assert_eq!(machine.context().retry_count, 0);
            assert_eq!(machine.context().last_error, None);
        }
    }

    // ==================== Misc ====================

    #[test]
    fn test_valid_events_reflect_table() {
        let machine = StateMachine::new();
        let events = machine.valid_events();
        assert_eq!(events, vec![StartAdvertising]);

        let machine = machine_in(ConnectingWifi);
        let mut events = machine.valid_events();
        events.sort_by_key(|e| e.as_str());
        assert_eq!(events, vec![WifiConnected, WifiConnectionFailed]);
    }

    #[test]
    fn test_is_event_valid_includes_catch_alls() {
        let machine = StateMachine::new();
        assert!(machine.is_event_valid(StartAdvertising));
        assert!(machine.is_event_valid(ResetRequested));
        assert!(machine.is_event_valid(ErrorOccurred));
        assert!(!machine.is_event_valid(WifiConnected));
    }

    #[test]
    fn test_session_state_classification() {
        assert!(Authenticating.allows_session());
        assert!(Provisioned.allows_session());
        assert!(!Idle.allows_session());
        assert!(!Advertising.allows_session());
        assert!(!Connected.allows_session());
        assert!(!Error.allows_session());
    }

    #[test]
    fn test_display_names() {
        assert_eq!(ReceivingCredentials.to_string(), "RECEIVING_CREDENTIALS");
        assert_eq!(BleClientDisconnected.to_string(), "BLE_CLIENT_DISCONNECTED");
    }
}
