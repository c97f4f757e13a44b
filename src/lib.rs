//! WiBLE provisioning core.
//!
//! A small embedded device exposes a BLE GATT service that a mobile
//! peer uses to push WiFi credentials over an ECDH-derived, MAC'd
//! channel; the device proves them by joining the network and reports
//! the outcome back over the same link.
//!
//! This crate is the platform-independent protocol core and can be
//! tested on the host machine without radio hardware: the GATT server,
//! the WiFi station and the key/value store are trait collaborators
//! ([`BleNotifier`], [`WifiDriver`], [`CredentialStore`]) injected
//! into the [`Orchestrator`].
//!
//! # Layers
//!
//! - [`crypto`] - ECDH key agreement, session keys, authenticated
//!   encryption, secure wiping
//! - [`state`] - the nine-state provisioning machine
//! - [`orchestrator`] - the control plane binding GATT writes, crypto,
//!   credentials and the WiFi driver together

pub mod config;
pub mod credentials;
pub mod crypto;
pub mod error;
pub mod gatt;
pub mod orchestrator;
pub mod state;
pub mod storage;
pub mod wifi;

// Re-export commonly used items
pub use config::{ProvisioningConfig, SecurityLevel};
pub use credentials::{WifiCredentials, MAX_PASSWORD_LEN, MAX_SSID_LEN};
pub use crypto::{CryptoError, EncryptedMessage, SessionCrypto};
pub use error::ErrorKind;
pub use gatt::{BeaconConfig, BleNotifier, Characteristic, ControlCommand, EventQueue, LinkEvent};
pub use orchestrator::Orchestrator;
pub use state::{ProvisioningState, StateEvent, StateMachine, StateTransition};
pub use storage::{CredentialStore, MemoryCredentialStore};
pub use wifi::{ConnectionInfo, DisconnectReason, RetryPolicy, WifiDriver, WifiError};
