//! Credential persistence contract.
//!
//! Successfully provisioned credentials may be stashed in the
//! platform key/value store so the device can rejoin on boot. The
//! record lives under the `wible_creds` namespace with one key per
//! field. The NVS-backed implementor ships with the platform layer;
//! [`MemoryCredentialStore`] covers host tests.
//!
//! Writes happen only after the machine reaches `Provisioned`, and
//! only when `persist_credentials` is set.

use std::fmt;

use zeroize::Zeroize;

use crate::credentials::{CredentialError, WifiCredentials};
use crate::error::ErrorKind;

/// Key/value namespace for the credential record.
pub const CRED_NAMESPACE: &str = "wible_creds";

/// Key holding the SSID.
pub const KEY_SSID: &str = "ssid";

/// Key holding the passphrase.
pub const KEY_PASS: &str = "pass";

/// Errors surfaced by a credential store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The record could not be written.
    WriteFailed(String),
    /// The record could not be read or was corrupted.
    ReadFailed(String),
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::StorageFailed
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WriteFailed(msg) => write!(f, "credential write failed: {}", msg),
            Self::ReadFailed(msg) => write!(f, "credential read failed: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<CredentialError> for StorageError {
    fn from(err: CredentialError) -> Self {
        Self::ReadFailed(err.to_string())
    }
}

/// Key/value store for the provisioned credential record.
pub trait CredentialStore {
    /// Write the record, replacing any previous one.
    fn save(&mut self, ssid: &str, password: &str) -> Result<(), StorageError>;

    /// Read the record; `Ok(None)` when nothing is stored.
    fn load(&self) -> Result<Option<WifiCredentials>, StorageError>;

    /// Remove the record; wipes any in-memory copy.
    fn clear(&mut self) -> Result<(), StorageError>;
}

/// In-memory store for host tests and simulations.
#[derive(Default)]
pub struct MemoryCredentialStore {
    record: Option<(String, String)>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a record is present.
    pub fn is_populated(&self) -> bool {
        self.record.is_some()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn save(&mut self, ssid: &str, password: &str) -> Result<(), StorageError> {
        self.clear()?;
        self.record = Some((ssid.to_string(), password.to_string()));
        Ok(())
    }

    fn load(&self) -> Result<Option<WifiCredentials>, StorageError> {
        match &self.record {
            None => Ok(None),
            Some((ssid, password)) => {
                let creds = WifiCredentials::new(ssid.clone(), password.clone())?;
                Ok(Some(creds))
            }
        }
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        if let Some((mut ssid, mut password)) = self.record.take() {
            ssid.zeroize();
            password.zeroize();
        }
        Ok(())
    }
}
