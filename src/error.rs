//! Crate-wide error taxonomy.
//!
//! Each subsystem defines its own error enum (`CryptoError`,
//! `CredentialError`, `WifiError`, `StorageError`) and maps it into
//! [`ErrorKind`] for the error callback, which reports
//! `(kind, message, can_retry)` to the embedding firmware.

use std::fmt;

/// Classification of provisioning failures reported through the error
/// callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// BLE stack failed to initialize.
    BleInitFailed,
    /// BLE link dropped unexpectedly.
    BleConnectionLost,
    /// WiFi subsystem failed to initialize.
    WifiInitFailed,
    /// WiFi join attempt failed.
    WifiConnectionFailed,
    /// Received credential payload was malformed or out of bounds.
    CredentialFormatInvalid,
    /// Peer authentication failed.
    AuthenticationFailed,
    /// Crypto subsystem could not be seeded or set up.
    CryptoInitFailed,
    /// ECDH key agreement with the peer failed.
    CryptoKeyExchangeFailed,
    /// Decryption or integrity verification failed.
    CryptoDecryptFailed,
    /// Persistent storage operation failed.
    StorageFailed,
    /// A configured deadline elapsed.
    TimeoutError,
    /// Anything not covered above.
    UnknownError,
}

impl ErrorKind {
    /// Stable name for logs and status payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BleInitFailed => "BLE_INIT_FAILED",
            Self::BleConnectionLost => "BLE_CONNECTION_LOST",
            Self::WifiInitFailed => "WIFI_INIT_FAILED",
            Self::WifiConnectionFailed => "WIFI_CONNECTION_FAILED",
            Self::CredentialFormatInvalid => "CREDENTIAL_FORMAT_INVALID",
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::CryptoInitFailed => "CRYPTO_INIT_FAILED",
            Self::CryptoKeyExchangeFailed => "CRYPTO_KEY_EXCHANGE_FAILED",
            Self::CryptoDecryptFailed => "CRYPTO_DECRYPT_FAILED",
            Self::StorageFailed => "STORAGE_FAILED",
            Self::TimeoutError => "TIMEOUT_ERROR",
            Self::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
