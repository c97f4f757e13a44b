//! WiFi credential handling.
//!
//! [`WifiCredentials`] is the decrypted payload of a provisioning
//! session. Its lifetime is deliberately short: it is parsed from a
//! decrypted frame, handed to the WiFi driver, optionally persisted,
//! and dropped. The password is zeroed when the value goes out of
//! scope and never appears in `Debug` output.

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::ErrorKind;

/// Maximum SSID length per IEEE 802.11.
pub const MAX_SSID_LEN: usize = 32;

/// Maximum passphrase length for WPA2/WPA3.
pub const MAX_PASSWORD_LEN: usize = 64;

/// Access-point security type reported alongside credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityType {
    Open,
    Wep,
    WpaPsk,
    #[default]
    Wpa2Psk,
    Wpa2Enterprise,
    Wpa3Psk,
}

impl SecurityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Wep => "WEP",
            Self::WpaPsk => "WPA",
            Self::Wpa2Psk => "WPA2",
            Self::Wpa2Enterprise => "WPA2_ENTERPRISE",
            Self::Wpa3Psk => "WPA3",
        }
    }

    /// Parse a security-type label; unknown labels fall back to WPA2.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_uppercase().as_str() {
            "OPEN" | "NONE" => Self::Open,
            "WEP" => Self::Wep,
            "WPA" => Self::WpaPsk,
            "WPA2_ENTERPRISE" => Self::Wpa2Enterprise,
            "WPA3" => Self::Wpa3Psk,
            _ => Self::Wpa2Psk,
        }
    }
}

impl fmt::Display for SecurityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors raised while parsing or validating credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// SSID is empty.
    SsidEmpty,
    /// SSID exceeds [`MAX_SSID_LEN`].
    SsidTooLong { len: usize, max: usize },
    /// Password exceeds [`MAX_PASSWORD_LEN`].
    PasswordTooLong { len: usize, max: usize },
    /// Payload was not the expected JSON shape.
    FormatInvalid(String),
}

impl CredentialError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::CredentialFormatInvalid
    }
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SsidEmpty => write!(f, "SSID cannot be empty"),
            Self::SsidTooLong { len, max } => {
                write!(f, "SSID too long: {} bytes (max {})", len, max)
            }
            Self::PasswordTooLong { len, max } => {
                write!(f, "password too long: {} bytes (max {})", len, max)
            }
            Self::FormatInvalid(msg) => write!(f, "invalid credential format: {}", msg),
        }
    }
}

impl std::error::Error for CredentialError {}

/// Credentials for joining an access point.
///
/// The password is wiped from memory on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct WifiCredentials {
    /// Network SSID (1-32 bytes).
    pub ssid: String,
    /// Passphrase (0-64 bytes; empty for open networks).
    pub password: String,
    /// Declared security type of the target network.
    #[zeroize(skip)]
    pub security: SecurityType,
    /// Whether the target network is hidden.
    #[zeroize(skip)]
    pub hidden: bool,
}

impl WifiCredentials {
    /// Create validated credentials.
    pub fn new(
        ssid: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, CredentialError> {
        let creds = Self {
            ssid: ssid.into(),
            password: password.into(),
            security: SecurityType::default(),
            hidden: false,
        };
        creds.validate()?;
        Ok(creds)
    }

    /// Validate length bounds.
    pub fn validate(&self) -> Result<(), CredentialError> {
        if self.ssid.is_empty() {
            return Err(CredentialError::SsidEmpty);
        }
        if self.ssid.len() > MAX_SSID_LEN {
            return Err(CredentialError::SsidTooLong {
                len: self.ssid.len(),
                max: MAX_SSID_LEN,
            });
        }
        if self.password.len() > MAX_PASSWORD_LEN {
            return Err(CredentialError::PasswordTooLong {
                len: self.password.len(),
                max: MAX_PASSWORD_LEN,
            });
        }
        Ok(())
    }

    /// Check bounds without reporting why they failed.
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Whether the target network is open (no passphrase).
    pub fn is_open(&self) -> bool {
        self.password.is_empty()
    }

    /// Parse a decrypted credential payload.
    ///
    /// The payload is the JSON object `{"ssid":"…","pass":"…"}`,
    /// located by literal key search rather than a full JSON parser:
    /// the peer application emits exactly this shape and nothing else
    /// travels on the credentials characteristic.
    pub fn from_json(payload: &str) -> Result<Self, CredentialError> {
        let ssid = extract_string_field(payload, "ssid")
            .ok_or_else(|| CredentialError::FormatInvalid("missing \"ssid\" field".into()))?;
        let password = extract_string_field(payload, "pass").unwrap_or_default();
        let security = extract_string_field(payload, "security")
            .map(|s| SecurityType::from_label(&s))
            .unwrap_or_default();
        let hidden = payload.contains("\"hidden\":true");

        let creds = Self {
            ssid,
            password,
            security,
            hidden,
        };
        creds.validate()?;
        Ok(creds)
    }
}

// Redacting Debug: the password must never reach a log sink.
impl fmt::Debug for WifiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WifiCredentials")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .field("security", &self.security)
            .field("hidden", &self.hidden)
            .finish()
    }
}

/// Locate `"key":"value"` in `payload` and return the raw value.
fn extract_string_field(payload: &str, key: &str) -> Option<String> {
    let needle = format!("\"{}\":\"", key);
    let start = payload.find(&needle)? + needle.len();
    let rest = &payload[start..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}
