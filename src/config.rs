//! Provisioning configuration.
//!
//! One immutable [`ProvisioningConfig`] is consumed at construction
//! time; nothing reads configuration from anywhere else afterwards.

use std::fmt;

/// Default GAP device name advertised while provisioning.
pub const DEFAULT_DEVICE_NAME: &str = "WiBLE_Device";

/// Default PIN used for out-of-band confirmation.
pub const DEFAULT_PIN_CODE: &str = "000000";

/// Security posture of the provisioning channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityLevel {
    /// No encryption. Development only.
    None,
    /// BLE pairing without an application-layer session.
    Basic,
    /// ECDH key agreement plus authenticated symmetric encryption.
    Secure,
    /// Secure plus certificate pinning (reserved).
    Enterprise,
}

impl SecurityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Basic => "BASIC",
            Self::Secure => "SECURE",
            Self::Enterprise => "ENTERPRISE",
        }
    }

    /// Whether this level requires an encrypted session before
    /// credentials are accepted.
    pub fn requires_session(&self) -> bool {
        matches!(self, Self::Secure | Self::Enterprise)
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Configuration consumed once at init.
///
/// All timeouts are milliseconds; all lengths are bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningConfig {
    /// GAP device name used while advertising.
    pub device_name: String,
    /// Channel security posture.
    pub security_level: SecurityLevel,
    /// PIN for out-of-band confirmation (compared in constant time).
    pub pin_code: String,
    /// Deadline for the peer to complete the key exchange after
    /// connecting.
    pub auth_timeout_ms: u32,
    /// Lifetime of a derived session key.
    pub session_timeout_ms: u32,
    /// Upper bound on a single WiFi join attempt.
    pub wifi_connect_timeout_ms: u32,
    /// WiFi join retries, owned by the driver.
    pub wifi_max_retries: u8,
    /// Base delay between WiFi retries.
    pub wifi_retry_delay_ms: u32,
    /// Attempt to rejoin the stored network on boot.
    pub auto_reconnect: bool,
    /// Persist credentials after a successful provisioning.
    pub persist_credentials: bool,
    /// Regenerate the ECDH keypair on every session teardown.
    pub enable_pfs: bool,
    /// Negotiated BLE MTU.
    pub mtu_size: u16,
    /// Simultaneous BLE peers (the core provisions exactly one).
    pub max_connections: u8,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            security_level: SecurityLevel::Secure,
            pin_code: DEFAULT_PIN_CODE.to_string(),
            auth_timeout_ms: 30_000,
            session_timeout_ms: 300_000,
            wifi_connect_timeout_ms: 20_000,
            wifi_max_retries: 3,
            wifi_retry_delay_ms: 2_000,
            auto_reconnect: true,
            persist_credentials: true,
            enable_pfs: true,
            mtu_size: 512,
            max_connections: 1,
        }
    }
}
