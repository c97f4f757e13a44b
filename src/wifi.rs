//! WiFi driver contract.
//!
//! The core never talks to a radio directly; it drives a station
//! through [`WifiDriver`]. A join attempt is a blocking call bounded
//! by `wifi_connect_timeout_ms`; while it runs, the state machine
//! sits in `ConnectingWifi` and no other events are processed. Retry
//! behavior belongs to the driver, and [`RetryPolicy`] packages the
//! configured limits for it.

use std::fmt;
use std::time::Duration;

use crate::config::ProvisioningConfig;
use crate::credentials::WifiCredentials;
use crate::error::ErrorKind;

/// Details of an established station link.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionInfo {
    /// SSID of the joined network.
    pub ssid: String,
    /// Address acquired via DHCP.
    pub ip_address: String,
    /// Gateway address, if known.
    pub gateway: String,
    /// Signal strength in dBm at join time.
    pub rssi: i8,
}

/// Why a station link went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Unknown,
    UserRequested,
    ConnectionTimeout,
    AuthenticationFailed,
    SsidNotFound,
    WeakSignal,
    ApDisconnected,
    DhcpFailed,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::UserRequested => "user requested",
            Self::ConnectionTimeout => "connection timeout",
            Self::AuthenticationFailed => "authentication failed",
            Self::SsidNotFound => "SSID not found",
            Self::WeakSignal => "weak signal",
            Self::ApDisconnected => "AP disconnected",
            Self::DhcpFailed => "DHCP failed",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors surfaced by a WiFi driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WifiError {
    /// Driver not initialized or radio unavailable.
    NotReady,
    /// SSID could not be handed to the radio.
    InvalidSsid,
    /// The join attempt failed.
    ConnectionFailed(DisconnectReason),
    /// The configured join deadline elapsed.
    Timeout { elapsed_ms: u64 },
}

impl WifiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotReady => ErrorKind::WifiInitFailed,
            Self::InvalidSsid => ErrorKind::CredentialFormatInvalid,
            Self::ConnectionFailed(_) => ErrorKind::WifiConnectionFailed,
            Self::Timeout { .. } => ErrorKind::TimeoutError,
        }
    }
}

impl fmt::Display for WifiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotReady => write!(f, "WiFi driver not ready"),
            Self::InvalidSsid => write!(f, "invalid SSID"),
            Self::ConnectionFailed(reason) => write!(f, "connection failed: {}", reason),
            Self::Timeout { elapsed_ms } => {
                write!(f, "connection timed out after {} ms", elapsed_ms)
            }
        }
    }
}

impl std::error::Error for WifiError {}

/// Station driver consumed by the orchestrator.
///
/// `connect` blocks for at most the configured join timeout and
/// reports the outcome; unsolicited link changes reach the core
/// through the orchestrator's `on_wifi_*` entry points.
pub trait WifiDriver {
    /// Join the network described by `credentials`.
    fn connect(&mut self, credentials: &WifiCredentials) -> Result<ConnectionInfo, WifiError>;

    /// Leave the current network.
    fn disconnect(&mut self) -> Result<(), WifiError>;

    /// Whether the station link is currently up.
    fn is_connected(&self) -> bool;
}

/// Retry limits handed to the driver; the core does not retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first failure.
    pub max_retries: u8,
    /// Delay before the first retry.
    pub base_delay_ms: u32,
    /// Double the delay on every further retry.
    pub exponential_backoff: bool,
}

impl RetryPolicy {
    /// Cap on a single backoff delay.
    pub const MAX_DELAY_MS: u32 = 60_000;

    pub fn from_config(config: &ProvisioningConfig) -> Self {
        Self {
            max_retries: config.wifi_max_retries,
            base_delay_ms: config.wifi_retry_delay_ms,
            exponential_backoff: true,
        }
    }

    /// Delay before retry `attempt` (1-based). Attempt 0 is the
    /// initial try and has no delay.
    pub fn delay_for_attempt(&self, attempt: u8) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay = if self.exponential_backoff {
            let shift = u32::from(attempt - 1).min(16);
            self.base_delay_ms.saturating_mul(1 << shift)
        } else {
            self.base_delay_ms
        };
        Duration::from_millis(u64::from(delay.min(Self::MAX_DELAY_MS)))
    }

    /// Whether another retry is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u8) -> bool {
        attempt < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_from_config() {
        let policy = RetryPolicy::from_config(&ProvisioningConfig::default());
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay_ms, 2_000);
        assert!(policy.exponential_backoff);
    }

    #[test]
    fn test_exponential_backoff_doubles() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay_ms: 1_000,
            exponential_backoff: true,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4_000));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_retries: 32,
            base_delay_ms: 2_000,
            exponential_backoff: true,
        };
        assert_eq!(
            policy.delay_for_attempt(30),
            Duration::from_millis(u64::from(RetryPolicy::MAX_DELAY_MS))
        );
    }

    #[test]
    fn test_constant_delay_without_backoff() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay_ms: 500,
            exponential_backoff: false,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn test_should_retry_respects_limit() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay_ms: 100,
            exponential_backoff: false,
        };
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            WifiError::ConnectionFailed(DisconnectReason::AuthenticationFailed).kind(),
            ErrorKind::WifiConnectionFailed
        );
        assert_eq!(
            WifiError::Timeout { elapsed_ms: 20_000 }.kind(),
            ErrorKind::TimeoutError
        );
        assert_eq!(WifiError::NotReady.kind(), ErrorKind::WifiInitFailed);
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            WifiError::ConnectionFailed(DisconnectReason::SsidNotFound).to_string(),
            "connection failed: SSID not found"
        );
        assert_eq!(
            WifiError::Timeout { elapsed_ms: 1500 }.to_string(),
            "connection timed out after 1500 ms"
        );
    }
}
