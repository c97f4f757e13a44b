//! GATT surface of the provisioning service.
//!
//! # GATT Service Structure
//!
//! ```text
//! Service: WiBLE Provisioning (6e400001-b5a3-f393-e0a9-e50e24dcca9e)
//! ├── Credentials (…0002…) - Write   - key exchange + encrypted credentials
//! ├── Status      (…0003…) - Notify  - encrypted status JSON
//! ├── Control     (…0004…) - Write   - one-byte commands
//! └── Data        (…0005…) - R/W/N   - opaque to the core
//! ```
//!
//! The GATT server itself is a platform collaborator; the core only
//! routes writes by characteristic and emits notifications through
//! [`BleNotifier`]. Platforms whose radio callbacks arrive off the
//! main loop post them into the [`EventQueue`], which the loop drains
//! in bounded batches.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use log::warn;

use crate::wifi::{ConnectionInfo, DisconnectReason};

/// Provisioning service UUID.
pub const SERVICE_UUID: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";

/// Credentials characteristic (Write).
pub const CRED_CHAR_UUID: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";

/// Status characteristic (Notify).
pub const STATUS_CHAR_UUID: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";

/// Control characteristic (Write).
pub const CONTROL_CHAR_UUID: &str = "6e400004-b5a3-f393-e0a9-e50e24dcca9e";

/// Data characteristic (Read/Write/Notify).
pub const DATA_CHAR_UUID: &str = "6e400005-b5a3-f393-e0a9-e50e24dcca9e";

/// Events drained from the queue per `poll` iteration.
pub const DRAIN_BATCH_MAX: usize = 8;

/// ATT header overhead subtracted from the MTU.
const ATT_HEADER_LEN: u16 = 3;

/// Largest payload a single notification can carry at the given MTU.
pub fn mtu_payload_capacity(mtu: u16) -> usize {
    usize::from(mtu.saturating_sub(ATT_HEADER_LEN))
}

/// The four service characteristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Characteristic {
    Credentials,
    Status,
    Control,
    Data,
}

impl Characteristic {
    /// Resolve a characteristic from its 128-bit UUID string.
    pub fn from_uuid(uuid: &str) -> Option<Self> {
        if uuid.eq_ignore_ascii_case(CRED_CHAR_UUID) {
            Some(Self::Credentials)
        } else if uuid.eq_ignore_ascii_case(STATUS_CHAR_UUID) {
            Some(Self::Status)
        } else if uuid.eq_ignore_ascii_case(CONTROL_CHAR_UUID) {
            Some(Self::Control)
        } else if uuid.eq_ignore_ascii_case(DATA_CHAR_UUID) {
            Some(Self::Data)
        } else {
            None
        }
    }

    pub fn uuid(&self) -> &'static str {
        match self {
            Self::Credentials => CRED_CHAR_UUID,
            Self::Status => STATUS_CHAR_UUID,
            Self::Control => CONTROL_CHAR_UUID,
            Self::Data => DATA_CHAR_UUID,
        }
    }
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Credentials => "credentials",
            Self::Status => "status",
            Self::Control => "control",
            Self::Data => "data",
        };
        write!(f, "{}", name)
    }
}

/// One-byte commands accepted on the control characteristic.
///
/// Only `Reset` acts on the core; the others are advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Request a network scan (advisory).
    Scan,
    /// Abort provisioning and return to idle.
    Reset,
    /// Request factory reset (advisory).
    Factory,
}

impl ControlCommand {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Scan),
            0x02 => Some(Self::Reset),
            0x03 => Some(Self::Factory),
            _ => None,
        }
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            Self::Scan => 0x01,
            Self::Reset => 0x02,
            Self::Factory => 0x03,
        }
    }
}

/// Outbound notification sink implemented by the GATT server.
pub trait BleNotifier {
    /// Send a notification on the given characteristic. Best-effort:
    /// the server drops the payload if no peer is subscribed.
    fn notify(&mut self, characteristic: Characteristic, payload: &[u8]);
}

/// An externally-sourced event awaiting the cooperative loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A peer wrote to one of our characteristics.
    BleWrite {
        characteristic: Characteristic,
        data: Vec<u8>,
    },
    /// A BLE central connected.
    BleConnected { peer: String },
    /// The BLE central disconnected.
    BleDisconnected { peer: String, reason: String },
    /// The station link came up.
    WifiConnected(ConnectionInfo),
    /// The station link went down.
    WifiDisconnected(DisconnectReason),
}

/// Mutex-guarded FIFO between driver callbacks and the loop.
///
/// Enqueue and dequeue are O(1); the loop drains in bounded batches so
/// a chatty radio cannot starve timeout processing.
#[derive(Default)]
pub struct EventQueue {
    inner: Mutex<VecDeque<LinkEvent>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Post an event from a driver callback.
    pub fn push(&self, event: LinkEvent) {
        match self.inner.lock() {
            Ok(mut queue) => queue.push_back(event),
            Err(_) => warn!("event queue poisoned; dropping event"),
        }
    }

    /// Take up to `max` events in FIFO order.
    pub fn drain_batch(&self, max: usize) -> Vec<LinkEvent> {
        match self.inner.lock() {
            Ok(mut queue) => {
                let count = queue.len().min(max);
                queue.drain(..count).collect()
            }
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// iBeacon-compatible advertising identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeaconConfig {
    /// Proximity UUID.
    pub uuid: [u8; 16],
    /// Major group id.
    pub major: u16,
    /// Minor group id.
    pub minor: u16,
    /// Calibrated TX power at 1 m, dBm.
    pub tx_power: i8,
}

impl BeaconConfig {
    /// Manufacturer-data layout broadcast in beacon mode:
    ///
    /// ```text
    /// [0x4C 0x00][0x02 0x15][UUID(16)][Major BE(2)][Minor BE(2)][TxPower(1)]
    /// ```
    pub fn manufacturer_data(&self) -> [u8; 25] {
        let mut data = [0u8; 25];
        data[0] = 0x4C; // Apple company id, little-endian
        data[1] = 0x00;
        data[2] = 0x02; // iBeacon type
        data[3] = 0x15; // remaining length
        data[4..20].copy_from_slice(&self.uuid);
        data[20..22].copy_from_slice(&self.major.to_be_bytes());
        data[22..24].copy_from_slice(&self.minor.to_be_bytes());
        data[24] = self.tx_power as u8;
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Characteristic Tests ====================

    #[test]
    fn test_uuid_resolution() {
        assert_eq!(
            Characteristic::from_uuid(CRED_CHAR_UUID),
            Some(Characteristic::Credentials)
        );
        assert_eq!(
            Characteristic::from_uuid(STATUS_CHAR_UUID),
            Some(Characteristic::Status)
        );
        assert_eq!(
            Characteristic::from_uuid(CONTROL_CHAR_UUID),
            Some(Characteristic::Control)
        );
        assert_eq!(
            Characteristic::from_uuid(DATA_CHAR_UUID),
            Some(Characteristic::Data)
        );
        assert_eq!(Characteristic::from_uuid(SERVICE_UUID), None);
        assert_eq!(Characteristic::from_uuid("bogus"), None);
    }

    #[test]
    fn test_uuid_resolution_is_case_insensitive() {
        let upper = CRED_CHAR_UUID.to_ascii_uppercase();
        assert_eq!(
            Characteristic::from_uuid(&upper),
            Some(Characteristic::Credentials)
        );
    }

    #[test]
    fn test_uuid_round_trip() {
        for c in [
            Characteristic::Credentials,
            Characteristic::Status,
            Characteristic::Control,
            Characteristic::Data,
        ] {
            assert_eq!(Characteristic::from_uuid(c.uuid()), Some(c));
        }
    }

    // ==================== Control Command Tests ====================

    #[test]
    fn test_command_codes() {
        assert_eq!(ControlCommand::from_byte(0x01), Some(ControlCommand::Scan));
        assert_eq!(ControlCommand::from_byte(0x02), Some(ControlCommand::Reset));
        assert_eq!(
            ControlCommand::from_byte(0x03),
            Some(ControlCommand::Factory)
        );
        assert_eq!(ControlCommand::from_byte(0x00), None);
        assert_eq!(ControlCommand::from_byte(0xFF), None);
    }

    #[test]
    fn test_command_byte_round_trip() {
        for cmd in [
            ControlCommand::Scan,
            ControlCommand::Reset,
            ControlCommand::Factory,
        ] {
            assert_eq!(ControlCommand::from_byte(cmd.as_byte()), Some(cmd));
        }
    }

    // ==================== Queue Tests ====================

    #[test]
    fn test_queue_fifo_order() {
        let queue = EventQueue::new();
        queue.push(LinkEvent::BleConnected {
            peer: "one".into(),
        });
        queue.push(LinkEvent::BleConnected {
            peer: "two".into(),
        });

        let drained = queue.drain_batch(10);
        assert_eq!(drained.len(), 2);
        assert_eq!(
            drained[0],
            LinkEvent::BleConnected {
                peer: "one".into()
            }
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_drain_is_bounded() {
        let queue = EventQueue::new();
        for i in 0..20 {
            queue.push(LinkEvent::BleWrite {
                characteristic: Characteristic::Data,
                data: vec![i],
            });
        }
        let first = queue.drain_batch(DRAIN_BATCH_MAX);
        assert_eq!(first.len(), DRAIN_BATCH_MAX);
        assert_eq!(queue.len(), 20 - DRAIN_BATCH_MAX);

        // Remaining events keep their order.
        let second = queue.drain_batch(DRAIN_BATCH_MAX);
        assert_eq!(
            second[0],
            LinkEvent::BleWrite {
                characteristic: Characteristic::Data,
                data: vec![DRAIN_BATCH_MAX as u8],
            }
        );
    }

    #[test]
    fn test_queue_drain_empty() {
        let queue = EventQueue::new();
        assert!(queue.drain_batch(4).is_empty());
    }

    // ==================== Beacon Tests ====================

    #[test]
    fn test_beacon_layout() {
        let beacon = BeaconConfig {
            uuid: [0xAB; 16],
            major: 0x0102,
            minor: 0x0304,
            tx_power: -59,
        };
        let data = beacon.manufacturer_data();
        assert_eq!(data.len(), 25);
        assert_eq!(&data[0..4], &[0x4C, 0x00, 0x02, 0x15]);
        assert_eq!(&data[4..20], &[0xAB; 16]);
        assert_eq!(&data[20..22], &[0x01, 0x02]); // major, big-endian
        assert_eq!(&data[22..24], &[0x03, 0x04]); // minor, big-endian
        assert_eq!(data[24] as i8, -59);
    }

    // ==================== MTU Tests ====================

    #[test]
    fn test_mtu_payload_capacity() {
        assert_eq!(mtu_payload_capacity(23), 20);
        assert_eq!(mtu_payload_capacity(512), 509);
        assert_eq!(mtu_payload_capacity(3), 0);
        assert_eq!(mtu_payload_capacity(0), 0);
    }
}
