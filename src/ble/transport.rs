//! BLE transport abstraction.
//!
//! The OS Bluetooth stack sits behind [`BleTransport`], so the flashing logic
//! can run against real hardware or against a scripted fake in tests.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::flashing::error::FlashOpResult;

/// A GATT characteristic addressed by service and characteristic UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Characteristic {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl Characteristic {
    pub const fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// GATT write mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

/// A device seen in a scan or in the bonded device list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Peripheral {
    /// Transport-level identifier (MAC address or OS handle).
    pub id: String,
    /// Advertised name.
    pub name: String,
}

impl Peripheral {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Peripheral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Asynchronous events raised by the BLE stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A characteristic value changed on a subscribed characteristic.
    Notification {
        device_id: String,
        characteristic: Characteristic,
        value: Vec<u8>,
    },
    /// The link to a device dropped, whether requested or not.
    Disconnected { device_id: String },
}

/// Trait for the BLE operations the flasher needs.
///
/// Implementations only wrap the OS stack. Bonding policy, notification
/// fan-out and timeouts above the single call live in this crate.
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Prepare the stack for use.
    async fn initialize(&self) -> FlashOpResult<()>;

    /// Whether the Bluetooth adapter is switched on.
    async fn is_enabled(&self) -> bool;

    /// Whether location services are on (needed for scanning on some platforms).
    async fn is_location_enabled(&self) -> bool;

    /// Scan for devices whose advertised name starts with `name_prefix`.
    async fn scan(&self, name_prefix: &str, timeout: Duration) -> FlashOpResult<Vec<Peripheral>>;

    /// Devices the OS already holds a bond for.
    async fn bonded_devices(&self) -> FlashOpResult<Vec<Peripheral>>;

    async fn connect(&self, device_id: &str, timeout: Duration) -> FlashOpResult<()>;

    async fn disconnect(&self, device_id: &str) -> FlashOpResult<()>;

    /// Whether the OS reports a bond for this device.
    async fn is_bonded(&self, device_id: &str) -> FlashOpResult<bool>;

    /// Request a bond. Fails with `FlashError::BondRejected` if the user declines.
    async fn create_bond(&self, device_id: &str, timeout: Duration) -> FlashOpResult<()>;

    /// Discover (or rediscover) the GATT table, returning the service UUIDs.
    async fn discover_services(&self, device_id: &str) -> FlashOpResult<Vec<Uuid>>;

    async fn read(&self, device_id: &str, characteristic: Characteristic) -> FlashOpResult<Vec<u8>>;

    async fn write(
        &self,
        device_id: &str,
        characteristic: Characteristic,
        data: &[u8],
        write_type: WriteType,
    ) -> FlashOpResult<()>;

    async fn start_notifications(
        &self,
        device_id: &str,
        characteristic: Characteristic,
    ) -> FlashOpResult<()>;

    async fn stop_notifications(
        &self,
        device_id: &str,
        characteristic: Characteristic,
    ) -> FlashOpResult<()>;

    /// Subscribe to notifications and disconnect events for all devices.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}
