//! Bluetooth Low Energy connection layer.
//!
//! Wraps the platform BLE stack ([`BleTransport`]) with a per-connection
//! [`Device`] that owns notification fan-out and disconnect tracking, and a
//! [`BondingController`] that gets a device into a stable, bonded state.

pub mod bonding;
pub mod device;
pub mod notifications;
pub mod transport;

pub use bonding::{BondFailure, BondingController, BondingState};
pub use device::Device;
pub use notifications::{NotificationSubscription, Predicate};
pub use transport::{BleTransport, Characteristic, Peripheral, TransportEvent, WriteType};
