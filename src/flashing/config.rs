//! Configuration constants and tunables for micro:bit Bluetooth flashing.

use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

use super::error::FlashOpResult;

// ============================================================================
// GATT Services and Characteristics
// ============================================================================

/// Partial Flashing Service exposed by MakeCode-built firmware.
pub const PARTIAL_FLASHING_SERVICE: Uuid = Uuid::from_u128(0xe97dd91d_251d_470a_a062_fa1922dfa9a8);

/// Characteristic carrying every partial flashing command and notification.
pub const PARTIAL_FLASH_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0xe97d3b10_251d_470a_a062_fa1922dfa9a8);

/// micro:bit DFU control service (V1 only).
pub const MICROBIT_DFU_SERVICE: Uuid = Uuid::from_u128(0xe95d93b0_251d_470a_a062_fa1922dfa9a8);

/// Writing [`DFU_CONTROL_ACTIVATE`] here reboots a V1 into its bootloader.
pub const MICROBIT_DFU_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0xe95d93b1_251d_470a_a062_fa1922dfa9a8);

/// Legacy Nordic DFU service, present on a V1 once it is in bootloader mode.
pub const NORDIC_DFU_SERVICE: Uuid = Uuid::from_u128(0x00001530_1212_efde_1523_785feabcd123);

/// Nordic Secure DFU service. Its presence alone identifies a V2.
pub const SECURE_DFU_SERVICE: Uuid = Uuid::from_u128(0x0000fe59_0000_1000_8000_00805f9b34fb);

/// Standard Device Information Service.
pub const DEVICE_INFORMATION_SERVICE: Uuid =
    Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);

/// Model Number String characteristic of the Device Information Service.
pub const MODEL_NUMBER_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x00002a24_0000_1000_8000_00805f9b34fb);

// ============================================================================
// Partial Flashing Commands
// ============================================================================

/// Region info query: `[0x00, region_id]`.
pub const REGION_INFO_COMMAND: u8 = 0x00;

/// Flash data packet: `[0x01, offset(2, BE), seq, data(16)]`.
pub const FLASH_COMMAND: u8 = 0x01;

/// End of flash marker: `[0x02]`.
pub const END_OF_FLASH_COMMAND: u8 = 0x02;

/// Reset into a [`MicroBitMode`](super::partial::MicroBitMode): `[0xFF, mode]`.
pub const MICROBIT_RESET_COMMAND: u8 = 0xFF;

/// Byte written to the DFU control characteristic to enter the bootloader.
pub const DFU_CONTROL_ACTIVATE: u8 = 0x01;

/// Data bytes carried by one flash packet.
pub const PACKET_DATA_SIZE: usize = 16;

/// Total length of an encoded flash packet.
pub const FLASH_PACKET_SIZE: usize = 4 + PACKET_DATA_SIZE;

/// Packets per acknowledged batch.
pub const PACKETS_PER_BATCH: usize = 4;

/// Bytes covered by one batch; code regions are rounded up to this.
pub const BATCH_SIZE: u32 = (PACKET_DATA_SIZE * PACKETS_PER_BATCH) as u32;

/// Length of a region info response up to the end of the hash.
pub const REGION_INFO_RESPONSE_SIZE: usize = 18;

// ============================================================================
// Board Layout
// ============================================================================

/// Universal hex block type tags for V1 images.
pub const V1_BLOCK_TYPES: &[u16] = &[0x9900, 0x9901, 0x9902];

/// Universal hex block type tags for V2 images.
pub const V2_BLOCK_TYPES: &[u16] = &[0x9903, 0x9904];

/// Application region of a V1, `[start, end)`.
pub const V1_APP_REGION: (u32, u32) = (0x18000, 0x3C000);

/// Application region of a V2, `[start, end)`.
pub const V2_APP_REGION: (u32, u32) = (0x1C000, 0x77000);

/// Marker MakeCode places at the start of its code region. The 8-byte DAL
/// hash follows immediately.
pub const PXT_MAGIC: [u8; 16] = [
    0x70, 0x8E, 0x3B, 0x92, 0xC6, 0x15, 0xA8, 0x41, 0xC4, 0x98, 0x66, 0xC9, 0x75, 0xEE, 0x51,
    0x97,
];

// ============================================================================
// DFU Packaging
// ============================================================================

/// Identifies the init packet struct.
pub const INIT_PACKET_MAGIC: &[u8; 12] = b"microbit_app";

/// Version of the init packet struct.
pub const INIT_PACKET_VERSION: u32 = 1;

/// Size of the init packet in bytes.
pub const INIT_PACKET_SIZE: usize = 56;

/// DFU payloads must be a multiple of this many bytes.
pub const DFU_SIZE_ALIGNMENT: usize = 4;

/// Application binary name inside the DFU archive.
pub const APP_BIN_FILENAME: &str = "application.bin";

/// Init packet name inside the DFU archive.
pub const APP_DAT_FILENAME: &str = "application.dat";

/// Manifest name inside the DFU archive.
pub const MANIFEST_FILENAME: &str = "manifest.json";

// ============================================================================
// Timeouts and Delays
// ============================================================================

/// Timeout for a transport connection.
pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Timeout for an explicit bond request.
pub const BOND_TIMEOUT_MS: u64 = 40_000;

/// Wait for the first disconnect a fresh bond provokes (arrives after 2-3 s).
pub const FIRST_DISCONNECT_TIMEOUT_MS: u64 = 5_000;

/// Wait for the reset-driven disconnect (arrives 10-13 s after the first).
pub const SECOND_DISCONNECT_TIMEOUT_MS: u64 = 20_000;

/// Window in which an automatic disconnect must follow an implicit bond.
pub const BOND_GRACE_WINDOW_MS: u64 = 4_000;

/// Scan window when looking for a device by name.
pub const SCAN_TIMEOUT_MS: u64 = 5_000;

/// Timeout for a single write and its matching notification.
pub const NOTIFICATION_TIMEOUT_MS: u64 = 5_000;

/// Settle time before service discovery so service-changed indications land.
pub const SERVICE_CHANGED_DELAY_MS: u64 = 1_600;

/// Wait for a V1 to drop the link after the bootloader reboot request.
pub const REBOOT_DISCONNECT_TIMEOUT_MS: u64 = 3_000;

/// Time a V1 needs to come back up in bootloader mode.
pub const REBOOT_DELAY_MS: u64 = 2_500;

/// Settle delay around the end-of-flash write.
pub const END_OF_FLASH_DELAY_MS: u64 = 100;

/// Upper bound for a complete vendor DFU run.
pub const FULL_FLASH_TIMEOUT_MS: u64 = 300_000;

/// Advertised name prefix; `{}` is replaced by the device name pattern.
pub const DEVICE_NAME_TEMPLATE: &str = "BBC micro:bit [{}]";

// ============================================================================
// Runtime Options
// ============================================================================

/// Tunables for one flasher, overridable from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlashOptions {
    pub connect_timeout_ms: u64,
    pub bond_timeout_ms: u64,
    pub first_disconnect_timeout_ms: u64,
    pub second_disconnect_timeout_ms: u64,
    pub bond_grace_window_ms: u64,
    pub scan_timeout_ms: u64,
    pub notification_timeout_ms: u64,
    pub service_changed_delay_ms: u64,
    pub reboot_disconnect_timeout_ms: u64,
    pub reboot_delay_ms: u64,
    pub full_flash_timeout_ms: u64,
    /// Advertised name template, `{}` marks the pattern.
    pub device_name_template: String,
    /// Offer a full flash to V1 boards when partial flashing is not possible.
    pub legacy_full_flash_fallback: bool,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            connect_timeout_ms: CONNECT_TIMEOUT_MS,
            bond_timeout_ms: BOND_TIMEOUT_MS,
            first_disconnect_timeout_ms: FIRST_DISCONNECT_TIMEOUT_MS,
            second_disconnect_timeout_ms: SECOND_DISCONNECT_TIMEOUT_MS,
            bond_grace_window_ms: BOND_GRACE_WINDOW_MS,
            scan_timeout_ms: SCAN_TIMEOUT_MS,
            notification_timeout_ms: NOTIFICATION_TIMEOUT_MS,
            service_changed_delay_ms: SERVICE_CHANGED_DELAY_MS,
            reboot_disconnect_timeout_ms: REBOOT_DISCONNECT_TIMEOUT_MS,
            reboot_delay_ms: REBOOT_DELAY_MS,
            full_flash_timeout_ms: FULL_FLASH_TIMEOUT_MS,
            device_name_template: DEVICE_NAME_TEMPLATE.to_string(),
            legacy_full_flash_fallback: false,
        }
    }
}

impl FlashOptions {
    /// Parse options from JSON; missing fields keep their defaults.
    pub fn from_json(json: &str) -> FlashOpResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Advertised name prefix for a device name pattern.
    pub fn device_name_prefix(&self, pattern: &str) -> String {
        self.device_name_template.replace("{}", pattern)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn bond_timeout(&self) -> Duration {
        Duration::from_millis(self.bond_timeout_ms)
    }

    pub fn first_disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.first_disconnect_timeout_ms)
    }

    pub fn second_disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.second_disconnect_timeout_ms)
    }

    pub fn bond_grace_window(&self) -> Duration {
        Duration::from_millis(self.bond_grace_window_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn notification_timeout(&self) -> Duration {
        Duration::from_millis(self.notification_timeout_ms)
    }

    pub fn service_changed_delay(&self) -> Duration {
        Duration::from_millis(self.service_changed_delay_ms)
    }

    pub fn reboot_disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reboot_disconnect_timeout_ms)
    }

    pub fn reboot_delay(&self) -> Duration {
        Duration::from_millis(self.reboot_delay_ms)
    }

    pub fn full_flash_timeout(&self) -> Duration {
        Duration::from_millis(self.full_flash_timeout_ms)
    }
}

// ============================================================================
// Platform Capabilities
// ============================================================================

/// What the host BLE stack lets us do, in place of runtime platform checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformCapabilities {
    /// Bond state can be queried and bonds created explicitly.
    pub supports_explicit_bond_query: bool,
    /// Location services must be on before scanning.
    pub requires_location_permission: bool,
}

impl PlatformCapabilities {
    /// Android: explicit bonding API, location gate on scanning.
    pub const fn android() -> Self {
        Self {
            supports_explicit_bond_query: true,
            requires_location_permission: true,
        }
    }

    /// iOS: the OS pairs on demand and hides bond state.
    pub const fn ios() -> Self {
        Self {
            supports_explicit_bond_query: false,
            requires_location_permission: false,
        }
    }
}
