//! Partial flashing service client.
//!
//! All traffic goes over one characteristic. Byte 0 of every write and every
//! notification is the command id.

use std::time::Duration;

use log::{debug, trace};

use crate::ble::{Characteristic, Device, NotificationSubscription, WriteType};

use super::config::{
    END_OF_FLASH_COMMAND, FLASH_COMMAND, FLASH_PACKET_SIZE, MICROBIT_RESET_COMMAND,
    PACKET_DATA_SIZE, PARTIAL_FLASHING_SERVICE, PARTIAL_FLASH_CHARACTERISTIC,
    REGION_INFO_COMMAND, REGION_INFO_RESPONSE_SIZE,
};
use super::error::{FlashError, FlashOpResult};
use super::model::RegionInfo;

/// The partial flashing control characteristic.
pub const PARTIAL_FLASH: Characteristic =
    Characteristic::new(PARTIAL_FLASHING_SERVICE, PARTIAL_FLASH_CHARACTERISTIC);

/// Flash acknowledgment status: batch not complete yet.
pub const STATUS_WAITING: u8 = 0x00;

/// Flash acknowledgment status: resend the whole batch.
pub const STATUS_RETRANSMIT: u8 = 0xAA;

/// Memory regions the device reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegionId {
    SoftDevice = 0,
    Dal = 1,
    /// User code.
    MakeCode = 2,
}

/// Mode selected by the reset command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MicroBitMode {
    Pairing = 0,
    Application = 1,
}

/// Device answer to the last packet of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketState {
    Success,
    Retransmit,
}

/// Encode one 20-byte flash packet.
///
/// Packet 0 of a batch carries the low 16 bits of the batch address and
/// packet 1 the high 16 bits. The device ignores the field on packets 2 and 3,
/// which repeat the high half.
pub fn encode_flash_packet(
    batch_address: u32,
    packet_in_batch: usize,
    sequence: u8,
    data: &[u8],
) -> [u8; FLASH_PACKET_SIZE] {
    let offset = if packet_in_batch == 0 {
        (batch_address & 0xFFFF) as u16
    } else {
        (batch_address >> 16) as u16
    };

    let mut packet = [0xFF; FLASH_PACKET_SIZE];
    packet[0] = FLASH_COMMAND;
    packet[1..3].copy_from_slice(&offset.to_be_bytes());
    packet[3] = sequence;
    let len = data.len().min(PACKET_DATA_SIZE);
    packet[4..4 + len].copy_from_slice(&data[..len]);
    packet
}

/// Decode a region info notification.
///
/// Returns `None` if the device reports the region as unavailable.
pub fn decode_region_info(response: &[u8]) -> FlashOpResult<Option<RegionInfo>> {
    if response.len() < REGION_INFO_RESPONSE_SIZE {
        return Err(FlashError::UnexpectedResponse {
            reason: format!(
                "region info is {} bytes, expected {}",
                response.len(),
                REGION_INFO_RESPONSE_SIZE
            ),
        });
    }

    let start = u32::from_be_bytes([response[2], response[3], response[4], response[5]]);
    let end = u32::from_be_bytes([response[6], response[7], response[8], response[9]]);
    if start == 0 || start >= end {
        return Ok(None);
    }

    let mut hash = [0u8; 8];
    hash.copy_from_slice(&response[10..18]);
    Ok(Some(RegionInfo { start, end, hash }))
}

/// Interpret a flash acknowledgment. `None` for a waiting status.
pub fn decode_packet_state(response: &[u8]) -> Option<PacketState> {
    match response.get(1).copied() {
        None | Some(STATUS_WAITING) => None,
        Some(STATUS_RETRANSMIT) => Some(PacketState::Retransmit),
        Some(_) => Some(PacketState::Success),
    }
}

/// Client for the partial flashing characteristic of a connected device.
pub struct PartialFlashingService<'a> {
    device: &'a Device,
    timeout: Duration,
}

impl<'a> PartialFlashingService<'a> {
    pub fn new(device: &'a Device, notification_timeout: Duration) -> Self {
        Self {
            device,
            timeout: notification_timeout,
        }
    }

    /// Enable notifications; needed before any call that awaits a response.
    pub async fn subscribe(&self) -> FlashOpResult<NotificationSubscription> {
        self.device.subscribe(PARTIAL_FLASH).await
    }

    /// Ask the device for a region's boundaries and hash.
    pub async fn get_region_info(&self, region: RegionId) -> FlashOpResult<Option<RegionInfo>> {
        let response = self
            .device
            .write_for_notification(
                PARTIAL_FLASH,
                &[REGION_INFO_COMMAND, region as u8],
                WriteType::WithoutResponse,
                REGION_INFO_COMMAND,
                |_| true,
                self.timeout,
            )
            .await?;

        let info = decode_region_info(&response)?;
        match &info {
            Some(info) => debug!("Device {:?} region: {}", region, info),
            None => debug!("Device {:?} region unavailable", region),
        }
        Ok(info)
    }

    /// Reset the device into `mode`. The device drops the link.
    pub async fn reset_to_mode(&self, mode: MicroBitMode) -> FlashOpResult<()> {
        debug!("Resetting device into {:?} mode", mode);
        self.device
            .write(
                PARTIAL_FLASH,
                &[MICROBIT_RESET_COMMAND, mode as u8],
                WriteType::WithoutResponse,
            )
            .await
    }

    /// Send a packet without waiting for an acknowledgment.
    pub async fn write_flash(&self, packet: &[u8; FLASH_PACKET_SIZE]) -> FlashOpResult<()> {
        trace!("Flash packet seq={}", packet[3]);
        self.device
            .write(PARTIAL_FLASH, packet, WriteType::WithoutResponse)
            .await
    }

    /// Send the last packet of a batch and wait for the batch verdict.
    pub async fn write_flash_awaiting_ack(
        &self,
        packet: &[u8; FLASH_PACKET_SIZE],
    ) -> FlashOpResult<PacketState> {
        let response = self
            .device
            .write_for_notification(
                PARTIAL_FLASH,
                packet,
                WriteType::WithoutResponse,
                FLASH_COMMAND,
                |value| decode_packet_state(value).is_some(),
                self.timeout,
            )
            .await?;

        decode_packet_state(&response).ok_or_else(|| FlashError::UnexpectedResponse {
            reason: "flash acknowledgment without status".to_string(),
        })
    }

    pub async fn write_end_of_flash(&self) -> FlashOpResult<()> {
        debug!("Sending end of flash");
        self.device
            .write(
                PARTIAL_FLASH,
                &[END_OF_FLASH_COMMAND],
                WriteType::WithoutResponse,
            )
            .await
    }
}
