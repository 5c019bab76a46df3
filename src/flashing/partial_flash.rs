//! Partial flash driver.
//!
//! Compares the device's code and DAL regions with the new image and, when
//! they are compatible, streams only the code region in 64-byte batches.

use std::time::Duration;

use log::{debug, info, warn};

use crate::ble::Device;
use crate::hex::{find_tagged_code_region, MemoryImage};

use super::config::{
    FlashOptions, BATCH_SIZE, END_OF_FLASH_DELAY_MS, PACKETS_PER_BATCH, PACKET_DATA_SIZE, PXT_MAGIC,
};
use super::error::{FlashError, FlashOpResult};
use super::model::{BoardId, FlashProgress, FlashProgressStage, RegionInfo};
use super::partial::{encode_flash_packet, PacketState, PartialFlashingService, RegionId};

/// Result of a partial flash attempt.
#[derive(Debug)]
pub enum PartialFlashOutcome {
    Success,
    /// Partial flashing cannot be used; a full flash is needed.
    AttemptFullFlash,
    /// A write or acknowledgment failed mid-stream.
    Failed(FlashError),
}

/// Why a partial flash is not applicable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    DeviceRegionUnavailable,
    NoTaggedRegion,
    DalHashMismatch,
    StartAddressMismatch,
}

/// Decide whether the image can be partially flashed onto the device.
///
/// `file_region` is the tagged code region of the new image; its hash is the
/// hash of the DAL the code was built against. Returns the region to stream.
pub fn assess_partial_flash(
    device_code: Option<RegionInfo>,
    device_dal: Option<RegionInfo>,
    file_region: Option<RegionInfo>,
) -> Result<RegionInfo, FallbackReason> {
    let (Some(device_code), Some(device_dal)) = (device_code, device_dal) else {
        return Err(FallbackReason::DeviceRegionUnavailable);
    };
    let file_region = file_region.ok_or(FallbackReason::NoTaggedRegion)?;

    if file_region.hash != device_dal.hash {
        return Err(FallbackReason::DalHashMismatch);
    }
    if file_region.start != device_code.start {
        return Err(FallbackReason::StartAddressMismatch);
    }
    Ok(file_region)
}

/// Try to partially flash `image` onto a connected `device`.
pub async fn partial_flash(
    device: &Device,
    image: &MemoryImage,
    board: BoardId,
    options: &FlashOptions,
    progress: &(dyn Fn(FlashProgress) + Send + Sync),
) -> PartialFlashOutcome {
    let service = PartialFlashingService::new(device, options.notification_timeout());

    let subscription = match service.subscribe().await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!("Cannot enable partial flashing notifications: {}", e);
            return PartialFlashOutcome::AttemptFullFlash;
        }
    };

    let outcome = run(&service, image, board, progress).await;

    if let Err(e) = subscription.unsubscribe().await {
        debug!("Unsubscribe after partial flash failed: {}", e);
    }
    outcome
}

async fn run(
    service: &PartialFlashingService<'_>,
    image: &MemoryImage,
    board: BoardId,
    progress: &(dyn Fn(FlashProgress) + Send + Sync),
) -> PartialFlashOutcome {
    let device_code = read_region(service, RegionId::MakeCode).await;
    let device_dal = read_region(service, RegionId::Dal).await;
    let file_region = find_tagged_code_region(image, &PXT_MAGIC, board.app_region());

    let region = match assess_partial_flash(device_code, device_dal, file_region) {
        Ok(region) => region,
        Err(reason) => {
            info!("Partial flash not applicable: {:?}", reason);
            return PartialFlashOutcome::AttemptFullFlash;
        }
    };

    info!("Partial flashing code region {}", region);
    match stream_region(service, image, region, progress).await {
        Ok(()) => PartialFlashOutcome::Success,
        Err(e) => {
            warn!("Partial flash failed: {} ({})", e, e.error_code());
            PartialFlashOutcome::Failed(e)
        }
    }
}

async fn read_region(service: &PartialFlashingService<'_>, region: RegionId) -> Option<RegionInfo> {
    match service.get_region_info(region).await {
        Ok(info) => info,
        Err(e) => {
            warn!("Could not read {:?} region: {}", region, e);
            None
        }
    }
}

async fn stream_region(
    service: &PartialFlashingService<'_>,
    image: &MemoryImage,
    region: RegionInfo,
    progress: &(dyn Fn(FlashProgress) + Send + Sync),
) -> FlashOpResult<()> {
    let total = u64::from(region.len());
    let mut sequence: u32 = 0;
    let mut address = region.start;

    while address < region.end {
        let batch = image.slice_pad(address, BATCH_SIZE as usize);

        loop {
            let mut state = PacketState::Success;
            for (index, chunk) in batch.chunks(PACKET_DATA_SIZE).enumerate() {
                let packet = encode_flash_packet(address, index, sequence as u8, chunk);
                sequence = sequence.wrapping_add(1);
                if index + 1 < PACKETS_PER_BATCH {
                    service.write_flash(&packet).await?;
                } else {
                    state = service.write_flash_awaiting_ack(&packet).await?;
                }
            }
            match state {
                PacketState::Success => break,
                PacketState::Retransmit => {
                    warn!("Device requested retransmit of batch 0x{:08X}", address)
                }
            }
        }

        address = address.saturating_add(BATCH_SIZE);
        let written = u64::from(address - region.start).min(total);
        let percent = if total == 0 { 100 } else { written * 100 / total };
        progress(FlashProgress::with_percent(
            FlashProgressStage::PartialFlashing,
            percent as u8,
        ));
    }

    let settle = Duration::from_millis(END_OF_FLASH_DELAY_MS);
    tokio::time::sleep(settle).await;
    service.write_end_of_flash().await?;
    tokio::time::sleep(settle).await;

    progress(FlashProgress::with_percent(
        FlashProgressStage::PartialFlashing,
        100,
    ));
    info!("Partial flash complete ({} packets)", sequence);
    Ok(())
}
