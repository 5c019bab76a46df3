//! Full flash through the vendor DFU service.
//!
//! V1 boards are first rebooted into their bootloader over the micro:bit DFU
//! control characteristic. The link is then closed because the DFU service
//! opens its own connection.

use log::{debug, info, warn};

use crate::ble::{Characteristic, Device, WriteType};
use crate::hex::MemoryImage;

use super::config::{
    FlashOptions, DFU_CONTROL_ACTIVATE, MICROBIT_DFU_CHARACTERISTIC, MICROBIT_DFU_SERVICE,
    NORDIC_DFU_SERVICE,
};
use super::dfu::{flash_dfu, DfuService};
use super::dfu_package::{build_dfu_payload, build_init_packet, extract_application_image};
use super::error::FlashOpResult;
use super::model::{BoardId, FlashProgress, FlashProgressStage, FlashResult};

/// The legacy DFU control characteristic.
pub const DFU_CONTROL: Characteristic =
    Characteristic::new(MICROBIT_DFU_SERVICE, MICROBIT_DFU_CHARACTERISTIC);

/// Reboot a V1 board into its bootloader and reconnect.
///
/// Waits for the reboot disconnect (disconnecting explicitly if it does not
/// come), lets the bootloader start, reconnects, and rediscovers services if
/// the bootloader's DFU service is missing from the cached table.
pub async fn reboot_to_bootloader(device: &Device, options: &FlashOptions) -> FlashOpResult<()> {
    info!("Requesting reboot to bootloader");
    device
        .write(DFU_CONTROL, &[DFU_CONTROL_ACTIVATE], WriteType::WithResponse)
        .await?;

    if let Err(e) = device
        .wait_for_disconnect(options.reboot_disconnect_timeout())
        .await
    {
        debug!("{}, disconnecting explicitly", e);
        device.disconnect().await?;
    }

    tokio::time::sleep(options.reboot_delay()).await;

    device.connect(options.connect_timeout()).await?;
    let services = device.discover_services().await?;
    if !services.contains(&NORDIC_DFU_SERVICE) {
        debug!("Bootloader DFU service missing from cache, rediscovering");
        device.discover_services().await?;
    }
    Ok(())
}

/// Replace the whole application on the device with `image`.
pub async fn full_flash(
    device: &Device,
    image: &MemoryImage,
    board: BoardId,
    dfu: &dyn DfuService,
    options: &FlashOptions,
    progress: &(dyn Fn(FlashProgress) + Send + Sync),
) -> FlashResult {
    info!("Full flash of {} board", board);
    progress(FlashProgress::stage(FlashProgressStage::FullFlashing));

    let rebooted = match board {
        BoardId::V1 => reboot_to_bootloader(device, options).await,
        BoardId::V2 => Ok(()),
    };
    if let Err(e) = device.disconnect().await {
        debug!("Disconnect before DFU failed: {}", e);
    }
    if let Err(e) = rebooted {
        warn!("Reboot to bootloader failed: {}", e);
        return FlashResult::FullFlashFailed;
    }

    let Some(app) = extract_application_image(image, board) else {
        warn!("No application data in the {} region", board);
        return FlashResult::InvalidHex;
    };
    let init_packet = build_init_packet(app.len());
    let payload = match build_dfu_payload(&app, &init_packet, board) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Failed to package DFU payload: {}", e);
            return FlashResult::FullFlashFailed;
        }
    };

    flash_dfu(dfu, device.peripheral(), &payload, board, options, progress).await
}
