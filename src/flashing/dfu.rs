//! Vendor DFU handoff.
//!
//! The Nordic DFU state machine runs outside this crate behind [`DfuService`].
//! This module writes the payload to a temporary file, starts the service and
//! relays its events.

use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::ble::Peripheral;

use super::config::FlashOptions;
use super::dfu_package::DfuPayload;
use super::error::{FlashError, FlashOpResult};
use super::model::{BoardId, FlashProgress, FlashProgressStage, FlashResult};

/// Options passed to the vendor DFU service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DfuOptions {
    /// Skip the application version check (V1).
    pub force_dfu: bool,
    /// Use the buttonless secure DFU service (V2).
    pub buttonless_secure_dfu: bool,
    pub disable_notification: bool,
    pub restore_bond: bool,
    pub keep_bond: bool,
    pub packet_receipt_notifications: bool,
}

impl DfuOptions {
    pub fn for_board(board: BoardId) -> Self {
        let v2 = board == BoardId::V2;
        Self {
            force_dfu: !v2,
            buttonless_secure_dfu: v2,
            disable_notification: v2,
            restore_bond: v2,
            keep_bond: true,
            packet_receipt_notifications: true,
        }
    }
}

/// One DFU run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuRequest {
    pub device_id: String,
    pub device_name: String,
    /// Payload file; valid until the run finishes.
    pub file_path: PathBuf,
    pub options: DfuOptions,
}

/// Events reported by the vendor DFU service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DfuEvent {
    /// Upload progress, 0-100.
    Progress(u8),
    /// Intermediate state change, informational only.
    State(String),
    Completed,
    Aborted,
    Failed(String),
}

/// The vendor DFU mechanism.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DfuService: Send + Sync {
    /// Start a DFU run. Events arrive on the returned channel until a
    /// terminal event or until the sender is dropped.
    async fn start_dfu(&self, request: DfuRequest) -> FlashOpResult<mpsc::Receiver<DfuEvent>>;
}

/// Flash `payload` onto `peripheral` through the vendor DFU service.
///
/// The temporary payload file and the event channel are released on every
/// exit path.
pub async fn flash_dfu(
    dfu: &dyn DfuService,
    peripheral: &Peripheral,
    payload: &DfuPayload,
    board: BoardId,
    options: &FlashOptions,
    progress: &(dyn Fn(FlashProgress) + Send + Sync),
) -> FlashResult {
    let file = match write_payload(payload) {
        Ok(file) => file,
        Err(e) => {
            error!("Failed to write DFU payload: {}", e);
            return FlashResult::FullFlashFailed;
        }
    };

    let request = DfuRequest {
        device_id: peripheral.id.clone(),
        device_name: peripheral.name.clone(),
        file_path: file.path().to_path_buf(),
        options: DfuOptions::for_board(board),
    };
    info!(
        "Starting DFU for {} with {} ({} bytes)",
        peripheral,
        payload.file_name(),
        payload.bytes().len()
    );

    let mut events = match dfu.start_dfu(request).await {
        Ok(events) => events,
        Err(e) => {
            error!("DFU failed to start: {} ({})", e, e.error_code());
            return FlashResult::FullFlashFailed;
        }
    };

    let relay = async {
        while let Some(event) = events.recv().await {
            match event {
                DfuEvent::Progress(percent) => progress(FlashProgress::with_percent(
                    FlashProgressStage::FullFlashing,
                    percent,
                )),
                DfuEvent::State(state) => debug!("DFU state: {}", state),
                DfuEvent::Completed => {
                    info!("DFU completed");
                    return FlashResult::Success;
                }
                DfuEvent::Aborted => {
                    warn!("DFU aborted");
                    return FlashResult::Cancelled;
                }
                DfuEvent::Failed(reason) => {
                    error!("DFU failed: {}", reason);
                    return FlashResult::FullFlashFailed;
                }
            }
        }
        warn!("DFU event stream ended without a result");
        FlashResult::FullFlashFailed
    };

    let result = match tokio::time::timeout(options.full_flash_timeout(), relay).await {
        Ok(result) => result,
        Err(_) => {
            error!("{}", FlashError::timeout("full flash"));
            FlashResult::FullFlashFailed
        }
    };

    drop(events);
    if let Err(e) = file.close() {
        debug!("Failed to remove DFU payload file: {}", e);
    }
    result
}

fn write_payload(payload: &DfuPayload) -> FlashOpResult<tempfile::NamedTempFile> {
    let suffix = match payload {
        DfuPayload::Archive(_) => ".zip",
        DfuPayload::Binary(_) => ".bin",
    };
    let mut file = tempfile::Builder::new()
        .prefix("microbit-dfu-")
        .suffix(suffix)
        .tempfile()?;
    file.write_all(payload.bytes())?;
    file.flush()?;
    Ok(file)
}
