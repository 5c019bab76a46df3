//! Flash session orchestration.
//!
//! `Initialize → FindDevice → Connecting → DetermineRevision → TryPartial →
//! (Success | TryFull) → Complete`. Each phase announces its stage before it
//! runs, and the terminal stage is announced before the result is returned.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::ble::{BleTransport, BondFailure, BondingController, Characteristic, Device, Peripheral};
use crate::hex::{image_for_board, parse_intel_hex, MemoryImage};

use super::config::{
    FlashOptions, PlatformCapabilities, DEVICE_INFORMATION_SERVICE, MODEL_NUMBER_CHARACTERISTIC,
    SECURE_DFU_SERVICE,
};
use super::dfu::DfuService;
use super::error::{FlashError, FlashOpResult};
use super::full_flash::full_flash;
use super::model::{BoardId, FlashProgress, FlashProgressStage, FlashResult};
use super::partial_flash::{partial_flash, PartialFlashOutcome};

/// Callback receiving progress notifications.
pub type ProgressSink<'a> = &'a (dyn Fn(FlashProgress) + Send + Sync);

const MODEL_NUMBER: Characteristic =
    Characteristic::new(DEVICE_INFORMATION_SERVICE, MODEL_NUMBER_CHARACTERISTIC);

/// Owns the BLE and DFU collaborators and runs flash sessions.
///
/// At most one session per device id runs at a time.
pub struct Flasher {
    transport: Arc<dyn BleTransport>,
    dfu: Arc<dyn DfuService>,
    capabilities: PlatformCapabilities,
    options: FlashOptions,
    active: Mutex<HashSet<String>>,
}

impl Flasher {
    pub fn new(
        transport: Arc<dyn BleTransport>,
        dfu: Arc<dyn DfuService>,
        capabilities: PlatformCapabilities,
        options: FlashOptions,
    ) -> Self {
        Self {
            transport,
            dfu,
            capabilities,
            options,
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn options(&self) -> &FlashOptions {
        &self.options
    }

    pub fn capabilities(&self) -> PlatformCapabilities {
        self.capabilities
    }

    /// Flash `hex` onto the micro:bit whose name matches `pattern`.
    ///
    /// Always produces exactly one result, preceded by a `Complete`,
    /// `Cancelled` or `Failed` progress notification.
    pub async fn flash(&self, pattern: &str, hex: &str, progress: ProgressSink<'_>) -> FlashResult {
        let result = self.run(pattern, hex, progress).await;
        if result.is_success() {
            info!("Flash session finished: {:?}", result);
        } else {
            warn!("Flash session finished: {:?}", result);
        }
        progress(FlashProgress::stage(result.terminal_stage()));
        result
    }

    async fn run(&self, pattern: &str, hex: &str, progress: ProgressSink<'_>) -> FlashResult {
        progress(FlashProgress::stage(FlashProgressStage::Initialize));
        if let Err(result) = self.check_environment().await {
            return result;
        }

        progress(FlashProgress::stage(FlashProgressStage::FindDevice));
        let Some(peripheral) = self.find_device(pattern).await else {
            return FlashResult::DeviceNotFound;
        };
        info!("Found {}", peripheral);

        let Some(_lease) = SessionLease::acquire(&self.active, &peripheral.id) else {
            warn!("A flash session for {} is already running", peripheral);
            return FlashResult::FailedToConnect;
        };

        progress(FlashProgress::stage(FlashProgressStage::Connecting));
        let mut bonding = BondingController::new(
            Arc::clone(&self.transport),
            self.capabilities,
            self.options.clone(),
        );
        let device = match bonding.connect(&peripheral).await {
            Ok(device) => device,
            Err(BondFailure::Cancelled) => return FlashResult::Cancelled,
            Err(BondFailure::FailedToConnect) => return FlashResult::FailedToConnect,
        };

        let result = self.flash_device(&device, hex, progress).await;

        if let Err(e) = device.disconnect().await {
            debug!("Disconnect at end of session failed: {}", e);
        }
        result
    }

    async fn check_environment(&self) -> Result<(), FlashResult> {
        if let Err(e) = self.transport.initialize().await {
            error!("Bluetooth initialization failed: {}", e);
            return Err(FlashResult::BluetoothDisabled);
        }
        if self.capabilities.requires_location_permission
            && !self.transport.is_location_enabled().await
        {
            return Err(FlashResult::MissingPermissions);
        }
        if !self.transport.is_enabled().await {
            return Err(FlashResult::BluetoothDisabled);
        }
        Ok(())
    }

    /// Bonded devices first (where the platform exposes them), then a scan.
    async fn find_device(&self, pattern: &str) -> Option<Peripheral> {
        let prefix = self.options.device_name_prefix(pattern);

        if self.capabilities.supports_explicit_bond_query {
            match self.transport.bonded_devices().await {
                Ok(bonded) => {
                    if let Some(found) = bonded.into_iter().find(|p| p.name.starts_with(&prefix)) {
                        debug!("Using bonded device {}", found);
                        return Some(found);
                    }
                }
                Err(e) => debug!("Bonded device lookup failed: {}", e),
            }
        }

        debug!("Scanning for '{}'", prefix);
        match self
            .transport
            .scan(&prefix, self.options.scan_timeout())
            .await
        {
            Ok(found) => found.into_iter().find(|p| p.name.starts_with(&prefix)),
            Err(e) => {
                warn!("Scan failed: {}", e);
                None
            }
        }
    }

    async fn flash_device(&self, device: &Device, hex: &str, progress: ProgressSink<'_>) -> FlashResult {
        tokio::time::sleep(self.options.service_changed_delay()).await;
        let services = match device.discover_services().await {
            Ok(services) => services,
            Err(e) => {
                warn!("Service discovery failed: {}", e);
                return FlashResult::FailedToConnect;
            }
        };

        let board = match determine_revision(device, &services).await {
            Ok(board) => board,
            Err(e) => {
                warn!("Could not determine board revision: {}", e);
                return FlashResult::FailedToConnect;
            }
        };
        info!("Device is a {} board", board);

        let Some(image) = prepare_image(hex, board) else {
            return FlashResult::InvalidHex;
        };

        progress(FlashProgress::stage(FlashProgressStage::PartialFlashing));
        match partial_flash(device, &image, board, &self.options, progress).await {
            PartialFlashOutcome::Success => FlashResult::Success,
            PartialFlashOutcome::Failed(_) => FlashResult::PartialFlashFailed,
            PartialFlashOutcome::AttemptFullFlash => {
                self.fall_back_to_full_flash(device, &image, board, progress)
                    .await
            }
        }
    }

    async fn fall_back_to_full_flash(
        &self,
        device: &Device,
        image: &MemoryImage,
        board: BoardId,
        progress: ProgressSink<'_>,
    ) -> FlashResult {
        if board == BoardId::V1 && !self.options.legacy_full_flash_fallback {
            info!("Full flash fallback disabled for V1 boards");
            return FlashResult::PartialFlashFailed;
        }

        if self.capabilities.supports_explicit_bond_query {
            match self.transport.is_bonded(device.id()).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("{} is not bonded, pairing was declined", device.name());
                    return FlashResult::Cancelled;
                }
                Err(e) => debug!("Bond check before full flash failed: {}", e),
            }
        }

        full_flash(device, image, board, self.dfu.as_ref(), &self.options, progress).await
    }
}

/// Read the model number; fall back to the service table if it is unreadable.
async fn determine_revision(device: &Device, services: &[Uuid]) -> FlashOpResult<BoardId> {
    match device.read(MODEL_NUMBER).await {
        Ok(bytes) => {
            let model = String::from_utf8_lossy(&bytes);
            debug!("Model number: {}", model);
            Ok(BoardId::from_model_number(&model))
        }
        Err(e @ (FlashError::NotConnected | FlashError::Disconnected { .. })) => Err(e),
        Err(e) => {
            debug!("Model number unreadable ({}), checking services", e);
            Ok(if services.contains(&SECURE_DFU_SERVICE) {
                BoardId::V2
            } else {
                BoardId::V1
            })
        }
    }
}

fn prepare_image(hex: &str, board: BoardId) -> Option<MemoryImage> {
    let image = match parse_intel_hex(hex.as_bytes()) {
        Ok(image) => image,
        Err(e) => {
            error!("Invalid hex: {}", e);
            return None;
        }
    };
    let selected = image_for_board(image, board);
    if selected.is_none() {
        error!("Hex has no image for {} boards", board);
    }
    selected
}

/// Marks a device id busy for the lifetime of the lease.
struct SessionLease<'a> {
    active: &'a Mutex<HashSet<String>>,
    device_id: String,
}

impl<'a> SessionLease<'a> {
    fn acquire(active: &'a Mutex<HashSet<String>>, device_id: &str) -> Option<Self> {
        let inserted = active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device_id.to_string());
        inserted.then(|| Self {
            active,
            device_id: device_id.to_string(),
        })
    }
}

impl Drop for SessionLease<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.device_id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use tokio::sync::mpsc;

    use super::*;
    use crate::flashing::dfu::{DfuEvent, MockDfuService};
    use crate::flashing::partial::PARTIAL_FLASH;
    use crate::test_helpers::fake_ble::FakeBle;
    use crate::test_helpers::fixtures::{code_image, region};
    use crate::test_helpers::init_logging;
    use FlashProgressStage::*;

    const DAL_HASH: [u8; 8] = [0x0D, 0xA1, 0x0D, 0xA1, 0x0D, 0xA1, 0x0D, 0xA1];

    fn v2_hex(hash: [u8; 8]) -> String {
        code_image(0x30000, 0x80, hash).to_intel_hex()
    }

    fn v2_device() -> FakeBle {
        FakeBle::new().model("BBC micro:bit V2.21").regions(
            Some(region(0x30000, 0x40000, [0; 8])),
            Some(region(0x1000, 0x1C000, DAL_HASH)),
        )
    }

    fn unused_dfu() -> Arc<dyn DfuService> {
        let mut dfu = MockDfuService::new();
        dfu.expect_start_dfu().never();
        Arc::new(dfu)
    }

    fn completing_dfu() -> Arc<dyn DfuService> {
        let mut dfu = MockDfuService::new();
        dfu.expect_start_dfu().times(1).returning(|_| {
            let (tx, rx) = mpsc::channel(4);
            tx.try_send(DfuEvent::Progress(50)).unwrap();
            tx.try_send(DfuEvent::Completed).unwrap();
            Ok(rx)
        });
        Arc::new(dfu)
    }

    fn flasher(fake: &Arc<FakeBle>, dfu: Arc<dyn DfuService>, caps: PlatformCapabilities) -> Flasher {
        Flasher::new(fake.clone(), dfu, caps, FlashOptions::default())
    }

    async fn run(flasher: &Flasher, hex: &str) -> (FlashResult, Vec<FlashProgress>) {
        let seen = StdMutex::new(Vec::new());
        let sink = |p: FlashProgress| seen.lock().unwrap().push(p);
        let result = flasher.flash("zavov", hex, &sink).await;
        (result, seen.into_inner().unwrap())
    }

    fn stages(progress: &[FlashProgress]) -> Vec<FlashProgressStage> {
        let mut stages: Vec<_> = progress.iter().map(|p| p.stage).collect();
        stages.dedup();
        stages
    }

    #[tokio::test(start_paused = true)]
    async fn test_v2_partial_flash_success() {
        init_logging();
        let fake = Arc::new(v2_device().bonded(true));
        let flasher = flasher(&fake, unused_dfu(), PlatformCapabilities::android());

        let (result, progress) = run(&flasher, &v2_hex(DAL_HASH)).await;

        assert_eq!(result, FlashResult::Success);
        assert_eq!(
            stages(&progress),
            vec![Initialize, FindDevice, Connecting, PartialFlashing, Complete]
        );
        assert_eq!(
            progress.iter().rev().nth(1).and_then(|p| p.percent),
            Some(100)
        );
        assert!(!fake.is_link_up());
    }

    #[tokio::test(start_paused = true)]
    async fn test_v2_dal_mismatch_falls_back_to_full_flash() {
        let fake = Arc::new(v2_device().bonded(true));
        let flasher = flasher(&fake, completing_dfu(), PlatformCapabilities::android());

        let (result, progress) = run(&flasher, &v2_hex([0x99; 8])).await;

        assert_eq!(result, FlashResult::Success);
        assert_eq!(
            stages(&progress),
            vec![
                Initialize,
                FindDevice,
                Connecting,
                PartialFlashing,
                FullFlashing,
                Complete
            ]
        );
        assert!(fake
            .writes()
            .iter()
            .all(|w| w.characteristic != PARTIAL_FLASH || w.data[0] != 0x01));
    }

    #[tokio::test(start_paused = true)]
    async fn test_v1_mismatch_is_partial_flash_failed() {
        let fake = Arc::new(
            FakeBle::new()
                .model("BBC micro:bit")
                .bonded(true)
                .regions(
                    Some(region(0x18000, 0x3C000, [0; 8])),
                    Some(region(0x1000, 0x18000, DAL_HASH)),
                ),
        );
        let flasher = flasher(&fake, unused_dfu(), PlatformCapabilities::android());
        let hex = code_image(0x18000, 0x80, [0x42; 8]).to_intel_hex();

        let (result, progress) = run(&flasher, &hex).await;

        assert_eq!(result, FlashResult::PartialFlashFailed);
        assert_eq!(progress.last().unwrap().stage, Failed);
        assert!(!fake.is_link_up());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bluetooth_disabled_never_connects() {
        let fake = Arc::new(v2_device().enabled(false));
        let flasher = flasher(&fake, unused_dfu(), PlatformCapabilities::android());

        let (result, progress) = run(&flasher, &v2_hex(DAL_HASH)).await;

        assert_eq!(result, FlashResult::BluetoothDisabled);
        assert_eq!(stages(&progress), vec![Initialize, Failed]);
        assert_eq!(fake.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_location_off_is_missing_permissions() {
        let fake = Arc::new(v2_device().location_enabled(false));

        let android = flasher(&fake, unused_dfu(), PlatformCapabilities::android());
        assert_eq!(run(&android, "").await.0, FlashResult::MissingPermissions);

        // iOS does not gate scanning on location.
        let ios = flasher(&fake, unused_dfu(), PlatformCapabilities::ios());
        assert_eq!(run(&ios, &v2_hex(DAL_HASH)).await.0, FlashResult::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_not_found() {
        let fake = Arc::new(v2_device().advertising(vec![]));
        let flasher = flasher(&fake, unused_dfu(), PlatformCapabilities::ios());

        let (result, _) = run(&flasher, &v2_hex(DAL_HASH)).await;

        assert_eq!(result, FlashResult::DeviceNotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bonded_device_found_without_scan() {
        let fake = Arc::new(v2_device().bonded(true).advertising(vec![]).with_bonded_list());
        let flasher = flasher(&fake, unused_dfu(), PlatformCapabilities::android());

        let (result, _) = run(&flasher, &v2_hex(DAL_HASH)).await;

        assert_eq!(result, FlashResult::Success);
        assert_eq!(fake.scan_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_hex() {
        let fake = Arc::new(v2_device().bonded(true));
        let flasher = flasher(&fake, unused_dfu(), PlatformCapabilities::android());

        let (result, _) = run(&flasher, ":0400000001020304F3\n").await;

        assert_eq!(result, FlashResult::InvalidHex);
        assert!(!fake.is_link_up());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_bond_is_cancelled() {
        let fake = Arc::new(v2_device().bonded(false).reject_bond());
        let flasher = flasher(&fake, unused_dfu(), PlatformCapabilities::android());

        let (result, progress) = run(&flasher, &v2_hex(DAL_HASH)).await;

        assert_eq!(result, FlashResult::Cancelled);
        assert_eq!(progress.last().unwrap().stage, Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_revision_falls_back_to_service_table() {
        let fake = Arc::new(v2_device().bonded(true).unreadable_model());
        let flasher = flasher(&fake, unused_dfu(), PlatformCapabilities::android());

        let (result, _) = run(&flasher, &v2_hex(DAL_HASH)).await;

        assert_eq!(result, FlashResult::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_session_for_same_device_is_rejected() {
        let fake = Arc::new(v2_device().bonded(true));
        let flasher = flasher(&fake, unused_dfu(), PlatformCapabilities::android());
        let hex = v2_hex(DAL_HASH);

        let (first, second) = tokio::join!(run(&flasher, &hex), run(&flasher, &hex));

        let mut results = vec![first.0, second.0];
        results.sort_by_key(|r| *r == FlashResult::Success);
        assert_eq!(results, vec![FlashResult::FailedToConnect, FlashResult::Success]);
    }
}
