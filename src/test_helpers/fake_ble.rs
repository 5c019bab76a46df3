//! Scripted in-memory BLE transport emulating a micro:bit.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::ble::{BleTransport, Characteristic, Peripheral, TransportEvent, WriteType};
use crate::flashing::config::{
    DEVICE_INFORMATION_SERVICE, FLASH_COMMAND, MICROBIT_RESET_COMMAND,
    MODEL_NUMBER_CHARACTERISTIC, PACKETS_PER_BATCH, PARTIAL_FLASHING_SERVICE,
    REGION_INFO_COMMAND, SECURE_DFU_SERVICE,
};
use crate::flashing::error::{FlashError, FlashOpResult};
use crate::flashing::full_flash::DFU_CONTROL;
use crate::flashing::model::RegionInfo;
use crate::flashing::partial::{PARTIAL_FLASH, STATUS_RETRANSMIT, STATUS_WAITING};

const MODEL_NUMBER: Characteristic =
    Characteristic::new(DEVICE_INFORMATION_SERVICE, MODEL_NUMBER_CHARACTERISTIC);

const POST_BOND_DISCONNECT: Duration = Duration::from_secs(2);
const RESET_DISCONNECT: Duration = Duration::from_secs(3);
const REBOOT_DISCONNECT: Duration = Duration::from_millis(500);

/// One write seen by the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub characteristic: Characteristic,
    pub data: Vec<u8>,
    pub write_type: WriteType,
}

struct Script {
    peripheral: Peripheral,
    enabled: bool,
    location_enabled: bool,
    advertised: Vec<Peripheral>,
    bonded_list: bool,
    model: Option<String>,
    services: Vec<Uuid>,
    code_region: Option<RegionInfo>,
    dal_region: Option<RegionInfo>,
    silent: bool,
    acks: bool,
    waiting_acks: bool,
    retransmit_on_batch: Option<usize>,
    refuse_connections: bool,
    reject_bond: bool,
    disconnect_after_bond: bool,
    disconnect_after_subscribe: bool,
    fail_notifications: bool,
    disconnect_on_reboot: bool,
}

#[derive(Default)]
struct Recorded {
    link_up: bool,
    bonded: bool,
    connects: usize,
    scans: usize,
    discovers: usize,
    notification_starts: usize,
    notification_stops: usize,
    writes: Vec<WriteRecord>,
    packets_in_batch: usize,
    batches: usize,
    subscribe_disconnect_sent: bool,
}

/// Fake micro:bit behind the [`BleTransport`] seam.
pub struct FakeBle {
    script: Script,
    state: Arc<Mutex<Recorded>>,
    events: broadcast::Sender<TransportEvent>,
}

impl FakeBle {
    pub fn new() -> Self {
        let peripheral = Peripheral::new("C4:7A:2B:10:00:01", "BBC micro:bit [zavov]");
        let (events, _) = broadcast::channel(256);
        Self {
            script: Script {
                advertised: vec![peripheral.clone()],
                peripheral,
                enabled: true,
                location_enabled: true,
                bonded_list: false,
                model: Some("BBC micro:bit V2.00".to_string()),
                services: vec![
                    PARTIAL_FLASHING_SERVICE,
                    DEVICE_INFORMATION_SERVICE,
                    SECURE_DFU_SERVICE,
                ],
                code_region: None,
                dal_region: None,
                silent: false,
                acks: true,
                waiting_acks: false,
                retransmit_on_batch: None,
                refuse_connections: false,
                reject_bond: false,
                disconnect_after_bond: true,
                disconnect_after_subscribe: false,
                fail_notifications: false,
                disconnect_on_reboot: true,
            },
            state: Arc::new(Mutex::new(Recorded::default())),
            events,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.script.enabled = enabled;
        self
    }

    pub fn location_enabled(mut self, enabled: bool) -> Self {
        self.script.location_enabled = enabled;
        self
    }

    pub fn advertising(mut self, peripherals: Vec<Peripheral>) -> Self {
        self.script.advertised = peripherals;
        self
    }

    /// Report the device in the OS bonded device list.
    pub fn with_bonded_list(mut self) -> Self {
        self.script.bonded_list = true;
        self
    }

    pub fn bonded(self, bonded: bool) -> Self {
        self.state.lock().unwrap().bonded = bonded;
        self
    }

    pub fn model(mut self, model: &str) -> Self {
        self.script.model = Some(model.to_string());
        self
    }

    pub fn unreadable_model(mut self) -> Self {
        self.script.model = None;
        self
    }

    pub fn services(mut self, services: Vec<Uuid>) -> Self {
        self.script.services = services;
        self
    }

    /// Region info answers; `None` leaves the query unanswered.
    pub fn regions(mut self, code: Option<RegionInfo>, dal: Option<RegionInfo>) -> Self {
        self.script.code_region = code;
        self.script.dal_region = dal;
        self
    }

    /// Never notify.
    pub fn silent(mut self) -> Self {
        self.script.silent = true;
        self
    }

    /// Answer region queries but never acknowledge flash batches.
    pub fn no_acks(mut self) -> Self {
        self.script.acks = false;
        self
    }

    /// Send a "waiting" status ahead of every batch acknowledgment.
    pub fn waiting_acks(mut self, enabled: bool) -> Self {
        self.script.waiting_acks = enabled;
        self
    }

    /// Ask for a retransmit of the `n`th batch received (1-based), once.
    pub fn retransmit_on_batch(mut self, n: usize) -> Self {
        self.script.retransmit_on_batch = Some(n);
        self
    }

    pub fn refuse_connections(mut self) -> Self {
        self.script.refuse_connections = true;
        self
    }

    pub fn reject_bond(mut self) -> Self {
        self.script.reject_bond = true;
        self
    }

    pub fn disconnect_after_bond(mut self, enabled: bool) -> Self {
        self.script.disconnect_after_bond = enabled;
        self
    }

    /// Drop the link once, shortly after the first notification subscription.
    pub fn disconnect_after_subscribe(mut self, enabled: bool) -> Self {
        self.script.disconnect_after_subscribe = enabled;
        self
    }

    pub fn fail_notifications(mut self) -> Self {
        self.script.fail_notifications = true;
        self
    }

    pub fn stay_connected_on_reboot(mut self) -> Self {
        self.script.disconnect_on_reboot = false;
        self
    }

    pub fn peripheral(&self) -> Peripheral {
        self.script.peripheral.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn scan_count(&self) -> usize {
        self.state.lock().unwrap().scans
    }

    pub fn discover_count(&self) -> usize {
        self.state.lock().unwrap().discovers
    }

    pub fn notification_starts(&self) -> usize {
        self.state.lock().unwrap().notification_starts
    }

    pub fn notification_stops(&self) -> usize {
        self.state.lock().unwrap().notification_stops
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn is_link_up(&self) -> bool {
        self.state.lock().unwrap().link_up
    }

    /// Drop the link from the device side.
    pub fn drop_link(&self) {
        drop_link(&self.state, &self.events, &self.script.peripheral.id);
    }

    fn drop_link_after(&self, delay: Duration) {
        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        let device_id = self.script.peripheral.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            drop_link(&state, &events, &device_id);
        });
    }

    fn notify(&self, value: Vec<u8>) {
        let _ = self.events.send(TransportEvent::Notification {
            device_id: self.script.peripheral.id.clone(),
            characteristic: PARTIAL_FLASH,
            value,
        });
    }

    fn on_partial_flash_write(&self, data: &[u8]) {
        match data.first().copied() {
            Some(REGION_INFO_COMMAND) if !self.script.silent => {
                let region_id = data.get(1).copied().unwrap_or_default();
                let region = match region_id {
                    1 => self.script.dal_region,
                    2 => self.script.code_region,
                    _ => None,
                };
                if let Some(region) = region {
                    let mut response = vec![REGION_INFO_COMMAND, region_id];
                    response.extend_from_slice(&region.start.to_be_bytes());
                    response.extend_from_slice(&region.end.to_be_bytes());
                    response.extend_from_slice(&region.hash);
                    self.notify(response);
                }
            }
            Some(FLASH_COMMAND) => {
                let batch = {
                    let mut state = self.state.lock().unwrap();
                    state.packets_in_batch += 1;
                    if state.packets_in_batch < PACKETS_PER_BATCH {
                        return;
                    }
                    state.packets_in_batch = 0;
                    state.batches += 1;
                    state.batches
                };
                if self.script.silent || !self.script.acks {
                    return;
                }
                if self.script.waiting_acks {
                    self.notify(vec![FLASH_COMMAND, STATUS_WAITING]);
                }
                let status = if self.script.retransmit_on_batch == Some(batch) {
                    STATUS_RETRANSMIT
                } else {
                    0xFF
                };
                self.notify(vec![FLASH_COMMAND, status]);
            }
            Some(MICROBIT_RESET_COMMAND) => self.drop_link_after(RESET_DISCONNECT),
            _ => {}
        }
    }
}

impl Default for FakeBle {
    fn default() -> Self {
        Self::new()
    }
}

fn drop_link(
    state: &Mutex<Recorded>,
    events: &broadcast::Sender<TransportEvent>,
    device_id: &str,
) {
    state.lock().unwrap().link_up = false;
    let _ = events.send(TransportEvent::Disconnected {
        device_id: device_id.to_string(),
    });
}

#[async_trait]
impl BleTransport for FakeBle {
    async fn initialize(&self) -> FlashOpResult<()> {
        Ok(())
    }

    async fn is_enabled(&self) -> bool {
        self.script.enabled
    }

    async fn is_location_enabled(&self) -> bool {
        self.script.location_enabled
    }

    async fn scan(&self, name_prefix: &str, _timeout: Duration) -> FlashOpResult<Vec<Peripheral>> {
        self.state.lock().unwrap().scans += 1;
        Ok(self
            .script
            .advertised
            .iter()
            .filter(|p| p.name.starts_with(name_prefix))
            .cloned()
            .collect())
    }

    async fn bonded_devices(&self) -> FlashOpResult<Vec<Peripheral>> {
        if self.script.bonded_list {
            Ok(vec![self.script.peripheral.clone()])
        } else {
            Ok(Vec::new())
        }
    }

    async fn connect(&self, _device_id: &str, _timeout: Duration) -> FlashOpResult<()> {
        if self.script.refuse_connections {
            return Err(FlashError::Transport("connection refused".to_string()));
        }
        let mut state = self.state.lock().unwrap();
        state.link_up = true;
        state.connects += 1;
        Ok(())
    }

    async fn disconnect(&self, _device_id: &str) -> FlashOpResult<()> {
        self.state.lock().unwrap().link_up = false;
        Ok(())
    }

    async fn is_bonded(&self, _device_id: &str) -> FlashOpResult<bool> {
        Ok(self.state.lock().unwrap().bonded)
    }

    async fn create_bond(&self, _device_id: &str, _timeout: Duration) -> FlashOpResult<()> {
        if self.script.reject_bond {
            return Err(FlashError::BondRejected);
        }
        self.state.lock().unwrap().bonded = true;
        if self.script.disconnect_after_bond {
            self.drop_link_after(POST_BOND_DISCONNECT);
        }
        Ok(())
    }

    async fn discover_services(&self, _device_id: &str) -> FlashOpResult<Vec<Uuid>> {
        self.state.lock().unwrap().discovers += 1;
        Ok(self.script.services.clone())
    }

    async fn read(&self, _device_id: &str, characteristic: Characteristic) -> FlashOpResult<Vec<u8>> {
        match (&self.script.model, characteristic == MODEL_NUMBER) {
            (Some(model), true) => Ok(model.as_bytes().to_vec()),
            _ => Err(FlashError::Transport(format!(
                "read of {} failed",
                characteristic
            ))),
        }
    }

    async fn write(
        &self,
        _device_id: &str,
        characteristic: Characteristic,
        data: &[u8],
        write_type: WriteType,
    ) -> FlashOpResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            if !state.link_up {
                return Err(FlashError::Transport("link is down".to_string()));
            }
            state.writes.push(WriteRecord {
                characteristic,
                data: data.to_vec(),
                write_type,
            });
        }

        if characteristic == PARTIAL_FLASH {
            self.on_partial_flash_write(data);
        } else if characteristic == DFU_CONTROL && self.script.disconnect_on_reboot {
            self.drop_link_after(REBOOT_DISCONNECT);
        }
        Ok(())
    }

    async fn start_notifications(
        &self,
        _device_id: &str,
        _characteristic: Characteristic,
    ) -> FlashOpResult<()> {
        if self.script.fail_notifications {
            return Err(FlashError::Transport("notifications unavailable".to_string()));
        }
        let drop_soon = {
            let mut state = self.state.lock().unwrap();
            state.notification_starts += 1;
            let first = !state.subscribe_disconnect_sent;
            if self.script.disconnect_after_subscribe && first {
                state.subscribe_disconnect_sent = true;
                true
            } else {
                false
            }
        };
        if drop_soon {
            self.drop_link_after(POST_BOND_DISCONNECT);
        }
        Ok(())
    }

    async fn stop_notifications(
        &self,
        _device_id: &str,
        _characteristic: Characteristic,
    ) -> FlashOpResult<()> {
        self.state.lock().unwrap().notification_stops += 1;
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}
