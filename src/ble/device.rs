//! One BLE connection to a micro:bit.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::flashing::error::{FlashError, FlashOpResult};

use super::notifications::{NotificationRegistry, NotificationSubscription, WaiterGuard};
use super::transport::{BleTransport, Characteristic, Peripheral, TransportEvent, WriteType};

pub(crate) struct LinkState {
    pub connected: bool,
    /// Bumped on every disconnect.
    pub epoch: u64,
    pub registry: NotificationRegistry,
}

/// State shared between a [`Device`], its event dispatcher and its
/// subscription handles.
pub(crate) struct Shared {
    pub device_id: String,
    link: Mutex<LinkState>,
    disconnects: watch::Sender<u64>,
}

impl Shared {
    pub fn link(&self) -> MutexGuard<'_, LinkState> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Release a subscription taken in `epoch`. Returns true if the transport
    /// subscription should be stopped.
    pub fn release(&self, characteristic: Characteristic, epoch: u64) -> bool {
        let mut link = self.link();
        if link.epoch != epoch || !link.connected {
            return false;
        }
        link.registry.release(characteristic)
    }

    fn on_notification(&self, characteristic: Characteristic, value: &[u8]) {
        let mut link = self.link();
        if !link.connected {
            return;
        }
        if !link.registry.dispatch(characteristic, value) {
            debug!(
                "Unclaimed notification on {}: {:02X?}",
                characteristic, value
            );
        }
    }

    fn on_disconnect(&self) {
        {
            let mut link = self.link();
            if !link.connected {
                return;
            }
            link.connected = false;
            link.epoch += 1;
            link.registry.invalidate();
        }
        info!("Device {} disconnected", self.device_id);
        self.disconnects.send_modify(|generation| *generation += 1);
    }
}

/// A connection identity for one peripheral.
///
/// Tracks liveness, owns the notification registry and exposes a disconnect
/// signal. Must be created inside a tokio runtime: it spawns a task that
/// routes transport events to this device until it is dropped.
pub struct Device {
    peripheral: Peripheral,
    transport: Arc<dyn BleTransport>,
    shared: Arc<Shared>,
    dispatcher: JoinHandle<()>,
}

impl Device {
    pub fn new(transport: Arc<dyn BleTransport>, peripheral: Peripheral) -> Self {
        let (disconnects, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            device_id: peripheral.id.clone(),
            link: Mutex::new(LinkState {
                connected: false,
                epoch: 0,
                registry: NotificationRegistry::default(),
            }),
            disconnects,
        });
        let dispatcher = tokio::spawn(dispatch_events(Arc::clone(&shared), transport.events()));

        Self {
            peripheral,
            transport,
            shared,
            dispatcher,
        }
    }

    pub fn id(&self) -> &str {
        &self.peripheral.id
    }

    pub fn name(&self) -> &str {
        &self.peripheral.name
    }

    pub fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }

    pub fn is_connected(&self) -> bool {
        self.shared.link().connected
    }

    /// Characteristics with at least one live subscription.
    pub fn active_subscriptions(&self) -> Vec<Characteristic> {
        self.shared.link().registry.active()
    }

    pub async fn connect(&self, timeout: Duration) -> FlashOpResult<()> {
        debug!("Connecting to {}", self.peripheral);
        match tokio::time::timeout(timeout, self.transport.connect(self.id(), timeout)).await {
            Ok(result) => result?,
            Err(_) => return Err(FlashError::timeout("connect")),
        }
        self.shared.link().connected = true;
        info!("Connected to {}", self.peripheral);
        Ok(())
    }

    /// Disconnect and invalidate all subscriptions and waiters.
    pub async fn disconnect(&self) -> FlashOpResult<()> {
        if !self.is_connected() {
            return Ok(());
        }
        let result = self.transport.disconnect(self.id()).await;
        self.shared.on_disconnect();
        result
    }

    /// Wait for the link to drop. Returns at once if it already has.
    pub async fn wait_for_disconnect(&self, timeout: Duration) -> FlashOpResult<()> {
        let mut generation = self.shared.disconnects.subscribe();
        if !self.is_connected() {
            return Ok(());
        }
        match tokio::time::timeout(timeout, generation.changed()).await {
            Ok(_) => Ok(()),
            Err(_) => Err(FlashError::timeout("wait for disconnect")),
        }
    }

    pub async fn discover_services(&self) -> FlashOpResult<Vec<Uuid>> {
        self.ensure_connected()?;
        self.transport.discover_services(self.id()).await
    }

    /// Start (or share) a notification subscription on `characteristic`.
    pub async fn subscribe(
        &self,
        characteristic: Characteristic,
    ) -> FlashOpResult<NotificationSubscription> {
        let (first, epoch) = {
            let mut link = self.shared.link();
            if !link.connected {
                return Err(FlashError::NotConnected);
            }
            (link.registry.acquire(characteristic), link.epoch)
        };

        if first {
            debug!("Starting notifications for {}", characteristic);
            if let Err(e) = self
                .transport
                .start_notifications(self.id(), characteristic)
                .await
            {
                self.shared.release(characteristic, epoch);
                return Err(e);
            }
        }

        Ok(NotificationSubscription::new(
            Arc::clone(&self.shared),
            Arc::clone(&self.transport),
            characteristic,
            epoch,
        ))
    }

    pub async fn read(&self, characteristic: Characteristic) -> FlashOpResult<Vec<u8>> {
        self.ensure_connected()?;
        self.transport.read(self.id(), characteristic).await
    }

    pub async fn write(
        &self,
        characteristic: Characteristic,
        data: &[u8],
        write_type: WriteType,
    ) -> FlashOpResult<()> {
        self.ensure_connected()?;
        self.transport
            .write(self.id(), characteristic, data, write_type)
            .await
    }

    /// Write `data`, then wait for a notification on the same characteristic
    /// whose first byte is `command` and which `predicate` accepts.
    ///
    /// Fails with `NotSubscribed` if nothing subscribes to `characteristic`,
    /// with `Disconnected` if the link drops first, or with `Timeout`.
    pub async fn write_for_notification<P>(
        &self,
        characteristic: Characteristic,
        data: &[u8],
        write_type: WriteType,
        command: u8,
        predicate: P,
        timeout: Duration,
    ) -> FlashOpResult<Vec<u8>>
    where
        P: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        let (id, receiver) = {
            let mut link = self.shared.link();
            if !link.connected {
                return Err(FlashError::NotConnected);
            }
            if !link.registry.is_subscribed(characteristic) {
                return Err(FlashError::NotSubscribed {
                    characteristic: characteristic.to_string(),
                });
            }
            link.registry.add_waiter(
                characteristic,
                Box::new(move |value| value.first() == Some(&command) && predicate(value)),
            )
        };
        let _guard = WaiterGuard::new(Arc::clone(&self.shared), id);

        self.write(characteristic, data, write_type).await?;

        tokio::select! {
            outcome = receiver => match outcome {
                Ok(result) => result,
                Err(_) => Err(FlashError::disconnected("notification wait")),
            },
            _ = tokio::time::sleep(timeout) => {
                Err(FlashError::timeout(format!("notification 0x{command:02X}")))
            }
        }
    }

    fn ensure_connected(&self) -> FlashOpResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(FlashError::NotConnected)
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch_events(shared: Arc<Shared>, mut events: broadcast::Receiver<TransportEvent>) {
    loop {
        match events.recv().await {
            Ok(TransportEvent::Notification {
                device_id,
                characteristic,
                value,
            }) if device_id == shared.device_id => shared.on_notification(characteristic, &value),
            Ok(TransportEvent::Disconnected { device_id }) if device_id == shared.device_id => {
                shared.on_disconnect()
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!("Dropped {} transport events for {}", skipped, shared.device_id)
            }
            Err(RecvError::Closed) => break,
        }
    }
}
