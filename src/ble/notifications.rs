//! Notification fan-out for one device.
//!
//! One transport subscription per characteristic is shared by any number of
//! [`NotificationSubscription`] handles. Waiters registered against a
//! characteristic are resolved by the first notification their predicate
//! accepts; each notification resolves at most one waiter.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::flashing::error::{FlashError, FlashOpResult};

use super::device::Shared;
use super::transport::{BleTransport, Characteristic};

/// Notification filter.
pub type Predicate = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

type WaiterResult = FlashOpResult<Vec<u8>>;

struct Waiter {
    id: u64,
    characteristic: Characteristic,
    predicate: Predicate,
    sender: oneshot::Sender<WaiterResult>,
}

/// Subscription refcounts and pending waiters for one device.
#[derive(Default)]
pub(crate) struct NotificationRegistry {
    subscriptions: HashMap<Characteristic, usize>,
    waiters: Vec<Waiter>,
    next_waiter_id: u64,
}

impl NotificationRegistry {
    /// Take a reference on `characteristic`. Returns true for the first one.
    pub fn acquire(&mut self, characteristic: Characteristic) -> bool {
        let count = self.subscriptions.entry(characteristic).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Drop a reference on `characteristic`. Returns true when the last one goes.
    pub fn release(&mut self, characteristic: Characteristic) -> bool {
        match self.subscriptions.get_mut(&characteristic) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.subscriptions.remove(&characteristic);
                true
            }
            None => false,
        }
    }

    pub fn is_subscribed(&self, characteristic: Characteristic) -> bool {
        self.subscriptions.contains_key(&characteristic)
    }

    pub fn active(&self) -> Vec<Characteristic> {
        let mut active: Vec<_> = self.subscriptions.keys().copied().collect();
        active.sort();
        active
    }

    pub fn add_waiter(
        &mut self,
        characteristic: Characteristic,
        predicate: Predicate,
    ) -> (u64, oneshot::Receiver<WaiterResult>) {
        let (sender, receiver) = oneshot::channel();
        let id = self.next_waiter_id;
        self.next_waiter_id += 1;
        self.waiters.push(Waiter {
            id,
            characteristic,
            predicate,
            sender,
        });
        (id, receiver)
    }

    pub fn remove_waiter(&mut self, id: u64) {
        self.waiters.retain(|waiter| waiter.id != id);
    }

    pub fn pending_waiters(&self) -> usize {
        self.waiters.len()
    }

    /// Resolve the first waiter on `characteristic` that accepts `value`.
    pub fn dispatch(&mut self, characteristic: Characteristic, value: &[u8]) -> bool {
        self.waiters.retain(|waiter| !waiter.sender.is_closed());

        let position = self.waiters.iter().position(|waiter| {
            waiter.characteristic == characteristic && (waiter.predicate)(value)
        });
        match position {
            Some(index) => {
                let waiter = self.waiters.remove(index);
                let _ = waiter.sender.send(Ok(value.to_vec()));
                true
            }
            None => false,
        }
    }

    /// Clear all subscriptions and fail every pending waiter.
    pub fn invalidate(&mut self) {
        self.subscriptions.clear();
        for waiter in self.waiters.drain(..) {
            let _ = waiter
                .sender
                .send(Err(FlashError::disconnected("notification wait")));
        }
    }
}

/// Removes a waiter when the wait is abandoned (timeout or write failure).
pub(crate) struct WaiterGuard {
    shared: Arc<Shared>,
    id: u64,
}

impl WaiterGuard {
    pub fn new(shared: Arc<Shared>, id: u64) -> Self {
        Self { shared, id }
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.shared.link().registry.remove_waiter(self.id);
    }
}

/// Handle for one logical notification subscription.
///
/// Prefer [`unsubscribe`](Self::unsubscribe). If the handle is dropped
/// instead, the transport subscription is stopped in the background.
/// Handles from before a disconnect are inert afterwards.
#[must_use = "dropping the handle ends the subscription"]
pub struct NotificationSubscription {
    shared: Arc<Shared>,
    transport: Arc<dyn BleTransport>,
    characteristic: Characteristic,
    epoch: u64,
    released: bool,
}

impl NotificationSubscription {
    pub(crate) fn new(
        shared: Arc<Shared>,
        transport: Arc<dyn BleTransport>,
        characteristic: Characteristic,
        epoch: u64,
    ) -> Self {
        Self {
            shared,
            transport,
            characteristic,
            epoch,
            released: false,
        }
    }

    pub fn characteristic(&self) -> Characteristic {
        self.characteristic
    }

    /// Release this handle, stopping notifications if it was the last one.
    pub async fn unsubscribe(mut self) -> FlashOpResult<()> {
        self.released = true;
        if self.shared.release(self.characteristic, self.epoch) {
            debug!("Stopping notifications for {}", self.characteristic);
            self.transport
                .stop_notifications(&self.shared.device_id, self.characteristic)
                .await?;
        }
        Ok(())
    }
}

impl Drop for NotificationSubscription {
    fn drop(&mut self) {
        if self.released || !self.shared.release(self.characteristic, self.epoch) {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            warn!(
                "No runtime to stop notifications for {}",
                self.characteristic
            );
            return;
        };
        let transport = Arc::clone(&self.transport);
        let device_id = self.shared.device_id.clone();
        let characteristic = self.characteristic;
        handle.spawn(async move {
            if let Err(e) = transport.stop_notifications(&device_id, characteristic).await {
                debug!("Failed to stop notifications for {}: {}", characteristic, e);
            }
        });
    }
}
