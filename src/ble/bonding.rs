//! Connection and bonding state machine.
//!
//! Some micro:bit firmware drops the link shortly after a fresh bond and then
//! again after a reset into pairing mode. The controller sequences the
//! connect, bond, disconnect and reconnect steps until the link is stable.

use std::fmt;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::flashing::config::{
    FlashOptions, PlatformCapabilities, MICROBIT_RESET_COMMAND, PARTIAL_FLASHING_SERVICE,
    PARTIAL_FLASH_CHARACTERISTIC,
};
use crate::flashing::error::FlashError;
use crate::flashing::partial::MicroBitMode;

use super::device::Device;
use super::transport::{BleTransport, Characteristic, Peripheral, WriteType};

/// States of one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondingState {
    Disconnected,
    Connecting,
    ConnectedUnbonded,
    Bonding,
    PostBondDisconnectWait,
    Reconnecting,
    Ready,
    Failed,
}

impl BondingState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BondingState::Ready | BondingState::Failed)
    }
}

/// Why a connection attempt ended without a usable device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondFailure {
    /// A step failed or timed out.
    FailedToConnect,
    /// The user or OS declined the bond.
    Cancelled,
}

impl fmt::Display for BondFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BondFailure::FailedToConnect => f.write_str("failed to connect"),
            BondFailure::Cancelled => f.write_str("bonding cancelled"),
        }
    }
}

const PARTIAL_FLASH: Characteristic =
    Characteristic::new(PARTIAL_FLASHING_SERVICE, PARTIAL_FLASH_CHARACTERISTIC);

/// Drives one peripheral from `Disconnected` to `Ready` or `Failed`.
///
/// Timeouts are not retried here; the caller owns retry policy.
pub struct BondingController {
    transport: Arc<dyn BleTransport>,
    capabilities: PlatformCapabilities,
    options: FlashOptions,
    state: BondingState,
    history: Vec<BondingState>,
}

impl BondingController {
    pub fn new(
        transport: Arc<dyn BleTransport>,
        capabilities: PlatformCapabilities,
        options: FlashOptions,
    ) -> Self {
        Self {
            transport,
            capabilities,
            options,
            state: BondingState::Disconnected,
            history: vec![BondingState::Disconnected],
        }
    }

    pub fn state(&self) -> BondingState {
        self.state
    }

    /// Every state visited so far, in order.
    pub fn history(&self) -> &[BondingState] {
        &self.history
    }

    /// Connect to `peripheral` and make sure the link survives bonding.
    pub async fn connect(&mut self, peripheral: &Peripheral) -> Result<Device, BondFailure> {
        let device = Device::new(Arc::clone(&self.transport), peripheral.clone());

        match self.establish(&device).await {
            Ok(()) => {
                self.transition(BondingState::Ready);
                info!("Connection to {} ready", peripheral);
                Ok(device)
            }
            Err(failure) => {
                self.transition(BondingState::Failed);
                if let Err(e) = device.disconnect().await {
                    debug!("Disconnect after failed bonding: {}", e);
                }
                Err(failure)
            }
        }
    }

    async fn establish(&mut self, device: &Device) -> Result<(), BondFailure> {
        self.transition(BondingState::Connecting);
        device
            .connect(self.options.connect_timeout())
            .await
            .map_err(|e| connect_failure("connect", e))?;
        self.transition(BondingState::ConnectedUnbonded);

        if self.capabilities.supports_explicit_bond_query {
            self.bond_explicitly(device).await
        } else {
            self.bond_implicitly(device).await
        }
    }

    /// Platforms that can query and create bonds directly.
    async fn bond_explicitly(&mut self, device: &Device) -> Result<(), BondFailure> {
        let bonded = self
            .transport
            .is_bonded(device.id())
            .await
            .map_err(|e| connect_failure("bond query", e))?;
        if bonded {
            debug!("{} is already bonded", device.name());
            return Ok(());
        }

        self.transition(BondingState::Bonding);
        match self
            .transport
            .create_bond(device.id(), self.options.bond_timeout())
            .await
        {
            Ok(()) => info!("Bonded with {}", device.name()),
            Err(FlashError::BondRejected) => {
                warn!("Bond with {} rejected", device.name());
                return Err(BondFailure::Cancelled);
            }
            Err(e) => return Err(connect_failure("bond", e)),
        }

        self.transition(BondingState::PostBondDisconnectWait);
        device
            .wait_for_disconnect(self.options.first_disconnect_timeout())
            .await
            .map_err(|e| connect_failure("first disconnect", e))?;

        self.reconnect_through_reset(device).await
    }

    /// Platforms that bond implicitly on the first privileged operation.
    async fn bond_implicitly(&mut self, device: &Device) -> Result<(), BondFailure> {
        self.transition(BondingState::Bonding);
        let subscription = device.subscribe(PARTIAL_FLASH).await.map_err(|e| {
            warn!("Privileged operation failed, assuming bond declined: {}", e);
            BondFailure::Cancelled
        })?;
        if let Err(e) = subscription.unsubscribe().await {
            debug!("Unsubscribe after bond probe failed: {}", e);
        }

        self.transition(BondingState::PostBondDisconnectWait);
        match device
            .wait_for_disconnect(self.options.bond_grace_window())
            .await
        {
            Ok(()) => {
                info!("{} dropped the link after bonding", device.name());
                self.reconnect_through_reset(device).await
            }
            Err(FlashError::Timeout { .. }) => {
                debug!("No disconnect within grace window, link is stable");
                Ok(())
            }
            Err(e) => Err(connect_failure("bond grace window", e)),
        }
    }

    /// Reconnect, reset into pairing mode, wait for the reset disconnect and
    /// reconnect again.
    async fn reconnect_through_reset(&mut self, device: &Device) -> Result<(), BondFailure> {
        self.transition(BondingState::Reconnecting);
        device
            .connect(self.options.connect_timeout())
            .await
            .map_err(|e| connect_failure("reconnect", e))?;

        device
            .write(
                PARTIAL_FLASH,
                &[MICROBIT_RESET_COMMAND, MicroBitMode::Pairing as u8],
                WriteType::WithoutResponse,
            )
            .await
            .map_err(|e| connect_failure("reset to pairing mode", e))?;

        device
            .wait_for_disconnect(self.options.second_disconnect_timeout())
            .await
            .map_err(|e| connect_failure("second disconnect", e))?;

        device
            .connect(self.options.connect_timeout())
            .await
            .map_err(|e| connect_failure("final reconnect", e))
    }

    fn transition(&mut self, next: BondingState) {
        debug!("Bonding state {:?} -> {:?}", self.state, next);
        self.state = next;
        self.history.push(next);
    }
}

fn connect_failure(step: &str, error: FlashError) -> BondFailure {
    warn!("Connection step '{}' failed: {}", step, error);
    BondFailure::FailedToConnect
}
