//! Shared flashing types: boards, regions, progress and outcomes.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::config::{V1_APP_REGION, V1_BLOCK_TYPES, V2_APP_REGION, V2_BLOCK_TYPES};

/// Supported micro:bit hardware revisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoardId {
    /// Legacy revision (nRF51).
    V1,
    /// Current revision (nRF52833).
    V2,
}

impl BoardId {
    /// Application region of this board.
    pub fn app_region(self) -> AddressWindow {
        let (start, end) = match self {
            BoardId::V1 => V1_APP_REGION,
            BoardId::V2 => V2_APP_REGION,
        };
        AddressWindow::new(start, end)
    }

    /// Universal hex block types that carry this board's image.
    pub fn block_types(self) -> &'static [u16] {
        match self {
            BoardId::V1 => V1_BLOCK_TYPES,
            BoardId::V2 => V2_BLOCK_TYPES,
        }
    }

    /// Board that owns a universal hex block type, if any.
    pub fn from_block_type(block_type: u16) -> Option<Self> {
        [BoardId::V1, BoardId::V2]
            .into_iter()
            .find(|board| board.block_types().contains(&block_type))
    }

    /// Map a Device Information model number string to a board.
    pub fn from_model_number(model: &str) -> Self {
        if model.contains("V2") {
            BoardId::V2
        } else {
            BoardId::V1
        }
    }
}

impl fmt::Display for BoardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoardId::V1 => f.write_str("V1"),
            BoardId::V2 => f.write_str("V2"),
        }
    }
}

/// Half-open address range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressWindow {
    pub start: u32,
    pub end: u32,
}

impl AddressWindow {
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.start && address < self.end
    }

    /// True if `[start, start + len)` overlaps this window.
    pub fn overlaps(&self, start: u32, len: usize) -> bool {
        let block_end = u64::from(start) + len as u64;
        block_end > u64::from(self.start) && start < self.end
    }

    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// On-device (or in-image) region boundaries and content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    pub start: u32,
    /// Exclusive.
    pub end: u32,
    pub hash: [u8; 8],
}

impl RegionInfo {
    pub fn len(&self) -> u32 {
        self.end.wrapping_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Upper-case hex rendering of the hash, for logs.
    pub fn hash_hex(&self) -> String {
        self.hash.iter().map(|b| format!("{b:02X}")).collect()
    }
}

impl fmt::Display for RegionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:08X}..0x{:08X} hash={}",
            self.start,
            self.end,
            self.hash_hex()
        )
    }
}

/// Phases reported to the caller while a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FlashProgressStage {
    Initialize,
    FindDevice,
    Connecting,
    PartialFlashing,
    FullFlashing,
    Complete,
    Cancelled,
    Failed,
}

impl FlashProgressStage {
    /// Stable name used in progress events.
    pub fn name(&self) -> &'static str {
        match self {
            FlashProgressStage::Initialize => "initialize",
            FlashProgressStage::FindDevice => "find-device",
            FlashProgressStage::Connecting => "connecting",
            FlashProgressStage::PartialFlashing => "partial-flashing",
            FlashProgressStage::FullFlashing => "full-flashing",
            FlashProgressStage::Complete => "complete",
            FlashProgressStage::Cancelled => "cancelled",
            FlashProgressStage::Failed => "failed",
        }
    }
}

/// One progress notification: a stage plus an optional 0-100 percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlashProgress {
    pub stage: FlashProgressStage,
    pub percent: Option<u8>,
}

impl FlashProgress {
    pub fn stage(stage: FlashProgressStage) -> Self {
        Self {
            stage,
            percent: None,
        }
    }

    pub fn with_percent(stage: FlashProgressStage, percent: u8) -> Self {
        Self {
            stage,
            percent: Some(percent.min(100)),
        }
    }

    /// Get a human-readable message for this progress notification.
    pub fn message(&self) -> String {
        let base = match self.stage {
            FlashProgressStage::Initialize => "Initializing Bluetooth...",
            FlashProgressStage::FindDevice => "Looking for micro:bit...",
            FlashProgressStage::Connecting => "Connecting...",
            FlashProgressStage::PartialFlashing => "Flashing changes",
            FlashProgressStage::FullFlashing => "Flashing full firmware",
            FlashProgressStage::Complete => "Flash complete!",
            FlashProgressStage::Cancelled => "Flash cancelled",
            FlashProgressStage::Failed => "Flash failed",
        };
        match self.percent {
            Some(percent) => format!("{base}... {percent}%"),
            None => base.to_string(),
        }
    }
}

/// Terminal outcome of one flash session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FlashResult {
    Success,
    MissingPermissions,
    BluetoothDisabled,
    DeviceNotFound,
    FailedToConnect,
    InvalidHex,
    PartialFlashFailed,
    FullFlashFailed,
    Cancelled,
}

impl FlashResult {
    pub fn is_success(&self) -> bool {
        matches!(self, FlashResult::Success)
    }

    /// Stage announced just before this result is returned.
    pub fn terminal_stage(&self) -> FlashProgressStage {
        match self {
            FlashResult::Success => FlashProgressStage::Complete,
            FlashResult::Cancelled => FlashProgressStage::Cancelled,
            _ => FlashProgressStage::Failed,
        }
    }
}
