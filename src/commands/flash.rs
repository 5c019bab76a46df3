//! Entry points for flashing a micro:bit.
//!
//! These wrap [`Flasher`] for a host application: progress is delivered on a
//! channel and the terminal result through a join handle.

use std::sync::Arc;

use log::warn;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::flashing::config::PXT_MAGIC;
use crate::flashing::model::{BoardId, FlashProgress, FlashResult};
use crate::flashing::Flasher;
use crate::hex::{find_tagged_code_region, image_for_board, parse_intel_hex};

/// Progress event sent to the host during a flash.
#[derive(Debug, Clone, Serialize)]
pub struct FlashProgressEvent {
    /// Current stage name.
    pub stage: String,
    /// Progress percentage (0-100), where the stage reports one.
    pub percent: Option<u8>,
    /// Human-readable message.
    pub message: String,
}

impl From<FlashProgress> for FlashProgressEvent {
    fn from(progress: FlashProgress) -> Self {
        Self {
            stage: progress.stage.name().to_string(),
            percent: progress.percent,
            message: progress.message(),
        }
    }
}

/// A running flash session.
pub struct FlashHandle {
    /// Closed once the session has produced its result.
    pub progress: mpsc::UnboundedReceiver<FlashProgressEvent>,
    pub result: JoinHandle<FlashResult>,
}

/// Flash `hex` onto the micro:bit named after `pattern`.
///
/// Dropping the progress receiver does not stop the session.
pub fn start_flash(flasher: Arc<Flasher>, pattern: String, hex: String) -> FlashHandle {
    let (tx, progress) = mpsc::unbounded_channel();

    let result = tokio::spawn(async move {
        let sink = move |p: FlashProgress| {
            let _ = tx.send(FlashProgressEvent::from(p));
        };
        flasher.flash(&pattern, &hex, &sink).await
    });

    FlashHandle { progress, result }
}

/// Summary of a hex file for display before flashing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HexInfo {
    /// Whether the file carries images for more than one board.
    pub universal: bool,
    /// Boards the file has an image for.
    pub boards: Vec<BoardId>,
    /// Boards whose image has a tagged code region, i.e. can be partially
    /// flashed.
    pub partial_flash_boards: Vec<BoardId>,
}

/// Validate that `hex` can be flashed.
pub fn validate_hex(hex: &str) -> Result<HexInfo, String> {
    let image = parse_intel_hex(hex.as_bytes()).map_err(|e| format!("{}", e))?;

    let mut boards = Vec::new();
    let mut partial_flash_boards = Vec::new();
    for board in [BoardId::V1, BoardId::V2] {
        let Some(board_image) = image_for_board(image.clone(), board) else {
            continue;
        };
        boards.push(board);

        if find_tagged_code_region(&board_image, &PXT_MAGIC, board.app_region()).is_some() {
            partial_flash_boards.push(board);
        }
    }

    if boards.is_empty() {
        warn!("Hex file has no image for any known board");
        return Err("No micro:bit image in hex file".to_string());
    }

    Ok(HexInfo {
        universal: image.is_universal(),
        boards,
        partial_flash_boards,
    })
}
