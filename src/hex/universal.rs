//! Universal hex board separation.
//!
//! A universal hex interleaves one section per board, each opened by a block
//! start record naming its block type. Extraction keeps the sections whose
//! block type belongs to the requested board and drops the rest.

use log::debug;

use crate::flashing::model::BoardId;

use super::image::MemoryImage;
use super::record::{Record, RecordType};

/// Extract the single-board image for `board` from a universal hex.
///
/// Returns `None` if `image` is not a universal hex. The result is empty if
/// the universal hex carries no section for `board`.
///
/// Extended linear address records are folded so the output never repeats
/// the active address and never holds two address records back to back.
pub fn extract_board_image(image: &MemoryImage, board: BoardId) -> Option<MemoryImage> {
    if !image.is_universal() {
        return None;
    }

    let wanted = board.block_types();
    let mut out: Vec<Record> = Vec::new();
    let mut active = false;
    let mut last_linear: Option<u16> = None;

    for record in image.records() {
        match record.record_type {
            RecordType::BlockStart => {
                active = record.block_type().is_some_and(|tag| wanted.contains(&tag));
            }
            RecordType::Data | RecordType::CustomData => {
                if active {
                    out.push(Record::data(record.address, &record.data));
                }
            }
            RecordType::ExtendedLinearAddress => {
                let upper = record
                    .base_address()
                    .map(|base| (base >> 16) as u16)
                    .unwrap_or_default();
                if last_linear == Some(upper) {
                    continue;
                }
                let previous_is_linear = out
                    .last()
                    .is_some_and(|r| r.record_type == RecordType::ExtendedLinearAddress);
                if previous_is_linear {
                    out.pop();
                }
                out.push(Record::extended_linear_address(upper));
                last_linear = Some(upper);
            }
            RecordType::EndOfFile | RecordType::ExtendedSegmentAddress => out.push(record.clone()),
            RecordType::StartSegmentAddress
            | RecordType::StartLinearAddress
            | RecordType::PaddedData
            | RecordType::BlockEnd => {}
        }
    }

    let extracted = MemoryImage::from_records(out);
    debug!(
        "Extracted {} image: {} bytes in {} blocks",
        board,
        extracted.byte_len(),
        extracted.block_count()
    );
    Some(extracted)
}

/// Image to flash on `board`: the board's section of a universal hex, or the
/// image itself for a single-board hex. `None` if nothing is left for `board`.
pub fn image_for_board(image: MemoryImage, board: BoardId) -> Option<MemoryImage> {
    let selected = match extract_board_image(&image, board) {
        Some(extracted) => extracted,
        None => image,
    };
    (!selected.is_empty()).then_some(selected)
}
