//! Locate the tagged application code region inside an image.

use crate::flashing::config::BATCH_SIZE;
use crate::flashing::model::{AddressWindow, RegionInfo};

use super::image::MemoryImage;

/// Length of the code hash that follows the magic marker.
pub const CODE_HASH_LEN: usize = 8;

/// Find the code region tagged by `magic` inside `window`.
///
/// The region starts at the first occurrence of `magic` (in address order)
/// whose address lies in `window`. The 8 bytes after the marker are the
/// code hash. The end is the highest populated address reachable from the
/// start, clamped to `window.end` and rounded up to a whole flash batch.
pub fn find_tagged_code_region(
    image: &MemoryImage,
    magic: &[u8],
    window: AddressWindow,
) -> Option<RegionInfo> {
    if magic.is_empty() {
        return None;
    }

    let start = image.blocks().find_map(|(address, data)| {
        if !window.overlaps(address, data.len()) {
            return None;
        }
        data.windows(magic.len())
            .enumerate()
            .map(|(offset, candidate)| (address.wrapping_add(offset as u32), candidate))
            .find(|(candidate_address, candidate)| {
                window.contains(*candidate_address) && *candidate == magic
            })
            .map(|(candidate_address, _)| candidate_address)
    })?;

    let hash_address = start.wrapping_add(magic.len() as u32);
    let mut hash = [0u8; CODE_HASH_LEN];
    hash.copy_from_slice(&image.slice_pad(hash_address, CODE_HASH_LEN));

    let window_end = u64::from(window.end);
    let mut end = u64::from(start);
    for (address, data) in image.blocks() {
        let block_start = u64::from(address);
        let block_end = block_start + data.len() as u64;
        if block_start >= window_end {
            break;
        }
        if block_end > u64::from(start) {
            end = end.max(block_end.min(window_end));
        }
    }

    let batch = u64::from(BATCH_SIZE);
    let rounded = end.div_ceil(batch) * batch;

    Some(RegionInfo {
        start,
        end: rounded as u32,
        hash,
    })
}
