//! Sparse memory image decoded from Intel HEX.

use std::collections::BTreeMap;
use std::ops::Bound;

use log::debug;

use super::error::HexError;
use super::record::{records, Record, RecordType};

/// Filler for addresses not covered by any block.
pub const FILL_BYTE: u8 = 0xFF;

const RECORD_DATA_LEN: usize = 16;

/// Decoded hex: the original record stream plus the contiguous memory blocks
/// it describes.
///
/// Records are kept because a universal hex carries overlapping sections for
/// different boards that a flat address map cannot represent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryImage {
    records: Vec<Record>,
    blocks: BTreeMap<u32, Vec<u8>>,
}

impl MemoryImage {
    /// Build an image from a record stream.
    pub fn from_records(records: Vec<Record>) -> Self {
        let mut blocks = BTreeMap::new();
        let mut base = 0u32;

        for record in &records {
            match record.record_type {
                RecordType::ExtendedLinearAddress | RecordType::ExtendedSegmentAddress => {
                    if let Some(address) = record.base_address() {
                        base = address;
                    }
                }
                RecordType::Data | RecordType::CustomData => {
                    let address = base.wrapping_add(u32::from(record.address));
                    write_wrapping(&mut blocks, address, &record.data);
                }
                _ => {}
            }
        }

        Self { records, blocks }
    }

    /// Build an image from `(address, bytes)` blocks.
    pub fn from_blocks<I>(blocks: I) -> Self
    where
        I: IntoIterator<Item = (u32, Vec<u8>)>,
    {
        let mut merged = BTreeMap::new();
        for (address, data) in blocks {
            write_wrapping(&mut merged, address, &data);
        }
        let records = encode_blocks(&merged);
        Self {
            records,
            blocks: merged,
        }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Contiguous blocks in ascending address order.
    pub fn blocks(&self) -> impl Iterator<Item = (u32, &[u8])> + '_ {
        self.blocks.iter().map(|(address, data)| (*address, data.as_slice()))
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// True if the image holds no data bytes.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Number of populated bytes.
    pub fn byte_len(&self) -> usize {
        self.blocks.values().map(Vec::len).sum()
    }

    /// True if the source carried universal hex block start records.
    pub fn is_universal(&self) -> bool {
        self.records
            .iter()
            .any(|record| record.record_type == RecordType::BlockStart)
    }

    /// Byte at `address`, if populated.
    pub fn get(&self, address: u32) -> Option<u8> {
        let (start, data) = self.blocks.range(..=address).next_back()?;
        data.get((address - start) as usize).copied()
    }

    /// `len` bytes starting at `start`, gaps filled with [`FILL_BYTE`].
    pub fn slice_pad(&self, start: u32, len: usize) -> Vec<u8> {
        let mut out = vec![FILL_BYTE; len];
        let want_start = u64::from(start);
        let want_end = want_start + len as u64;

        for (&address, data) in &self.blocks {
            let block_start = u64::from(address);
            let block_end = block_start + data.len() as u64;
            if block_start >= want_end {
                break;
            }
            if block_end <= want_start {
                continue;
            }
            let from = block_start.max(want_start);
            let to = block_end.min(want_end);
            let src = (from - block_start) as usize;
            let dst = (from - want_start) as usize;
            let len = (to - from) as usize;
            out[dst..dst + len].copy_from_slice(&data[src..src + len]);
        }

        out
    }

    /// Address of the first occurrence of `needle` inside one block.
    pub fn find(&self, needle: &[u8]) -> Option<u32> {
        if needle.is_empty() {
            return None;
        }
        self.blocks.iter().find_map(|(&address, data)| {
            data.windows(needle.len())
                .position(|window| window == needle)
                .map(|offset| address.wrapping_add(offset as u32))
        })
    }

    /// Re-encode the memory blocks as Intel HEX text.
    ///
    /// Emits 16-byte data records, an extended linear address record only when
    /// the upper half of the address changes, and a trailing end-of-file record.
    pub fn to_intel_hex(&self) -> String {
        let mut out = String::new();
        for record in encode_blocks(&self.blocks) {
            out.push_str(&record.to_line());
            out.push('\n');
        }
        out
    }
}

/// Decode Intel HEX text into a [`MemoryImage`].
pub fn parse_intel_hex(input: &[u8]) -> Result<MemoryImage, HexError> {
    let mut parsed = Vec::new();
    let mut seen_linear_address = false;

    for item in records(input) {
        let (line, record) = item?;
        match record.record_type {
            RecordType::ExtendedLinearAddress => seen_linear_address = true,
            RecordType::BlockStart if !seen_linear_address => {
                return Err(HexError::BlockStartWithoutLinearAddress { line });
            }
            _ => {}
        }
        parsed.push(record);
    }

    if parsed.is_empty() {
        return Err(HexError::Empty);
    }

    let image = MemoryImage::from_records(parsed);
    debug!(
        "Decoded hex: {} records, {} blocks, {} bytes",
        image.records.len(),
        image.block_count(),
        image.byte_len()
    );
    Ok(image)
}

/// Write `data` at `address`, wrapping modulo 2^32.
fn write_wrapping(blocks: &mut BTreeMap<u32, Vec<u8>>, address: u32, data: &[u8]) {
    let room = (u64::from(u32::MAX) - u64::from(address) + 1) as usize;
    if data.len() > room {
        let (head, tail) = data.split_at(room);
        write(blocks, address, head);
        write(blocks, 0, tail);
    } else {
        write(blocks, address, data);
    }
}

/// Write `data` at `address`, merging with touching or overlapping blocks.
/// Later writes win. `address + data.len()` must not exceed 2^32.
fn write(blocks: &mut BTreeMap<u32, Vec<u8>>, address: u32, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    let start = u64::from(address);
    let end = start + data.len() as u64;

    let mut merged_start = start;
    let mut merged_end = end;
    let mut touching = Vec::new();

    if let Some((&block_start, block)) = blocks.range(..=address).next_back() {
        let block_end = u64::from(block_start) + block.len() as u64;
        if block_end >= start {
            merged_start = u64::from(block_start);
            merged_end = merged_end.max(block_end);
            touching.push(block_start);
        }
    }

    let upper = end.min(u64::from(u32::MAX)) as u32;
    for (&block_start, block) in blocks.range((Bound::Excluded(address), Bound::Included(upper))) {
        merged_end = merged_end.max(u64::from(block_start) + block.len() as u64);
        touching.push(block_start);
    }

    let mut merged = vec![FILL_BYTE; (merged_end - merged_start) as usize];
    for block_start in touching {
        if let Some(block) = blocks.remove(&block_start) {
            let offset = (u64::from(block_start) - merged_start) as usize;
            merged[offset..offset + block.len()].copy_from_slice(&block);
        }
    }
    let offset = (start - merged_start) as usize;
    merged[offset..offset + data.len()].copy_from_slice(data);

    blocks.insert(merged_start as u32, merged);
}

fn encode_blocks(blocks: &BTreeMap<u32, Vec<u8>>) -> Vec<Record> {
    let mut out = Vec::new();
    let mut upper: Option<u16> = None;

    for (&block_start, data) in blocks {
        let mut offset = 0usize;
        while offset < data.len() {
            let address = block_start.wrapping_add(offset as u32);
            let high = (address >> 16) as u16;
            let low = (address & 0xFFFF) as usize;

            if upper != Some(high) {
                out.push(Record::extended_linear_address(high));
                upper = Some(high);
            }

            let len = RECORD_DATA_LEN
                .min(data.len() - offset)
                .min(0x1_0000 - low);
            out.push(Record::data(low as u16, &data[offset..offset + len]));
            offset += len;
        }
    }

    out.push(Record::end_of_file());
    out
}
