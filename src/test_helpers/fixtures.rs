use crate::flashing::config::PXT_MAGIC;
use crate::flashing::model::RegionInfo;
use crate::hex::{MemoryImage, Record, RecordType};

/// Builder for Intel HEX / universal hex test sources
pub struct HexBuilder {
    records: Vec<Record>,
}

impl HexBuilder {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    pub fn linear_address(mut self, upper: u16) -> Self {
        self.records.push(Record::extended_linear_address(upper));
        self
    }

    pub fn block(mut self, block_type: u16) -> Self {
        self.records.push(Record::block_start(block_type));
        self
    }

    /// Data records of at most 16 bytes starting at `offset`.
    pub fn data(mut self, offset: u16, bytes: &[u8]) -> Self {
        for (index, chunk) in bytes.chunks(16).enumerate() {
            let address = offset.wrapping_add((index * 16) as u16);
            self.records.push(Record::data(address, chunk));
        }
        self
    }

    pub fn custom_data(mut self, offset: u16, bytes: &[u8]) -> Self {
        self.records.push(Record {
            record_type: RecordType::CustomData,
            address: offset,
            data: bytes.to_vec(),
        });
        self
    }

    pub fn padding(mut self, bytes: &[u8]) -> Self {
        self.records.push(Record {
            record_type: RecordType::PaddedData,
            address: 0,
            data: bytes.to_vec(),
        });
        self
    }

    pub fn block_end(mut self) -> Self {
        self.records.push(Record {
            record_type: RecordType::BlockEnd,
            address: 0,
            data: Vec::new(),
        });
        self
    }

    /// Hex text, terminated by an end-of-file record.
    pub fn build(mut self) -> String {
        self.records.push(Record::end_of_file());
        self.records
            .iter()
            .map(|record| format!("{}\n", record.to_line()))
            .collect()
    }
}

impl Default for HexBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Image with a tagged code region of `len` bytes at `start`.
pub fn code_image(start: u32, len: usize, hash: [u8; 8]) -> MemoryImage {
    let mut code = PXT_MAGIC.to_vec();
    code.extend_from_slice(&hash);
    let filler = (code.len()..len.max(code.len())).map(|i| (i % 251) as u8);
    code.extend(filler);
    MemoryImage::from_blocks(vec![(start, code)])
}

pub fn region(start: u32, end: u32, hash: [u8; 8]) -> RegionInfo {
    RegionInfo { start, end, hash }
}
