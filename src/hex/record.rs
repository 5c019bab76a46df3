//! Intel HEX record decoding and encoding.
//!
//! A record is `:` followed by hex digits for
//! `byte_count(1) address(2) record_type(1) data(byte_count) checksum(1)`.
//! The checksum is the two's complement of the sum of the preceding bytes.

use std::fmt::Write as _;

use super::error::HexError;

/// Record types understood by the decoder, including the universal hex and
/// micro:bit extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    Data = 0x00,
    EndOfFile = 0x01,
    /// New base is value × 16.
    ExtendedSegmentAddress = 0x02,
    StartSegmentAddress = 0x03,
    /// New base is value × 65536.
    ExtendedLinearAddress = 0x04,
    StartLinearAddress = 0x05,
    /// Universal hex: the following data belongs to this block type.
    BlockStart = 0x0A,
    /// Universal hex: padding, carries no image data.
    PaddedData = 0x0C,
    /// micro:bit data record, equivalent to `Data`.
    CustomData = 0x0D,
    /// Universal hex: end of the current block.
    BlockEnd = 0x0E,
}

impl RecordType {
    /// Parse a record type from its byte value.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(RecordType::Data),
            0x01 => Some(RecordType::EndOfFile),
            0x02 => Some(RecordType::ExtendedSegmentAddress),
            0x03 => Some(RecordType::StartSegmentAddress),
            0x04 => Some(RecordType::ExtendedLinearAddress),
            0x05 => Some(RecordType::StartLinearAddress),
            0x0A => Some(RecordType::BlockStart),
            0x0C => Some(RecordType::PaddedData),
            0x0D => Some(RecordType::CustomData),
            0x0E => Some(RecordType::BlockEnd),
            _ => None,
        }
    }

    /// Whether records of this type carry image bytes.
    pub fn is_data(&self) -> bool {
        matches!(self, RecordType::Data | RecordType::CustomData)
    }
}

/// One decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub record_type: RecordType,
    pub address: u16,
    pub data: Vec<u8>,
}

impl Record {
    pub fn data(address: u16, data: &[u8]) -> Self {
        Self {
            record_type: RecordType::Data,
            address,
            data: data.to_vec(),
        }
    }

    pub fn end_of_file() -> Self {
        Self {
            record_type: RecordType::EndOfFile,
            address: 0,
            data: Vec::new(),
        }
    }

    pub fn extended_linear_address(upper: u16) -> Self {
        Self {
            record_type: RecordType::ExtendedLinearAddress,
            address: 0,
            data: upper.to_be_bytes().to_vec(),
        }
    }

    /// Block start as written by the universal hex tooling (tag + `C0DE`).
    pub fn block_start(block_type: u16) -> Self {
        let mut data = block_type.to_be_bytes().to_vec();
        data.extend_from_slice(&[0xC0, 0xDE]);
        Self {
            record_type: RecordType::BlockStart,
            address: 0,
            data,
        }
    }

    /// Decode one record line (without line terminator).
    pub fn parse(line: &[u8], line_no: usize) -> Result<Self, HexError> {
        let digits = line
            .strip_prefix(b":")
            .ok_or_else(|| HexError::invalid(line_no, "missing ':' start code"))?;

        if digits.len() % 2 != 0 {
            return Err(HexError::invalid(line_no, "odd number of hex digits"));
        }
        if digits.len() < 10 {
            return Err(HexError::invalid(line_no, "record too short"));
        }

        let bytes = digits
            .chunks(2)
            .map(|pair| decode_byte(pair[0], pair[1]))
            .collect::<Option<Vec<u8>>>()
            .ok_or_else(|| HexError::invalid(line_no, "non-hex digit"))?;

        let byte_count = bytes[0] as usize;
        if bytes.len() != byte_count + 5 {
            return Err(HexError::invalid(
                line_no,
                format!(
                    "byte count {} does not match record length {}",
                    byte_count,
                    bytes.len() - 5
                ),
            ));
        }

        let (body, checksum) = bytes.split_at(bytes.len() - 1);
        let expected = checksum_of(body);
        if expected != checksum[0] {
            return Err(HexError::ChecksumMismatch {
                line: line_no,
                expected,
                actual: checksum[0],
            });
        }

        let record_type =
            RecordType::from_byte(body[3]).ok_or(HexError::UnsupportedRecordType {
                line: line_no,
                record_type: body[3],
            })?;
        let address = u16::from_be_bytes([body[1], body[2]]);
        let data = body[4..].to_vec();

        match record_type {
            RecordType::ExtendedSegmentAddress | RecordType::ExtendedLinearAddress
                if data.len() != 2 =>
            {
                return Err(HexError::invalid(line_no, "address record must carry 2 bytes"));
            }
            // The tag is 2 bytes; the universal hex tooling appends a 2-byte
            // `C0DE` marker.
            RecordType::BlockStart if data.len() != 2 && data.len() != 4 => {
                return Err(HexError::InvalidBlockStart {
                    line: line_no,
                    len: data.len(),
                });
            }
            _ => {}
        }

        Ok(Self {
            record_type,
            address,
            data,
        })
    }

    /// Block type declared by a block start record.
    pub fn block_type(&self) -> Option<u16> {
        (self.record_type == RecordType::BlockStart && self.data.len() >= 2)
            .then(|| u16::from_be_bytes([self.data[0], self.data[1]]))
    }

    /// Base address set by an extended address record.
    pub fn base_address(&self) -> Option<u32> {
        if self.data.len() != 2 {
            return None;
        }
        let value = u32::from(u16::from_be_bytes([self.data[0], self.data[1]]));
        match self.record_type {
            RecordType::ExtendedSegmentAddress => Some(value << 4),
            RecordType::ExtendedLinearAddress => Some(value << 16),
            _ => None,
        }
    }

    /// Two's complement checksum of this record.
    pub fn checksum(&self) -> u8 {
        let mut body = Vec::with_capacity(4 + self.data.len());
        body.push(self.data.len() as u8);
        body.extend_from_slice(&self.address.to_be_bytes());
        body.push(self.record_type as u8);
        body.extend_from_slice(&self.data);
        checksum_of(&body)
    }

    /// Encode as a record line (no terminator), upper-case digits.
    pub fn to_line(&self) -> String {
        let mut line = String::with_capacity(11 + self.data.len() * 2);
        line.push(':');
        let _ = write!(
            line,
            "{:02X}{:04X}{:02X}",
            self.data.len(),
            self.address,
            self.record_type as u8
        );
        for byte in &self.data {
            let _ = write!(line, "{byte:02X}");
        }
        let _ = write!(line, "{:02X}", self.checksum());
        line
    }
}

/// Iterator over the records of a hex source.
///
/// The cursor lives in the iterator, so independent sources can be decoded
/// concurrently. Blank lines are skipped and iteration ends after the
/// end-of-file record.
pub struct RecordParser<'a> {
    lines: std::iter::Enumerate<std::slice::Split<'a, u8, fn(&u8) -> bool>>,
    finished: bool,
}

impl<'a> RecordParser<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        let is_newline: fn(&u8) -> bool = |b| *b == b'\n';
        Self {
            lines: input.split(is_newline).enumerate(),
            finished: false,
        }
    }
}

impl Iterator for RecordParser<'_> {
    /// `(line number, record)`; line numbers start at 1.
    type Item = Result<(usize, Record), HexError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        for (index, line) in self.lines.by_ref() {
            let line = trim_ascii(line);
            if line.is_empty() {
                continue;
            }
            let line_no = index + 1;
            let result = Record::parse(line, line_no);
            match &result {
                Ok(record) if record.record_type == RecordType::EndOfFile => self.finished = true,
                Err(_) => self.finished = true,
                _ => {}
            }
            return Some(result.map(|record| (line_no, record)));
        }
        self.finished = true;
        None
    }
}

/// Decode the records of a hex source.
pub fn records(input: &[u8]) -> RecordParser<'_> {
    RecordParser::new(input)
}

fn checksum_of(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    sum.wrapping_neg()
}

fn decode_byte(hi: u8, lo: u8) -> Option<u8> {
    Some(hex_digit(hi)? << 4 | hex_digit(lo)?)
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'A'..=b'F' => Some(c - b'A' + 10),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}

fn trim_ascii(mut line: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = line {
        if first.is_ascii_whitespace() {
            line = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = line {
        if last.is_ascii_whitespace() {
            line = rest;
        } else {
            break;
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_data_record() {
        let record = Record::parse(b":0B0010006164647265737320676170A7", 1).unwrap();

        assert_eq!(record.record_type, RecordType::Data);
        assert_eq!(record.address, 0x0010);
        assert_eq!(record.data, b"address gap");
    }

    #[test]
    fn test_parse_lowercase_digits() {
        let record = Record::parse(b":020000040001f9", 1).unwrap();
        assert_eq!(record.base_address(), Some(0x10000));
    }

    #[test]
    fn test_parse_checksum_mismatch() {
        let result = Record::parse(b":0B0010006164647265737320676170A8", 7);

        assert_eq!(
            result,
            Err(HexError::ChecksumMismatch {
                line: 7,
                expected: 0xA7,
                actual: 0xA8
            })
        );
    }

    #[test]
    fn test_parse_flipped_checksum_bits() {
        let line = Record::data(0x1234, &[1, 2, 3, 4]).to_line();
        let last = line.len() - 1;

        for bit in 0..4 {
            let mut corrupted = line.clone().into_bytes();
            let digit = hex_digit(corrupted[last]).unwrap() ^ (1 << bit);
            corrupted[last] = b"0123456789ABCDEF"[digit as usize];

            assert!(matches!(
                Record::parse(&corrupted, 1),
                Err(HexError::ChecksumMismatch { .. })
            ));
        }
    }

    #[test]
    fn test_parse_malformed_lines() {
        assert!(matches!(
            Record::parse(b"0B0010006164", 1),
            Err(HexError::InvalidRecord { .. })
        ));
        assert!(matches!(
            Record::parse(b":0B00100061646472657373206761", 1),
            Err(HexError::InvalidRecord { .. })
        ));
        assert!(matches!(
            Record::parse(b":02000004ZZ01F9", 1),
            Err(HexError::InvalidRecord { .. })
        ));
        assert!(matches!(
            Record::parse(b":03000004000100F8", 1),
            Err(HexError::InvalidRecord { .. })
        ));
    }

    #[test]
    fn test_parse_unsupported_type() {
        assert_eq!(
            Record::parse(b":00000009F7", 3),
            Err(HexError::UnsupportedRecordType {
                line: 3,
                record_type: 0x09
            })
        );
    }

    #[test]
    fn test_block_start_payload_length() {
        let tag_only = Record {
            record_type: RecordType::BlockStart,
            address: 0,
            data: vec![0x99, 0x03],
        };
        let parsed = Record::parse(tag_only.to_line().as_bytes(), 1).unwrap();
        assert_eq!(parsed.block_type(), Some(0x9903));

        let with_marker = Record::parse(b":0400000A9901C0DEBA", 1).unwrap();
        assert_eq!(with_marker.block_type(), Some(0x9901));

        let odd = Record {
            record_type: RecordType::BlockStart,
            address: 0,
            data: vec![0x99, 0x03, 0x00],
        };
        assert_eq!(
            Record::parse(odd.to_line().as_bytes(), 5),
            Err(HexError::InvalidBlockStart { line: 5, len: 3 })
        );
    }

    #[test]
    fn test_base_addresses() {
        let segment = Record {
            record_type: RecordType::ExtendedSegmentAddress,
            address: 0,
            data: vec![0x12, 0x00],
        };
        assert_eq!(segment.base_address(), Some(0x12000));
        assert_eq!(
            Record::extended_linear_address(0x0003).base_address(),
            Some(0x30000)
        );
        assert_eq!(Record::end_of_file().base_address(), None);
    }

    #[test]
    fn test_to_line() {
        assert_eq!(Record::end_of_file().to_line(), ":00000001FF");
        assert_eq!(Record::extended_linear_address(1).to_line(), ":020000040001F9");
        assert_eq!(Record::block_start(0x9901).to_line(), ":0400000A9901C0DEBA");
    }

    #[test]
    fn test_parser_skips_blank_lines_and_stops_at_eof() {
        let input = b":020000040001F9\r\n\r\n:0400000001020304F2\n:00000001FF\ngarbage after eof\n";
        let parsed: Vec<_> = records(input).collect::<Result<_, _>>().unwrap();

        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].0, 1);
        assert_eq!(parsed[1].0, 3);
        assert_eq!(parsed[2].1.record_type, RecordType::EndOfFile);
    }

    #[test]
    fn test_parser_reports_line_numbers() {
        let input = b":020000040001F9\n:0400000001020304F3\n";
        let result: Result<Vec<_>, _> = records(input).collect();

        assert!(matches!(result, Err(HexError::ChecksumMismatch { line: 2, .. })));
    }
}
