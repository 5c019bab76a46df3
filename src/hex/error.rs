//! Error types for Intel HEX decoding.

use thiserror::Error;

/// Errors raised while decoding Intel HEX or universal hex sources.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HexError {
    /// The record is not well formed (missing colon, bad digits, wrong length).
    #[error("Line {line}: invalid record ({reason})")]
    InvalidRecord { line: usize, reason: String },

    /// The record checksum does not bring the byte sum to zero.
    #[error("Line {line}: checksum mismatch, expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { line: usize, expected: u8, actual: u8 },

    /// The record type is not one this decoder understands.
    #[error("Line {line}: unsupported record type 0x{record_type:02X}")]
    UnsupportedRecordType { line: usize, record_type: u8 },

    /// A universal hex block start record with a malformed payload.
    #[error("Line {line}: block start record carries {len} bytes")]
    InvalidBlockStart { line: usize, len: usize },

    /// A universal hex block start record appeared before any linear address.
    #[error("Line {line}: block start record before any extended linear address")]
    BlockStartWithoutLinearAddress { line: usize },

    /// The source contained no records at all.
    #[error("Hex source contains no records")]
    Empty,
}

impl HexError {
    pub(crate) fn invalid(line: usize, reason: impl Into<String>) -> Self {
        HexError::InvalidRecord {
            line,
            reason: reason.into(),
        }
    }
}
