//! Intel HEX and universal hex decoding.
//!
//! Decodes hex text into a [`MemoryImage`], separates universal hex files
//! into per-board images, and locates the tagged application code region
//! used for partial flashing.

pub mod error;
pub mod image;
pub mod record;
pub mod region;
pub mod universal;

pub use error::HexError;
pub use image::{parse_intel_hex, MemoryImage, FILL_BYTE};
pub use record::{records, Record, RecordParser, RecordType};
pub use region::find_tagged_code_region;
pub use universal::{extract_board_image, image_for_board};
