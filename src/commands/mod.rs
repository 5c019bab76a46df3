//! Host-facing commands.

pub mod flash;

pub use flash::{start_flash, validate_hex, FlashHandle, FlashProgressEvent, HexInfo};
