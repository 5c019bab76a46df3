//! Flash BBC micro:bit boards over Bluetooth Low Energy.
//!
//! Changed MakeCode programs are streamed straight into flash through the
//! partial flashing service. Anything else goes through a full firmware
//! update driven by the platform's Nordic DFU library.

pub mod ble;
pub mod commands;
pub mod flashing;
pub mod hex;

#[cfg(test)]
mod test_helpers;
