//! micro:bit flashing over Bluetooth Low Energy.
//!
//! # Flow Overview
//!
//! A flash session consists of:
//! 1. **Initialize** - Check that Bluetooth (and location, where needed) is on
//! 2. **Find Device** - Bonded devices first, then a prefix scan
//! 3. **Connect** - Bond and ride out the post-bond disconnects
//! 4. **Revision** - Read the model number to pick the V1 or V2 image
//! 5. **Partial Flash** - Stream only the changed code region when the
//!    device's runtime matches the file's
//! 6. **Full Flash** - Otherwise package the application and hand it to the
//!    vendor DFU service
//!
//! # Example
//!
//! ```ignore
//! use microbit_ble_flasher::flashing::{FlashOptions, Flasher, PlatformCapabilities};
//!
//! let flasher = Flasher::new(transport, dfu, PlatformCapabilities::android(), FlashOptions::default());
//! let result = flasher
//!     .flash("zavov", &hex, &|p| println!("{}", p.message()))
//!     .await;
//! ```

pub mod config;
pub mod dfu;
pub mod dfu_package;
pub mod error;
pub mod full_flash;
pub mod model;
pub mod partial;
pub mod partial_flash;
pub mod session;

pub use config::{FlashOptions, PlatformCapabilities};
pub use dfu::{DfuEvent, DfuOptions, DfuRequest, DfuService};
pub use error::{FlashError, FlashOpResult};
pub use model::{AddressWindow, BoardId, FlashProgress, FlashProgressStage, FlashResult, RegionInfo};
pub use session::{Flasher, ProgressSink};
