//! DFU payload packaging.
//!
//! The V2 bootloader takes a zip package:
//! - manifest.json - names the binary and init packet
//! - application.bin - application image
//! - application.dat - 56-byte init packet
//!
//! The V1 bootloader takes the raw application binary.

use std::io::{Cursor, Write};

use log::debug;
use serde::{Deserialize, Serialize};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::hex::MemoryImage;

use super::config::{
    APP_BIN_FILENAME, APP_DAT_FILENAME, DFU_SIZE_ALIGNMENT, INIT_PACKET_MAGIC,
    INIT_PACKET_SIZE, INIT_PACKET_VERSION, MANIFEST_FILENAME,
};
use super::error::FlashOpResult;
use super::model::BoardId;

/// Payload handed to the vendor DFU service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DfuPayload {
    /// Zip package (V2).
    Archive(Vec<u8>),
    /// Raw application binary (V1).
    Binary(Vec<u8>),
}

impl DfuPayload {
    pub fn bytes(&self) -> &[u8] {
        match self {
            DfuPayload::Archive(bytes) | DfuPayload::Binary(bytes) => bytes,
        }
    }

    /// Suggested file name for the payload on disk.
    pub fn file_name(&self) -> &'static str {
        match self {
            DfuPayload::Archive(_) => "dfu.zip",
            DfuPayload::Binary(_) => "dfu-app-bin.bin",
        }
    }
}

/// manifest.json layout.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    pub manifest: ManifestInner,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestInner {
    pub application: ApplicationManifest,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplicationManifest {
    pub bin_file: String,
    pub dat_file: String,
}

impl Manifest {
    fn application() -> Self {
        Self {
            manifest: ManifestInner {
                application: ApplicationManifest {
                    bin_file: APP_BIN_FILENAME.to_string(),
                    dat_file: APP_DAT_FILENAME.to_string(),
                },
            },
        }
    }
}

/// Slice the board's application region out of `image`.
///
/// The slice runs from the region start to the highest populated address in
/// the region, rounded up to a 4-byte boundary; gaps read as 0xFF. Returns
/// `None` if nothing in the image falls inside the region.
pub fn extract_application_image(image: &MemoryImage, board: BoardId) -> Option<Vec<u8>> {
    let window = board.app_region();

    let highest = image
        .blocks()
        .filter(|(address, data)| window.overlaps(*address, data.len()))
        .map(|(address, data)| (u64::from(address) + data.len() as u64).min(u64::from(window.end)))
        .max()?;

    let used = (highest - u64::from(window.start)) as usize;
    let len = used.div_ceil(DFU_SIZE_ALIGNMENT) * DFU_SIZE_ALIGNMENT;
    let bytes = image.slice_pad(window.start, len);
    debug!(
        "Application image for {}: {} bytes from 0x{:08X}",
        board,
        bytes.len(),
        window.start
    );
    Some(bytes)
}

/// Build the 56-byte init packet for an application of `app_len` bytes.
///
/// Little-endian: tag(12) version(4) app size(4) hash size(4) hash(32). The
/// hash size is 0, so the bootloader skips the hash check.
pub fn build_init_packet(app_len: usize) -> [u8; INIT_PACKET_SIZE] {
    let mut packet = [0u8; INIT_PACKET_SIZE];
    packet[..12].copy_from_slice(INIT_PACKET_MAGIC);
    packet[12..16].copy_from_slice(&INIT_PACKET_VERSION.to_le_bytes());
    packet[16..20].copy_from_slice(&(app_len as u32).to_le_bytes());
    packet[20..24].copy_from_slice(&0u32.to_le_bytes());
    packet
}

/// Package an application image for the vendor DFU service.
pub fn build_dfu_payload(
    app: &[u8],
    init_packet: &[u8; INIT_PACKET_SIZE],
    board: BoardId,
) -> FlashOpResult<DfuPayload> {
    match board {
        BoardId::V1 => Ok(DfuPayload::Binary(app.to_vec())),
        BoardId::V2 => {
            let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
            let options = FileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .compression_level(Some(9));

            zip.start_file(APP_BIN_FILENAME, options)?;
            zip.write_all(app)?;
            zip.start_file(APP_DAT_FILENAME, options)?;
            zip.write_all(init_packet)?;
            zip.start_file(MANIFEST_FILENAME, options)?;
            zip.write_all(serde_json::to_string(&Manifest::application())?.as_bytes())?;

            let archive = zip.finish()?.into_inner();
            debug!("Built DFU archive: {} bytes", archive.len());
            Ok(DfuPayload::Archive(archive))
        }
    }
}
