//! Error types for the upgrade pipeline

use std::time::Duration;

use thiserror::Error;

use crate::image::FirmwareVersion;

/// Everything that can go wrong between opening a firmware file and
/// confirming the post-reboot version.
///
/// Every stage of the pipeline is all-or-nothing: the first error aborts
/// the run and is surfaced unchanged. There is no automatic retry; the
/// flash contents are unknown after a failed erase or write, and the only
/// safe restart point is a fresh run from the compatibility checks.
#[derive(Debug, Error)]
pub enum Error {
    /// Reading the firmware file failed.
    #[error("firmware file: {0}")]
    FileIo(#[from] std::io::Error),

    /// The firmware file is too short to contain an image header.
    #[error("firmware file is {len} bytes, shorter than the {expected}-byte image header")]
    TruncatedImage {
        /// Actual file length.
        len: usize,
        /// Minimum length (the header size).
        expected: usize,
    },

    /// The image payload is not a whole number of 32-bit words.
    #[error("image payload is {len} bytes, not a whole number of 32-bit words")]
    UnalignedImage {
        /// Payload length in bytes.
        len: usize,
    },

    /// The file name does not carry a version field.
    #[error("file name {name:?} does not encode a firmware version")]
    BadFileName {
        /// The offending file name.
        name: String,
    },

    /// The header magic does not identify a T7 firmware image.
    #[error("bad image header code {code:#010x}, expected {expected:#010x}")]
    InvalidHeaderCode {
        /// Value found in the header.
        code: u32,
        /// The T7 magic.
        expected: u32,
    },

    /// The image targets a different device family.
    #[error("image targets device type {device:#010x}, which is not a T7")]
    IncorrectDeviceType {
        /// Device-type tag found in the header.
        device: u32,
    },

    /// The version inside the image disagrees with the file name.
    #[error("image header declares version {contained}, file name declares {declared}")]
    IncorrectVersion {
        /// Version embedded in the header.
        contained: FirmwareVersion,
        /// Version encoded in the file name.
        declared: FirmwareVersion,
    },

    /// A flash transfer was requested with an unusable chunk size.
    #[error("chunk size of {words} words is outside the 1..={max} transaction limit")]
    InvalidChunkSize {
        /// Requested words per transaction.
        words: usize,
        /// Hardware cap on words per mixed transaction.
        max: usize,
    },

    /// A flash transfer was requested at a misaligned byte address.
    #[error("flash address {address:#010x} is not 4-byte aligned")]
    UnalignedAddress {
        /// The offending address.
        address: u32,
    },

    /// The device returned fewer words than the transaction asked for.
    #[error("device returned {actual} words, expected {expected}")]
    ShortResponse {
        /// Words requested.
        expected: usize,
        /// Words received.
        actual: usize,
    },

    /// Erasing a flash region failed.
    #[error("erase of the {region} region failed")]
    EraseFailed {
        /// Region being erased.
        region: &'static str,
        /// The underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// A word read back after the erase was not all-ones.
    #[error("flash at {address:#010x} reads {word:#010x} after erase, expected 0xffffffff")]
    EraseVerify {
        /// Byte address of the offending word.
        address: u32,
        /// Value read.
        word: u32,
    },

    /// Writing a flash region failed.
    #[error("write to the {region} region failed")]
    WriteFailed {
        /// Region being written.
        region: &'static str,
        /// The underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// The image read back from flash differs from what was written.
    #[error("flash word {index} reads {actual:#010x}, expected {expected:#010x}")]
    WriteVerifyMismatch {
        /// Index of the first mismatching word.
        index: usize,
        /// Word that was written.
        expected: u32,
        /// Word that was read back.
        actual: u32,
    },

    /// The upgrade reboot request could not be delivered.
    #[error("firmware upgrade reboot request failed")]
    RebootFailed(#[source] Box<Error>),

    /// The device did not reappear on the bus after the reboot.
    #[error("device with serial {serial} did not re-enumerate within {waited:?}")]
    EnumerationTimeout {
        /// Serial number being waited for.
        serial: u32,
        /// How long the pipeline waited.
        waited: Duration,
    },

    /// The rebooted device reports a version other than the one installed.
    #[error("device reports firmware {actual} after reboot, expected {expected}")]
    VersionMismatch {
        /// Version that was installed.
        expected: FirmwareVersion,
        /// Version the device reports.
        actual: FirmwareVersion,
    },

    /// A device link transaction failed.
    #[error("device link: {0}")]
    Link(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap a transport error as a link failure.
    pub fn link<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Link(Box::new(err))
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;
