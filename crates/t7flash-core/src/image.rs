//! Firmware image files
//!
//! A T7 firmware file is a 128-byte big-endian descriptor followed by the
//! image payload. The file name encodes the intended version: the first
//! all-digit underscore-separated field is the version times 10000
//! (`T7firmware_010067_2014-02-24.bin` is version 1.0067).

use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::t7::{self, header, IMAGE_HEADER_LEN};

/// A firmware version with four decimal places, stored as version × 10000.
///
/// Versions appear in the file name, the image header, and the device's
/// version register, and all three must agree to four decimals. Keeping
/// them fixed-point makes those comparisons exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FirmwareVersion(u32);

impl FirmwareVersion {
    /// Build from a pre-scaled value (version × 10000).
    pub const fn from_scaled(scaled: u32) -> Self {
        Self(scaled)
    }

    /// Round a float version (header field or device register) to four
    /// decimal places.
    pub fn from_f32(version: f32) -> Self {
        Self((version as f64 * 10000.0).round() as u32)
    }

    /// The scaled representation (version × 10000).
    pub const fn scaled(self) -> u32 {
        self.0
    }

    /// The nearest float representation.
    pub fn to_f32(self) -> f32 {
        self.0 as f32 / 10000.0
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:04}", self.0 / 10000, self.0 % 10000)
    }
}

/// Parsed view of the 128-byte image descriptor.
///
/// All documented fields live at fixed offsets (see [`crate::t7::header`]);
/// the undocumented gaps are kept verbatim so that [`ImageHeader::serialize`]
/// reproduces the original header bytes exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageHeader {
    /// Header magic; [`crate::t7::HEADER_CODE`] for T7 images.
    pub header_code: u32,
    /// Device-type tag the image was built for.
    pub intended_device: u32,
    contained_version: f32,
    required_upgrader_version: f32,
    /// Ordinal of this image within the file.
    pub image_number: u16,
    /// Number of images in the file.
    pub num_images: u16,
    /// Offset of the next image, for multi-image files.
    pub next_image_offset: u32,
    /// Image payload length in bytes.
    pub image_length: u32,
    /// Payload start offset within the file.
    pub image_offset: u32,
    /// Size of the SHA region in bytes.
    pub sha_byte_count: u32,
    reserved_low: [u8; 36],
    /// Option flags.
    pub options: u32,
    /// Encrypted SHA digest. Validated by the device after reboot, not by
    /// this tool.
    pub encrypted_sha: [u8; 20],
    /// Plaintext SHA digest.
    pub plain_sha: [u8; 20],
    reserved_high: [u8; 8],
    /// Header checksum.
    pub checksum: u32,
}

fn be_u16(bytes: &[u8; IMAGE_HEADER_LEN], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

fn be_u32(bytes: &[u8; IMAGE_HEADER_LEN], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

impl ImageHeader {
    /// Decode the descriptor from its first 128 bytes.
    pub fn parse(bytes: &[u8; IMAGE_HEADER_LEN]) -> Self {
        let mut reserved_low = [0u8; 36];
        reserved_low.copy_from_slice(&bytes[header::SHA_BYTE_COUNT + 4..header::OPTIONS]);
        let mut encrypted_sha = [0u8; 20];
        encrypted_sha.copy_from_slice(&bytes[header::ENCRYPTED_SHA..header::ENCRYPTED_SHA + 20]);
        let mut plain_sha = [0u8; 20];
        plain_sha.copy_from_slice(&bytes[header::PLAIN_SHA..header::PLAIN_SHA + 20]);
        let mut reserved_high = [0u8; 8];
        reserved_high.copy_from_slice(&bytes[header::PLAIN_SHA + 20..header::CHECKSUM]);

        Self {
            header_code: be_u32(bytes, header::CODE),
            intended_device: be_u32(bytes, header::INTENDED_DEVICE),
            contained_version: f32::from_bits(be_u32(bytes, header::CONTAINED_VERSION)),
            required_upgrader_version: f32::from_bits(be_u32(
                bytes,
                header::REQUIRED_UPGRADER_VERSION,
            )),
            image_number: be_u16(bytes, header::IMAGE_NUMBER),
            num_images: be_u16(bytes, header::NUM_IMAGES),
            next_image_offset: be_u32(bytes, header::NEXT_IMAGE_OFFSET),
            image_length: be_u32(bytes, header::IMAGE_LENGTH),
            image_offset: be_u32(bytes, header::IMAGE_OFFSET),
            sha_byte_count: be_u32(bytes, header::SHA_BYTE_COUNT),
            reserved_low,
            options: be_u32(bytes, header::OPTIONS),
            encrypted_sha,
            plain_sha,
            reserved_high,
            checksum: be_u32(bytes, header::CHECKSUM),
        }
    }

    /// Re-encode the descriptor. Inverse of [`ImageHeader::parse`].
    pub fn serialize(&self) -> [u8; IMAGE_HEADER_LEN] {
        let mut out = [0u8; IMAGE_HEADER_LEN];
        out[header::CODE..header::CODE + 4].copy_from_slice(&self.header_code.to_be_bytes());
        out[header::INTENDED_DEVICE..header::INTENDED_DEVICE + 4]
            .copy_from_slice(&self.intended_device.to_be_bytes());
        out[header::CONTAINED_VERSION..header::CONTAINED_VERSION + 4]
            .copy_from_slice(&self.contained_version.to_bits().to_be_bytes());
        out[header::REQUIRED_UPGRADER_VERSION..header::REQUIRED_UPGRADER_VERSION + 4]
            .copy_from_slice(&self.required_upgrader_version.to_bits().to_be_bytes());
        out[header::IMAGE_NUMBER..header::IMAGE_NUMBER + 2]
            .copy_from_slice(&self.image_number.to_be_bytes());
        out[header::NUM_IMAGES..header::NUM_IMAGES + 2]
            .copy_from_slice(&self.num_images.to_be_bytes());
        out[header::NEXT_IMAGE_OFFSET..header::NEXT_IMAGE_OFFSET + 4]
            .copy_from_slice(&self.next_image_offset.to_be_bytes());
        out[header::IMAGE_LENGTH..header::IMAGE_LENGTH + 4]
            .copy_from_slice(&self.image_length.to_be_bytes());
        out[header::IMAGE_OFFSET..header::IMAGE_OFFSET + 4]
            .copy_from_slice(&self.image_offset.to_be_bytes());
        out[header::SHA_BYTE_COUNT..header::SHA_BYTE_COUNT + 4]
            .copy_from_slice(&self.sha_byte_count.to_be_bytes());
        out[header::SHA_BYTE_COUNT + 4..header::OPTIONS].copy_from_slice(&self.reserved_low);
        out[header::OPTIONS..header::OPTIONS + 4].copy_from_slice(&self.options.to_be_bytes());
        out[header::ENCRYPTED_SHA..header::ENCRYPTED_SHA + 20]
            .copy_from_slice(&self.encrypted_sha);
        out[header::PLAIN_SHA..header::PLAIN_SHA + 20].copy_from_slice(&self.plain_sha);
        out[header::PLAIN_SHA + 20..header::CHECKSUM].copy_from_slice(&self.reserved_high);
        out[header::CHECKSUM..header::CHECKSUM + 4].copy_from_slice(&self.checksum.to_be_bytes());
        out
    }

    /// Version the image declares for itself, to four decimals.
    pub fn contained_version(&self) -> FirmwareVersion {
        FirmwareVersion::from_f32(self.contained_version)
    }

    /// Minimum upgrader version the image asks for, to four decimals.
    pub fn required_upgrader_version(&self) -> FirmwareVersion {
        FirmwareVersion::from_f32(self.required_upgrader_version)
    }
}

/// A loaded firmware file: the verbatim header bytes, the payload, the
/// parsed descriptor, and the version declared by the file name.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    header_bytes: [u8; IMAGE_HEADER_LEN],
    image_bytes: Vec<u8>,
    /// Parsed view over the header bytes.
    pub header: ImageHeader,
    /// Version encoded in the file name. This is the authoritative
    /// "intended" version: both the header's embedded version and the
    /// post-reboot reported version are checked against it.
    pub declared_version: FirmwareVersion,
}

impl FirmwareImage {
    /// Read and parse a firmware file.
    pub fn load(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::BadFileName {
                name: path.display().to_string(),
            })?;
        let bytes = fs::read(path)?;
        Self::from_parts(name, &bytes)
    }

    /// Parse a firmware file from its name and raw contents.
    pub fn from_parts(name: &str, bytes: &[u8]) -> Result<Self> {
        let declared_version = version_from_file_name(name)?;

        if bytes.len() < IMAGE_HEADER_LEN {
            return Err(Error::TruncatedImage {
                len: bytes.len(),
                expected: IMAGE_HEADER_LEN,
            });
        }
        let mut header_bytes = [0u8; IMAGE_HEADER_LEN];
        header_bytes.copy_from_slice(&bytes[..IMAGE_HEADER_LEN]);
        let image_bytes = bytes[IMAGE_HEADER_LEN..].to_vec();
        if image_bytes.len() % 4 != 0 {
            return Err(Error::UnalignedImage {
                len: image_bytes.len(),
            });
        }

        let header = ImageHeader::parse(&header_bytes);
        if header.image_length as usize != image_bytes.len() {
            log::warn!(
                "header declares a {}-byte image but the file carries {} bytes",
                header.image_length,
                image_bytes.len()
            );
        }

        Ok(Self {
            header_bytes,
            image_bytes,
            header,
            declared_version,
        })
    }

    /// The 128 header bytes, exactly as read from the file.
    pub fn header_bytes(&self) -> &[u8; IMAGE_HEADER_LEN] {
        &self.header_bytes
    }

    /// The image payload.
    pub fn image_bytes(&self) -> &[u8] {
        &self.image_bytes
    }

    /// Payload length in 32-bit words.
    pub fn image_words(&self) -> usize {
        self.image_bytes.len() / 4
    }

    /// Decode the payload as big-endian words, in flash address order.
    pub fn image_as_words(&self) -> Vec<u32> {
        decode_be_words(&self.image_bytes)
    }

    /// Decode the header as big-endian words.
    pub fn header_as_words(&self) -> Vec<u32> {
        decode_be_words(&self.header_bytes)
    }

    /// Reject the image unless it can safely be flashed onto a T7.
    ///
    /// Checks, in order: the header magic, the device-type tag (current or
    /// legacy T7), and agreement between the embedded version and the file
    /// name version. Runs before anything touches the device.
    pub fn check_compatibility(&self) -> Result<()> {
        if self.header.header_code != t7::HEADER_CODE {
            return Err(Error::InvalidHeaderCode {
                code: self.header.header_code,
                expected: t7::HEADER_CODE,
            });
        }
        if self.header.intended_device != t7::TARGET_T7
            && self.header.intended_device != t7::TARGET_T7_LEGACY
        {
            return Err(Error::IncorrectDeviceType {
                device: self.header.intended_device,
            });
        }
        let contained = self.header.contained_version();
        if contained != self.declared_version {
            return Err(Error::IncorrectVersion {
                contained,
                declared: self.declared_version,
            });
        }
        Ok(())
    }
}

fn decode_be_words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Extract the declared version from a firmware file name.
///
/// The version field is the first underscore-separated field that is all
/// digits, interpreted as version × 10000.
fn version_from_file_name(name: &str) -> Result<FirmwareVersion> {
    name.split('_')
        .filter(|field| !field.is_empty())
        .find_map(|field| field.parse::<u32>().ok().map(FirmwareVersion::from_scaled))
        .ok_or_else(|| Error::BadFileName {
            name: name.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal valid header: T7 magic, current device tag, version 1.0067.
    fn test_header_bytes() -> [u8; IMAGE_HEADER_LEN] {
        let mut bytes = [0u8; IMAGE_HEADER_LEN];
        bytes[..4].copy_from_slice(&t7::HEADER_CODE.to_be_bytes());
        bytes[4..8].copy_from_slice(&t7::TARGET_T7.to_be_bytes());
        bytes[8..12].copy_from_slice(&1.0067f32.to_be_bytes());
        bytes[12..16].copy_from_slice(&0.94f32.to_be_bytes());
        bytes[16..18].copy_from_slice(&1u16.to_be_bytes());
        bytes[18..20].copy_from_slice(&1u16.to_be_bytes());
        bytes[24..28].copy_from_slice(&16u32.to_be_bytes());
        bytes[28..32].copy_from_slice(&128u32.to_be_bytes());
        bytes[32..36].copy_from_slice(&20u32.to_be_bytes());
        bytes
    }

    fn test_file(version_field: &str, payload_len: usize) -> (String, Vec<u8>) {
        let name = format!("T7firmware_{}_2014-02-24.bin", version_field);
        let mut bytes = test_header_bytes().to_vec();
        bytes.extend((0..payload_len).map(|i| (i * 7 + 3) as u8));
        (name, bytes)
    }

    #[test]
    fn version_display_pads_decimals() {
        assert_eq!(FirmwareVersion::from_scaled(10067).to_string(), "1.0067");
        assert_eq!(FirmwareVersion::from_scaled(20000).to_string(), "2.0000");
        assert_eq!(FirmwareVersion::from_scaled(15).to_string(), "0.0015");
    }

    #[test]
    fn version_from_f32_rounds_to_four_decimals() {
        assert_eq!(
            FirmwareVersion::from_f32(1.0067),
            FirmwareVersion::from_scaled(10067)
        );
        assert_eq!(
            FirmwareVersion::from_f32(1.0269),
            FirmwareVersion::from_scaled(10269)
        );
    }

    #[test]
    fn file_name_version_field() {
        let v = version_from_file_name("T7firmware_010067_2014-02-24.bin").unwrap();
        assert_eq!(v, FirmwareVersion::from_scaled(10067));
        // Some releases carry an extra underscore before "firmware".
        let v = version_from_file_name("T7_firmware_010067_2014-02-24.bin").unwrap();
        assert_eq!(v, FirmwareVersion::from_scaled(10067));
    }

    #[test]
    fn file_name_without_version_is_rejected() {
        let err = version_from_file_name("firmware.bin").unwrap_err();
        assert!(matches!(err, Error::BadFileName { .. }));
    }

    #[test]
    fn header_parse_reads_documented_fields() {
        let header = ImageHeader::parse(&test_header_bytes());
        assert_eq!(header.header_code, t7::HEADER_CODE);
        assert_eq!(header.intended_device, t7::TARGET_T7);
        assert_eq!(header.contained_version().to_string(), "1.0067");
        assert_eq!(header.image_number, 1);
        assert_eq!(header.num_images, 1);
        assert_eq!(header.image_length, 16);
        assert_eq!(header.image_offset, 128);
        assert_eq!(header.sha_byte_count, 20);
    }

    #[test]
    fn header_round_trips_every_byte() {
        // Fill all 128 bytes, including the undocumented gaps, with a
        // non-trivial pattern.
        let mut bytes = test_header_bytes();
        for (i, b) in bytes.iter_mut().enumerate().skip(36) {
            *b = (i * 13 + 5) as u8;
        }
        assert_eq!(ImageHeader::parse(&bytes).serialize(), bytes);
    }

    #[test]
    fn load_splits_header_and_payload() {
        let (name, bytes) = test_file("010067", 16);
        let image = FirmwareImage::from_parts(&name, &bytes).unwrap();
        assert_eq!(image.header_bytes(), &bytes[..128]);
        assert_eq!(image.image_bytes(), &bytes[128..]);
        assert_eq!(image.image_words(), 4);
        assert_eq!(image.declared_version, FirmwareVersion::from_scaled(10067));
        assert_eq!(
            image.image_as_words()[0],
            u32::from_be_bytes([bytes[128], bytes[129], bytes[130], bytes[131]])
        );
    }

    #[test]
    fn short_file_is_rejected() {
        let err = FirmwareImage::from_parts("T7firmware_010067_x.bin", &[0u8; 64]).unwrap_err();
        assert!(matches!(err, Error::TruncatedImage { len: 64, .. }));
    }

    #[test]
    fn unaligned_payload_is_rejected() {
        let (name, mut bytes) = test_file("010067", 16);
        bytes.push(0xAB);
        let err = FirmwareImage::from_parts(&name, &bytes).unwrap_err();
        assert!(matches!(err, Error::UnalignedImage { len: 17 }));
    }

    #[test]
    fn compatible_image_passes_the_gate() {
        let (name, bytes) = test_file("010067", 16);
        let image = FirmwareImage::from_parts(&name, &bytes).unwrap();
        image.check_compatibility().unwrap();
    }

    #[test]
    fn legacy_device_tag_passes_the_gate() {
        let (name, mut bytes) = test_file("010067", 16);
        bytes[4..8].copy_from_slice(&t7::TARGET_T7_LEGACY.to_be_bytes());
        let image = FirmwareImage::from_parts(&name, &bytes).unwrap();
        image.check_compatibility().unwrap();
    }

    #[test]
    fn bad_magic_fails_the_gate() {
        let (name, mut bytes) = test_file("010067", 16);
        bytes[0] = 0x00;
        let image = FirmwareImage::from_parts(&name, &bytes).unwrap();
        let err = image.check_compatibility().unwrap_err();
        assert!(matches!(err, Error::InvalidHeaderCode { .. }));
    }

    #[test]
    fn wrong_device_tag_fails_the_gate() {
        let (name, mut bytes) = test_file("010067", 16);
        bytes[4..8].copy_from_slice(&0x0000_0004u32.to_be_bytes());
        let image = FirmwareImage::from_parts(&name, &bytes).unwrap();
        let err = image.check_compatibility().unwrap_err();
        assert!(matches!(
            err,
            Error::IncorrectDeviceType {
                device: 0x0000_0004
            }
        ));
    }

    #[test]
    fn version_disagreement_fails_the_gate() {
        // File name says 1.0067, header says 1.0068.
        let (name, mut bytes) = test_file("010067", 16);
        bytes[8..12].copy_from_slice(&1.0068f32.to_be_bytes());
        let image = FirmwareImage::from_parts(&name, &bytes).unwrap();
        let err = image.check_compatibility().unwrap_err();
        match err {
            Error::IncorrectVersion {
                contained,
                declared,
            } => {
                assert_eq!(contained, FirmwareVersion::from_scaled(10068));
                assert_eq!(declared, FirmwareVersion::from_scaled(10067));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
