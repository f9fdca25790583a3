//! T7 device constants
//!
//! Central table for the Modbus register map, the external flash geometry,
//! and the firmware image header layout. Everything in the rest of the
//! crate that depends on the T7 device family comes from here.

/// A named device register.
///
/// The link layer addresses registers numerically; the name is carried for
/// logging and for transports that resolve registers symbolically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register {
    /// Symbolic name, as published in the device's register map.
    pub name: &'static str,
    /// Register address.
    pub address: u32,
}

/// Registers used by the upgrade pipeline.
pub mod regs {
    use super::Register;

    /// Product identifier, 7.0 for the T7 family (float register).
    pub const PRODUCT_ID: Register = Register {
        name: "PRODUCT_ID",
        address: 60000,
    };

    /// Running firmware version (float register).
    pub const FIRMWARE_VERSION: Register = Register {
        name: "FIRMWARE_VERSION",
        address: 60004,
    };

    /// Device serial number.
    pub const SERIAL_NUMBER: Register = Register {
        name: "SERIAL_NUMBER",
        address: 60028,
    };

    /// External flash unlock key. Written immediately before a protected
    /// erase or write; each flash region has its own key value.
    pub const EXF_KEY: Register = Register {
        name: "EXF_KEY",
        address: 61800,
    };

    /// External flash read pointer. Writing a byte address here positions
    /// the read cursor.
    pub const EXF_P_READ: Register = Register {
        name: "EXF_pREAD",
        address: 61810,
    };

    /// External flash read window. Each word read from this register
    /// returns the word at the read cursor and advances the cursor.
    pub const EXF_READ: Register = Register {
        name: "EXF_READ",
        address: 61812,
    };

    /// External flash page erase. Writing a page byte address here erases
    /// that page (requires the region key in `EXF_KEY` first).
    pub const EXF_ERASE: Register = Register {
        name: "EXF_ERASE",
        address: 61820,
    };

    /// External flash write pointer.
    pub const EXF_P_WRITE: Register = Register {
        name: "EXF_pWRITE",
        address: 61830,
    };

    /// External flash write window. Each word written lands at the write
    /// cursor and advances it.
    pub const EXF_WRITE: Register = Register {
        name: "EXF_WRITE",
        address: 61832,
    };

    /// Firmware upgrade request. Writing [`super::REBOOT_KEY`] reboots the
    /// device into the flash upgrade path.
    pub const REQ_FWUPG: Register = Register {
        name: "REQ_FWUPG",
        address: 61996,
    };
}

/// A region of the T7's external flash with its own unlock key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashRegion {
    /// Human-readable region name, used in log and error messages.
    pub name: &'static str,
    /// First byte address of the region.
    pub base: u32,
    /// Number of erase pages the region spans.
    pub pages: u32,
    /// Unlock key written to `EXF_KEY` before erases and writes.
    pub key: u32,
    /// Words per window transaction when transferring this region.
    pub block_words: usize,
}

impl FlashRegion {
    /// Region size in bytes.
    pub const fn size_bytes(&self) -> u32 {
        self.pages * FLASH_PAGE_SIZE
    }

    /// Region size in 32-bit words.
    pub const fn size_words(&self) -> usize {
        (self.size_bytes() / 4) as usize
    }
}

/// Smallest erasable unit of the external flash, in bytes.
pub const FLASH_PAGE_SIZE: u32 = 4096;

/// Value of every word in a freshly erased page. The flash erases to
/// all-ones; anything else after an erase means the erase did not take.
pub const ERASED_WORD: u32 = 0xFFFF_FFFF;

/// Region holding the firmware image payload.
pub const IMAGE_REGION: FlashRegion = FlashRegion {
    name: "firmware image",
    base: 0x0000_0000,
    pages: 224,
    key: 0x6A09_02B5,
    block_words: 8,
};

/// Region holding the 128-byte image descriptor.
pub const HEADER_REGION: FlashRegion = FlashRegion {
    name: "image header",
    base: 0x0038_0000,
    pages: 1,
    key: 0xDCA6_739F,
    block_words: 8,
};

/// Value written to `REQ_FWUPG` to trigger the upgrade reboot.
pub const REBOOT_KEY: u32 = 0x4C4A_0004;

/// Length of the image descriptor at the start of every firmware file.
pub const IMAGE_HEADER_LEN: usize = 128;

/// Magic value in the first four header bytes of a T7 firmware image.
pub const HEADER_CODE: u32 = 0x4C4A_4658;

/// Device-type tag carried by current T7 images.
pub const TARGET_T7: u32 = 0x0000_0007;

/// Device-type tag carried by images built before the family split.
pub const TARGET_T7_LEGACY: u32 = 0x0001_0007;

/// Big-endian field offsets within the 128-byte image header.
pub mod header {
    /// Header magic ([`super::HEADER_CODE`]), u32.
    pub const CODE: usize = 0;
    /// Intended device-type tag, u32.
    pub const INTENDED_DEVICE: usize = 4;
    /// Firmware version contained in the image, f32.
    pub const CONTAINED_VERSION: usize = 8;
    /// Minimum upgrader version able to install the image, f32.
    pub const REQUIRED_UPGRADER_VERSION: usize = 12;
    /// Ordinal of this image within the file, u16.
    pub const IMAGE_NUMBER: usize = 16;
    /// Number of images in the file, u16.
    pub const NUM_IMAGES: usize = 18;
    /// Offset of the next image for multi-image files, u32.
    pub const NEXT_IMAGE_OFFSET: usize = 20;
    /// Image payload length in bytes, u32.
    pub const IMAGE_LENGTH: usize = 24;
    /// Payload start offset within the file, u32.
    pub const IMAGE_OFFSET: usize = 28;
    /// Size of the SHA region in bytes, u32.
    pub const SHA_BYTE_COUNT: usize = 32;
    /// Option flags, u32.
    pub const OPTIONS: usize = 72;
    /// Encrypted SHA digest, 20 bytes.
    pub const ENCRYPTED_SHA: usize = 76;
    /// Plaintext SHA digest, 20 bytes.
    pub const PLAIN_SHA: usize = 96;
    /// Header checksum, u32.
    pub const CHECKSUM: usize = 124;
}
