//! t7flash-core - Firmware upgrade pipeline for the LabJack T7
//!
//! This crate drives the register-based flash programming protocol that
//! installs a new firmware image on a T7 data-acquisition device. The
//! pipeline verifies that the image fits the device, erases the external
//! flash regions holding the current image and its header, writes and
//! verifies the new contents, reboots the device into the upgrade path,
//! waits for it to reappear on the host bus, and confirms the reported
//! firmware version.
//!
//! The crate is transport-agnostic: all device traffic goes through the
//! [`link::DeviceLink`] trait, and rediscovery after reboot goes through
//! [`link::Enumerator`]. A Modbus-TCP implementation for the T7's Ethernet
//! interface lives in the `t7flash-modbus` crate.
//!
//! # Example
//!
//! ```ignore
//! use t7flash_core::image::FirmwareImage;
//! use t7flash_core::upgrade::{self, NoProgress, UpgradeConfig};
//!
//! let image = FirmwareImage::load("T7firmware_010067_2014-02-24.bin".as_ref())?;
//! let link = enumerator.open(serial)?;
//! let outcome = upgrade::upgrade(
//!     image,
//!     link,
//!     &mut enumerator,
//!     &UpgradeConfig::default(),
//!     &mut NoProgress,
//! )?;
//! println!("device {} now runs {}", outcome.serial, outcome.version);
//! ```
//!
//! A failure between the start of the image write and a successful
//! verification leaves the device without a bootable firmware image. The
//! device's bootloader stays alive in that state and accepts another
//! upgrade attempt; the pipeline never tries to salvage a partial write by
//! skipping stages.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod error;
pub mod flash;
pub mod image;
pub mod link;
pub mod t7;
pub mod upgrade;

pub use error::{Error, Result};
