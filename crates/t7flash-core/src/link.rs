//! Device link and enumeration traits
//!
//! The pipeline talks to an opened device exclusively through
//! [`DeviceLink`], and finds devices on the host bus through
//! [`Enumerator`]. Transport crates implement both; the rest of this crate
//! never sees a socket or a wire format.

use crate::error::Result;
use crate::image::FirmwareVersion;
use crate::t7::Register;

/// One frame of a mixed multi-register operation.
///
/// The flash window protocol depends on frames executing in order within a
/// single transaction: the pointer write must land before the window
/// transfer it positions.
#[derive(Debug, Clone, Copy)]
pub enum Frame<'a> {
    /// Write `values.len()` consecutive values to a register.
    Write {
        /// Target register.
        reg: Register,
        /// Values to write, in order.
        values: &'a [u32],
    },
    /// Read `count` consecutive values from a register.
    Read {
        /// Source register.
        reg: Register,
        /// Number of values to read.
        count: usize,
    },
}

impl Frame<'_> {
    /// Number of values this frame consumes or produces.
    pub fn value_count(&self) -> usize {
        match self {
            Frame::Write { values, .. } => values.len(),
            Frame::Read { count, .. } => *count,
        }
    }
}

/// Register-level access to one opened device.
///
/// Every method blocks until the device has acknowledged the operation.
/// Implementations must preserve ordering: a call returns only once its
/// effect is complete, and the frames of [`DeviceLink::rw_many`] execute
/// strictly in the order given.
pub trait DeviceLink {
    /// Write a single register.
    fn write(&mut self, reg: Register, value: u32) -> Result<()>;

    /// Write several registers, pairwise: `regs[i]` receives `values[i]`,
    /// in index order.
    fn write_many(&mut self, regs: &[Register], values: &[u32]) -> Result<()>;

    /// Execute a mixed operation and return the concatenated results of
    /// its read frames, in frame order.
    fn rw_many(&mut self, frames: &[Frame<'_>]) -> Result<Vec<u32>>;

    /// Read a single register.
    fn read(&mut self, reg: Register) -> Result<u32>;

    /// Read a float register (the raw word reinterpreted as IEEE-754 bits).
    fn read_f32(&mut self, reg: Register) -> Result<f32> {
        Ok(f32::from_bits(self.read(reg)?))
    }

    /// Close the connection. Consumes the link; the pipeline calls this
    /// synchronously before the device drops off the bus on reboot.
    fn close(self) -> Result<()>
    where
        Self: Sized;
}

/// A device visible on the host bus.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Serial number.
    pub serial: u32,
    /// Product identifier (7.0 for the T7 family).
    pub product_id: f32,
    /// Firmware version the device reports.
    pub firmware_version: FirmwareVersion,
    /// Transport-specific location, e.g. a host address.
    pub connection: String,
}

/// Discovery and opening of devices on one transport.
pub trait Enumerator {
    /// The link type produced by [`Enumerator::open`].
    type Link: DeviceLink;

    /// List the devices currently visible. Devices that are mid-reboot
    /// simply do not appear; that is not an error.
    fn list_all(&mut self) -> Result<Vec<DeviceInfo>>;

    /// Open the device with the given serial number.
    fn open(&mut self, serial: u32) -> Result<Self::Link>;
}
