//! Modbus-TCP device link

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use t7flash_core::image::FirmwareVersion;
use t7flash_core::link::{DeviceInfo, DeviceLink, Frame};
use t7flash_core::t7::{regs, Register};
use t7flash_core::Error;

use crate::error::{ModbusError, Result};
use crate::protocol::{self, MBAP_LEN};

/// Default socket timeout for reads and writes.
const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// An open Modbus-TCP connection to one T7.
///
/// Implements [`DeviceLink`] for the upgrade pipeline. Every call is one
/// or more synchronous request/response exchanges on the stream, so the
/// ordering the pipeline depends on falls out of the transport: a call
/// returns only after the device has acknowledged it.
pub struct TcpLink {
    stream: TcpStream,
    peer: String,
    transaction: u16,
}

impl TcpLink {
    /// Connect to a device. `host` may carry an explicit port; the
    /// standard Modbus port is used otherwise.
    pub fn connect(host: &str, timeout: Duration) -> Result<Self> {
        let addr = if host.contains(':') {
            host.to_string()
        } else {
            format!("{host}:{}", protocol::MODBUS_PORT)
        };
        let sock_addr: SocketAddr = addr
            .to_socket_addrs()
            .map_err(|e| ModbusError::ConnectFailed {
                addr: addr.clone(),
                source: e,
            })?
            .next()
            .ok_or_else(|| ModbusError::ConnectFailed {
                addr: addr.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "host resolved to no addresses",
                ),
            })?;

        let stream = TcpStream::connect_timeout(&sock_addr, timeout).map_err(|e| {
            ModbusError::ConnectFailed {
                addr: addr.clone(),
                source: e,
            }
        })?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(IO_TIMEOUT))?;
        stream.set_write_timeout(Some(IO_TIMEOUT))?;
        log::debug!("connected to {addr}");

        Ok(Self {
            stream,
            peer: addr,
            transaction: 0,
        })
    }

    /// The address this link is connected to.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    fn next_transaction(&mut self) -> u16 {
        self.transaction = self.transaction.wrapping_add(1);
        self.transaction
    }

    fn reg_address(address: u32) -> Result<u16> {
        u16::try_from(address).map_err(|_| ModbusError::AddressOutOfRange(address))
    }

    fn transact(&mut self, request: &[u8], sent: u16) -> Result<Vec<u8>> {
        self.stream.write_all(request)?;
        let mut header = [0u8; MBAP_LEN];
        self.stream.read_exact(&mut header)?;
        let (received, remaining) = protocol::parse_mbap(&header)?;
        if received != sent {
            return Err(ModbusError::TransactionMismatch { sent, received });
        }
        let mut pdu = vec![0u8; remaining];
        self.stream.read_exact(&mut pdu)?;
        Ok(pdu)
    }

    /// Read `count` 32-bit values starting at a register address.
    pub fn read_words(&mut self, address: u32, count: usize) -> Result<Vec<u32>> {
        let address = Self::reg_address(address)?;
        let reg_count = (count * 2) as u16;
        let transaction = self.next_transaction();
        let request = protocol::encode_read_request(transaction, address, reg_count);
        let pdu = self.transact(&request, transaction)?;
        let registers = protocol::parse_read_response(&pdu, reg_count)?;
        protocol::regs_to_words(&registers)
    }

    /// Write consecutive 32-bit values starting at a register address.
    pub fn write_words(&mut self, address: u32, words: &[u32]) -> Result<()> {
        let address = Self::reg_address(address)?;
        let registers = protocol::words_to_regs(words);
        let transaction = self.next_transaction();
        let request = protocol::encode_write_request(transaction, address, &registers);
        let pdu = self.transact(&request, transaction)?;
        protocol::check_write_response(&pdu, address, registers.len() as u16)
    }

    /// Read the identity registers this tool cares about.
    pub fn probe_info(&mut self) -> Result<DeviceInfo> {
        let product_id = f32::from_bits(self.read_words(regs::PRODUCT_ID.address, 1)?[0]);
        let serial = self.read_words(regs::SERIAL_NUMBER.address, 1)?[0];
        let version = f32::from_bits(self.read_words(regs::FIRMWARE_VERSION.address, 1)?[0]);
        Ok(DeviceInfo {
            serial,
            product_id,
            firmware_version: FirmwareVersion::from_f32(version),
            connection: self.peer.clone(),
        })
    }
}

impl DeviceLink for TcpLink {
    fn write(&mut self, reg: Register, value: u32) -> t7flash_core::Result<()> {
        log::debug!("{} <- {value:#010x}", reg.name);
        self.write_words(reg.address, &[value]).map_err(Error::link)
    }

    fn write_many(&mut self, registers: &[Register], values: &[u32]) -> t7flash_core::Result<()> {
        // The paired registers (key/erase) are not adjacent, so each pair
        // is its own request; the synchronous stream keeps them ordered.
        for (reg, &value) in registers.iter().zip(values) {
            self.write_words(reg.address, &[value])
                .map_err(Error::link)?;
        }
        Ok(())
    }

    fn rw_many(&mut self, frames: &[Frame<'_>]) -> t7flash_core::Result<Vec<u32>> {
        let mut out = Vec::new();
        for frame in frames {
            match *frame {
                Frame::Write { reg, values } => self
                    .write_words(reg.address, values)
                    .map_err(Error::link)?,
                Frame::Read { reg, count } => out.extend(
                    self.read_words(reg.address, count)
                        .map_err(Error::link)?,
                ),
            }
        }
        Ok(out)
    }

    fn read(&mut self, reg: Register) -> t7flash_core::Result<u32> {
        let words = self.read_words(reg.address, 1).map_err(Error::link)?;
        Ok(words[0])
    }

    fn close(self) -> t7flash_core::Result<()> {
        log::debug!("closing connection to {}", self.peer);
        self.stream
            .shutdown(Shutdown::Both)
            .map_err(Error::link)
    }
}
