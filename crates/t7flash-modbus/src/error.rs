//! Error types for Modbus-TCP operations

use thiserror::Error;

/// Modbus-TCP transport errors.
#[derive(Debug, Error)]
pub enum ModbusError {
    /// Connecting to the device failed.
    #[error("failed to connect to {addr}: {source}")]
    ConnectFailed {
        /// Address that was dialed.
        addr: String,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// A socket read or write failed mid-transaction.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device answered with a Modbus exception.
    #[error("device exception 0x{code:02X} for function 0x{function:02X}")]
    Exception {
        /// Function code the request carried.
        function: u8,
        /// Exception code from the device.
        code: u8,
    },

    /// The response does not parse as a Modbus frame.
    #[error("malformed response: {0}")]
    MalformedResponse(&'static str),

    /// The response transaction id does not match the request.
    #[error("transaction id mismatch: sent {sent}, received {received}")]
    TransactionMismatch {
        /// Id in the request.
        sent: u16,
        /// Id in the response.
        received: u16,
    },

    /// A register address does not fit the 16-bit Modbus address space.
    #[error("register address {0} is outside the Modbus address space")]
    AddressOutOfRange(u32),

    /// No configured host carries the requested serial number.
    #[error("no device with serial {0} found on the configured hosts")]
    DeviceNotFound(u32),
}

/// Result type for Modbus-TCP operations.
pub type Result<T> = std::result::Result<T, ModbusError>;
