//! Modbus-TCP framing
//!
//! The T7 speaks standard Modbus TCP on its Ethernet interface. Registers
//! are 16 bits wide and big-endian; every 32-bit device value occupies two
//! consecutive registers, most significant first. The upgrade pipeline
//! only needs two function codes: read holding registers (0x03) and write
//! multiple registers (0x10).
//!
//! Everything in this module is a pure encoder or decoder over byte
//! slices; the socket handling lives in [`crate::device`].

use crate::error::{ModbusError, Result};

/// Standard Modbus TCP port, which the T7 listens on.
pub const MODBUS_PORT: u16 = 502;

/// Protocol identifier in the MBAP header (always zero for Modbus).
pub const PROTOCOL_ID: u16 = 0;

/// Unit identifier; the T7 ignores it but expects a fixed value.
pub const UNIT_ID: u8 = 1;

/// Read holding registers.
pub const FC_READ_HOLDING: u8 = 0x03;

/// Write multiple registers.
pub const FC_WRITE_MULTIPLE: u8 = 0x10;

/// Set on the function code in exception responses.
const EXCEPTION_FLAG: u8 = 0x80;

/// Size of the MBAP header (including the unit identifier).
pub const MBAP_LEN: usize = 7;

fn mbap(transaction: u16, pdu_len: usize) -> [u8; MBAP_LEN] {
    // The length field counts the unit identifier plus the PDU.
    let length = (pdu_len + 1) as u16;
    let t = transaction.to_be_bytes();
    let p = PROTOCOL_ID.to_be_bytes();
    let l = length.to_be_bytes();
    [t[0], t[1], p[0], p[1], l[0], l[1], UNIT_ID]
}

/// Encode a read-holding-registers request for `count` registers at
/// `address`.
pub fn encode_read_request(transaction: u16, address: u16, count: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(MBAP_LEN + 5);
    frame.extend_from_slice(&mbap(transaction, 5));
    frame.push(FC_READ_HOLDING);
    frame.extend_from_slice(&address.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    frame
}

/// Encode a write-multiple-registers request.
pub fn encode_write_request(transaction: u16, address: u16, values: &[u16]) -> Vec<u8> {
    let byte_count = values.len() * 2;
    let mut frame = Vec::with_capacity(MBAP_LEN + 6 + byte_count);
    frame.extend_from_slice(&mbap(transaction, 6 + byte_count));
    frame.push(FC_WRITE_MULTIPLE);
    frame.extend_from_slice(&address.to_be_bytes());
    frame.extend_from_slice(&(values.len() as u16).to_be_bytes());
    frame.push(byte_count as u8);
    for value in values {
        frame.extend_from_slice(&value.to_be_bytes());
    }
    frame
}

/// Decode an MBAP header, returning the transaction id and the number of
/// bytes that follow the header on the wire.
pub fn parse_mbap(header: &[u8; MBAP_LEN]) -> Result<(u16, usize)> {
    let protocol = u16::from_be_bytes([header[2], header[3]]);
    if protocol != PROTOCOL_ID {
        return Err(ModbusError::MalformedResponse("bad protocol identifier"));
    }
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    if length < 2 {
        return Err(ModbusError::MalformedResponse("length field too small"));
    }
    let transaction = u16::from_be_bytes([header[0], header[1]]);
    // The unit identifier is part of the header we already read.
    Ok((transaction, length - 1))
}

fn check_function(pdu: &[u8], function: u8) -> Result<()> {
    match pdu.first() {
        None => Err(ModbusError::MalformedResponse("empty PDU")),
        Some(&fc) if fc == function => Ok(()),
        Some(&fc) if fc == function | EXCEPTION_FLAG => Err(ModbusError::Exception {
            function,
            code: pdu.get(1).copied().unwrap_or(0),
        }),
        Some(_) => Err(ModbusError::MalformedResponse("unexpected function code")),
    }
}

/// Decode a read-holding-registers response into register values.
pub fn parse_read_response(pdu: &[u8], expected_regs: u16) -> Result<Vec<u16>> {
    check_function(pdu, FC_READ_HOLDING)?;
    let byte_count = *pdu
        .get(1)
        .ok_or(ModbusError::MalformedResponse("missing byte count"))? as usize;
    let data = &pdu[2..];
    if data.len() != byte_count || byte_count != expected_regs as usize * 2 {
        return Err(ModbusError::MalformedResponse("byte count mismatch"));
    }
    Ok(data
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect())
}

/// Validate a write-multiple-registers response echo.
pub fn check_write_response(pdu: &[u8], address: u16, count: u16) -> Result<()> {
    check_function(pdu, FC_WRITE_MULTIPLE)?;
    if pdu.len() != 5 {
        return Err(ModbusError::MalformedResponse("bad write echo length"));
    }
    let echo_address = u16::from_be_bytes([pdu[1], pdu[2]]);
    let echo_count = u16::from_be_bytes([pdu[3], pdu[4]]);
    if echo_address != address || echo_count != count {
        return Err(ModbusError::MalformedResponse("write echo mismatch"));
    }
    Ok(())
}

/// Split a 32-bit device value into its register pair, MSW first.
pub fn u32_to_regs(value: u32) -> [u16; 2] {
    [(value >> 16) as u16, value as u16]
}

/// Reassemble a 32-bit device value from consecutive registers.
pub fn regs_to_u32(high: u16, low: u16) -> u32 {
    ((high as u32) << 16) | low as u32
}

/// Flatten 32-bit values into the register stream for a write request.
pub fn words_to_regs(words: &[u32]) -> Vec<u16> {
    words.iter().flat_map(|&w| u32_to_regs(w)).collect()
}

/// Collect a register stream back into 32-bit values.
pub fn regs_to_words(registers: &[u16]) -> Result<Vec<u32>> {
    if registers.len() % 2 != 0 {
        return Err(ModbusError::MalformedResponse("odd register count"));
    }
    Ok(registers
        .chunks_exact(2)
        .map(|pair| regs_to_u32(pair[0], pair[1]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_request_layout() {
        // 2 registers at address 60028 (serial number).
        let frame = encode_read_request(0x0102, 60028, 2);
        assert_eq!(
            frame,
            vec![0x01, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0xEA, 0x7C, 0x00, 0x02]
        );
    }

    #[test]
    fn write_request_layout() {
        let frame = encode_write_request(0x0001, 61800, &[0x6A09, 0x02B5]);
        assert_eq!(
            frame,
            vec![
                0x00, 0x01, 0x00, 0x00, 0x00, 0x0B, 0x01, 0x10, 0xF1, 0x68, 0x00, 0x02, 0x04,
                0x6A, 0x09, 0x02, 0xB5
            ]
        );
    }

    #[test]
    fn mbap_round_trip() {
        let frame = encode_read_request(0xBEEF, 0, 1);
        let mut header = [0u8; MBAP_LEN];
        header.copy_from_slice(&frame[..MBAP_LEN]);
        let (transaction, remaining) = parse_mbap(&header).unwrap();
        assert_eq!(transaction, 0xBEEF);
        assert_eq!(remaining, frame.len() - MBAP_LEN);
    }

    #[test]
    fn read_response_decodes_registers() {
        let pdu = [0x03, 0x04, 0x12, 0x34, 0x56, 0x78];
        let regs = parse_read_response(&pdu, 2).unwrap();
        assert_eq!(regs, vec![0x1234, 0x5678]);
        assert_eq!(regs_to_u32(regs[0], regs[1]), 0x1234_5678);
    }

    #[test]
    fn exception_response_is_surfaced() {
        let pdu = [0x83, 0x02];
        let err = parse_read_response(&pdu, 1).unwrap_err();
        assert!(matches!(
            err,
            ModbusError::Exception {
                function: 0x03,
                code: 0x02,
            }
        ));
    }

    #[test]
    fn short_read_response_is_rejected() {
        let pdu = [0x03, 0x04, 0x12, 0x34];
        assert!(parse_read_response(&pdu, 2).is_err());
    }

    #[test]
    fn write_echo_is_checked() {
        let pdu = [0x10, 0xF1, 0x68, 0x00, 0x02];
        check_write_response(&pdu, 61800, 2).unwrap();
        assert!(check_write_response(&pdu, 61800, 3).is_err());
    }

    #[test]
    fn word_register_conversions_invert() {
        let words = [0xDEAD_BEEF, 0x0000_0001, 0xFFFF_0000];
        let regs = words_to_regs(&words);
        assert_eq!(regs, vec![0xDEAD, 0xBEEF, 0x0000, 0x0001, 0xFFFF, 0x0000]);
        assert_eq!(regs_to_words(&regs).unwrap(), words);
    }
}
