//! Modbus RTU frame encoding and decoding.
//!
//! The RD60xx speaks standard Modbus RTU framing, carried verbatim inside a
//! TCP stream instead of over a serial line:
//!
//! ```text
//! [address:1][function:1][payload:N][crc_lo][crc_hi]
//! ```
//!
//! The CRC is the usual Modbus CRC-16 (init 0xFFFF, reflected polynomial
//! 0xA001) over every byte preceding it, appended low byte first.
//!
//! Decoding operates on a byte cursor over the stream: when fewer bytes than
//! a complete frame are available it reports [`Decoded::NeedMoreData`] rather
//! than failing, so the caller can keep accumulating. Malformed input is an
//! error and the caller resynchronises by discarding a byte and retrying.

use crate::error::FrameError;

/// Read holding registers.
pub const FUNC_READ_HOLDING: u8 = 0x03;
/// Write a single holding register.
pub const FUNC_WRITE_SINGLE: u8 = 0x06;
/// Write multiple holding registers.
pub const FUNC_WRITE_MULTIPLE: u8 = 0x10;

/// High bit set on the function byte marks an exception response.
const EXCEPTION_FLAG: u8 = 0x80;

/// Largest register-data byte count a read response may carry (125 words).
const MAX_READ_BYTES: usize = 250;

const CRC_LEN: usize = 2;

/// One decoded frame: device address, function code, and the bytes between
/// the function byte and the checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub address: u8,
    pub function: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Exception code, if this is an exception response.
    pub fn exception_code(&self) -> Option<u8> {
        if self.function & EXCEPTION_FLAG != 0 {
            self.payload.first().copied()
        } else {
            None
        }
    }

    /// Extract the register words from a read-holding-registers response.
    pub fn registers(&self) -> Result<Vec<u16>, FrameError> {
        if self.function != FUNC_READ_HOLDING {
            return Err(FrameError::Malformed("not a register read response"));
        }
        let count = *self
            .payload
            .first()
            .ok_or(FrameError::Malformed("empty register read payload"))? as usize;
        let data = &self.payload[1..];
        if data.len() != count {
            return Err(FrameError::Malformed("register byte count mismatch"));
        }
        Ok(data
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }
}

/// Outcome of a decode attempt over a byte cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// The buffer does not yet hold a complete frame.
    NeedMoreData,
    /// A complete, checksum-valid frame; `consumed` bytes may be drained.
    Frame { frame: Frame, consumed: usize },
}

/// Modbus CRC-16 over `data` (init 0xFFFF, polynomial 0xA001).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Assemble a frame from its parts, appending the checksum.
pub fn encode(address: u8, function: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + payload.len() + CRC_LEN);
    out.push(address);
    out.push(function);
    out.extend_from_slice(payload);
    let crc = crc16(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// Build a read-holding-registers request.
pub fn read_request(address: u8, start: u16, count: u16) -> Vec<u8> {
    let mut payload = [0u8; 4];
    payload[..2].copy_from_slice(&start.to_be_bytes());
    payload[2..].copy_from_slice(&count.to_be_bytes());
    encode(address, FUNC_READ_HOLDING, &payload)
}

/// Build a write-single-register request.
pub fn write_single_request(address: u8, register: u16, value: u16) -> Vec<u8> {
    let mut payload = [0u8; 4];
    payload[..2].copy_from_slice(&register.to_be_bytes());
    payload[2..].copy_from_slice(&value.to_be_bytes());
    encode(address, FUNC_WRITE_SINGLE, &payload)
}

/// Build a write-multiple-registers request.
pub fn write_multiple_request(address: u8, start: u16, values: &[u16]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(5 + values.len() * 2);
    payload.extend_from_slice(&start.to_be_bytes());
    payload.extend_from_slice(&(values.len() as u16).to_be_bytes());
    payload.push((values.len() * 2) as u8);
    for value in values {
        payload.extend_from_slice(&value.to_be_bytes());
    }
    encode(address, FUNC_WRITE_MULTIPLE, &payload)
}

/// Try to decode one response frame from the front of `buf`.
///
/// The payload length is derived from the function code: read responses carry
/// a byte count, writes echo a fixed four bytes, exceptions carry a single
/// code byte. Anything else is malformed and the caller must resynchronise.
pub fn decode_response(buf: &[u8]) -> Result<Decoded, FrameError> {
    if buf.len() < 2 {
        return Ok(Decoded::NeedMoreData);
    }

    let function = buf[1];
    let payload_len = if function & EXCEPTION_FLAG != 0 {
        match function & !EXCEPTION_FLAG {
            FUNC_READ_HOLDING | FUNC_WRITE_SINGLE | FUNC_WRITE_MULTIPLE => 1,
            _ => return Err(FrameError::Malformed("unknown function code")),
        }
    } else {
        match function {
            FUNC_READ_HOLDING => {
                let Some(&count) = buf.get(2) else {
                    return Ok(Decoded::NeedMoreData);
                };
                let count = count as usize;
                if count == 0 || count > MAX_READ_BYTES || count % 2 != 0 {
                    return Err(FrameError::Malformed("register byte count out of bounds"));
                }
                1 + count
            }
            FUNC_WRITE_SINGLE | FUNC_WRITE_MULTIPLE => 4,
            _ => return Err(FrameError::Malformed("unknown function code")),
        }
    };

    let total = 2 + payload_len + CRC_LEN;
    if buf.len() < total {
        return Ok(Decoded::NeedMoreData);
    }

    let expected = crc16(&buf[..total - CRC_LEN]);
    let received = u16::from_le_bytes([buf[total - 2], buf[total - 1]]);
    if expected != received {
        return Err(FrameError::ChecksumInvalid { expected, received });
    }

    Ok(Decoded::Frame {
        frame: Frame {
            address: buf[0],
            function,
            payload: buf[2..2 + payload_len].to_vec(),
        },
        consumed: total,
    })
}

/// Build a read-holding-registers *response* frame (count byte plus words).
///
/// The bridge itself only decodes responses; this is used by tests and
/// device simulators.
pub fn read_response(address: u8, words: &[u16]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + words.len() * 2);
    payload.push((words.len() * 2) as u8);
    for word in words {
        payload.extend_from_slice(&word.to_be_bytes());
    }
    encode(address, FUNC_READ_HOLDING, &payload)
}
