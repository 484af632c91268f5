// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus RTU wire encoding.

use std::io::{self, Cursor, Error, ErrorKind};

use byteorder::{BigEndian, ReadBytesExt as _};
use bytes::{BufMut as _, Bytes, BytesMut};

use crate::frame::{ExceptionCode, ExceptionResponse, FunctionCode, Request, Response, Word};

pub(crate) mod rtu;

/// Size of the trailing checksum of every RTU frame.
const CRC_LEN: usize = 2;

/// Modbus RTU CRC-16 (polynomial 0xA001 reflected, initial value 0xFFFF).
///
/// The result is appended to a frame low byte first.
#[must_use]
pub fn crc16(buf: &[u8]) -> u16 {
    let mut crc = 0xFFFF;
    for x in buf {
        crc ^= u16::from(*x);
        for _ in 0..8 {
            if (crc & 0x0001) != 0 {
                crc >>= 1;
                crc ^= 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Splits `frame` into its content and checksum if the checksum is valid.
pub(crate) fn verify_crc(frame: &[u8]) -> io::Result<&[u8]> {
    if frame.len() < CRC_LEN + 2 {
        return Err(Error::new(ErrorKind::InvalidData, "frame too short"));
    }
    let (content, crc) = frame.split_at(frame.len() - CRC_LEN);
    let received = u16::from_le_bytes([crc[0], crc[1]]);
    let expected = crc16(content);
    if received != expected {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("Invalid CRC: expected = 0x{expected:0>4X}, actual = 0x{received:0>4X}"),
        ));
    }
    Ok(content)
}

fn put_crc(buf: &mut BytesMut, start: usize) {
    let crc = crc16(&buf[start..]);
    buf.put_u16_le(crc);
}

/// `[address, function] + payload + CRC16-LE`
#[must_use]
pub fn encode_response(address: u8, function: FunctionCode, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 4);
    buf.put_u8(address);
    buf.put_u8(function.value());
    buf.put_slice(payload);
    put_crc(&mut buf, 0);
    buf.freeze()
}

/// `[address, function | 0x80, exception] + CRC16-LE`
#[must_use]
pub fn encode_exception(address: u8, function: FunctionCode, exception: ExceptionCode) -> Bytes {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(address);
    buf.put_u8(function.exception_value());
    buf.put_u8(exception.value());
    put_crc(&mut buf, 0);
    buf.freeze()
}

#[allow(clippy::cast_possible_truncation)]
fn u8_len(len: usize) -> u8 {
    debug_assert!(len <= u8::MAX.into());
    len as u8
}

/// Read response payload: one byte count followed by the big-endian words.
///
/// At most [`MAX_READ_QUANTITY`](crate::frame::MAX_READ_QUANTITY) words
/// fit, the register banks reject larger reads before encoding.
#[must_use]
pub(crate) fn encode_registers(words: &[Word]) -> Bytes {
    let mut buf = BytesMut::with_capacity(words.len() * 2 + 1);
    buf.put_u8(u8_len(words.len() * 2));
    for w in words {
        buf.put_u16(*w);
    }
    buf.freeze()
}

pub(crate) fn encode_request_pdu(buf: &mut BytesMut, request: &Request) {
    use Request::*;

    buf.put_u8(request.function_code().value());
    match request {
        ReadHoldingRegisters(address, word)
        | ReadInputRegisters(address, word)
        | WriteSingleRegister(address, word) => {
            buf.put_u16(*address);
            buf.put_u16(*word);
        }
        Custom(_, data) => {
            buf.put_slice(data);
        }
    }
}

fn read_u16_be(reader: &mut impl io::Read) -> io::Result<u16> {
    reader.read_u16::<BigEndian>()
}

fn read_words(bytes: &[u8]) -> io::Result<Vec<Word>> {
    let (&byte_count, data) = bytes
        .split_first()
        .ok_or_else(|| Error::new(ErrorKind::InvalidData, "missing byte count"))?;
    let byte_count = usize::from(byte_count);
    if data.len() != byte_count || byte_count % 2 != 0 {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("Invalid byte count {byte_count} for {} data bytes", data.len()),
        ));
    }
    let mut rdr = Cursor::new(data);
    (0..byte_count / 2).map(|_| read_u16_be(&mut rdr)).collect()
}

/// Decodes a request PDU (function code followed by its data).
pub(crate) fn decode_request_pdu(pdu: Bytes) -> io::Result<Request> {
    use FunctionCode::*;

    let Some(&fn_code) = pdu.first() else {
        return Err(Error::new(ErrorKind::InvalidData, "empty request"));
    };
    let mut rdr = Cursor::new(&pdu[1..]);
    let req = match FunctionCode::new(fn_code) {
        ReadHoldingRegisters => {
            Request::ReadHoldingRegisters(read_u16_be(&mut rdr)?, read_u16_be(&mut rdr)?)
        }
        ReadInputRegisters => {
            Request::ReadInputRegisters(read_u16_be(&mut rdr)?, read_u16_be(&mut rdr)?)
        }
        WriteSingleRegister => {
            Request::WriteSingleRegister(read_u16_be(&mut rdr)?, read_u16_be(&mut rdr)?)
        }
        Custom(code) => Request::Custom(code, pdu.slice(1..)),
    };
    Ok(req)
}

/// Decodes a response PDU which may be an exception response.
pub(crate) fn decode_response_pdu(
    pdu: &[u8],
) -> io::Result<Result<Response, ExceptionResponse>> {
    let Some((&fn_code, data)) = pdu.split_first() else {
        return Err(Error::new(ErrorKind::InvalidData, "empty response"));
    };
    if fn_code & 0x80 != 0 {
        let exception = data
            .first()
            .copied()
            .map(ExceptionCode::new)
            .ok_or_else(|| Error::new(ErrorKind::InvalidData, "missing exception code"))?;
        return Ok(Err(ExceptionResponse {
            function: FunctionCode::new(fn_code & 0x7F),
            exception,
        }));
    }
    let rsp = match FunctionCode::new(fn_code) {
        FunctionCode::ReadHoldingRegisters => Response::ReadHoldingRegisters(read_words(data)?),
        FunctionCode::ReadInputRegisters => Response::ReadInputRegisters(read_words(data)?),
        FunctionCode::WriteSingleRegister | FunctionCode::Custom(_) => {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("Unsupported response function code 0x{fn_code:0>2X}"),
            ));
        }
    };
    Ok(Ok(rsp))
}
