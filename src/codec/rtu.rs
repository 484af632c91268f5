// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::io::{Error, ErrorKind, Result};

use bytes::{BufMut as _, Bytes, BytesMut};
use log::{debug, warn};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    frame::rtu::{Header, RequestAdu, ResponseAdu},
    Slave,
};

use super::{decode_request_pdu, decode_response_pdu, encode_request_pdu, verify_crc, CRC_LEN};

/// Number of bytes the server takes from the stream for every request:
/// `address + function + 4 data bytes + crc`.
pub(crate) const REQUEST_FRAME_LEN: usize = 8;

/// Client side codec: encodes requests, decodes responses and exceptions.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ClientCodec;

/// Server side codec that cuts fixed size request frames out of the stream.
///
/// There is no length field in RTU. Every window of [`REQUEST_FRAME_LEN`]
/// bytes must be a checksum-valid request, otherwise the whole accumulation
/// buffer is dropped and accumulation starts over. There is no
/// byte-by-byte resynchronization.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ServerCodec;

fn response_frame_len(buf: &BytesMut) -> Result<Option<usize>> {
    if buf.len() < 2 {
        // incomplete frame
        return Ok(None);
    }
    let fn_code = buf[1];
    let len = match fn_code {
        0x03 | 0x04 => {
            if buf.len() > 2 {
                Some(3 + usize::from(buf[2]) + CRC_LEN)
            } else {
                // incomplete frame
                None
            }
        }
        code if code & 0x80 != 0 => Some(2 + 1 + CRC_LEN),
        _ => {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("Invalid function code: 0x{fn_code:0>2X}"),
            ));
        }
    };
    Ok(len)
}

fn decode_response_frame(frame: &[u8]) -> Result<ResponseAdu> {
    let content = verify_crc(frame)?;
    let hdr = Header {
        slave: Slave(content[0]),
    };
    let pdu = decode_response_pdu(&content[1..])?;
    Ok(ResponseAdu { hdr, pdu })
}

impl Decoder for ClientCodec {
    type Item = ResponseAdu;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<ResponseAdu>> {
        let frame_len = match response_frame_len(buf) {
            Ok(Some(len)) if buf.len() >= len => len,
            Ok(_) => return Ok(None),
            Err(err) => {
                warn!("Dropping {} received bytes: {err}", buf.len());
                buf.clear();
                return Ok(None);
            }
        };
        let frame = buf.split_to(frame_len);
        match decode_response_frame(&frame) {
            Ok(adu) => Ok(Some(adu)),
            Err(err) => {
                // The request times out instead of leaving the framed
                // stream in its errored state.
                warn!("Dropping response frame {frame:02X?}: {err}");
                buf.clear();
                Ok(None)
            }
        }
    }
}

impl Encoder<RequestAdu> for ClientCodec {
    type Error = Error;

    fn encode(&mut self, adu: RequestAdu, buf: &mut BytesMut) -> Result<()> {
        let RequestAdu { hdr, pdu } = adu;
        let start = buf.len();
        buf.reserve(8);
        buf.put_u8(hdr.slave.into());
        encode_request_pdu(buf, &pdu);
        let crc = super::crc16(&buf[start..]);
        buf.put_u16_le(crc);
        Ok(())
    }
}

fn decode_request_frame(frame: Bytes) -> Result<RequestAdu> {
    let content = verify_crc(&frame)?;
    let content_len = content.len();
    let hdr = Header {
        slave: Slave(frame[0]),
    };
    let pdu = decode_request_pdu(frame.slice(1..content_len))?;
    Ok(RequestAdu { hdr, pdu })
}

impl Decoder for ServerCodec {
    type Item = RequestAdu;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RequestAdu>> {
        if buf.len() < REQUEST_FRAME_LEN {
            return Ok(None);
        }
        let frame = buf.split_to(REQUEST_FRAME_LEN).freeze();
        match decode_request_frame(frame.clone()) {
            Ok(adu) => Ok(Some(adu)),
            Err(err) => {
                warn!("Bad serial frame {frame:02X?}: {err}");
                debug!("Discarding {} buffered bytes", buf.len());
                buf.clear();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<RequestAdu>> {
        let adu = self.decode(buf)?;
        if adu.is_none() && !buf.is_empty() {
            debug!("Discarding {} bytes at end of stream", buf.len());
            buf.clear();
        }
        Ok(adu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{
        codec::crc16,
        frame::{ExceptionCode, ExceptionResponse, FunctionCode, Request, Response},
    };

    fn with_crc(content: &[u8]) -> Vec<u8> {
        let mut frame = content.to_vec();
        frame.extend_from_slice(&crc16(content).to_le_bytes());
        frame
    }

    mod client {
        use super::*;

        #[test]
        fn encode_read_request() {
            let mut codec = ClientCodec;
            let mut buf = BytesMut::new();
            let adu = RequestAdu {
                hdr: Header { slave: Slave(0x01) },
                pdu: Request::ReadHoldingRegisters(0x082B, 2),
            };
            codec.encode(adu, &mut buf).unwrap();
            assert_eq!(
                buf,
                Bytes::from_static(&[0x01, 0x03, 0x08, 0x2B, 0x00, 0x02, 0xB6, 0x63])
            );
        }

        #[test]
        fn decode_partly_received_message() {
            let mut codec = ClientCodec;
            let mut buf = BytesMut::from(
                &[
                    0x12, // slave address
                    0x03, // function code
                    0x04, // byte count
                    0x00, // data
                    0x00, // data
                    0x00, // data
                ][..],
            );
            let res = codec.decode(&mut buf).unwrap();
            assert!(res.is_none());
            assert_eq!(buf.len(), 6);
        }

        #[test]
        fn decode_read_response() {
            let mut codec = ClientCodec;
            let mut buf = BytesMut::from(&[0x01, 0x03, 0x04, 0x89, 0x02, 0x42, 0xC7, 0x00, 0x9D][..]);
            buf.extend_from_slice(&[0x00]);
            let ResponseAdu { hdr, pdu } = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(buf.len(), 1);
            assert_eq!(hdr.slave, Slave(0x01));
            assert_eq!(pdu, Ok(Response::ReadHoldingRegisters(vec![0x8902, 0x42C7])));
        }

        #[test]
        fn decode_exception_message() {
            let mut codec = ClientCodec;
            let mut buf = BytesMut::from(&with_crc(&[0x66, 0x84, 0x02])[..]);
            let ResponseAdu { pdu, .. } = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(
                pdu,
                Err(ExceptionResponse {
                    function: FunctionCode::ReadInputRegisters,
                    exception: ExceptionCode::IllegalDataAddress,
                })
            );
            assert!(buf.is_empty());
        }

        #[test]
        fn drop_response_with_invalid_crc() {
            let mut codec = ClientCodec;
            let mut frame = with_crc(&[0x01, 0x04, 0x02, 0x00, 0x2A]);
            frame[3] ^= 0xFF;
            let mut buf = BytesMut::from(&frame[..]);
            assert!(codec.decode(&mut buf).unwrap().is_none());
            assert!(buf.is_empty());
        }

        #[test]
        fn drop_unknown_function() {
            let mut codec = ClientCodec;
            let mut buf = BytesMut::from(&[0x01, 0x01, 0x01, 0x00, 0x00, 0x00][..]);
            assert!(codec.decode(&mut buf).unwrap().is_none());
            assert!(buf.is_empty());
        }
    }

    mod server {
        use super::*;

        #[test]
        fn wait_for_a_full_window() {
            let mut codec = ServerCodec;
            let mut buf = BytesMut::from(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84][..]);
            assert!(codec.decode(&mut buf).unwrap().is_none());
            assert_eq!(buf.len(), 7);
        }

        #[test]
        fn decode_read_request() {
            let mut codec = ServerCodec;
            let mut buf =
                BytesMut::from(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A, 0x02][..]);
            let RequestAdu { hdr, pdu } = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(hdr.slave, Slave(0x01));
            assert_eq!(pdu, Request::ReadHoldingRegisters(0, 1));
            assert_eq!(&buf[..], &[0x02]);
        }

        #[test]
        fn decode_back_to_back_requests() {
            let mut codec = ServerCodec;
            let mut bytes = with_crc(&[0x01, 0x04, 0x00, 0x02, 0x00, 0x02]);
            bytes.extend(with_crc(&[0x02, 0x06, 0x00, 0x01, 0x12, 0x34]));
            let mut buf = BytesMut::from(&bytes[..]);

            let first = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(first.pdu, Request::ReadInputRegisters(2, 2));
            let second = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(second.hdr.slave, Slave(0x02));
            assert_eq!(second.pdu, Request::WriteSingleRegister(1, 0x1234));
            assert!(buf.is_empty());
        }

        #[test]
        fn bad_window_clears_the_whole_buffer() {
            let mut codec = ServerCodec;
            // One stray byte shifts the window, the valid request behind it is lost.
            let mut bytes = vec![0xFF];
            bytes.extend(with_crc(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]));
            bytes.extend(with_crc(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]));
            let mut buf = BytesMut::from(&bytes[..]);

            assert!(codec.decode(&mut buf).unwrap().is_none());
            assert!(buf.is_empty());
        }

        #[test]
        fn discard_leftover_at_eof() {
            let mut codec = ServerCodec;
            let mut buf = BytesMut::from(&[0x01, 0x03, 0x00][..]);
            assert!(codec.decode_eof(&mut buf).unwrap().is_none());
            assert!(buf.is_empty());
        }
    }
}
