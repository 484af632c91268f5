// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::*;

use crate::{ProtocolError, Result, Slave};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Header {
    pub(crate) slave: Slave,
}

/// Context of an outstanding client request, used to match its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RequestContext {
    pub(crate) function_code: FunctionCode,
    pub(crate) header: Header,
}

/// One RTU request frame without its checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestAdu {
    pub(crate) hdr: Header,
    pub(crate) pdu: Request,
}

impl RequestAdu {
    pub(crate) fn context(&self) -> RequestContext {
        RequestContext {
            function_code: self.pdu.function_code(),
            header: self.hdr,
        }
    }
}

impl From<RequestAdu> for SlaveRequest {
    fn from(from: RequestAdu) -> Self {
        let RequestAdu { hdr, pdu } = from;
        Self {
            slave: hdr.slave.into(),
            request: pdu,
        }
    }
}

/// One RTU response frame without its checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResponseAdu {
    pub(crate) hdr: Header,
    pub(crate) pdu: std::result::Result<Response, ExceptionResponse>,
}

impl ResponseAdu {
    pub(crate) fn try_into_response(self, request_context: RequestContext) -> Result<Response> {
        let RequestContext {
            function_code: req_function_code,
            header: req_hdr,
        } = request_context;

        let ResponseAdu {
            hdr: rsp_hdr,
            pdu: result,
        } = self;

        if req_hdr != rsp_hdr {
            return Err(ProtocolError::HeaderMismatch {
                request: req_hdr.slave,
                response: rsp_hdr.slave,
            }
            .into());
        }

        // Match function codes of request and response.
        let rsp_function_code = match &result {
            Ok(response) => response.function_code(),
            Err(ExceptionResponse { function, .. }) => *function,
        };
        if req_function_code != rsp_function_code {
            return Err(ProtocolError::FunctionCodeMismatch {
                request: req_function_code,
                response: rsp_function_code,
            }
            .into());
        }

        Ok(result.map_err(
            |ExceptionResponse {
                 function: _,
                 exception,
             }| exception,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::Error;

    fn read_context(slave: u8) -> RequestContext {
        RequestAdu {
            hdr: Header {
                slave: Slave(slave),
            },
            pdu: Request::ReadHoldingRegisters(0, 1),
        }
        .context()
    }

    #[test]
    fn accept_matching_response() {
        let rsp = ResponseAdu {
            hdr: Header { slave: Slave(3) },
            pdu: Ok(Response::ReadHoldingRegisters(vec![0x2A])),
        };
        let result = rsp.try_into_response(read_context(3)).unwrap();
        assert_eq!(result, Ok(Response::ReadHoldingRegisters(vec![0x2A])));
    }

    #[test]
    fn reject_response_from_other_slave() {
        let rsp = ResponseAdu {
            hdr: Header { slave: Slave(5) },
            pdu: Ok(Response::ReadHoldingRegisters(vec![0x2A])),
        };
        let err = rsp.try_into_response(read_context(3)).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::HeaderMismatch { .. })
        ));
    }

    #[test]
    fn reject_response_with_other_function() {
        let rsp = ResponseAdu {
            hdr: Header { slave: Slave(3) },
            pdu: Ok(Response::ReadInputRegisters(vec![0x2A])),
        };
        let err = rsp.try_into_response(read_context(3)).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::FunctionCodeMismatch { .. })
        ));
    }

    #[test]
    fn pass_exception_through() {
        let rsp = ResponseAdu {
            hdr: Header { slave: Slave(3) },
            pdu: Err(ExceptionResponse {
                function: FunctionCode::ReadHoldingRegisters,
                exception: ExceptionCode::IllegalDataAddress,
            }),
        };
        let result = rsp.try_into_response(read_context(3)).unwrap();
        assert_eq!(result, Err(ExceptionCode::IllegalDataAddress));
    }
}
