// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

pub(crate) mod rtu;

use std::{
    error,
    fmt::{self, Display},
};

use bytes::Bytes;

use crate::SlaveId;

/// A Modbus function code.
///
/// Only the register functions served by the gateway have a name,
/// everything else is carried as [`FunctionCode::Custom`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionCode {
    /// 03 (0x03) Read Holding Registers
    ReadHoldingRegisters,

    /// 04 (0x04) Read Input Registers
    ReadInputRegisters,

    /// 06 (0x06) Write Single Register
    WriteSingleRegister,

    /// Any other Modbus function code.
    Custom(u8),
}

impl FunctionCode {
    /// Maps a function byte from the wire.
    #[must_use]
    pub const fn new(value: u8) -> Self {
        match value {
            0x03 => Self::ReadHoldingRegisters,
            0x04 => Self::ReadInputRegisters,
            0x06 => Self::WriteSingleRegister,
            code => Self::Custom(code),
        }
    }

    /// The function byte sent on the wire.
    #[must_use]
    pub const fn value(self) -> u8 {
        match self {
            Self::ReadHoldingRegisters => 0x03,
            Self::ReadInputRegisters => 0x04,
            Self::WriteSingleRegister => 0x06,
            Self::Custom(code) => code,
        }
    }

    /// The function byte of an exception response to this function.
    #[must_use]
    pub const fn exception_value(self) -> u8 {
        self.value() | 0x80
    }
}

impl Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.value().fmt(f)
    }
}

/// A Modbus protocol address is represented by 16 bit from `0` to `65535`.
///
/// This *protocol address* uses 0-based indexing, while the register numbers
/// in the configuration file use the conventional 1-based `3xxxx`/`4xxxx`
/// notation.
pub type Address = u16;

/// Modbus uses 16 bit for its data items.
///
/// Transmitted using a big-endian representation.
pub type Word = u16;

/// Number of items to process.
pub type Quantity = u16;

/// Largest number of registers a single read may ask for.
pub const MAX_READ_QUANTITY: Quantity = 125;

/// A decoded request PDU, sent by the bus poller or received by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Function 0x03: start address and register count.
    ReadHoldingRegisters(Address, Quantity),

    /// Function 0x04: start address and register count.
    ReadInputRegisters(Address, Quantity),

    /// Function 0x06: register address and new value.
    WriteSingleRegister(Address, Word),

    /// Any other function byte, followed by its undecoded data.
    Custom(u8, Bytes),
}

impl Request {
    /// Function code to put on the wire for this request.
    #[must_use]
    pub const fn function_code(&self) -> FunctionCode {
        use Request::*;

        match self {
            ReadHoldingRegisters(_, _) => FunctionCode::ReadHoldingRegisters,
            ReadInputRegisters(_, _) => FunctionCode::ReadInputRegisters,
            WriteSingleRegister(_, _) => FunctionCode::WriteSingleRegister,
            Custom(code, _) => FunctionCode::Custom(*code),
        }
    }
}

/// A request together with the device address it was sent to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveRequest {
    pub slave: SlaveId,
    pub request: Request,
}

/// Payload of a non-exception reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Words read from the holding registers.
    ReadHoldingRegisters(Vec<Word>),

    /// Words read from the input registers.
    ReadInputRegisters(Vec<Word>),
}

impl Response {
    /// Function code this reply answers.
    #[must_use]
    pub const fn function_code(&self) -> FunctionCode {
        use Response::*;

        match self {
            ReadHoldingRegisters(_) => FunctionCode::ReadHoldingRegisters,
            ReadInputRegisters(_) => FunctionCode::ReadInputRegisters,
        }
    }
}

/// A server (slave) exception.
///
/// Every variant maps to the single exception byte sent on the wire.
/// Success is not a variant, it is the `Ok` side of a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    /// 0x01, the function is not registered for the addressed device.
    IllegalFunction,
    /// 0x02
    IllegalDataAddress,
    /// 0x03
    IllegalDataValue,
    /// 0x04
    ServerDeviceFailure,
    /// 0x0B, the addressed device is not known to the gateway.
    UnknownDevice,
    /// Passthrough of any other code, e.g. received from a remote device.
    Custom(u8),
}

impl ExceptionCode {
    pub const ILLEGAL_FUNCTION: u8 = 0x01;
    pub const ILLEGAL_DATA_ADDRESS: u8 = 0x02;
    pub const ILLEGAL_DATA_VALUE: u8 = 0x03;
    pub const SERVER_DEVICE_FAILURE: u8 = 0x04;
    pub const UNKNOWN_DEVICE: u8 = 0x0B;

    /// Create a new [`ExceptionCode`] with `value`.
    #[must_use]
    pub const fn new(value: u8) -> Self {
        use ExceptionCode::*;

        match value {
            Self::ILLEGAL_FUNCTION => IllegalFunction,
            Self::ILLEGAL_DATA_ADDRESS => IllegalDataAddress,
            Self::ILLEGAL_DATA_VALUE => IllegalDataValue,
            Self::SERVER_DEVICE_FAILURE => ServerDeviceFailure,
            Self::UNKNOWN_DEVICE => UnknownDevice,
            other => Custom(other),
        }
    }

    /// The wire-level exception byte.
    #[must_use]
    pub const fn value(self) -> u8 {
        use ExceptionCode::*;

        match self {
            IllegalFunction => Self::ILLEGAL_FUNCTION,
            IllegalDataAddress => Self::ILLEGAL_DATA_ADDRESS,
            IllegalDataValue => Self::ILLEGAL_DATA_VALUE,
            ServerDeviceFailure => Self::SERVER_DEVICE_FAILURE,
            UnknownDevice => Self::UNKNOWN_DEVICE,
            Custom(code) => code,
        }
    }

    pub(crate) fn description(&self) -> &str {
        use ExceptionCode::*;

        match *self {
            IllegalFunction => "Illegal function",
            IllegalDataAddress => "Illegal data address",
            IllegalDataValue => "Illegal data value",
            ServerDeviceFailure => "Server device failure",
            UnknownDevice => "Unknown device",
            Custom(_) => "Custom",
        }
    }
}

impl From<ExceptionCode> for u8 {
    fn from(from: ExceptionCode) -> Self {
        from.value()
    }
}

impl Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom(code) => write!(f, "Custom exception 0x{code:0>2X}"),
            _ => f.write_str(self.description()),
        }
    }
}

impl error::Error for ExceptionCode {}

/// A server (slave) exception response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionResponse {
    pub function: FunctionCode,
    pub exception: ExceptionCode,
}

impl Display for ExceptionResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Modbus function {}: {}", self.function, self.exception)
    }
}

impl error::Error for ExceptionResponse {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_code_values() {
        assert_eq!(FunctionCode::new(0x03), FunctionCode::ReadHoldingRegisters);
        assert_eq!(FunctionCode::new(0x04), FunctionCode::ReadInputRegisters);
        assert_eq!(FunctionCode::new(0x06), FunctionCode::WriteSingleRegister);
        assert_eq!(FunctionCode::new(0x01), FunctionCode::Custom(0x01));
        assert_eq!(FunctionCode::Custom(0x10).value(), 0x10);
        assert_eq!(FunctionCode::ReadInputRegisters.exception_value(), 0x84);
    }

    #[test]
    fn exception_codes() {
        assert_eq!(ExceptionCode::IllegalFunction.value(), 0x01);
        assert_eq!(ExceptionCode::UnknownDevice.value(), 0x0B);
        assert_eq!(ExceptionCode::new(0x0B), ExceptionCode::UnknownDevice);
        assert_eq!(ExceptionCode::new(0x42), ExceptionCode::Custom(0x42));
        assert_eq!(u8::from(ExceptionCode::IllegalDataAddress), 0x02);
    }

    #[test]
    fn exception_response_display() {
        let rsp = ExceptionResponse {
            function: FunctionCode::ReadHoldingRegisters,
            exception: ExceptionCode::IllegalDataValue,
        };
        assert_eq!(rsp.to_string(), "Modbus function 3: Illegal data value");
    }

    #[test]
    fn request_function_codes() {
        assert_eq!(
            Request::ReadInputRegisters(0, 1).function_code(),
            FunctionCode::ReadInputRegisters
        );
        assert_eq!(
            Request::Custom(0x01, Bytes::new()).function_code(),
            FunctionCode::Custom(0x01)
        );
    }
}
