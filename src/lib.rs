// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A [Modbus](https://en.wikipedia.org/wiki/Modbus) RTU gateway
//! based on [tokio](https://tokio.rs).
//!
//! The gateway polls register ranges of remote devices on one or more serial
//! buses, caches the values in a [`RegisterStore`](store::RegisterStore) and
//! answers requests of an upstream master from that cache on a separate
//! serial port.
//!
//! As in Modbus itself the polling side is called *client* and the answering
//! side *server*.
//!
//! ## Data flow
//!
//! ```text
//! remote devices --serial--> client::bus --> store <-- server <--serial-- master
//!                                              |
//!                                              +--> telemetry --> MQTT
//! ```

pub mod prelude;

pub mod client;
pub mod codec;
pub mod config;
pub mod gateway;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod usb;

mod error;
pub use self::error::{Error, ProtocolError, RegistryError};

mod frame;
pub use self::frame::{
    Address, ExceptionCode, ExceptionResponse, FunctionCode, Quantity, Request, Response,
    SlaveRequest, Word, MAX_READ_QUANTITY,
};

mod slave;
pub use self::slave::{Slave, SlaveContext, SlaveId};

/// Specialized [`std::result::Result`] type for client calls.
///
/// The outer result carries transport and protocol failures, the inner one
/// the exception reported by the remote device.
pub type Result<T> = std::result::Result<std::result::Result<T, ExceptionCode>, Error>;
