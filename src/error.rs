// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types.

use std::io;

use thiserror::Error;

use crate::{FunctionCode, Slave};

/// Protocol or transport errors of a client request.
#[derive(Debug, Error)]
pub enum Error {
    /// The serial link failed or timed out.
    #[error(transparent)]
    Transport(#[from] io::Error),

    /// The remote device answered with something that does not fit the request.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A response that does not belong to the request that was sent.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The response was sent by a different slave than the one addressed.
    #[error("response from slave {response} to a request for slave {request}")]
    HeaderMismatch { request: Slave, response: Slave },

    /// The function codes of request and response do not match.
    #[error("function code mismatch: expected {request}, received {response}")]
    FunctionCodeMismatch {
        request: FunctionCode,
        response: FunctionCode,
    },
}

/// Failures of device registration in the register store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Device identifiers must be unique across all buses.
    #[error("device {0} already registered")]
    AlreadyRegistered(Slave),

    /// Broadcast and reserved addresses cannot own register banks.
    #[error("device {0} is not a single device address")]
    InvalidDevice(Slave),
}
