// SPDX-FileCopyrightText: Copyright (c) 2017-2023 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Common types and traits

///////////////////////////////////////////////////////////////////
/// Modules
///////////////////////////////////////////////////////////////////
pub use crate::client;

#[allow(missing_docs)]
pub mod rtu {
    pub use crate::client::rtu::*;
}

///////////////////////////////////////////////////////////////////
/// Types
///////////////////////////////////////////////////////////////////
pub use crate::{
    client::bus::{BusHalt, DeviceBus},
    config::Config,
    gateway::Gateway,
    store::RegisterStore,
};
pub use crate::{ExceptionCode, FunctionCode, Request, Response, SlaveRequest};
pub use crate::{Slave, SlaveId};

///////////////////////////////////////////////////////////////////
/// Traits
///////////////////////////////////////////////////////////////////
pub use crate::client::{Client, Reader};
pub use crate::server::Service;
pub use crate::slave::SlaveContext;
pub use crate::store::RegisterBank;
pub use crate::telemetry::Publisher;
