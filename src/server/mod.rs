// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus server answering from the register store.

pub mod rtu;

mod service;
pub use self::service::{Service, StoreService};
