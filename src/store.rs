// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Register store shared by the bus pollers and the server.
//!
//! Every registered device owns one bank per function code. Each bank has
//! its own read/write lock, there is no lock spanning several banks.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
};

use bytes::Bytes;
use log::{debug, info};

use crate::{
    codec::encode_registers,
    error::RegistryError,
    frame::{Address, ExceptionCode, FunctionCode, Quantity, Word, MAX_READ_QUANTITY},
    Slave,
};

/// Number of registers allocated per bank.
pub const BANK_SIZE: usize = 256;

/// Access to one bank of 16 bit registers.
pub trait RegisterBank: Send + Sync + fmt::Debug {
    /// Reads `count` registers starting at `start`.
    ///
    /// The result is prefixed with its byte count (`count * 2`) and holds the
    /// register values big-endian, ready to be used as a read response payload.
    /// The range is checked first. Empty reads and reads of more than
    /// [`MAX_READ_QUANTITY`] registers are then rejected with
    /// [`ExceptionCode::IllegalDataValue`].
    fn read(&self, start: Address, count: Quantity) -> Result<Bytes, ExceptionCode>;

    /// Stores `count` big-endian values from `data` starting at `start`.
    fn write(&self, start: Address, count: Quantity, data: &[u8]) -> Result<(), ExceptionCode>;
}

/// Shared handle of a register bank.
pub type BankHandle = Arc<dyn RegisterBank>;

/// The standard read/write register bank.
#[derive(Debug)]
pub struct Registers {
    data: RwLock<[Word; BANK_SIZE]>,
}

impl Default for Registers {
    fn default() -> Self {
        Self {
            data: RwLock::new([0; BANK_SIZE]),
        }
    }
}

fn checked_range(start: Address, count: Quantity) -> Result<std::ops::Range<usize>, ExceptionCode> {
    let start = usize::from(start);
    let end = start + usize::from(count);
    if end > BANK_SIZE {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    Ok(start..end)
}

impl RegisterBank for Registers {
    fn read(&self, start: Address, count: Quantity) -> Result<Bytes, ExceptionCode> {
        let range = checked_range(start, count)?;
        if count == 0 || count > MAX_READ_QUANTITY {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let data = self
            .data
            .read()
            .map_err(|_| ExceptionCode::ServerDeviceFailure)?;
        Ok(encode_registers(&data[range]))
    }

    fn write(&self, start: Address, count: Quantity, data: &[u8]) -> Result<(), ExceptionCode> {
        let range = checked_range(start, count)?;
        let Some(bytes) = data.get(..range.len() * 2) else {
            return Err(ExceptionCode::IllegalDataValue);
        };
        let mut registers = self
            .data
            .write()
            .map_err(|_| ExceptionCode::ServerDeviceFailure)?;
        for (reg, word) in registers[range].iter_mut().zip(bytes.chunks_exact(2)) {
            *reg = u16::from_be_bytes([word[0], word[1]]);
        }
        Ok(())
    }
}

type DeviceBanks = HashMap<FunctionCode, BankHandle>;

/// Registry of all devices served by the gateway.
///
/// Devices are only added during startup and never removed.
#[derive(Debug, Default)]
pub struct RegisterStore {
    devices: RwLock<HashMap<Slave, DeviceBanks>>,
}

impl RegisterStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the function 3 and function 4 banks of a new device.
    ///
    /// Registering an identifier twice is an error and leaves the existing
    /// banks untouched.
    pub fn register_device(&self, slave: Slave) -> Result<(), RegistryError> {
        if !slave.is_single_device() {
            return Err(RegistryError::InvalidDevice(slave));
        }
        let mut devices = self
            .devices
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if devices.contains_key(&slave) {
            return Err(RegistryError::AlreadyRegistered(slave));
        }
        let banks: DeviceBanks = [
            FunctionCode::ReadHoldingRegisters,
            FunctionCode::ReadInputRegisters,
        ]
        .into_iter()
        .map(|function| (function, Arc::new(Registers::default()) as BankHandle))
        .collect();
        devices.insert(slave, banks);
        info!("Added standard device {slave}");
        Ok(())
    }

    /// Resolves the bank of `function` for the device `slave`.
    pub fn bank(&self, slave: Slave, function: FunctionCode) -> Result<BankHandle, ExceptionCode> {
        let devices = self
            .devices
            .read()
            .map_err(|_| ExceptionCode::ServerDeviceFailure)?;
        let Some(banks) = devices.get(&slave) else {
            return Err(ExceptionCode::UnknownDevice);
        };
        banks.get(&function).cloned().ok_or_else(|| {
            debug!("Request for unregistered function {function} on device {slave}");
            ExceptionCode::IllegalFunction
        })
    }

    /// Reads `count` registers at `index` of a device's bank.
    pub fn read_by_index(
        &self,
        slave: Slave,
        function: FunctionCode,
        index: Address,
        count: Quantity,
    ) -> Result<Bytes, ExceptionCode> {
        self.bank(slave, function)?.read(index, count)
    }

    /// All registered devices in ascending order.
    #[must_use]
    pub fn devices(&self) -> Vec<Slave> {
        let devices = self
            .devices
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut slaves: Vec<_> = devices.keys().copied().collect();
        slaves.sort_unstable();
        slaves
    }
}
