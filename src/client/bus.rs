// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Polling of the devices on one serial bus.
//!
//! Each bus is polled by a single task that walks all actions of all
//! devices round-robin and copies the results into the register store.

use std::{fmt, sync::Arc, time::Duration};

use log::{error, info, warn};

use crate::{
    config::{ClientConfig, ConfigError, RegisterRange},
    frame::{Address, FunctionCode, Quantity, Word, MAX_READ_QUANTITY},
    store::{RegisterStore, BANK_SIZE},
    Slave, SlaveContext as _,
};

use super::{Context, Reader as _};

/// Failures of a single action after which its bus stops polling.
pub const MAX_ERRORS: usize = 10;

/// Pause after a successful poll when the range sets no delay.
pub const DEFAULT_DELAY: Duration = Duration::from_millis(500);

/// Register type, given by the leading digit of a configured register number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeType {
    /// `3xxxx`
    InputRegisters,
    /// `4xxxx`
    HoldingRegisters,
}

impl RangeType {
    fn from_digit(digit: u32) -> Option<Self> {
        match digit {
            3 => Some(Self::InputRegisters),
            4 => Some(Self::HoldingRegisters),
            _ => None,
        }
    }

    /// The function issued on the bus for this range.
    #[must_use]
    pub const fn request_function(self) -> FunctionCode {
        match self {
            Self::InputRegisters => FunctionCode::ReadInputRegisters,
            Self::HoldingRegisters => FunctionCode::ReadHoldingRegisters,
        }
    }

    /// The bank that receives the polled values.
    ///
    /// Operation type 3 fills bank 4 and operation type 4 fills bank 3.
    /// Upstream masters read the values with the function matching the
    /// register type, not the operation type digit.
    #[must_use]
    pub const fn target_bank(self) -> FunctionCode {
        match self {
            Self::InputRegisters => FunctionCode::ReadInputRegisters,
            Self::HoldingRegisters => FunctionCode::ReadHoldingRegisters,
        }
    }

    /// The leading digit of the configured register numbers.
    #[must_use]
    pub const fn op_type(self) -> u8 {
        match self {
            Self::InputRegisters => 3,
            Self::HoldingRegisters => 4,
        }
    }
}

/// Splits a register number like `30001` into its type and 0-based address.
pub fn parse_register(number: u32) -> Result<(RangeType, Address), ConfigError> {
    let digits = number.to_string();
    let invalid = || ConfigError::InvalidRegister(number);
    let (first, rest) = digits.split_at(1);
    let digit = first.parse::<u32>().map_err(|_| invalid())?;
    let range_type =
        RangeType::from_digit(digit).ok_or(ConfigError::UnsupportedRangeType(number))?;
    let one_based = rest.parse::<u32>().map_err(|_| invalid())?;
    let address = one_based
        .checked_sub(1)
        .and_then(|address| Address::try_from(address).ok())
        .ok_or_else(invalid)?;
    Ok((range_type, address))
}

/// One scheduled read of a register range of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAction {
    range_type: RangeType,
    start: Address,
    finish: Address,
    count: Quantity,
    delay: Duration,
    errors: usize,
}

impl DeviceAction {
    /// Validates a configured range. `finish` is exclusive.
    pub fn from_range(range: &RegisterRange) -> Result<Self, ConfigError> {
        let (start_type, start) = parse_register(range.start)?;
        let (finish_type, finish) = parse_register(range.finish)?;
        if start_type != finish_type {
            return Err(ConfigError::RangeTypeMismatch {
                start: range.start,
                finish: range.finish,
            });
        }
        if finish <= start {
            return Err(ConfigError::InvertedRange { start, finish });
        }
        let count = finish - start;
        if count > MAX_READ_QUANTITY || usize::from(finish) > BANK_SIZE {
            return Err(ConfigError::RangeTooLarge { start, finish });
        }
        let delay = match range.delay {
            0 => DEFAULT_DELAY,
            millis => Duration::from_millis(millis),
        };
        Ok(Self {
            range_type: start_type,
            start,
            finish,
            count,
            delay,
            errors: 0,
        })
    }

    #[must_use]
    pub const fn range_type(&self) -> RangeType {
        self.range_type
    }

    #[must_use]
    pub const fn start(&self) -> Address {
        self.start
    }

    #[must_use]
    pub const fn count(&self) -> Quantity {
        self.count
    }

    #[must_use]
    pub const fn delay(&self) -> Duration {
        self.delay
    }

    #[must_use]
    pub const fn errors(&self) -> usize {
        self.errors
    }
}

impl fmt::Display for DeviceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.range_type {
            RangeType::InputRegisters => "ReadInputRegisters",
            RangeType::HoldingRegisters => "ReadHoldingRegisters",
        };
        write!(
            f,
            "{op} from {}{:04} to {}{:04}",
            self.range_type.op_type(),
            u32::from(self.start) + 1,
            self.range_type.op_type(),
            u32::from(self.finish) + 1
        )
    }
}

/// A remote device and its scheduled actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    slave: Slave,
    actions: Vec<DeviceAction>,
}

impl Device {
    #[must_use]
    pub fn new(slave: Slave, actions: Vec<DeviceAction>) -> Self {
        Self { slave, actions }
    }

    #[must_use]
    pub const fn slave(&self) -> Slave {
        self.slave
    }

    #[must_use]
    pub fn actions(&self) -> &[DeviceAction] {
        &self.actions
    }
}

/// The action whose error count stopped a bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusHalt {
    pub slave: Slave,
    pub action: DeviceAction,
}

impl fmt::Display for BusHalt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "device {}: {} failed {} times",
            self.slave, self.action, self.action.errors
        )
    }
}

/// All devices reachable through one serial port.
#[derive(Debug)]
pub struct DeviceBus {
    name: String,
    context: Context,
    devices: Vec<Device>,
}

impl DeviceBus {
    #[must_use]
    pub fn new(name: impl Into<String>, context: Context, devices: Vec<Device>) -> Self {
        Self {
            name: name.into(),
            context,
            devices,
        }
    }

    /// Registers the configured devices and validates their ranges.
    ///
    /// Duplicate devices and invalid ranges are logged and skipped. Returns
    /// `None` if no device with at least one valid range remains.
    pub fn build(config: &ClientConfig, context: Context, store: &RegisterStore) -> Option<Self> {
        let name = &config.serial.device_name;
        let mut devices = Vec::with_capacity(config.devices.len());
        for remote in &config.devices {
            let slave = Slave(remote.id);
            if let Err(err) = store.register_device(slave) {
                error!("Skipping device {slave} on {name}: {err}");
                continue;
            }
            let actions: Vec<_> = remote
                .ranges
                .iter()
                .filter_map(|range| match DeviceAction::from_range(range) {
                    Ok(action) => Some(action),
                    Err(err) => {
                        warn!("Device {slave} on {name}: skipping range {range:?}: {err}");
                        None
                    }
                })
                .collect();
            if actions.is_empty() {
                warn!("No valid register ranges found for device {slave} on {name}");
                continue;
            }
            devices.push(Device::new(slave, actions));
        }
        if devices.is_empty() {
            warn!("No devices configured for device bus {name}");
            return None;
        }
        Some(Self::new(name.clone(), context, devices))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Polls all actions round-robin until one of them reached
    /// [`MAX_ERRORS`] failures.
    ///
    /// A single worn out action stops the whole bus, the remaining devices
    /// are no longer polled either. Returns `None` right away if there is
    /// nothing to poll.
    pub async fn collect(mut self, store: Arc<RegisterStore>) -> Option<BusHalt> {
        if self.devices.iter().all(|device| device.actions.is_empty()) {
            warn!("Nothing to poll on {}", self.name);
            return None;
        }
        info!("Collecting data from {} device(s) on {}", self.devices.len(), self.name);
        let Self {
            name,
            context,
            devices,
        } = &mut self;
        loop {
            for device in devices.iter_mut() {
                let slave = device.slave;
                for action in &mut device.actions {
                    if poll(context, slave, action, &store).await {
                        tokio::time::sleep(action.delay).await;
                    } else if action.errors >= MAX_ERRORS {
                        error!("Device {slave} on {name}: stopping bus, {action} failed too often");
                        return Some(BusHalt {
                            slave,
                            action: action.clone(),
                        });
                    }
                }
            }
        }
    }
}

/// Runs one action. Returns `true` if values were received.
async fn poll(
    context: &mut Context,
    slave: Slave,
    action: &mut DeviceAction,
    store: &RegisterStore,
) -> bool {
    context.set_slave(slave);
    let result = match action.range_type {
        RangeType::InputRegisters => context.read_input_registers(action.start, action.count).await,
        RangeType::HoldingRegisters => {
            context
                .read_holding_registers(action.start, action.count)
                .await
        }
    };
    let words = match result {
        Ok(Ok(words)) => words,
        Ok(Err(exception)) => {
            action.errors += 1;
            warn!(
                "Device {slave}: {action} failed, function {} answered: {exception}",
                action.range_type.request_function()
            );
            return false;
        }
        Err(err) => {
            action.errors += 1;
            warn!("Device {slave}: {action} failed: {err}");
            return false;
        }
    };
    if words.is_empty() {
        return false;
    }
    store_words(store, slave, action, &words);
    true
}

fn store_words(store: &RegisterStore, slave: Slave, action: &DeviceAction, words: &[Word]) {
    let bank = match store.bank(slave, action.range_type.target_bank()) {
        Ok(bank) => bank,
        Err(err) => {
            error!("Device {slave}: no bank for {action}: {err}");
            return;
        }
    };
    let data: Vec<u8> = words.iter().flat_map(|word| word.to_be_bytes()).collect();
    if let Err(err) = bank.write(action.start, action.count, &data) {
        error!("Device {slave}: unable to store {action}: {err}");
    }
}
