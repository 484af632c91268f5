// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Gateway configuration file.

use std::{fs, io, path::Path, time::Duration};

use serde::Deserialize;
use thiserror::Error;
use tokio_serial::{DataBits, SerialPortBuilder, StopBits};

use crate::{client::rtu::DEFAULT_TIMEOUT, frame::Address, SlaveId};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read configuration: {0}")]
    Io(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid register number {0}")]
    InvalidRegister(u32),

    #[error("unsupported register type of {0}, expected 3xxxx or 4xxxx")]
    UnsupportedRangeType(u32),

    #[error("range types do not match: {start} vs {finish}")]
    RangeTypeMismatch { start: u32, finish: u32 },

    #[error("finish register {finish} is not above start register {start}")]
    InvertedRange { start: Address, finish: Address },

    #[error("range {start}..{finish} exceeds the register bank or the read limit")]
    RangeTooLarge { start: Address, finish: Address },
}

/// Serial line parity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum Parity {
    #[serde(rename = "N")]
    None,
    #[default]
    #[serde(rename = "E")]
    Even,
    #[serde(rename = "O")]
    Odd,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(from: Parity) -> Self {
        match from {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }
}

fn default_baud_rate() -> u32 {
    9600
}

/// Port settings shared by the server and every client bus.
///
/// Data bits and stop bits are fixed to 8 and 1.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SerialConfig {
    #[serde(rename = "devicename")]
    pub device_name: String,
    #[serde(rename = "baudrate", default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default)]
    pub parity: Parity,
}

impl SerialConfig {
    #[must_use]
    pub fn new(device_name: impl Into<String>, baud_rate: u32, parity: Parity) -> Self {
        Self {
            device_name: device_name.into(),
            baud_rate,
            parity,
        }
    }

    /// Port builder with the fixed 8N1/8E1/8O1 framing and I/O deadline.
    #[must_use]
    pub fn builder(&self) -> SerialPortBuilder {
        self.builder_with_timeout(DEFAULT_TIMEOUT)
    }

    #[must_use]
    pub fn builder_with_timeout(&self, timeout: Duration) -> SerialPortBuilder {
        tokio_serial::new(&self.device_name, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(self.parity.into())
            .stop_bits(StopBits::One)
            .timeout(timeout)
    }
}

/// The serial port on which upstream masters query the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    #[serde(flatten)]
    pub serial: SerialConfig,
    /// Device registered for the gateway itself.
    #[serde(default)]
    pub device_id: Option<SlaveId>,
}

/// A register range `start..finish` with an optional delay in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegisterRange {
    pub start: u32,
    pub finish: u32,
    #[serde(default)]
    pub delay: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteDevice {
    pub id: SlaveId,
    #[serde(default)]
    pub ranges: Vec<RegisterRange>,
}

/// One client bus: a serial port with its remote devices.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientConfig {
    #[serde(flatten)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub devices: Vec<RemoteDevice>,
}

fn default_mqtt_port() -> u16 {
    1883
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub topic_prefix: String,
    #[serde(default)]
    pub hassdiscovery_prefix: String,
}

/// A published value: two registers at `idx` of the source device's bank 4.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RecordField {
    pub name: String,
    pub idx: Address,
    #[serde(default)]
    pub units: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceConfig {
    pub device_id: SlaveId,
    #[serde(default)]
    pub fields: Vec<RecordField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Config {
    pub name: String,
    pub server: Option<ServerConfig>,
    #[serde(default)]
    pub clients: Vec<ClientConfig>,
    pub mqtt: Option<MqttConfig>,
    pub source: Option<SourceConfig>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let yaml = fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    const CONFIG: &str = r#"
name: Meter
server:
  devicename: /dev/ttyUSB0
  baudrate: 19200
  parity: N
  device_id: 1
clients:
  - devicename: /dev/ttyUSB1
    baudrate: 9600
    parity: E
    devices:
      - id: 2
        ranges:
          - start: 30001
            finish: 30011
          - start: 40001
            finish: 40005
            delay: 250
mqtt:
  host: broker.local
  topic_prefix: meters
  hassdiscovery_prefix: homeassistant
source:
  device_id: 2
  fields:
    - name: Total Power
      idx: 12
      units: W
"#;

    #[test]
    fn parse_full_configuration() {
        let config = Config::from_yaml(CONFIG).unwrap();
        assert_eq!(config.name, "Meter");

        let server = config.server.unwrap();
        assert_eq!(
            server.serial,
            SerialConfig::new("/dev/ttyUSB0", 19200, Parity::None)
        );
        assert_eq!(server.device_id, Some(1));

        let client = &config.clients[0];
        assert_eq!(client.serial.parity, Parity::Even);
        assert_eq!(client.devices[0].id, 2);
        assert_eq!(
            client.devices[0].ranges[1],
            RegisterRange {
                start: 40001,
                finish: 40005,
                delay: 250
            }
        );
        assert_eq!(client.devices[0].ranges[0].delay, 0);

        let mqtt = config.mqtt.unwrap();
        assert_eq!(mqtt.port, 1883);
        assert_eq!(mqtt.qos, 0);

        let source = config.source.unwrap();
        assert_eq!(source.fields[0].idx, 12);
    }

    #[test]
    fn defaults_for_serial_settings() {
        let config = Config::from_yaml(
            "name: x\nclients:\n  - devicename: /dev/ttyS0\n",
        )
        .unwrap();
        let serial = &config.clients[0].serial;
        assert_eq!(serial.baud_rate, 9600);
        assert_eq!(serial.parity, Parity::Even);
        assert!(config.server.is_none());
        assert!(config.clients[0].devices.is_empty());
    }

    #[test]
    fn reject_unknown_parity() {
        let err = Config::from_yaml(
            "name: x\nclients:\n  - devicename: /dev/ttyS0\n    parity: X\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.clients.len(), 1);

        assert!(matches!(
            Config::from_file(file.path().with_extension("missing")),
            Err(ConfigError::Io(_))
        ));
    }
}
