// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

#![allow(dead_code)]

use std::{
    io,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::time::Instant;
use meterproxy::{
    client::{Client, Context},
    codec::crc16,
    config::{ClientConfig, Parity, RegisterRange, RemoteDevice, SerialConfig},
    Request, Response, Slave, SlaveContext, SlaveId,
};

pub fn with_crc(content: &[u8]) -> Vec<u8> {
    let mut frame = content.to_vec();
    frame.extend_from_slice(&crc16(content).to_le_bytes());
    frame
}

/// Asserts a 5 byte exception frame with a valid checksum.
pub fn check_exception_frame(frame: &[u8], slave: u8, function: u8, code: u8) {
    assert_eq!(frame.len(), 5);
    assert_eq!(frame[0], slave);
    assert_eq!(frame[1], function | 0x80);
    assert_eq!(frame[2], code);
    assert_eq!(crc16(&frame[..3]).to_le_bytes(), [frame[3], frame[4]]);
}

pub fn client_config(devices: Vec<(SlaveId, Vec<(u32, u32)>)>) -> ClientConfig {
    ClientConfig {
        serial: SerialConfig::new("/dev/ttyTEST", 9600, Parity::None),
        devices: devices
            .into_iter()
            .map(|(id, ranges)| RemoteDevice {
                id,
                ranges: ranges
                    .into_iter()
                    .map(|(start, finish)| RegisterRange {
                        start,
                        finish,
                        delay: 0,
                    })
                    .collect(),
            })
            .collect(),
    }
}

/// Answers with fixed words for the slaves in `healthy`, fails otherwise.
#[derive(Debug, Clone, Default)]
pub struct MockClient {
    slave: Option<Slave>,
    pub healthy: Vec<(Slave, Vec<u16>)>,
    pub calls: Arc<Mutex<Vec<(Slave, Request)>>>,
    pub called_at: Arc<Mutex<Vec<Instant>>>,
}

impl MockClient {
    pub fn with_healthy(healthy: Vec<(Slave, Vec<u16>)>) -> Self {
        Self {
            healthy,
            ..Default::default()
        }
    }

    pub fn into_context(self) -> Context {
        Context::from(Box::new(self) as Box<dyn Client>)
    }

    pub fn calls_for(&self, slave: Slave) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == slave)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl SlaveContext for MockClient {
    fn set_slave(&mut self, slave: Slave) {
        self.slave = Some(slave);
    }
}

#[async_trait]
impl Client for MockClient {
    async fn call(&mut self, request: Request) -> meterproxy::Result<Response> {
        let slave = self.slave.unwrap_or(Slave(0));
        self.calls.lock().unwrap().push((slave, request.clone()));
        self.called_at.lock().unwrap().push(Instant::now());
        let Some((_, words)) = self.healthy.iter().find(|(s, _)| *s == slave) else {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no response").into());
        };
        let rsp = match request {
            Request::ReadInputRegisters(_, cnt) => {
                Response::ReadInputRegisters(words.iter().copied().take(cnt.into()).collect())
            }
            Request::ReadHoldingRegisters(_, cnt) => {
                Response::ReadHoldingRegisters(words.iter().copied().take(cnt.into()).collect())
            }
            _ => unreachable!(),
        };
        Ok(Ok(rsp))
    }
}
