// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus RTU client over a serial line.

use std::{fmt, io, time::Duration};

use futures_util::{SinkExt as _, StreamExt as _};
use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialStream;
use tokio_util::codec::Framed;

use crate::{
    codec,
    config::SerialConfig,
    frame::{rtu::*, *},
    slave::*,
    Result,
};

use super::Context;

/// Time to wait for the response of a remote device.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// _Modbus_ RTU client.
#[derive(Debug)]
pub(crate) struct Client<T> {
    framed: Framed<T, codec::rtu::ClientCodec>,
    slave: Slave,
    timeout: Duration,
}

impl<T> Client<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(transport: T, slave: Slave, timeout: Duration) -> Self {
        let framed = Framed::new(transport, codec::rtu::ClientCodec);
        Self {
            framed,
            slave,
            timeout,
        }
    }

    async fn send_and_receive(&mut self, request_adu: RequestAdu) -> Result<Response> {
        let request_context = request_adu.context();

        self.framed.read_buffer_mut().clear();
        self.framed.send(request_adu).await?;

        let response_adu = self
            .framed
            .next()
            .await
            .unwrap_or_else(|| Err(io::Error::from(io::ErrorKind::BrokenPipe)))?;

        response_adu.try_into_response(request_context)
    }

    async fn call(&mut self, request: Request) -> Result<Response> {
        debug!("Call {request:?} on slave {}", self.slave);
        let request_adu = RequestAdu {
            hdr: Header { slave: self.slave },
            pdu: request,
        };
        let timeout = self.timeout;
        let result = tokio::time::timeout(timeout, self.send_and_receive(request_adu))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no response within {timeout:?}"),
                )
            })?;
        trace!("Result {result:?}");
        result
    }
}

impl<T> SlaveContext for Client<T> {
    fn set_slave(&mut self, slave: Slave) {
        self.slave = slave;
    }
}

#[async_trait::async_trait]
impl<T> super::Client for Client<T>
where
    T: fmt::Debug + AsyncRead + AsyncWrite + Send + Unpin,
{
    async fn call(&mut self, request: Request) -> Result<Response> {
        self.call(request).await
    }
}

/// Attach a new client context to a transport with the default timeout.
pub fn attach_slave<T>(transport: T, slave: Slave) -> Context
where
    T: AsyncRead + AsyncWrite + fmt::Debug + Unpin + Send + 'static,
{
    attach_slave_with_timeout(transport, slave, DEFAULT_TIMEOUT)
}

/// Attach a new client context to a transport.
pub fn attach_slave_with_timeout<T>(transport: T, slave: Slave, timeout: Duration) -> Context
where
    T: AsyncRead + AsyncWrite + fmt::Debug + Unpin + Send + 'static,
{
    let client = Client::new(transport, slave, timeout);
    Context::from(Box::new(client) as Box<dyn super::Client>)
}

/// Opens the serial port of a bus, initially addressing `slave`.
pub fn connect_slave(config: &SerialConfig, slave: Slave) -> io::Result<Context> {
    let serial = SerialStream::open(&config.builder())?;
    Ok(attach_slave(serial, slave))
}
