// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The running gateway: one register store shared by the client buses that
//! fill it and the server that answers from it.

use std::{io, sync::Arc};

use log::{info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    task::JoinHandle,
};

use crate::{
    client::{
        bus::{BusHalt, DeviceBus},
        rtu::connect_slave,
        Context,
    },
    config::{ClientConfig, ServerConfig},
    server::rtu::{self, Server},
    store::RegisterStore,
    Slave,
};

/// A polling task and the port it runs on.
#[derive(Debug)]
struct RunningBus {
    name: String,
    task: JoinHandle<Option<BusHalt>>,
}

/// Owns the register store and the tasks working on it.
///
/// All `start_*` and `spawn_*` functions must be called within a tokio
/// runtime.
#[derive(Debug, Default)]
pub struct Gateway {
    store: Arc<RegisterStore>,
    buses: Vec<RunningBus>,
}

impl Gateway {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn store(&self) -> &Arc<RegisterStore> {
        &self.store
    }

    /// Names of the ports whose buses are still polling.
    #[must_use]
    pub fn running_buses(&self) -> Vec<&str> {
        self.buses
            .iter()
            .filter(|bus| !bus.task.is_finished())
            .map(|bus| bus.name.as_str())
            .collect()
    }

    /// Opens the serial port of a client bus and starts polling it.
    ///
    /// Failing to open the port is an error. Returns `false` if the bus has
    /// no valid device and was not started.
    pub fn start_client(&mut self, config: &ClientConfig) -> io::Result<bool> {
        let Some(first) = config.devices.first() else {
            warn!("No devices configured for device bus {}", config.serial.device_name);
            return Ok(false);
        };
        let context = connect_slave(&config.serial, Slave(first.id)).map_err(|err| {
            io::Error::new(
                err.kind(),
                format!("failed to open {}: {err}", config.serial.device_name),
            )
        })?;
        Ok(self.spawn_client(config, context))
    }

    /// Registers the devices of `config` and polls them through `context`.
    pub fn spawn_client(&mut self, config: &ClientConfig, context: Context) -> bool {
        let Some(bus) = DeviceBus::build(config, context, &self.store) else {
            return false;
        };
        let name = bus.name().to_owned();
        let task = tokio::spawn(bus.collect(Arc::clone(&self.store)));
        self.buses.push(RunningBus { name, task });
        true
    }

    /// Opens the server port and answers requests on it.
    ///
    /// The returned task finishes when the port stops delivering data.
    pub fn start_server(&self, config: &ServerConfig) -> io::Result<JoinHandle<io::Result<()>>> {
        let serial = rtu::open(&config.serial).map_err(|err| {
            io::Error::new(
                err.kind(),
                format!("failed to open {}: {err}", config.serial.device_name),
            )
        })?;
        info!("Server: Started listening on {}", config.serial.device_name);
        Ok(self.spawn_server(serial, config.device_id))
    }

    /// Answers requests arriving on `transport`, optionally registering the
    /// gateway's own device first.
    pub fn spawn_server<T>(
        &self,
        transport: T,
        device_id: Option<crate::SlaveId>,
    ) -> JoinHandle<io::Result<()>>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        if let Some(id) = device_id {
            if let Err(err) = self.store.register_device(Slave(id)) {
                warn!("Server device: {err}");
            }
        }
        let server = Server::with_store(Arc::clone(&self.store));
        tokio::spawn(async move {
            let res = server.serve(transport).await;
            server.shutdown().await;
            res
        })
    }

    /// Stops all polling tasks.
    pub async fn shutdown(self) {
        for RunningBus { name, task } in self.buses {
            task.abort();
            match task.await {
                Ok(Some(halt)) => info!("Bus {name} had stopped: {halt}"),
                Ok(None) => {}
                Err(err) if err.is_cancelled() => info!("Bus {name} stopped"),
                Err(err) => warn!("Bus {name} failed: {err}"),
            }
        }
    }
}
