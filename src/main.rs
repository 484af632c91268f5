// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{collections::BTreeSet, future, io, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context as _};
use clap::{Parser, ValueEnum};
use log::{error, info, warn};
use tokio::task::JoinHandle;

use meterproxy::{
    config::Config,
    gateway::Gateway,
    telemetry::{MqttPublisher, Recorder},
    usb,
};

/// Time given to the client buses to fill the store before serving.
const SETTLE_TIME: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Only poll the remote devices.
    Client,
    /// Only answer requests.
    Server,
}

/// Modbus RTU gateway serving cached values of serial meters
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Mode to start in, both sides and MQTT recording if omitted
    #[clap(long, value_enum)]
    mode: Option<Mode>,

    /// Configuration file
    #[clap(long, default_value = "configuration.yaml")]
    cfg: PathBuf,

    /// Start even if no USB serial adapter is present
    #[clap(long)]
    skip_usb_check: bool,
}

fn check_usb_serial_devices() -> anyhow::Result<()> {
    let found = usb::find_usb_serial_devices(usb::SYSFS_USB_DEVICES).unwrap_or_else(|err| {
        warn!("No USB devices available: {err}");
        BTreeSet::new()
    });
    if found.is_empty() {
        bail!("Unable to find any suitable USB devices");
    }
    info!("USB serial devices: {found:?}");
    Ok(())
}

async fn server_finished(server: Option<JoinHandle<io::Result<()>>>) {
    let Some(server) = server else {
        return future::pending().await;
    };
    match server.await {
        Ok(Ok(())) => info!("Server port closed"),
        Ok(Err(err)) => error!("Server failed: {err}"),
        Err(err) => error!("Server task failed: {err}"),
    }
}

#[cfg(unix)]
async fn terminate() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn terminate() -> io::Result<()> {
    future::pending().await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    let args = Args::parse();
    info!("Meter Proxy. Reading configuration from {}", args.cfg.display());

    if !args.skip_usb_check {
        check_usb_serial_devices()?;
    }

    let config = Config::from_file(&args.cfg)
        .with_context(|| format!("unable to load {}", args.cfg.display()))?;

    let mut gateway = Gateway::new();

    // Collect data before answering requests.
    if args.mode != Some(Mode::Server) {
        for client in &config.clients {
            gateway.start_client(client)?;
        }
        info!("Polling buses: {:?}", gateway.running_buses());
        tokio::time::sleep(SETTLE_TIME).await;
    }

    let server = if args.mode == Some(Mode::Client) {
        None
    } else if let Some(server) = &config.server {
        Some(gateway.start_server(server)?)
    } else {
        warn!("No server port configured");
        None
    };

    info!("Serving devices: {:?}", gateway.store().devices());

    let recorder = match (args.mode, &config.mqtt, &config.source) {
        (None, Some(mqtt), Some(source)) => {
            let publisher = MqttPublisher::connect(&config.name, mqtt).await;
            let recorder = Recorder::new(
                config.name.clone(),
                mqtt,
                source,
                Arc::clone(gateway.store()),
                Arc::new(publisher),
            );
            Some(tokio::spawn(recorder.run()))
        }
        (None, _, _) => {
            info!("MQTT recording not configured");
            None
        }
        (Some(_), _, _) => {
            info!("MQTT recording not being started due operating mode");
            None
        }
    };

    if args.mode == Some(Mode::Client) {
        info!("Started as client. Will run until CTRL+C used.");
    }

    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        res = terminate() => res?,
        () = server_finished(server) => {}
    }
    info!("Quit signal received, exiting...");

    if let Some(recorder) = recorder {
        recorder.abort();
    }
    gateway.shutdown().await;
    Ok(())
}
