// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Publishing of register values to an MQTT broker.
//!
//! Each configured field is two registers of the source device's input
//! register bank, interpreted as a big-endian IEEE-754 `f32`. Fields are
//! announced once for Home Assistant discovery and then published every
//! second.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use log::{debug, info, warn};
use rumqttc::{AsyncClient, ClientError, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    config::{MqttConfig, RecordField, SourceConfig},
    frame::{ExceptionCode, FunctionCode},
    store::RegisterStore,
    Slave,
};

/// Interval between two rounds of publishing.
pub const PUBLISH_INTERVAL: Duration = Duration::from_secs(1);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("publish failed: {0}")]
    Publish(#[from] ClientError),

    #[error("source device {slave} is not readable: {exception}")]
    Source {
        slave: Slave,
        exception: ExceptionCode,
    },
}

/// Message sink used by the [`Recorder`].
#[async_trait]
pub trait Publisher: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn publish(
        &self,
        topic: &str,
        qos: u8,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), TelemetryError>;
}

const fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// MQTT connection driven by a background event loop task.
#[derive(Debug)]
pub struct MqttPublisher {
    client: AsyncClient,
    connected: watch::Receiver<bool>,
    eventloop: JoinHandle<()>,
}

impl MqttPublisher {
    /// Starts the event loop and waits a few seconds for the broker to accept
    /// the connection. A broker that is not reachable yet is only logged, the
    /// event loop keeps reconnecting.
    pub async fn connect(name: &str, config: &MqttConfig) -> Self {
        let client_id = format!("meterproxy-{}", name.to_lowercase().replace(' ', "_"));
        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(30));

        let (client, mut eventloop) = AsyncClient::new(options, 10);
        let (state, mut connected) = watch::channel(false);
        let eventloop = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        debug!("MQTT connection established");
                        state.send_replace(true);
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        state.send_replace(false);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!("MQTT event loop error: {err}");
                        state.send_replace(false);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        let broker = format!("{}:{}", config.host, config.port);
        match tokio::time::timeout(CONNECT_TIMEOUT, connected.wait_for(|up| *up)).await {
            Ok(Ok(_)) => info!("Connected to MQTT broker {broker}"),
            Ok(Err(_)) | Err(_) => warn!("Unable to connect to the MQTT broker {broker}"),
        }

        Self {
            client,
            connected,
            eventloop,
        }
    }
}

impl Drop for MqttPublisher {
    fn drop(&mut self) {
        self.eventloop.abort();
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    async fn publish(
        &self,
        topic: &str,
        qos: u8,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), TelemetryError> {
        self.client
            .publish(topic, qos_from_u8(qos), retain, payload)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Field {
    name: String,
    idx: u16,
    units: String,
    uid: String,
    topic: String,
}

impl Field {
    fn new(field: &RecordField, name: &str, topic_prefix: &str) -> Self {
        let uid = field.name.to_lowercase().replace(' ', "_");
        let topic = format!("{topic_prefix}/{name}/{uid}/state");
        Self {
            name: field.name.clone(),
            idx: field.idx,
            units: field.units.clone(),
            uid,
            topic,
        }
    }
}

#[derive(Debug, Serialize)]
struct DiscoveryMessage<'a> {
    name: String,
    unique_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<&'static str>,
    state_topic: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<&'a str>,
}

/// Reads the configured fields from the store and publishes them.
pub struct Recorder {
    name: String,
    qos: u8,
    discovery_prefix: String,
    source: Slave,
    fields: Vec<Field>,
    store: Arc<RegisterStore>,
    publisher: Arc<dyn Publisher>,
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder")
            .field("name", &self.name)
            .field("qos", &self.qos)
            .field("discovery_prefix", &self.discovery_prefix)
            .field("source", &self.source)
            .field("fields", &self.fields)
            .finish_non_exhaustive()
    }
}

impl Recorder {
    pub fn new(
        name: impl Into<String>,
        mqtt: &MqttConfig,
        source: &SourceConfig,
        store: Arc<RegisterStore>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let name = name.into();
        let fields = source
            .fields
            .iter()
            .map(|field| Field::new(field, &name, &mqtt.topic_prefix))
            .collect();
        Self {
            name,
            qos: mqtt.qos,
            discovery_prefix: mqtt.hassdiscovery_prefix.clone(),
            source: Slave(source.device_id),
            fields,
            store,
            publisher,
        }
    }

    /// Publishes the Home Assistant discovery message of every field.
    pub async fn announce(&self) {
        if !self.publisher.is_connected() {
            debug!("Not connected, skipping discovery announcement");
            return;
        }
        for field in &self.fields {
            let message = DiscoveryMessage {
                name: format!("{} {}", self.name, field.name),
                unique_id: &field.uid,
                icon: matches!(field.units.as_str(), "W" | "kWh").then_some("hass:flash"),
                state_topic: &field.topic,
                unit_of_measurement: (!field.units.is_empty()).then_some(field.units.as_str()),
            };
            let payload = match serde_json::to_vec(&message) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!("Unable to encode discovery message for {}: {err}", field.name);
                    continue;
                }
            };
            let topic = format!(
                "{}/sensor/{}/{}/config",
                self.discovery_prefix, self.name, field.idx
            );
            if let Err(err) = self.publisher.publish(&topic, self.qos, true, payload).await {
                warn!("Unable to announce {}: {err}", field.name);
            }
        }
    }

    /// Publishes the current value of every field.
    ///
    /// Fails only if the source device has no input register bank.
    pub async fn execute(&self) -> Result<(), TelemetryError> {
        let bank = self
            .store
            .bank(self.source, FunctionCode::ReadInputRegisters)
            .map_err(|exception| TelemetryError::Source {
                slave: self.source,
                exception,
            })?;
        if !self.publisher.is_connected() {
            debug!("Not connected, skipping publishing");
            return Ok(());
        }
        for field in &self.fields {
            let data = match bank.read(field.idx, 2) {
                Ok(data) => data,
                Err(err) => {
                    warn!("Unable to access index {}: {err}", field.idx);
                    continue;
                }
            };
            let Some(value) = decode_f32(&data) else {
                continue;
            };
            let payload = format!("{value:.2}").into_bytes();
            if let Err(err) = self
                .publisher
                .publish(&field.topic, self.qos, true, payload)
                .await
            {
                warn!("Unable to publish {}: {err}", field.name);
            }
        }
        Ok(())
    }

    /// Announces the fields, then publishes them every [`PUBLISH_INTERVAL`]
    /// until the source device becomes unavailable.
    pub async fn run(self) -> TelemetryError {
        self.announce().await;
        loop {
            if let Err(err) = self.execute().await {
                warn!("Recording stopped: {err}");
                return err;
            }
            tokio::time::sleep(PUBLISH_INTERVAL).await;
        }
    }
}

/// Decodes the `f32` of a two register read, skipping the byte count.
fn decode_f32(data: &[u8]) -> Option<f32> {
    let raw: [u8; 4] = data.get(1..5)?.try_into().ok()?;
    Some(f32::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    };

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct PublishCall {
        topic: String,
        qos: u8,
        retain: bool,
        payload: Vec<u8>,
    }

    #[derive(Debug, Default)]
    struct FakePublisher {
        connected: AtomicBool,
        publishes: Mutex<Vec<PublishCall>>,
    }

    impl FakePublisher {
        fn connected(connected: bool) -> Arc<Self> {
            let publisher = Self::default();
            publisher.connected.store(connected, Ordering::SeqCst);
            Arc::new(publisher)
        }

        fn publishes(&self) -> Vec<PublishCall> {
            self.publishes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Publisher for FakePublisher {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn publish(
            &self,
            topic: &str,
            qos: u8,
            retain: bool,
            payload: Vec<u8>,
        ) -> Result<(), TelemetryError> {
            self.publishes.lock().unwrap().push(PublishCall {
                topic: topic.to_owned(),
                qos,
                retain,
                payload,
            });
            Ok(())
        }
    }

    fn mqtt_config() -> MqttConfig {
        MqttConfig {
            host: "localhost".into(),
            port: 1883,
            qos: 1,
            topic_prefix: "prefix".into(),
            hassdiscovery_prefix: "ha".into(),
        }
    }

    fn recorder(publisher: Arc<FakePublisher>, value: f32) -> Recorder {
        let store = Arc::new(RegisterStore::new());
        store.register_device(Slave(1)).unwrap();
        store
            .bank(Slave(1), FunctionCode::ReadInputRegisters)
            .unwrap()
            .write(0, 2, &value.to_be_bytes())
            .unwrap();
        let source = SourceConfig {
            device_id: 1,
            fields: vec![RecordField {
                name: "Power".into(),
                idx: 0,
                units: "W".into(),
            }],
        };
        Recorder::new("TestDevice", &mqtt_config(), &source, store, publisher)
    }

    #[tokio::test]
    async fn execute_publishes_when_connected() {
        let publisher = FakePublisher::connected(true);
        let recorder = recorder(Arc::clone(&publisher), 12.34);
        recorder.execute().await.unwrap();

        let publishes = publisher.publishes();
        assert_eq!(
            publishes,
            vec![PublishCall {
                topic: "prefix/TestDevice/power/state".into(),
                qos: 1,
                retain: true,
                payload: b"12.34".to_vec(),
            }]
        );
    }

    #[tokio::test]
    async fn execute_skips_when_disconnected() {
        let publisher = FakePublisher::connected(false);
        let recorder = recorder(Arc::clone(&publisher), 45.67);
        recorder.execute().await.unwrap();
        assert!(publisher.publishes().is_empty());
    }

    #[tokio::test]
    async fn announce_only_when_connected() {
        let publisher = FakePublisher::connected(false);
        let recorder = recorder(Arc::clone(&publisher), 0.0);
        recorder.announce().await;
        assert!(publisher.publishes().is_empty());

        publisher.connected.store(true, Ordering::SeqCst);
        recorder.announce().await;
        let publishes = publisher.publishes();
        assert_eq!(publishes.len(), 1);
        assert_eq!(publishes[0].topic, "ha/sensor/TestDevice/0/config");
        assert!(publishes[0].retain);

        let payload = String::from_utf8(publishes[0].payload.clone()).unwrap();
        for want in [
            r#""name":"TestDevice Power""#,
            r#""unique_id":"power""#,
            r#""state_topic":"prefix/TestDevice/power/state""#,
            r#""icon":"hass:flash""#,
            r#""unit_of_measurement":"W""#,
        ] {
            assert!(payload.contains(want), "{payload} lacks {want}");
        }
    }

    #[tokio::test]
    async fn fail_without_source_device() {
        let publisher = FakePublisher::connected(true);
        let source = SourceConfig {
            device_id: 9,
            fields: vec![],
        };
        let recorder = Recorder::new(
            "x",
            &mqtt_config(),
            &source,
            Arc::new(RegisterStore::new()),
            publisher,
        );
        assert!(matches!(
            recorder.execute().await,
            Err(TelemetryError::Source {
                exception: ExceptionCode::UnknownDevice,
                ..
            })
        ));
    }

    #[test]
    fn debug_output_omits_publisher() {
        let recorder = recorder(FakePublisher::connected(true), 1.0);
        let text = format!("{recorder:?}");
        assert!(text.starts_with("Recorder {"));
        assert!(text.contains("\"TestDevice\""));
        assert!(text.contains("power"));
        assert!(!text.contains("publisher"));
    }

    #[test]
    fn field_uid_and_topic() {
        let field = Field::new(
            &RecordField {
                name: "Total Import Energy".into(),
                idx: 72,
                units: "kWh".into(),
            },
            "Meter",
            "home",
        );
        assert_eq!(field.uid, "total_import_energy");
        assert_eq!(field.topic, "home/Meter/total_import_energy/state");
    }
}
