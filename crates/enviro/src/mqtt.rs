//! MQTT publisher.  Readings go out as JSON on `<topic>/<suffix>`, QoS 0.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::config::MqttConfig;
use crate::error::DeliveryError;
use crate::reading::Reading;
use crate::sink::Sink;

/// Requests that may be queued before `try_publish` starts refusing.
const REQUEST_CAPACITY: usize = 10;

/// Topic suffix used by the sampling loop.
pub const SLOW_SUFFIX: &str = "slow";

pub struct Publisher {
    client: AsyncClient,
    topic: String,
    suffix: &'static str,
}

impl Publisher {
    /// Connect to the broker and wait for its CONNACK.
    ///
    /// Returns `None` (publishing disabled) when the broker refuses or does
    /// not answer within `connect_timeout`.  On success the event loop is
    /// handed to a background task that keeps the session alive.
    pub async fn connect(cfg: &MqttConfig, serial: &str) -> Option<Self> {
        let client_id = client_id(serial);
        let mut options = MqttOptions::new(&client_id, &cfg.host, cfg.port);
        options.set_keep_alive(Duration::from_secs(cfg.keep_alive));
        if let Some(user) = &cfg.username {
            options.set_credentials(user, cfg.password.as_deref().unwrap_or_default());
        }

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        let wait = Duration::from_secs(cfg.connect_timeout);
        match timeout(wait, wait_for_connack(&mut eventloop)).await {
            Ok(Ok(())) => {
                info!(host = %cfg.host, port = cfg.port, client_id = %client_id, "mqtt connected");
            }
            Ok(Err(e)) => {
                warn!(host = %cfg.host, port = cfg.port, "mqtt connect failed, publishing disabled: {e}");
                return None;
            }
            Err(_) => {
                warn!(
                    host = %cfg.host,
                    port = cfg.port,
                    timeout_sec = cfg.connect_timeout,
                    "mqtt broker did not answer, publishing disabled"
                );
                return None;
            }
        }

        tokio::spawn(poll_forever(eventloop));

        Some(Self::new(client, &cfg.topic))
    }

    fn new(client: AsyncClient, topic: &str) -> Self {
        Self {
            client,
            topic: topic.to_string(),
            suffix: SLOW_SUFFIX,
        }
    }

    /// Enqueue `reading` on `<topic>/<suffix>`.  Never waits on the network.
    pub fn publish(&self, suffix: &str, reading: &Reading) -> Result<(), DeliveryError> {
        let topic = topic_for(&self.topic, suffix);
        let body = payload(reading)?;
        self.client
            .try_publish(topic.as_str(), QoS::AtMostOnce, false, body)?;
        tracing::debug!(topic = %topic, "published reading");
        Ok(())
    }
}

#[async_trait]
impl Sink for Publisher {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn deliver(&mut self, reading: &Reading) -> Result<(), DeliveryError> {
        self.publish(self.suffix, reading)
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), ConnectionError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(_)) = eventloop.poll().await? {
            return Ok(());
        }
    }
}

/// Drive the event loop for the life of the process.  rumqttc reconnects on
/// the next poll after an error.
async fn poll_forever(mut eventloop: EventLoop) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => info!("mqtt reconnected"),
            Ok(Event::Incoming(Packet::Disconnect)) => warn!("mqtt disconnected"),
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Topic / payload / identity helpers
// ---------------------------------------------------------------------------

pub(crate) fn topic_for(base: &str, suffix: &str) -> String {
    format!("{base}/{suffix}")
}

pub(crate) fn payload(reading: &Reading) -> Result<Vec<u8>, DeliveryError> {
    Ok(serde_json::to_vec(reading)?)
}

pub(crate) fn client_id(serial: &str) -> String {
    format!("raspi-{serial}")
}

/// Extract the board serial from `/proc/cpuinfo` contents
/// (`Serial\t\t: 10000000abcdef01`).
pub(crate) fn parse_serial(cpuinfo: &str) -> Option<&str> {
    cpuinfo.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() != "Serial" {
            return None;
        }
        let value = value.trim();
        (!value.is_empty()).then_some(value)
    })
}

/// The device serial, or `"unknown"` when it cannot be read.
pub fn read_device_serial(cpuinfo_path: &Path) -> String {
    match std::fs::read_to_string(cpuinfo_path) {
        Ok(text) => match parse_serial(&text) {
            Some(serial) => serial.to_string(),
            None => {
                warn!(path = %cpuinfo_path.display(), "no Serial line, using 'unknown'");
                "unknown".to_string()
            }
        },
        Err(e) => {
            warn!(path = %cpuinfo_path.display(), "cannot read device serial, using 'unknown': {e}");
            "unknown".to_string()
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::sample_reading;

    const CPUINFO: &str = "\
processor\t: 0
model name\t: ARMv7 Processor rev 4 (v7l)
BogoMIPS\t: 38.40

Hardware\t: BCM2835
Revision\t: a02082
Serial\t\t: 00000000a1b2c3d4
Model\t\t: Raspberry Pi 3 Model B Rev 1.2
";

    // -- identity -----------------------------------------------------------

    #[test]
    fn parse_serial_from_cpuinfo() {
        assert_eq!(parse_serial(CPUINFO), Some("00000000a1b2c3d4"));
    }

    #[test]
    fn parse_serial_missing() {
        assert_eq!(parse_serial("processor\t: 0\nHardware\t: BCM2835\n"), None);
        assert_eq!(parse_serial(""), None);
    }

    #[test]
    fn parse_serial_empty_value() {
        assert_eq!(parse_serial("Serial\t\t: \n"), None);
    }

    #[test]
    fn parse_serial_ignores_similar_keys() {
        assert_eq!(parse_serial("SerialNumber : 42\nSerial : 7\n"), Some("7"));
    }

    #[test]
    fn read_device_serial_falls_back_to_unknown() {
        assert_eq!(read_device_serial(Path::new("/nonexistent/cpuinfo")), "unknown");
    }

    #[test]
    fn client_id_prefixed() {
        assert_eq!(client_id("00000000a1b2c3d4"), "raspi-00000000a1b2c3d4");
    }

    // -- payload --------------------------------------------------------------

    #[test]
    fn topic_has_suffix() {
        assert_eq!(topic_for("enviroplus", SLOW_SUFFIX), "enviroplus/slow");
    }

    #[test]
    fn payload_uses_reading_field_names() {
        let body = payload(&sample_reading()).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();

        for field in ["timestamp", "temperature", "pressure", "humidity", "oxidised", "reduced", "nh3", "lux"] {
            assert!(v.get(field).is_some(), "missing {field}");
        }
        assert_eq!(v["reduced"], 210.5);
    }

    // -- publisher ------------------------------------------------------------

    #[tokio::test]
    async fn deliver_enqueues_without_broker() {
        let options = MqttOptions::new("raspi-test", "127.0.0.1", 1883);
        let (client, _eventloop) = AsyncClient::new(options, 2);
        let mut publisher = Publisher::new(client, "enviroplus");

        let r = sample_reading();
        publisher.deliver(&r).await.unwrap();
        publisher.deliver(&r).await.unwrap();
        // request queue full and nobody polling
        assert!(matches!(
            publisher.deliver(&r).await,
            Err(DeliveryError::Mqtt(_))
        ));
    }

    #[tokio::test]
    async fn connect_refused_disables_publishing() {
        let cfg = MqttConfig {
            host: "127.0.0.1".into(),
            port: 1,
            connect_timeout: 2,
            ..MqttConfig::default()
        };
        assert!(Publisher::connect(&cfg, "test").await.is_none());
    }
}
