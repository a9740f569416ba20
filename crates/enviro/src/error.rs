//! Typed errors for the sensor, delivery and clock paths.
//!
//! Startup code works in `anyhow::Result`; these types exist so the sampling
//! loop can tell a sensor glitch from a sink failure and log each with the
//! right context.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor read timed out: {0}")]
    Timeout(String),
    #[error("sensor i/o failed on {what}: {source}")]
    Io {
        what: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse {what}: {detail}")]
    Parse { what: String, detail: String },
    #[error("bad frame checksum: expected {expected:#06x}, got {actual:#06x}")]
    Checksum { expected: u16, actual: u16 },
    #[error("sensor unavailable: {0}")]
    Unavailable(String),
}

impl SensorError {
    pub fn io(what: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            what: what.into(),
            source,
        }
    }

    pub fn parse(what: impl Into<String>, detail: impl ToString) -> Self {
        Self::Parse {
            what: what.into(),
            detail: detail.to_string(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("mqtt publish failed: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0} timed out after {1}s")]
    Timeout(&'static str, u64),
    #[error("payload serialisation failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("timestamp formatting failed: {0}")]
    Timestamp(#[from] time::error::Format),
}

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("last timestamp lookup failed: {0}")]
    Lookup(#[from] sqlx::Error),
    #[error("unrecognised stored timestamp {0:?}")]
    Unparseable(String),
}
