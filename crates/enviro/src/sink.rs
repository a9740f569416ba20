//! The delivery seam shared by the MQTT publisher and both stores.

use async_trait::async_trait;

use crate::error::DeliveryError;
use crate::reading::Reading;

/// A delivery target for readings.
///
/// Implementations report failures instead of logging them; the sampling
/// loop decides what a failure means.
#[async_trait]
pub trait Sink: Send {
    /// Short name used in log lines.
    fn name(&self) -> &'static str;

    async fn deliver(&mut self, reading: &Reading) -> Result<(), DeliveryError>;
}
