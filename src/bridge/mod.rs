pub mod scan;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod fake;

use std::sync::Arc;

use log::{debug, warn};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;

use crate::config::{Config, MeterConfig};
use crate::mbus::{MeterBus, TransportError};
use crate::mqtt::ha_interface::{state_topic, HaDevice, HaDiscover};
use crate::mqtt::{PublishData, Transmission};
use crate::templates::TemplateError;

pub use scheduler::{PollScheduler, TickReport};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PublishMode {
    /// Announce the eligible fields to Home Assistant
    Discovery,
    /// Publish the current values of the eligible fields
    State,
}

#[derive(Error, Debug)]
pub enum CycleError {
    #[error("Failed to fetch meter {meter}: {source}")]
    Fetch {
        meter: String,
        #[source]
        source: TransportError,
    },
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("MQTT manager is gone")]
    ChannelClosed,
}

/// What one fetch and publish cycle handed to the MQTT manager
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub published: usize,
    /// Messages thrown away because the MQTT manager was backed up
    pub dropped: usize,
    pub unmapped_records: usize,
    pub unused_descriptors: usize,
}

impl CycleReport {
    pub fn is_aligned(&self) -> bool {
        return self.unmapped_records == 0 && self.unused_descriptors == 0;
    }
}

/// Everything a poll needs, fixed once the bridge is running
pub struct BridgeContext {
    pub config: Config,
    pub bus: Arc<dyn MeterBus>,
    pub sender: Sender<Transmission>,
}

impl BridgeContext {
    pub fn new(config: Config, bus: Arc<dyn MeterBus>, sender: Sender<Transmission>) -> Self {
        return BridgeContext { config, bus, sender };
    }

    /* Never waits for the MQTT manager, a backed up channel loses the message */
    fn send(&self, transmission: Transmission) -> Result<bool, CycleError> {
        return match self.sender.try_send(transmission) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(dropped)) => {
                warn!("MQTT queue is full, dropping {:?}", dropped);
                Ok(false)
            }
            Err(TrySendError::Closed(_)) => Err(CycleError::ChannelClosed),
        };
    }

    fn count(report: &mut CycleReport, sent: bool) {
        if sent {
            report.published += 1;
        } else {
            report.dropped += 1;
        }
    }

    /// Reads one meter and hands its eligible fields to the MQTT manager in record order
    pub async fn fetch_and_publish(&self, meter: &MeterConfig, mode: PublishMode) -> Result<CycleReport, CycleError> {
        let device = self.config.meter_device(meter);
        let frame = self
            .bus
            .fetch(device, meter.address, self.config.read_timeout())
            .await
            .map_err(|source| CycleError::Fetch { meter: meter.name.clone(), source })?;

        let resolution = self.config.templates.resolve_meter(meter, &frame)?;
        let mut report = CycleReport {
            published: 0,
            dropped: 0,
            unmapped_records: resolution.unmapped_records,
            unused_descriptors: resolution.unused_descriptors,
        };

        match mode {
            PublishMode::Discovery => {
                let ha_device = HaDevice::from_frame(&meter.name, &frame);
                for field in resolution.eligible() {
                    let disc = HaDiscover::new(
                        &ha_device,
                        &meter.name,
                        &self.config.topic_prefix,
                        &self.config.autodiscover.prefix,
                        field,
                    );
                    debug!("Publishing autodiscover message to {}", disc.discover_topic);
                    let sent = self.send(Transmission::AutoDiscovery(disc))?;
                    Self::count(&mut report, sent);
                }
            }
            PublishMode::State => {
                for field in resolution.eligible() {
                    let topic = state_topic(&self.config.topic_prefix, &meter.name, &field.field.name);
                    let payload = format!("{:.6}", field.record.value);
                    debug!(
                        "Fetched new value from {} ({} {}), {} = {}",
                        meter.name, frame.manufacturer, frame.serial_number, topic, payload
                    );
                    let sent = self.send(Transmission::Publish(PublishData { topic, payload, qos: 0, retain: false }))?;
                    Self::count(&mut report, sent);
                }
            }
        }

        return Ok(report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::fake::{drain, water_config, FakeBus};
    use crate::mbus::ReadError;

    #[tokio::test]
    async fn test_state_publishes_only_eligible_fields() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let bus = Arc::new(FakeBus::with_water_meters(&[5]));
        let context = BridgeContext::new(water_config(false), bus, tx);
        let meter = context.config.meters[0].clone();

        let report = context.fetch_and_publish(&meter, PublishMode::State).await.unwrap();
        assert_eq!(report, CycleReport { published: 1, dropped: 0, unmapped_records: 0, unused_descriptors: 0 });

        let published = drain(&mut rx);
        assert_eq!(published.len(), 1);
        match &published[0] {
            Transmission::Publish(data) => {
                assert_eq!(data.topic, "home/meters/kitchen/volume/state");
                assert_eq!(data.payload, "12.500000");
                assert_eq!(data.qos, 0);
                assert!(!data.retain);
            }
            other => panic!("unexpected transmission {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_discovery_announces_eligible_fields() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let bus = Arc::new(FakeBus::with_water_meters(&[5]));
        let context = BridgeContext::new(water_config(true), bus, tx);
        let meter = context.config.meters[0].clone();

        let report = context.fetch_and_publish(&meter, PublishMode::Discovery).await.unwrap();
        assert_eq!(report.published, 1);

        let published = drain(&mut rx);
        match &published[..] {
            [Transmission::AutoDiscovery(disc)] => {
                assert_eq!(disc.discover_topic, "homeassistant/sensor/volume_12345678/config");
                assert_eq!(disc.state_topic, "home/meters/kitchen/volume/state");
                assert_eq!(disc.device.manufacturer, "ELS");
            }
            other => panic!("unexpected transmissions {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_failure_publishes_nothing() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let bus = Arc::new(FakeBus::with_water_meters(&[]));
        let context = BridgeContext::new(water_config(false), bus, tx);
        let meter = context.config.meters[0].clone();

        match context.fetch_and_publish(&meter, PublishMode::State).await {
            Err(CycleError::Fetch { meter, source }) => {
                assert_eq!(meter, "kitchen");
                assert!(matches!(source, TransportError::AckRead(ReadError::Timeout(_))));
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_uses_meter_device_override() {
        let (tx, _rx) = tokio::sync::mpsc::channel(16);
        let bus = Arc::new(FakeBus::with_water_meters(&[5, 7]));
        let context = BridgeContext::new(water_config(false), bus.clone(), tx);

        for meter in context.config.meters.clone() {
            context.fetch_and_publish(&meter, PublishMode::State).await.unwrap();
        }
        assert_eq!(
            bus.calls(),
            vec![("/dev/ttyAMA0".to_string(), 5), ("/dev/ttyUSB1".to_string(), 7)]
        );
    }

    #[tokio::test]
    async fn test_full_channel_drops_instead_of_waiting() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        tx.try_send(Transmission::Shutdown).unwrap();
        let bus = Arc::new(FakeBus::with_water_meters(&[5]));
        let context = BridgeContext::new(water_config(false), bus, tx);
        let meter = context.config.meters[0].clone();

        let report = tokio::time::timeout(
            std::time::Duration::from_millis(500),
            context.fetch_and_publish(&meter, PublishMode::State),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(report.published, 0);
        assert_eq!(report.dropped, 1);

        let queued = drain(&mut rx);
        assert_eq!(queued.len(), 1);
        assert!(matches!(queued[0], Transmission::Shutdown));
    }

    #[tokio::test]
    async fn test_closed_channel() {
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        drop(rx);
        let bus = Arc::new(FakeBus::with_water_meters(&[5]));
        let context = BridgeContext::new(water_config(false), bus, tx);
        let meter = context.config.meters[0].clone();

        assert!(matches!(
            context.fetch_and_publish(&meter, PublishMode::State).await,
            Err(CycleError::ChannelClosed)
        ));
    }
}
