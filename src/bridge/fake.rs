use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::Receiver;
use tokio::sync::Notify;

use crate::config::Config;
use crate::mbus::link::decode_long_frame;
use crate::mbus::link::tests::{long_frame, water_meter_data};
use crate::mbus::{DecodedFrame, MeterBus, ReadError, TransportError};
use crate::mqtt::Transmission;

/// Scripted bus, unknown addresses behave like absent devices
#[derive(Default)]
pub(crate) struct FakeBus {
    frames: HashMap<u8, Vec<u8>>,
    failures: Mutex<HashMap<u8, usize>>,
    gates: HashMap<u8, Arc<Notify>>,
    calls: Mutex<Vec<(String, u8)>>,
}

impl FakeBus {
    pub(crate) fn with_water_meters(addresses: &[u8]) -> Self {
        let mut bus = FakeBus::default();
        for address in addresses {
            bus.frames.insert(*address, long_frame(*address, &water_meter_data()));
        }
        return bus;
    }

    pub(crate) fn with_frame(mut self, address: u8, user_data: &[u8]) -> Self {
        self.frames.insert(address, long_frame(address, user_data));
        return self;
    }

    /// The next `times` polls of the address time out
    pub(crate) fn failing(self, address: u8, times: usize) -> Self {
        self.failures.lock().unwrap().insert(address, times);
        return self;
    }

    /// Polls of the address block until the gate is notified
    pub(crate) fn gated(mut self, address: u8, gate: Arc<Notify>) -> Self {
        self.gates.insert(address, gate);
        return self;
    }

    pub(crate) fn calls(&self) -> Vec<(String, u8)> {
        return self.calls.lock().unwrap().clone();
    }

    pub(crate) fn calls_to(&self, address: u8) -> usize {
        return self.calls.lock().unwrap().iter().filter(|(_, a)| *a == address).count();
    }
}

#[async_trait]
impl MeterBus for FakeBus {
    async fn fetch(&self, device: &str, address: u8, timeout: Duration) -> Result<DecodedFrame, TransportError> {
        self.calls.lock().unwrap().push((device.to_string(), address));

        if let Some(gate) = self.gates.get(&address) {
            gate.notified().await;
        }

        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&address) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(TransportError::AckRead(ReadError::Timeout(timeout)));
                }
            }
        }

        return match self.frames.get(&address) {
            Some(raw) => decode_long_frame(raw, address).map_err(|e| TransportError::FrameRead(ReadError::Decode(e))),
            None => Err(TransportError::AckRead(ReadError::Timeout(timeout))),
        };
    }
}

pub(crate) fn water_config(autodiscover: bool) -> Config {
    let contents = format!(
        r#"
servers:
  - tcp://broker.local:1883
topic_prefix: home/meters
device: /dev/ttyAMA0
interval_sec: 1
autodiscover:
  enabled: {autodiscover}
meters:
  - address: 5
    template: water
    name: kitchen
  - address: 7
    template: water
    name: garden
    device: /dev/ttyUSB1
templates:
  water:
    - publish: true
      name: volume
      device_class: water
      unit: m³
    - publish: false
      name: flowrate
"#
    );
    return Config::parse(&contents).unwrap();
}

pub(crate) fn drain(rx: &mut Receiver<Transmission>) -> Vec<Transmission> {
    let mut transmissions = Vec::new();
    while let Ok(t) = rx.try_recv() {
        transmissions.push(t);
    }
    return transmissions;
}
