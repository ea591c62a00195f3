use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use thiserror::Error;
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, StopBits};

pub mod div_vif_parser;
pub mod link;
pub mod structs;
pub mod utils;

pub use link::MbusLink;
pub use structs::{DataRecord, DecodedFrame, RecordFunction};

/// Structural problems of a received telegram
#[derive(Error, Debug, PartialEq)]
pub enum FrameError {
    #[error("Frame too short ({0} bytes)")]
    TooShort(usize),
    #[error("Unexpected start byte 0x{0:02x}")]
    UnexpectedStart(u8),
    #[error("Length fields differ (0x{0:02x} != 0x{1:02x})")]
    LengthMismatch(u8, u8),
    #[error("Checksum mismatch, calculated 0x{calculated:02x} but received 0x{received:02x}")]
    Checksum { calculated: u8, received: u8 },
    #[error("Missing stop byte")]
    MissingStop,
    #[error("Expected acknowledgement but received 0x{0:02x}")]
    UnexpectedAck(u8),
    #[error("Frame is addressed from {received} instead of {expected}")]
    AddressMismatch { expected: u8, received: u8 },
    #[error("CI field 0x{0:02x} not supported")]
    UnsupportedCi(u8),
    #[error("Identification number is not BCD")]
    InvalidIdentification,
    #[error("Data record at offset {0} is truncated")]
    RecordTruncated(usize),
    #[error("DIF 0x{dif:02x} at offset {offset} not supported")]
    UnsupportedDif { dif: u8, offset: usize },
    #[error("LVAR 0x{lvar:02x} at offset {offset} not supported")]
    UnsupportedLvar { lvar: u8, offset: usize },
}

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("no answer within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Decode(#[from] FrameError),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to dial serial to device {device}: {source}")]
    Dial {
        device: String,
        #[source]
        source: tokio_serial::Error,
    },
    #[error("Failed to write {telegram}: {source}")]
    Write {
        telegram: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to set read deadline of {0:?}")]
    Deadline(Duration),
    #[error("Failed to read single char frame: {0}")]
    AckRead(#[source] ReadError),
    #[error("Failed to read single frame: {0}")]
    FrameRead(#[source] ReadError),
}

impl TransportError {
    /// True if the device simply did not answer in time, false for structural failures
    pub fn is_timeout(&self) -> bool {
        return matches!(
            self,
            TransportError::AckRead(ReadError::Timeout(_)) | TransportError::FrameRead(ReadError::Timeout(_))
        );
    }
}

/// Access to the meters on a field bus
#[async_trait]
pub trait MeterBus: Send + Sync {
    async fn fetch(&self, device: &str, address: u8, timeout: Duration) -> Result<DecodedFrame, TransportError>;
}

/// Wired M-Bus behind a serial level converter, 8E1 framing
pub struct SerialBus {
    baud_rate: u32,
    /* A serial device has a single owner, meters on the same path take turns */
    ports: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SerialBus {
    pub fn new(baud_rate: u32) -> Self {
        return SerialBus {
            baud_rate,
            ports: Mutex::new(HashMap::new()),
        };
    }

    fn port_lock(&self, device: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut ports = self.ports.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        return ports.entry(device.to_string()).or_default().clone();
    }

    /* Runs the poll while owning its device path */
    async fn exclusive<F: Future>(&self, device: &str, poll: F) -> F::Output {
        let port = self.port_lock(device);
        let _owner = port.lock().await;
        return poll.await;
    }
}

#[async_trait]
impl MeterBus for SerialBus {
    async fn fetch(&self, device: &str, address: u8, timeout: Duration) -> Result<DecodedFrame, TransportError> {
        return self
            .exclusive(device, async {
                debug!("Dialing {device} for primary address {address}");
                let stream = tokio_serial::new(device, self.baud_rate)
                    .data_bits(DataBits::Eight)
                    .parity(Parity::Even)
                    .stop_bits(StopBits::One)
                    .timeout(timeout)
                    .open_native_async()
                    .map_err(|source| TransportError::Dial { device: device.to_string(), source })?;

                let mut link = MbusLink::new(stream);
                link.request_frame(address, timeout).await
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_lock_is_shared_per_device() {
        let bus = SerialBus::new(2400);
        let a = bus.port_lock("/dev/ttyUSB0");
        let b = bus.port_lock("/dev/ttyUSB0");
        let c = bus.port_lock("/dev/ttyUSB1");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_same_device_polls_take_turns() {
        let bus = Arc::new(SerialBus::new(2400));
        let gate = Arc::new(tokio::sync::Notify::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let (bus, gate, order) = (bus.clone(), gate.clone(), order.clone());
            tokio::spawn(async move {
                bus.exclusive("/dev/ttyUSB0", async {
                    order.lock().unwrap().push("first start");
                    gate.notified().await;
                    order.lock().unwrap().push("first end");
                })
                .await
            })
        };
        while order.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }

        let second = {
            let (bus, order) = (bus.clone(), order.clone());
            tokio::spawn(async move {
                bus.exclusive("/dev/ttyUSB0", async {
                    order.lock().unwrap().push("second");
                })
                .await
            })
        };
        /* Another path is not held up by the busy one */
        bus.exclusive("/dev/ttyUSB1", async {
            order.lock().unwrap().push("other");
        })
        .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*order.lock().unwrap(), vec!["first start", "other"]);

        gate.notify_one();
        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first start", "other", "first end", "second"]);
    }

    #[tokio::test]
    async fn test_dial_failure() {
        let bus = SerialBus::new(2400);
        let err = bus.fetch("/nonexistent/tty-mbus", 1, Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, TransportError::Dial { .. }));
        assert!(!err.is_timeout());
    }
}
