use std::ops::RangeInclusive;

use log::{debug, info};
use serde::Serialize;
use thiserror::Error;

use crate::config::{Config, MAX_PRIMARY_ADDRESS};
use crate::mbus::{DecodedFrame, MeterBus, TransportError};

pub const SCAN_ADDRESSES: RangeInclusive<u8> = 0..=MAX_PRIMARY_ADDRESS;

/// A device that answered during a scan
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ScanHit {
    pub primary_address: u8,
    pub serial_number: u32,
    pub manufacturer: String,
    pub version: u8,
    pub device_type: String,
}

impl ScanHit {
    fn from_frame(address: u8, frame: &DecodedFrame) -> Self {
        return ScanHit {
            primary_address: address,
            serial_number: frame.serial_number,
            manufacturer: frame.manufacturer.clone(),
            version: frame.version,
            device_type: frame.device_type.clone(),
        };
    }
}

/// Probes the addresses one after another on the bridge wide device
pub async fn scan(config: &Config, bus: &dyn MeterBus, addresses: RangeInclusive<u8>) -> Vec<ScanHit> {
    info!("Scanning {} for devices, this will take a while", config.device);
    let mut hits = Vec::new();

    for address in addresses {
        debug!("Checking address {address}");
        match bus.fetch(&config.device, address, config.scan_timeout()).await {
            Ok(frame) => {
                let hit = ScanHit::from_frame(address, &frame);
                info!(
                    "Found device primary_address={} serial_number={} manufacturer={} version={} device_type={}",
                    hit.primary_address, hit.serial_number, hit.manufacturer, hit.version, hit.device_type
                );
                hits.push(hit);
            }
            Err(e) => {
                debug!("No device at address {address}: {e}");
            }
        }
    }

    info!("Scan finished, found {} devices", hits.len());
    return hits;
}

#[derive(Error, Debug)]
pub enum PrintError {
    #[error(transparent)]
    Fetch(#[from] TransportError),
    #[error("Failed to encode frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decoded frame as pretty JSON followed by the raw telegram in hex
pub async fn raw_frame_report(config: &Config, bus: &dyn MeterBus, address: u8) -> Result<String, PrintError> {
    let frame = bus.fetch(&config.device, address, config.read_timeout()).await?;
    let json = serde_json::to_string_pretty(&frame)?;
    return Ok(format!("{json}\nraw: {}", hex::encode(&frame.raw)));
}
