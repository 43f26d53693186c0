//! Advertisement processing: admission, decryption and parsing.
//!
//! The pipeline owns the [`DeviceRegistry`] and is driven sequentially by the
//! run loop, so per-device state is never mutated concurrently. Publishing is
//! left to the caller through the returned [`Delivery`] values.

use crate::crypto::{self, DecryptError};
use crate::device::{DeviceRegistry, DeviceState};
use crate::mac_address::MacAddress;
use crate::measurement::{Measurement, RSSI};
use crate::parser;
use crate::publish::Delivery;
use std::time::Instant;
use tracing::{debug, info, warn};

/// BTHome 16-bit service UUID.
pub const BTHOME_UUID: u16 = 0xFCD2;

/// Protocol version carried in the top three bits of the header byte.
const BTHOME_VERSION: u8 = 0b010;
const ENCRYPTION_FLAG: u8 = 0b1;

/// One received advertisement, as delivered by a scanner backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: MacAddress,
    /// Service data entries keyed by 16-bit service UUID.
    pub service_data: Vec<(u16, Vec<u8>)>,
    /// Signal strength in dBm.
    pub rssi: i16,
}

/// Turns advertisements into deliveries for the publisher.
#[derive(Debug)]
pub struct Pipeline {
    registry: DeviceRegistry,
    measurements_as_info: bool,
}

impl Pipeline {
    pub fn new(registry: DeviceRegistry) -> Self {
        Self {
            registry,
            measurements_as_info: false,
        }
    }

    /// Log decoded measurements at INFO instead of DEBUG.
    pub fn with_measurements_as_info(mut self, as_info: bool) -> Self {
        self.measurements_as_info = as_info;
        self
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Process one advertisement, returning one delivery per decoded frame.
    pub fn process(&mut self, advertisement: &Advertisement) -> Vec<Delivery> {
        self.process_at(advertisement, Instant::now())
    }

    /// [`Pipeline::process`] with an explicit reception time.
    pub fn process_at(&mut self, advertisement: &Advertisement, now: Instant) -> Vec<Delivery> {
        let address = advertisement.address;
        if advertisement.service_data.is_empty() {
            return Vec::new();
        }
        debug!("Detected advertising BLE device {address}.");
        if !self.registry.accepts(&address) {
            debug!("Skipping unwanted BLE device {address}.");
            return Vec::new();
        }

        let mut deliveries = Vec::new();
        for (uuid, data) in &advertisement.service_data {
            if *uuid != BTHOME_UUID {
                continue;
            }
            let Some(&header) = data.first() else {
                continue;
            };
            if header >> 5 != BTHOME_VERSION {
                debug!("Skipping non BTHome v2 frame from {address} (header 0x{header:02X}).");
                continue;
            }
            let Some(state) = self.registry.resolve(address) else {
                continue;
            };
            let Some(payload) = open_frame(state, header, data) else {
                continue;
            };

            let Some(mut measurements) = parser::parse_at(state, &payload, now) else {
                warn!("BLE device {address} does not report any valid BTHome v2 data.");
                continue;
            };
            measurements.insert(
                RSSI,
                Measurement::numeric(f64::from(advertisement.rssi), Some("dBm")),
            );
            if self.measurements_as_info {
                info!("Data from device {address}: {measurements}.");
            } else {
                debug!("Data from device {address}: {measurements}.");
            }

            deliveries.push(Delivery {
                device: address,
                promiscuous: state.promiscuous,
                brokers: state.brokers.clone(),
                measurements,
            });
        }
        deliveries
    }
}

/// Return the plaintext payload of a frame, or `None` if it must be dropped.
fn open_frame(state: &mut DeviceState, header: u8, data: &[u8]) -> Option<Vec<u8>> {
    if header & ENCRYPTION_FLAG == 0 {
        let payload = &data[1..];
        if state.deduplicate && state.last_plaintext.as_deref() == Some(payload) {
            debug!("Skipping repeated payload from {}.", state.address);
            return None;
        }
        state.last_plaintext = Some(payload.to_vec());
        return Some(payload.to_vec());
    }

    match crypto::decrypt(state, data) {
        Ok(payload) => Some(payload),
        Err(e @ (DecryptError::Duplicate | DecryptError::Replay { .. })) => {
            debug!("Frame from {} dropped: {e}.", state.address);
            None
        }
        Err(e) => {
            debug!("Cannot decrypt frame from {}: {e}.", state.address);
            None
        }
    }
}
