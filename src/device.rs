//! Per-device state and the device registry.
//!
//! Each configured BTHome device owns a [`DeviceState`] holding its key, its
//! broker targets and the replay/duplicate bookkeeping updated by decryption
//! and parsing. The [`DeviceRegistry`] maps normalized addresses to states and
//! optionally admits unknown devices from a promiscuous template.

use crate::mac_address::MacAddress;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Reserved configuration address admitting any unlisted device.
pub const PROMISCUOUS: &str = "PROMISCUOUS";

/// Length of a BTHome AES-128 key.
pub const KEY_LEN: usize = 16;

/// One MQTT broker where measurements are published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerTarget {
    pub host: String,
    pub port: u16,
    /// Empty means no authentication.
    pub username: String,
    pub password: String,
    pub use_tls: bool,
    /// Accept any server certificate. Only meaningful with `use_tls`.
    pub allow_insecure_tls: bool,
    pub topics: Vec<String>,
}

impl BrokerTarget {
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }
}

impl Default for BrokerTarget {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8883,
            username: String::new(),
            password: String::new(),
            use_tls: true,
            allow_insecure_tls: false,
            topics: Vec::new(),
        }
    }
}

/// State of one BTHome device.
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub address: MacAddress,
    /// Decryption key; `None` refuses every encrypted frame.
    pub key: Option<[u8; KEY_LEN]>,
    /// Suppress repeated frames and repeated packet ids.
    pub deduplicate: bool,
    pub brokers: Arc<[BrokerTarget]>,
    /// Last accepted encryption counter.
    pub counter: Option<u32>,
    pub last_ciphertext: Option<Vec<u8>>,
    pub last_plaintext: Option<Vec<u8>>,
    pub last_packet_id: Option<u8>,
    pub last_accepted_at: Option<Instant>,
    /// Admitted from the promiscuous template rather than configured.
    pub promiscuous: bool,
}

impl DeviceState {
    pub fn new(address: MacAddress, brokers: Vec<BrokerTarget>) -> Self {
        Self {
            address,
            key: None,
            deduplicate: true,
            brokers: brokers.into(),
            counter: None,
            last_ciphertext: None,
            last_plaintext: None,
            last_packet_id: None,
            last_accepted_at: None,
            promiscuous: false,
        }
    }

    pub fn with_key(mut self, key: [u8; KEY_LEN]) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_deduplicate(mut self, deduplicate: bool) -> Self {
        self.deduplicate = deduplicate;
        self
    }

    /// Clone the configuration of a template for a newly seen device.
    ///
    /// Replay and duplicate state is not inherited.
    fn admit_from(template: &DeviceState, address: MacAddress) -> Self {
        Self {
            address,
            key: template.key,
            deduplicate: template.deduplicate,
            brokers: Arc::clone(&template.brokers),
            counter: None,
            last_ciphertext: None,
            last_plaintext: None,
            last_packet_id: None,
            last_accepted_at: None,
            promiscuous: true,
        }
    }
}

/// Registry of known devices, keyed by normalized address.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<MacAddress, DeviceState>,
    template: Option<DeviceState>,
}

/// Drop topic-less brokers; `None` if no broker is left.
fn retain_valid_brokers(state: &DeviceState, name: &str) -> Option<Arc<[BrokerTarget]>> {
    let brokers: Vec<BrokerTarget> = state
        .brokers
        .iter()
        .filter(|broker| {
            let valid = !broker.topics.is_empty();
            if !valid {
                warn!(
                    "Broker \"{}\" for device \"{}\" not added, as does not have any valid topic.",
                    broker.host, name
                );
            }
            valid
        })
        .cloned()
        .collect();

    if brokers.is_empty() {
        warn!("Device \"{name}\" not added, as does not have any valid broker.");
        None
    } else {
        Some(brokers.into())
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a configured device. Devices without a valid broker are refused.
    ///
    /// Returns whether the device was retained.
    pub fn insert(&mut self, mut state: DeviceState) -> bool {
        let name = state.address.compact();
        match retain_valid_brokers(&state, &name) {
            Some(brokers) => {
                state.brokers = brokers;
                self.devices.insert(state.address, state);
                true
            }
            None => false,
        }
    }

    /// Install the template used to admit unlisted devices.
    ///
    /// The template's address is ignored. Returns whether it was retained.
    pub fn set_promiscuous_template(&mut self, mut template: DeviceState) -> bool {
        match retain_valid_brokers(&template, PROMISCUOUS) {
            Some(brokers) => {
                template.brokers = brokers;
                self.template = Some(template);
                true
            }
            None => false,
        }
    }

    pub fn is_promiscuous(&self) -> bool {
        self.template.is_some()
    }

    /// Whether advertisements from `address` are of interest at all.
    pub fn accepts(&self, address: &MacAddress) -> bool {
        self.devices.contains_key(address) || self.template.is_some()
    }

    pub fn get(&self, address: &MacAddress) -> Option<&DeviceState> {
        self.devices.get(address)
    }

    /// Find the state of `address`, admitting it from the promiscuous
    /// template the first time an unlisted device is seen.
    pub fn resolve(&mut self, address: MacAddress) -> Option<&mut DeviceState> {
        if !self.devices.contains_key(&address) {
            let template = self.template.as_ref()?;
            debug!("Added new BLE device {address} in promiscuous mode.");
            self.devices
                .insert(address, DeviceState::admit_from(template, address));
        }
        self.devices.get_mut(&address)
    }

    /// Number of devices, not counting the promiscuous template.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// True when neither devices nor a promiscuous template are configured.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty() && self.template.is_none()
    }
}
