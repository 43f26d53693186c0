//! Device configuration file loading.
//!
//! The file is TOML with one table per device under `devices`, keyed by
//! address (any of the usual separators) or by `PROMISCUOUS`:
//!
//! ```toml
//! [devices."A4:C1:38:00:11:22"]
//! key = "231d39c1d7cc1ab1aee224cd096db932"
//! deduplicate = true
//!
//! [[devices."A4:C1:38:00:11:22".brokers]]
//! host = "mqtt.example.org"
//! port = 8883
//! user = "bthome"
//! password = "secret"
//! encrypt = true
//! allow-insecure = false
//! topics = ["home/livingroom"]
//! ```

use crate::device::{BrokerTarget, DeviceRegistry, DeviceState, KEY_LEN, PROMISCUOUS};
use crate::mac_address::MacAddress;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "bthome_devices.toml";

/// Fatal configuration problems.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read \"{path}\" configuration file: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot parse configuration file (bad syntax?): {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no valid BTHome devices to listen to")]
    NoDevices,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    devices: BTreeMap<String, DeviceConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeviceConfig {
    key: Option<String>,
    #[serde(default = "default_true")]
    deduplicate: bool,
    #[serde(default)]
    brokers: Vec<BrokerConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BrokerConfig {
    #[serde(default = "default_host", alias = "hostname")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    user: String,
    #[serde(default)]
    password: String,
    #[serde(default = "default_true")]
    encrypt: bool,
    #[serde(default, rename = "allow-insecure", alias = "insecure")]
    allow_insecure: bool,
    #[serde(default)]
    topics: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    BrokerTarget::default().host
}

fn default_port() -> u16 {
    BrokerTarget::default().port
}

/// Read and validate the configuration file at `path`.
pub fn load(path: &Path) -> Result<DeviceRegistry, ConfigError> {
    info!("Reading \"{}\" configuration file.", path.display());
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let registry = from_str(&content)?;
    info!(
        "Configuration file \"{}\" successfully parsed.",
        path.display()
    );
    Ok(registry)
}

/// Build a device registry from configuration text.
pub fn from_str(content: &str) -> Result<DeviceRegistry, ConfigError> {
    let config: ConfigFile = toml::from_str(content.trim_start_matches('\u{feff}'))?;

    let mut registry = DeviceRegistry::new();
    for (address, device) in config.devices {
        let promiscuous = is_promiscuous(&address);
        let mac = if promiscuous {
            MacAddress::default()
        } else {
            match address.parse::<MacAddress>() {
                Ok(mac) => mac,
                Err(e) => {
                    warn!("Device \"{address}\" not added, invalid address: {e}.");
                    continue;
                }
            }
        };
        let name = if promiscuous {
            PROMISCUOUS.to_string()
        } else {
            mac.compact()
        };

        let mut state = DeviceState::new(mac, brokers(&name, device.brokers))
            .with_deduplicate(device.deduplicate);
        if let Some(key) = device.key.as_deref().and_then(|key| parse_key(&name, key)) {
            state = state.with_key(key);
        }

        if promiscuous {
            registry.set_promiscuous_template(state);
        } else {
            registry.insert(state);
        }
    }

    if registry.is_empty() {
        error!("No valid BTHome devices to listen to.");
        return Err(ConfigError::NoDevices);
    }
    Ok(registry)
}

fn is_promiscuous(address: &str) -> bool {
    address.trim().eq_ignore_ascii_case(PROMISCUOUS)
}

/// Decode a hex key. An empty key means no key; a malformed one is
/// reported and disables decryption for the device.
fn parse_key(device: &str, key: &str) -> Option<[u8; KEY_LEN]> {
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    let mut bytes = [0u8; KEY_LEN];
    match hex::decode_to_slice(key, &mut bytes) {
        Ok(()) => Some(bytes),
        Err(e) => {
            error!("Decrypting key for device \"{device}\" not 128 bits in length ({e}).");
            None
        }
    }
}

/// Convert broker tables, dropping empty topics. Brokers left without
/// topics are filtered by the registry.
fn brokers(device: &str, configs: Vec<BrokerConfig>) -> Vec<BrokerTarget> {
    configs
        .into_iter()
        .map(|broker| {
            let topics = broker
                .topics
                .into_iter()
                .filter(|topic| {
                    let valid = !topic.is_empty();
                    if !valid {
                        warn!(
                            "Invalid empty topic for broker \"{}\" for device \"{device}\".",
                            broker.host
                        );
                    }
                    valid
                })
                .collect();
            BrokerTarget {
                allow_insecure_tls: broker.encrypt && broker.allow_insecure,
                host: broker.host,
                port: broker.port,
                username: broker.user,
                password: broker.password,
                use_tls: broker.encrypt,
                topics,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TEST_KEY, TEST_MAC};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const FULL: &str = r#"
        [devices."aa-bb-cc-dd-ee-ff"]
        key = "231d39c1d7cc1ab1aee224cd096db932"
        deduplicate = false

        [[devices."aa-bb-cc-dd-ee-ff".brokers]]
        host = "mqtt.example.org"
        port = 1883
        user = "bthome"
        password = "secret"
        encrypt = false
        allow-insecure = true
        topics = ["home/a", "", "home/b"]

        [[devices."aa-bb-cc-dd-ee-ff".brokers]]
        topics = ["home/c"]
    "#;

    #[test]
    fn full_device_is_loaded() {
        let registry = from_str(FULL).unwrap();
        let device = registry.get(&TEST_MAC).unwrap();

        assert_eq!(device.key, Some(TEST_KEY));
        assert!(!device.deduplicate);
        assert!(!device.promiscuous);
        assert_eq!(device.brokers.len(), 2);

        let first = &device.brokers[0];
        assert_eq!(first.host, "mqtt.example.org");
        assert_eq!(first.port, 1883);
        assert_eq!(first.username, "bthome");
        assert_eq!(first.password, "secret");
        assert!(!first.use_tls);
        // Meaningless without TLS.
        assert!(!first.allow_insecure_tls);
        assert_eq!(first.topics, vec!["home/a", "home/b"]);

        let second = &device.brokers[1];
        assert_eq!(second.host, "127.0.0.1");
        assert_eq!(second.port, 8883);
        assert!(second.use_tls);
        assert!(!second.has_credentials());
    }

    #[test]
    fn bad_key_disables_decryption_but_keeps_device() {
        let registry = from_str(
            r#"
            [devices.AABBCCDDEEFF]
            key = "abcd"
            brokers = [{ topics = ["t"] }]
            "#,
        )
        .unwrap();
        let device = registry.get(&TEST_MAC).unwrap();
        assert!(device.key.is_none());
        assert!(device.deduplicate);
    }

    #[test]
    fn non_hex_key_disables_decryption() {
        let registry = from_str(
            r#"
            [devices.AABBCCDDEEFF]
            key = "zz1d39c1d7cc1ab1aee224cd096db932"
            brokers = [{ topics = ["t"] }]
            "#,
        )
        .unwrap();
        assert!(registry.get(&TEST_MAC).unwrap().key.is_none());
    }

    #[test]
    fn promiscuous_template_is_loaded() {
        let registry = from_str(
            r#"
            [devices.PROMISCUOUS]
            brokers = [{ host = "all.example", encrypt = true, allow-insecure = true, topics = ["bthome"] }]
            "#,
        )
        .unwrap();
        assert!(registry.is_promiscuous());
        assert_eq!(registry.len(), 0);
        assert!(!registry.is_empty());
    }

    #[test]
    fn legacy_key_names_are_accepted() {
        let registry = from_str(
            r#"
            [devices."AA:BB:CC:DD:EE:FF"]
            brokers = [{ hostname = "legacy.example", insecure = true, topics = ["t"] }]
            "#,
        )
        .unwrap();
        let broker = &registry.get(&TEST_MAC).unwrap().brokers[0];
        assert_eq!(broker.host, "legacy.example");
        assert!(broker.allow_insecure_tls);
    }

    #[test]
    fn invalid_devices_are_dropped() {
        let result = from_str(
            r#"
            [devices."not a mac"]
            brokers = [{ topics = ["t"] }]

            [devices.AABBCCDDEEFF]
            brokers = [{ topics = [""] }]

            [devices.112233445566]
            brokers = []
            "#,
        );
        assert!(matches!(result, Err(ConfigError::NoDevices)));
    }

    #[test]
    fn only_empty_topics_are_dropped() {
        let registry = from_str(
            r#"
            [devices.AABBCCDDEEFF]
            brokers = [{ topics = ["", " ", "home/a"] }]
            "#,
        )
        .unwrap();
        let broker = &registry.get(&TEST_MAC).unwrap().brokers[0];
        assert_eq!(broker.topics, vec![" ", "home/a"]);
    }

    #[test]
    fn empty_configuration_is_an_error() {
        assert!(matches!(from_str(""), Err(ConfigError::NoDevices)));
    }

    #[test]
    fn syntax_errors_are_reported() {
        assert!(matches!(
            from_str("[devices"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            from_str("[devices.AABBCCDDEEFF]\nunknown = 1"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn load_reads_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(FULL.as_bytes()).unwrap();

        let registry = load(file.path()).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(matches!(load(&missing), Err(ConfigError::Read { .. })));
    }
}
