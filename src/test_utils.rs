use crate::device::{BrokerTarget, DeviceState, KEY_LEN};
use crate::mac_address::MacAddress;

/// A stable MAC address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// A stable AES key for unit tests.
pub const TEST_KEY: [u8; KEY_LEN] = [
    0x23, 0x1D, 0x39, 0xC1, 0xD7, 0xCC, 0x1A, 0xB1, 0xAE, 0xE2, 0x24, 0xCD, 0x09, 0x6D, 0xB9, 0x32,
];

/// A plaintext broker with a single `bthome/test` topic.
pub fn test_broker(host: &str) -> BrokerTarget {
    BrokerTarget {
        host: host.to_string(),
        port: 1883,
        use_tls: false,
        topics: vec!["bthome/test".to_string()],
        ..BrokerTarget::default()
    }
}

/// A deduplicating device at [`TEST_MAC`] keyed with [`TEST_KEY`].
pub fn test_device() -> DeviceState {
    DeviceState::new(TEST_MAC, vec![test_broker("localhost")]).with_key(TEST_KEY)
}
