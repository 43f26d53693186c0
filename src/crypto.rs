//! BTHome v2 AES-CCM decryption with replay protection.
//!
//! An encrypted service-data frame is laid out as
//!
//! ```text
//! | header (1) | ciphertext (n) | counter (4, LE) | MIC (4) |
//! ```
//!
//! and is authenticated with AES-128-CCM using a 13-byte nonce built from the
//! device address, the BTHome UUID, the header byte and the counter.

use crate::device::{DeviceState, KEY_LEN};
use crate::mac_address::MacAddress;
use aes::Aes128;
use ccm::Ccm;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{AeadInPlace, KeyInit};
use ccm::consts::{U4, U13};
use thiserror::Error;

/// AES-128-CCM with a 4-byte tag and a 13-byte nonce, as used by BTHome.
type BTHomeCcm = Ccm<Aes128, U4, U13>;

/// BTHome service UUID (0xFCD2) in little-endian byte order.
pub const BTHOME_UUID_BYTES: [u8; 2] = [0xD2, 0xFC];

const COUNTER_LEN: usize = 4;
const MIC_LEN: usize = 4;
const NONCE_LEN: usize = 13;
/// A frame must be longer than header + counter + MIC plus one payload byte.
const MIN_FRAME_LEN: usize = 1 + COUNTER_LEN + MIC_LEN;

/// Counters below this value are never treated as a replay, so devices whose
/// counter restarted after a reset are not locked out.
pub const REPLAY_TOLERANCE: u32 = 0x100;

/// Reasons an encrypted frame is dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecryptError {
    #[error("ciphertext too short ({0} bytes)")]
    TooShort(usize),
    #[error("decryption key not specified")]
    MissingKey,
    #[error("duplicated ciphertext")]
    Duplicate,
    #[error("encrypted packet rejected (decreasing counter {counter} < {last})")]
    Replay { counter: u32, last: u32 },
    #[error("authentication failed")]
    Authentication,
}

fn nonce(address: &MacAddress, header: u8, counter: [u8; COUNTER_LEN]) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..6].copy_from_slice(address.as_bytes());
    nonce[6..8].copy_from_slice(&BTHOME_UUID_BYTES);
    nonce[8] = header;
    nonce[9..].copy_from_slice(&counter);
    nonce
}

/// Decrypt and authenticate `frame` (header byte included) for `state`.
///
/// On success the device's counter, last ciphertext and last plaintext are
/// updated and the plaintext is returned. On failure `state` is untouched.
pub fn decrypt(state: &mut DeviceState, frame: &[u8]) -> Result<Vec<u8>, DecryptError> {
    if frame.len() <= MIN_FRAME_LEN {
        return Err(DecryptError::TooShort(frame.len()));
    }
    let key = state.key.ok_or(DecryptError::MissingKey)?;
    if state.deduplicate && state.last_ciphertext.as_deref() == Some(frame) {
        return Err(DecryptError::Duplicate);
    }

    let mic_start = frame.len() - MIC_LEN;
    let counter_start = mic_start - COUNTER_LEN;
    let mut counter_bytes = [0u8; COUNTER_LEN];
    counter_bytes.copy_from_slice(&frame[counter_start..mic_start]);
    let counter = u32::from_le_bytes(counter_bytes);

    if let Some(last) = state.counter
        && counter >= REPLAY_TOLERANCE
        && counter < last
    {
        return Err(DecryptError::Replay { counter, last });
    }

    let nonce = nonce(&state.address, frame[0], counter_bytes);
    let cipher = BTHomeCcm::new(GenericArray::from_slice(&key));
    let mut payload = frame[1..counter_start].to_vec();
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(&nonce),
            &[],
            &mut payload,
            GenericArray::from_slice(&frame[mic_start..]),
        )
        .map_err(|_| DecryptError::Authentication)?;

    state.last_ciphertext = Some(frame.to_vec());
    state.counter = Some(counter);
    state.last_plaintext = Some(payload.clone());
    Ok(payload)
}

/// Build an encrypted frame the way a BTHome device does.
///
/// `header` is the device information byte (its encryption bit should be set).
pub fn encrypt(
    address: &MacAddress,
    key: &[u8; KEY_LEN],
    header: u8,
    counter: u32,
    plaintext: &[u8],
) -> Vec<u8> {
    let counter_bytes = counter.to_le_bytes();
    let nonce = nonce(address, header, counter_bytes);
    let cipher = BTHomeCcm::new(GenericArray::from_slice(key));

    let mut frame = Vec::with_capacity(1 + plaintext.len() + COUNTER_LEN + MIC_LEN);
    frame.push(header);
    let mut body = plaintext.to_vec();
    // CCM only fails for messages beyond its length limit, far above BLE sizes.
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(&nonce), &[], &mut body)
        .unwrap_or_default();
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&counter_bytes);
    frame.extend_from_slice(&tag);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TEST_KEY, TEST_MAC, test_device};

    const HEADER: u8 = 0x41;

    fn frame(counter: u32, plaintext: &[u8]) -> Vec<u8> {
        encrypt(&TEST_MAC, &TEST_KEY, HEADER, counter, plaintext)
    }

    fn snapshot(state: &DeviceState) -> (Option<u32>, Option<Vec<u8>>, Option<Vec<u8>>) {
        (
            state.counter,
            state.last_ciphertext.clone(),
            state.last_plaintext.clone(),
        )
    }

    #[test]
    fn decrypt_round_trip_updates_state() {
        let mut state = test_device();
        let plaintext = [0x01, 0x64];
        let sealed = frame(1000, &plaintext);

        assert_eq!(decrypt(&mut state, &sealed).unwrap(), plaintext);
        assert_eq!(state.counter, Some(1000));
        assert_eq!(state.last_ciphertext.as_deref(), Some(sealed.as_slice()));
        assert_eq!(state.last_plaintext.as_deref(), Some(plaintext.as_slice()));
    }

    /// Encrypted example frame from the BTHome v2 format documentation.
    #[test]
    fn reference_frame_decrypts() {
        let address: MacAddress = "54:48:E6:8F:80:A5".parse().unwrap();
        let sealed = hex::decode("41e445f3c9962b332211006c7c4519").unwrap();
        let expected = hex::decode("02ca0903bf13").unwrap();
        let mut state = DeviceState::new(address, vec![]).with_key(TEST_KEY);

        assert_eq!(decrypt(&mut state, &sealed).unwrap(), expected);
        assert_eq!(state.counter, Some(0x0011_2233));
        assert_eq!(
            encrypt(&address, &TEST_KEY, HEADER, 0x0011_2233, &expected),
            sealed
        );
    }

    #[test]
    fn short_frames_are_rejected_without_mutation() {
        let mut state = test_device();
        for len in 0..=MIN_FRAME_LEN {
            let data = vec![HEADER; len];
            let before = snapshot(&state);
            assert_eq!(decrypt(&mut state, &data), Err(DecryptError::TooShort(len)));
            assert_eq!(snapshot(&state), before);
        }
    }

    #[test]
    fn missing_key_is_rejected() {
        let mut state = test_device();
        state.key = None;
        assert_eq!(
            decrypt(&mut state, &frame(1, &[0x01, 0x64])),
            Err(DecryptError::MissingKey)
        );
        assert!(state.counter.is_none());
    }

    #[test]
    fn duplicate_ciphertext_respects_deduplicate_flag() {
        let mut state = test_device();
        let sealed = frame(5, &[0x01, 0x64]);
        decrypt(&mut state, &sealed).unwrap();
        assert_eq!(decrypt(&mut state, &sealed), Err(DecryptError::Duplicate));

        state.deduplicate = false;
        assert!(decrypt(&mut state, &sealed).is_ok());
    }

    #[test]
    fn decreasing_counter_is_a_replay() {
        let mut state = test_device();
        decrypt(&mut state, &frame(5000, &[0x01, 0x64])).unwrap();

        let before = snapshot(&state);
        assert_eq!(
            decrypt(&mut state, &frame(4999, &[0x01, 0x63])),
            Err(DecryptError::Replay {
                counter: 4999,
                last: 5000
            })
        );
        assert_eq!(snapshot(&state), before);
    }

    #[test]
    fn small_counters_are_tolerated_after_wraparound() {
        let mut state = test_device();
        decrypt(&mut state, &frame(u32::MAX, &[0x01, 0x64])).unwrap();
        assert!(decrypt(&mut state, &frame(3, &[0x01, 0x63])).is_ok());
        assert_eq!(state.counter, Some(3));
        assert!(decrypt(&mut state, &frame(REPLAY_TOLERANCE - 1, &[0x01, 0x62])).is_ok());
    }

    #[test]
    fn first_frame_accepts_any_counter() {
        let mut state = test_device();
        assert!(decrypt(&mut state, &frame(10, &[0x01, 0x64])).is_ok());
        assert!(decrypt(&mut state, &frame(11, &[0x01, 0x64])).is_ok());
    }

    #[test]
    fn tampered_frame_fails_authentication() {
        let mut state = test_device();
        let mut sealed = frame(77, &[0x02, 0xCA, 0x09]);
        sealed[2] ^= 0xFF;
        let before = snapshot(&state);
        assert_eq!(decrypt(&mut state, &sealed), Err(DecryptError::Authentication));
        assert_eq!(snapshot(&state), before);
    }

    #[test]
    fn wrong_key_or_address_fails_authentication() {
        let sealed = frame(77, &[0x01, 0x64]);

        let mut other_key = test_device().with_key([0x11; KEY_LEN]);
        assert_eq!(decrypt(&mut other_key, &sealed), Err(DecryptError::Authentication));

        let mut other_address = test_device();
        other_address.address = MacAddress([0, 1, 2, 3, 4, 5]);
        assert_eq!(
            decrypt(&mut other_address, &sealed),
            Err(DecryptError::Authentication)
        );
    }

    #[test]
    fn decrypt_is_deterministic() {
        let sealed = frame(99, &[0x45, 0x11, 0x01]);
        let first = decrypt(&mut test_device(), &sealed);
        let second = decrypt(&mut test_device(), &sealed);
        assert_eq!(first, second);
    }
}
