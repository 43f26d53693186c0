//! BTHome v2 payload walker.
//!
//! A (decrypted) payload is a sequence of `object id | value` records. The
//! value layout of each id comes from the [sensor catalog](crate::sensor); an
//! unknown id ends the walk because nothing after it can be located.

use crate::device::DeviceState;
use crate::measurement::{Measurement, Measurements};
use crate::sensor::{self, FIRMWARE_VERSION, PACKET_ID, RAW, SensorDescriptor, TEXT};
use std::time::{Duration, Instant};
use tracing::debug;

/// Packets arriving later than this after the last accepted one skip the
/// packet id ordering check.
pub const PACKET_ID_WINDOW: Duration = Duration::from_secs(4);

/// Largest forward jump (exclusive, modulo 256) accepted for a packet id.
pub const PACKET_ID_MAX_STEP: u8 = 64;

/// Why the walk stopped early.
enum Stop {
    /// Unknown id or truncated value: keep what was decoded so far.
    Partial,
    /// Packet id gate rejected the frame: drop everything.
    Stale,
}

/// Read a little-endian integer of up to 8 bytes.
fn read_le(bytes: &[u8], signed: bool) -> i64 {
    let value = bytes
        .iter()
        .enumerate()
        .fold(0u64, |acc, (i, b)| acc | (u64::from(*b) << (8 * i)));
    if signed && !bytes.is_empty() {
        let shift = 64 - 8 * bytes.len() as u32;
        ((value << shift) as i64) >> shift
    } else {
        value as i64
    }
}

/// Packet ordering gate: accept after a quiet period, on a small forward step,
/// or on a repeated id when duplicates are allowed.
fn accept_packet_id(state: &DeviceState, packet_id: u8, now: Instant) -> bool {
    let quiet = state
        .last_accepted_at
        .is_none_or(|at| now.saturating_duration_since(at) > PACKET_ID_WINDOW);
    if quiet {
        return true;
    }
    match state.last_packet_id {
        None => true,
        Some(last) => {
            let step = packet_id.wrapping_sub(last);
            (step > 0 && step < PACKET_ID_MAX_STEP) || (step == 0 && !state.deduplicate)
        }
    }
}

/// Decode one record value. Returns the measurement (if any is reported) and
/// the number of bytes consumed after the id.
fn decode_value(
    state: &mut DeviceState,
    sensor: &SensorDescriptor,
    data: &[u8],
    now: Instant,
) -> Result<(Option<Measurement>, usize), Stop> {
    if sensor.is_event() {
        let code = *data.first().ok_or(Stop::Partial)?;
        let property = if sensor.width == 2 {
            Some(*data.get(1).ok_or(Stop::Partial)?)
        } else {
            None
        };
        let event = sensor
            .event_name(code)
            .map(|name| Measurement::Event { name, property });
        return Ok((event, sensor.width));
    }

    if sensor.width == 0 {
        let len = usize::from(*data.first().ok_or(Stop::Partial)?);
        let bytes = data.get(1..1 + len).ok_or(Stop::Partial)?;
        let value = match sensor.id {
            TEXT => String::from_utf8_lossy(bytes).into_owned(),
            RAW => hex::encode(bytes),
            _ => return Err(Stop::Partial),
        };
        return Ok((Some(Measurement::Text(value)), 1 + len));
    }

    let bytes = data.get(..sensor.width).ok_or(Stop::Partial)?;
    let raw = read_le(bytes, sensor.signed);

    let measurement = if sensor.id == PACKET_ID {
        let packet_id = raw as u8;
        if !accept_packet_id(state, packet_id, now) {
            debug!(
                "Packet rejected for device {} (timestamp or packet id {packet_id}).",
                state.address
            );
            return Err(Stop::Stale);
        }
        state.last_accepted_at = Some(now);
        state.last_packet_id = Some(packet_id);
        None
    } else if sensor.binary {
        Some(Measurement::Binary(raw != 0))
    } else if FIRMWARE_VERSION.contains(&sensor.id) {
        Some(Measurement::Text(format!(
            "{:0width$x}",
            raw,
            width = 2 * sensor.width
        )))
    } else {
        Some(Measurement::numeric(raw as f64 * sensor.factor, sensor.unit))
    };
    Ok((measurement, sensor.width))
}

/// Parse a BTHome v2 payload (without the device information byte).
///
/// Returns `None` when nothing was decoded or the packet id gate rejected the
/// frame. Accepting a packet id updates the device's packet ordering state.
pub fn parse(state: &mut DeviceState, payload: &[u8]) -> Option<Measurements> {
    parse_at(state, payload, Instant::now())
}

/// [`parse`] with an explicit reception time.
pub fn parse_at(state: &mut DeviceState, payload: &[u8], now: Instant) -> Option<Measurements> {
    let mut measurements = Measurements::new();
    let mut occurrences = [0u32; 256];
    let mut cursor = 0;

    while payload.len() - cursor >= 2 {
        let id = payload[cursor];
        let Some(sensor) = sensor::lookup(id) else {
            debug!(
                "Unknown object id 0x{id:02X} for device {} at offset {cursor}, stopping.",
                state.address
            );
            break;
        };

        let (measurement, consumed) =
            match decode_value(state, sensor, &payload[cursor + 1..], now) {
                Ok(decoded) => decoded,
                Err(Stop::Partial) => {
                    debug!(
                        "Truncated value for object id 0x{id:02X} from device {}.",
                        state.address
                    );
                    break;
                }
                Err(Stop::Stale) => return None,
            };
        cursor += 1 + consumed;

        let count = &mut occurrences[usize::from(id)];
        *count += 1;
        if let Some(measurement) = measurement {
            let name = if *count > 1 {
                format!("{}_{}", sensor.property, count)
            } else {
                sensor.property.to_string()
            };
            measurements.insert(name, measurement);
        }
    }

    (!measurements.is_empty()).then_some(measurements)
}
