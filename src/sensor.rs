//! BTHome v2 sensor catalog.
//!
//! Static description of every object id defined by the BTHome v2 format
//! (<https://bthome.io/format/>): how many bytes the value takes, whether it
//! is signed, the scale factor, the unit, and whether it is a binary or an
//! event sensor. The table is sorted by id so lookups are a binary search.

/// Object id of the packet id sensor, used for packet ordering and never reported.
pub const PACKET_ID: u8 = 0x00;
/// Object id of the UTF-8 text sensor (variable length).
pub const TEXT: u8 = 0x53;
/// Object id of the raw bytes sensor (variable length).
pub const RAW: u8 = 0x54;
/// Object ids reported as hexadecimal firmware version strings.
pub const FIRMWARE_VERSION: std::ops::RangeInclusive<u8> = 0xF1..=0xF2;

/// Event table of an event sensor: code byte to event name, `None` meaning "no event".
pub type EventTable = &'static [(u8, Option<&'static str>)];

/// How to decode the value following one object id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorDescriptor {
    pub id: u8,
    /// Reported property name. Several ids share a name (e.g. "temperature").
    pub property: &'static str,
    /// Value width in bytes; 0 means the next byte holds the actual length.
    pub width: usize,
    pub signed: bool,
    pub factor: f64,
    pub unit: Option<&'static str>,
    pub binary: bool,
    /// Present only on event sensors; overrides width/factor handling.
    pub events: Option<EventTable>,
}

impl SensorDescriptor {
    const fn new(id: u8, property: &'static str) -> Self {
        Self {
            id,
            property,
            width: 1,
            signed: false,
            factor: 1.0,
            unit: None,
            binary: false,
            events: None,
        }
    }

    const fn width(mut self, width: usize) -> Self {
        self.width = width;
        self
    }

    const fn signed(mut self) -> Self {
        self.signed = true;
        self
    }

    const fn factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    const fn unit(mut self, unit: &'static str) -> Self {
        self.unit = Some(unit);
        self
    }

    const fn binary(mut self) -> Self {
        self.binary = true;
        self
    }

    const fn events(mut self, events: EventTable) -> Self {
        self.events = Some(events);
        self
    }

    pub fn is_event(&self) -> bool {
        self.events.is_some()
    }

    /// Map an event code through the event table. Unknown codes and the
    /// explicit "no event" code both yield `None`.
    pub fn event_name(&self, code: u8) -> Option<&'static str> {
        self.events?
            .iter()
            .find(|(c, _)| *c == code)
            .and_then(|(_, name)| *name)
    }
}

const BUTTON_EVENTS: EventTable = &[
    (0x00, None),
    (0x01, Some("press")),
    (0x02, Some("double_press")),
    (0x03, Some("triple_press")),
    (0x04, Some("long_press")),
    (0x05, Some("long_double_press")),
    (0x06, Some("long_triple_press")),
    (0x80, Some("hold_press")),
];

const DIMMER_EVENTS: EventTable = &[
    (0x00, None),
    (0x01, Some("rotate_left")),
    (0x02, Some("rotate_right")),
];

type S = SensorDescriptor;

/// All known object ids, sorted by id.
static CATALOG: &[SensorDescriptor] = &[
    S::new(0x00, "packet id"),
    S::new(0x01, "battery").unit("%"),
    S::new(0x02, "temperature").width(2).signed().factor(0.01).unit("°C"),
    S::new(0x03, "humidity").width(2).factor(0.01).unit("%"),
    S::new(0x04, "pressure").width(3).factor(0.01).unit("hPa"),
    S::new(0x05, "illuminance").width(3).factor(0.01).unit("lux"),
    S::new(0x06, "mass (kg)").width(2).factor(0.01).unit("kg"),
    S::new(0x07, "mass (lb)").width(2).factor(0.01).unit("lb"),
    S::new(0x08, "dewpoint").width(2).signed().factor(0.01).unit("°C"),
    S::new(0x09, "count"),
    S::new(0x0A, "energy").width(3).factor(0.001).unit("kWh"),
    S::new(0x0B, "power").width(3).factor(0.01).unit("W"),
    S::new(0x0C, "voltage").width(2).factor(0.001).unit("V"),
    S::new(0x0D, "pm2.5").width(2).unit("ug/m3"),
    S::new(0x0E, "pm10").width(2).unit("ug/m3"),
    S::new(0x0F, "generic boolean").binary(),
    S::new(0x10, "power").binary(),
    S::new(0x11, "opening").binary(),
    S::new(0x12, "co2").width(2).unit("ppm"),
    S::new(0x13, "tvoc").width(2).unit("ug/m3"),
    S::new(0x14, "moisture").width(2).factor(0.01).unit("%"),
    S::new(0x15, "battery").binary(),
    S::new(0x16, "battery charging").binary(),
    S::new(0x17, "carbon monoxide").binary(),
    S::new(0x18, "cold").binary(),
    S::new(0x19, "connectivity").binary(),
    S::new(0x1A, "door").binary(),
    S::new(0x1B, "garage door").binary(),
    S::new(0x1C, "gas").binary(),
    S::new(0x1D, "heat").binary(),
    S::new(0x1E, "light").binary(),
    S::new(0x1F, "lock").binary(),
    S::new(0x20, "moisture").binary(),
    S::new(0x21, "motion").binary(),
    S::new(0x22, "moving").binary(),
    S::new(0x23, "occupancy").binary(),
    S::new(0x24, "plug").binary(),
    S::new(0x25, "presence").binary(),
    S::new(0x26, "problem").binary(),
    S::new(0x27, "running").binary(),
    S::new(0x28, "safety").binary(),
    S::new(0x29, "smoke").binary(),
    S::new(0x2A, "sound").binary(),
    S::new(0x2B, "tamper").binary(),
    S::new(0x2C, "vibration").binary(),
    S::new(0x2D, "window").binary(),
    S::new(0x2E, "humidity").unit("%"),
    S::new(0x2F, "moisture").unit("%"),
    S::new(0x3A, "button").events(BUTTON_EVENTS),
    S::new(0x3C, "dimmer").width(2).events(DIMMER_EVENTS),
    S::new(0x3D, "count").width(2),
    S::new(0x3E, "count").width(4),
    S::new(0x3F, "rotation").width(2).signed().factor(0.1).unit("°"),
    S::new(0x40, "distance (mm)").width(2).unit("mm"),
    S::new(0x41, "distance (m)").width(2).factor(0.1).unit("m"),
    S::new(0x42, "duration").width(3).factor(0.001).unit("s"),
    S::new(0x43, "current").width(2).factor(0.001).unit("A"),
    S::new(0x44, "speed").width(2).factor(0.01).unit("m/s"),
    S::new(0x45, "temperature").width(2).signed().factor(0.1).unit("°C"),
    S::new(0x46, "UV index").factor(0.1),
    S::new(0x47, "volume").width(2).factor(0.1).unit("L"),
    S::new(0x48, "volume").width(2).unit("mL"),
    S::new(0x49, "volume flow rate").width(2).factor(0.001).unit("m3/hr"),
    S::new(0x4A, "voltage").width(2).factor(0.1).unit("V"),
    S::new(0x4B, "gas").width(3).factor(0.001).unit("m3"),
    S::new(0x4C, "gas").width(4).factor(0.001).unit("m3"),
    S::new(0x4D, "energy").width(4).factor(0.001).unit("kWh"),
    S::new(0x4E, "volume").width(4).factor(0.001).unit("L"),
    S::new(0x4F, "water").width(4).factor(0.001).unit("L"),
    S::new(0x50, "timestamp").width(4),
    S::new(0x51, "acceleration").width(2).factor(0.001).unit("m/s²"),
    S::new(0x52, "gyroscope").width(2).factor(0.001).unit("°/s"),
    S::new(0x53, "text").width(0),
    S::new(0x54, "raw").width(0),
    S::new(0x55, "volume storage").width(4).factor(0.001).unit("L"),
    S::new(0x56, "conductivity").width(2).unit("µS/cm"),
    S::new(0x57, "temperature").signed().unit("°C"),
    S::new(0x58, "temperature").signed().factor(0.35).unit("°C"),
    S::new(0x59, "count").signed(),
    S::new(0x5A, "count").width(2).signed(),
    S::new(0x5B, "count").width(4).signed(),
    S::new(0x5C, "power").width(4).signed().factor(0.01).unit("W"),
    S::new(0x5D, "current").width(2).signed().factor(0.001).unit("A"),
    S::new(0xF0, "device type id").width(2),
    S::new(0xF1, "firmware version").width(4),
    S::new(0xF2, "firmware version").width(3),
];

/// Look up the descriptor of an object id.
pub fn lookup(id: u8) -> Option<&'static SensorDescriptor> {
    CATALOG
        .binary_search_by_key(&id, |s| s.id)
        .ok()
        .map(|index| &CATALOG[index])
}

/// Iterate over every known descriptor, in id order.
pub fn all() -> impl Iterator<Item = &'static SensorDescriptor> {
    CATALOG.iter()
}
