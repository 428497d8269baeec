//! Entity/attribute model shared by the client and solver paths.
//!
//! The world model holds named entities (URIs) and their timestamped,
//! typed attributes. Everything here is a plain value type: snapshots and
//! updates are moved or cloned across the connection boundary and never
//! shared.

use std::collections::btree_map::{self, BTreeMap};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Identifier of one entity in the world model (e.g. `room1.mug.mug42`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Uri(String);

impl Uri {
    /// Wraps a URI string.
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    /// Borrow the URI text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Dot-separated segments of the URI.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Uri {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Uri {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for Uri {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// World-model time: milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct GrailTime(pub i64);

impl GrailTime {
    /// Current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    /// Converts from a chrono timestamp.
    #[must_use]
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_millis())
    }

    /// Converts to a chrono timestamp, if representable.
    #[must_use]
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.0)
    }

    /// Milliseconds since the epoch.
    #[must_use]
    pub const fn millis(self) -> i64 {
        self.0
    }
}

impl fmt::Display for GrailTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One typed, timestamped fact about a URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    /// Attribute name (e.g. `location.xoffset`).
    pub name: String,
    /// Opaque payload.
    pub data: Vec<u8>,
    /// When the value was created.
    pub creation_date: GrailTime,
    /// Producer (solver) that authored the value.
    pub origin: String,
}

impl Attribute {
    /// Creates an attribute.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        data: Vec<u8>,
        creation_date: GrailTime,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            data,
            creation_date,
            origin: origin.into(),
        }
    }
}

/// A snapshot: URI → ordered attribute list.
///
/// A URI mapped to an empty list means "exists but nothing matched"; a URI
/// that is absent did not match the URI filter at all.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorldState(BTreeMap<Uri, Vec<Attribute>>);

impl WorldState {
    /// Creates an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `uri` exists, without attributes if it was not present.
    pub fn insert_uri(&mut self, uri: Uri) {
        self.0.entry(uri).or_default();
    }

    /// Appends an attribute to `uri`, creating the entry if needed.
    pub fn push(&mut self, uri: Uri, attribute: Attribute) {
        self.0.entry(uri).or_default().push(attribute);
    }

    /// Replaces the attribute list of `uri`.
    pub fn insert(&mut self, uri: Uri, attributes: Vec<Attribute>) -> Option<Vec<Attribute>> {
        self.0.insert(uri, attributes)
    }

    /// Attributes for `uri`, if the URI is present.
    #[must_use]
    pub fn get(&self, uri: &Uri) -> Option<&[Attribute]> {
        self.0.get(uri).map(Vec::as_slice)
    }

    /// Returns true if `uri` is present (possibly with no attributes).
    #[must_use]
    pub fn contains(&self, uri: &Uri) -> bool {
        self.0.contains_key(uri)
    }

    /// Number of URIs in the snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if no URI is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates URIs in sorted order.
    pub fn iter(&self) -> btree_map::Iter<'_, Uri, Vec<Attribute>> {
        self.0.iter()
    }

    /// Folds another partial snapshot into this one.
    ///
    /// Attributes of a URI present in both are appended in arrival order.
    pub fn merge(&mut self, other: WorldState) {
        for (uri, attrs) in other.0 {
            self.0.entry(uri).or_default().extend(attrs);
        }
    }
}

impl IntoIterator for WorldState {
    type Item = (Uri, Vec<Attribute>);
    type IntoIter = btree_map::IntoIter<Uri, Vec<Attribute>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a WorldState {
    type Item = (&'a Uri, &'a Vec<Attribute>);
    type IntoIter = btree_map::Iter<'a, Uri, Vec<Attribute>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<(Uri, Vec<Attribute>)> for WorldState {
    fn from_iter<I: IntoIterator<Item = (Uri, Vec<Attribute>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A single value pushed to the store by a solver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrUpdate {
    /// Solution (attribute) name.
    pub name: String,
    /// Creation time of the value.
    pub creation_date: GrailTime,
    /// Target entity.
    pub uri: Uri,
    /// Encoded value.
    pub data: Vec<u8>,
}

impl AttrUpdate {
    /// Creates an update stamped with the current time.
    #[must_use]
    pub fn now(name: impl Into<String>, uri: Uri, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            creation_date: GrailTime::now(),
            uri,
            data,
        }
    }
}

/// 128-bit transmitter identifier.
///
/// Serialized as a 32 digit hex string; JSON numbers cannot carry 128 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransmitterId(pub u128);

impl FromStr for TransmitterId {
    type Err = ParseIntError;

    /// Parses hex digits, with or without a `0x` prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        u128::from_str_radix(digits, 16).map(Self)
    }
}

impl Serialize for TransmitterId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&format_args!("{:032x}", self.0))
    }
}

impl<'de> Deserialize<'de> for TransmitterId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse()
            .map_err(|e| de::Error::custom(format!("invalid transmitter id {text:?}: {e}")))
    }
}

impl TransmitterId {
    /// Decodes a big-endian 16 byte identifier.
    #[must_use]
    pub fn from_be_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(u128::from_be_bytes(arr)))
    }

    /// Big-endian encoding.
    #[must_use]
    pub const fn to_be_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for TransmitterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A transmitter as seen by the sensor feed: physical layer plus id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransmitterKey {
    /// Physical layer the transmitter uses.
    pub physical_layer: u8,
    /// Transmitter id within that layer.
    pub tx_id: TransmitterId,
}

impl TransmitterKey {
    /// Creates a key.
    #[must_use]
    pub const fn new(physical_layer: u8, tx_id: TransmitterId) -> Self {
        Self {
            physical_layer,
            tx_id,
        }
    }
}

impl fmt::Display for TransmitterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.physical_layer, self.tx_id)
    }
}

/// A raw sensor sample delivered to the solver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleData {
    /// Whether the feed considers this sample valid.
    pub valid: bool,
    /// Physical layer of the transmitter.
    pub physical_layer: u8,
    /// Transmitter id.
    pub tx_id: TransmitterId,
    /// Sensor payload.
    pub sense_data: Vec<u8>,
}

impl SampleData {
    /// Key of the transmitter that produced this sample.
    #[must_use]
    pub const fn transmitter(&self) -> TransmitterKey {
        TransmitterKey::new(self.physical_layer, self.tx_id)
    }
}

/// A transmitter id range in a subscription rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransmitterMask {
    /// Base id.
    pub base_id: TransmitterId,
    /// Bits of the id that must match `base_id`.
    pub mask: TransmitterId,
}

impl TransmitterMask {
    /// Matches exactly one transmitter.
    #[must_use]
    pub const fn exact(id: TransmitterId) -> Self {
        Self {
            base_id: id,
            mask: TransmitterId(u128::MAX),
        }
    }

    /// Returns true if `id` falls under this mask.
    #[must_use]
    pub const fn matches(&self, id: TransmitterId) -> bool {
        id.0 & self.mask.0 == self.base_id.0 & self.mask.0
    }
}

/// Subscription descriptor for raw sensor data on one physical layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Physical layer this rule applies to.
    pub physical_layer: u8,
    /// Transmitters of interest.
    pub transmitters: Vec<TransmitterMask>,
    /// Requested update interval in milliseconds (0 = every sample).
    pub update_interval_ms: u64,
}

impl Rule {
    /// Creates an empty rule for a physical layer.
    #[must_use]
    pub const fn new(physical_layer: u8) -> Self {
        Self {
            physical_layer,
            transmitters: Vec::new(),
            update_interval_ms: 0,
        }
    }

    /// Adds a transmitter. Returns false if it was already covered.
    pub fn add_transmitter(&mut self, id: TransmitterId) -> bool {
        if self.covers(id) {
            return false;
        }
        self.transmitters.push(TransmitterMask::exact(id));
        true
    }

    /// Returns true if `id` is already requested by this rule.
    #[must_use]
    pub fn covers(&self, id: TransmitterId) -> bool {
        self.transmitters.iter().any(|m| m.matches(id))
    }
}

/// Declares an attribute the solver will publish.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeRegistration {
    /// Attribute name the solver writes.
    pub solution_name: String,
    /// Transient values are not persisted by the store.
    pub is_transient: bool,
}

impl TypeRegistration {
    /// A non-transient registration.
    #[must_use]
    pub fn persistent(solution_name: impl Into<String>) -> Self {
        Self {
            solution_name: solution_name.into(),
            is_transient: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr(name: &str) -> Attribute {
        Attribute::new(name, vec![1], GrailTime(10), "test")
    }

    #[test]
    fn test_uri_segments() {
        let uri = Uri::from("room1.mug.mug42");
        let segs: Vec<&str> = uri.segments().collect();
        assert_eq!(segs, vec!["room1", "mug", "mug42"]);
        assert_eq!(uri.to_string(), "room1.mug.mug42");
    }

    #[test]
    fn test_grail_time_datetime() {
        let t = GrailTime(1_500_000_000_000);
        let dt = t.to_datetime().unwrap();
        assert_eq!(GrailTime::from_datetime(dt), t);
    }

    #[test]
    fn test_world_state_empty_vs_absent() {
        let mut ws = WorldState::new();
        ws.insert_uri(Uri::from("a"));

        assert!(ws.contains(&Uri::from("a")));
        assert_eq!(ws.get(&Uri::from("a")), Some(&[][..]));
        assert!(!ws.contains(&Uri::from("b")));
        assert_eq!(ws.get(&Uri::from("b")), None);
    }

    #[test]
    fn test_world_state_insert_uri_keeps_attributes() {
        let mut ws = WorldState::new();
        ws.push(Uri::from("a"), attr("x"));
        ws.insert_uri(Uri::from("a"));
        assert_eq!(ws.get(&Uri::from("a")).unwrap().len(), 1);
    }

    #[test]
    fn test_world_state_merge() {
        let mut first = WorldState::new();
        first.push(Uri::from("a"), attr("x"));

        let mut second = WorldState::new();
        second.push(Uri::from("a"), attr("y"));
        second.insert_uri(Uri::from("b"));

        first.merge(second);
        assert_eq!(first.len(), 2);
        let names: Vec<&str> = first
            .get(&Uri::from("a"))
            .unwrap()
            .iter()
            .map(|a| a.name.as_str())
            .collect();
        assert_eq!(names, vec!["x", "y"]);
        assert!(first.get(&Uri::from("b")).unwrap().is_empty());
    }

    #[test]
    fn test_transmitter_id_from_slice() {
        let mut bytes = [0u8; 16];
        bytes[15] = 0x2a;
        assert_eq!(TransmitterId::from_be_slice(&bytes), Some(TransmitterId(42)));
        assert_eq!(TransmitterId::from_be_slice(&bytes[..15]), None);
        assert_eq!(TransmitterId(42).to_be_bytes(), bytes);
    }

    #[test]
    fn test_transmitter_id_hex_form() {
        let id = TransmitterId(0x42);
        assert_eq!(
            serde_json::to_value(id).unwrap(),
            serde_json::json!("00000000000000000000000000000042")
        );

        let mask = TransmitterMask::exact(TransmitterId(1 << 100));
        let json = serde_json::to_string(&mask).unwrap();
        assert!(json.contains(r#""mask":"ffffffffffffffffffffffffffffffff""#));
        assert_eq!(serde_json::from_str::<TransmitterMask>(&json).unwrap(), mask);

        assert_eq!("0x2a".parse::<TransmitterId>().unwrap(), TransmitterId(42));
        assert!("xyz".parse::<TransmitterId>().is_err());
        assert!(serde_json::from_str::<TransmitterId>("5").is_err());
        let too_long = format!("\"1{}\"", "0".repeat(32));
        assert!(serde_json::from_str::<TransmitterId>(&too_long).is_err());
    }

    #[test]
    fn test_rule_add_transmitter() {
        let mut rule = Rule::new(1);
        assert!(rule.add_transmitter(TransmitterId(5)));
        assert!(!rule.add_transmitter(TransmitterId(5)));
        assert!(rule.add_transmitter(TransmitterId(6)));
        assert_eq!(rule.transmitters.len(), 2);
        assert!(rule.covers(TransmitterId(6)));
        assert!(!rule.covers(TransmitterId(7)));
    }

    #[test]
    fn test_transmitter_mask() {
        let mask = TransmitterMask {
            base_id: TransmitterId(0xF0),
            mask: TransmitterId(0xF0),
        };
        assert!(mask.matches(TransmitterId(0xF3)));
        assert!(!mask.matches(TransmitterId(0xE3)));
    }

    #[test]
    fn test_world_state_serialization() {
        let mut ws = WorldState::new();
        ws.push(Uri::from("room.mug.1"), attr("location.xoffset"));
        ws.insert_uri(Uri::from("room.mug.2"));
        let json = serde_json::to_string(&ws).unwrap();
        let back: WorldState = serde_json::from_str(&json).unwrap();
        assert_eq!(ws, back);
    }
}
