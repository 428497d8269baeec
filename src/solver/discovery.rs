//! Transmitter discovery.
//!
//! The world model stores, for every switch-equipped object, an attribute
//! whose payload identifies its transmitter: one physical layer byte
//! followed by a 16 byte big-endian id. Discovery decodes those attributes
//! and binds each transmitter to its URI in a shared directory. The first
//! transmitter seen on a physical layer creates a [`Rule`] for that layer.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use tracing::{debug, info};

use crate::model::{Rule, TransmitterId, TransmitterKey, Uri, WorldState};
use crate::pattern::PatternSet;

/// Encoded size of a transmitter attribute payload.
pub const TRANSMITTER_PAYLOAD_LEN: usize = 17;

/// Decodes a transmitter attribute payload.
///
/// Returns `None` unless the payload is exactly one physical layer byte
/// and a 16 byte id.
#[must_use]
pub fn decode_transmitter(data: &[u8]) -> Option<TransmitterKey> {
    let (&phy, id) = data.split_first()?;
    if data.len() != TRANSMITTER_PAYLOAD_LEN {
        return None;
    }
    Some(TransmitterKey::new(phy, TransmitterId::from_be_slice(id)?))
}

/// Encodes a transmitter the way [`decode_transmitter`] expects it.
#[must_use]
pub fn encode_transmitter(key: TransmitterKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(TRANSMITTER_PAYLOAD_LEN);
    out.push(key.physical_layer);
    out.extend_from_slice(&key.tx_id.to_be_bytes());
    out
}

#[derive(Debug, Default)]
struct DirectoryInner {
    by_tx: HashMap<TransmitterKey, Uri>,
    rules: BTreeMap<u8, Rule>,
}

/// What a [`TransmitterDirectory::bind`] call changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BindOutcome {
    /// The transmitter now resolves to a different URI than before.
    pub remapped: bool,
    /// The rule set changed and should be re-sent to the sensor feed.
    pub rules_changed: bool,
}

/// Shared transmitter → URI lookup.
///
/// Samples are resolved concurrently with discovery updates; every read
/// and write goes through one lock.
#[derive(Debug, Default)]
pub struct TransmitterDirectory {
    inner: RwLock<DirectoryInner>,
}

impl TransmitterDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `key` to `uri`, extending the rule for its physical layer.
    pub fn bind(&self, key: TransmitterKey, uri: Uri) -> BindOutcome {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        let remapped = match inner.by_tx.insert(key, uri.clone()) {
            Some(previous) => previous != uri,
            None => true,
        };

        let rules_changed = inner
            .rules
            .entry(key.physical_layer)
            .or_insert_with(|| {
                info!(physical_layer = key.physical_layer, "New physical layer; creating rule");
                Rule::new(key.physical_layer)
            })
            .add_transmitter(key.tx_id);

        if remapped {
            debug!(transmitter = %key, uri = %uri, "Bound transmitter");
        }
        BindOutcome {
            remapped,
            rules_changed,
        }
    }

    /// URI bound to `key`, if any.
    #[must_use]
    pub fn lookup(&self, key: TransmitterKey) -> Option<Uri> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_tx
            .get(&key)
            .cloned()
    }

    /// Current rules, ordered by physical layer.
    #[must_use]
    pub fn rules(&self) -> Vec<Rule> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .rules
            .values()
            .cloned()
            .collect()
    }

    /// Number of bound transmitters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).by_tx.len()
    }

    /// Returns true if nothing is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of applying one world state to the directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Transmitters bound or re-bound by this state.
    pub bound: Vec<(TransmitterKey, Uri)>,
    /// Attributes that matched but could not be decoded.
    pub undecodable: usize,
    /// The rule set changed.
    pub rules_changed: bool,
}

/// Feeds transmitter attributes from world states into a directory.
#[derive(Debug)]
pub struct TransmitterDiscovery {
    attributes: PatternSet,
}

impl TransmitterDiscovery {
    /// Watches attributes whose names match `attributes`.
    #[must_use]
    pub const fn new(attributes: PatternSet) -> Self {
        Self { attributes }
    }

    /// Attribute patterns this discovery reacts to.
    #[must_use]
    pub const fn attributes(&self) -> &PatternSet {
        &self.attributes
    }

    /// Binds every decodable transmitter attribute in `state`.
    pub fn apply(&self, directory: &TransmitterDirectory, state: &WorldState) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        for (uri, attributes) in state {
            for attribute in attributes.iter().filter(|a| self.attributes.matches(&a.name)) {
                let Some(key) = decode_transmitter(&attribute.data) else {
                    debug!(uri = %uri, attribute = %attribute.name, "Undecodable transmitter attribute");
                    report.undecodable += 1;
                    continue;
                };
                let outcome = directory.bind(key, uri.clone());
                report.rules_changed |= outcome.rules_changed;
                if outcome.remapped {
                    report.bound.push((key, uri.clone()));
                }
            }
        }
        report
    }
}
