//! Typed frames exchanged with the world model.
//!
//! Frames are serde-serializable so a transport can carry them as JSON;
//! the library itself only ever handles the typed form.

use serde::{Deserialize, Serialize};

use crate::model::{AttrUpdate, GrailTime, Rule, SampleData, TypeRegistration, WorldState};

/// Ticket number correlating a request with its responses.
pub type Ticket = u32;

/// Frames sent by this library.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Query values in a time window. `start == stop == 0` asks for current values.
    SnapshotRequest {
        ticket: Ticket,
        uri_pattern: String,
        attribute_patterns: Vec<String>,
        start: GrailTime,
        stop: GrailTime,
    },

    /// Open a subscription paced by `interval_ms`.
    StreamRequest {
        ticket: Ticket,
        uri_pattern: String,
        attribute_patterns: Vec<String>,
        interval_ms: u64,
    },

    /// Stop delivering data for a ticket.
    CancelRequest {
        ticket: Ticket,
    },

    /// Announce the solution types a solver will publish.
    TypeAnnounce {
        origin: String,
        types: Vec<TypeRegistration>,
    },

    /// Push attribute values.
    SolverData {
        origin: String,
        create_uris: bool,
        updates: Vec<AttrUpdate>,
    },

    /// Ask the sensor feed for samples matching these rules.
    RuleRequest {
        rules: Vec<Rule>,
    },
}

/// Frames received from the world model or sensor feed.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// A (possibly partial) world state for a ticket.
    Data {
        ticket: Ticket,
        state: WorldState,
    },

    /// No more data will arrive for this ticket.
    RequestComplete {
        ticket: Ticket,
    },

    /// The request was refused.
    Rejected {
        ticket: Ticket,
        reason: String,
    },

    /// A raw sensor sample for the solver side.
    Sample {
        sample: SampleData,
    },

    /// The session is gone.
    Disconnected,
}

impl ServerFrame {
    /// Ticket this frame belongs to, if any.
    #[must_use]
    pub const fn ticket(&self) -> Option<Ticket> {
        match self {
            Self::Data { ticket, .. } | Self::RequestComplete { ticket } | Self::Rejected { ticket, .. } => {
                Some(*ticket)
            }
            Self::Sample { .. } | Self::Disconnected => None,
        }
    }
}
