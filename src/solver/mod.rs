//! Solver side: derive attribute values from raw samples and publish them.
//!
//! Samples arrive on a [`SolverConnection`]. The [`SwitchSolver`] resolves
//! the transmitter through a [`TransmitterDirectory`], asks its
//! [`ChangeTracker`] whether the value is new, and publishes changes through
//! an [`UpdateDispatcher`], which retries transient send failures.

mod connection;
mod discovery;
mod dispatcher;
mod switch;
mod tracker;

pub use connection::{SolverConfig, SolverConnection};
pub use discovery::{
    decode_transmitter, encode_transmitter, BindOutcome, DiscoveryReport, TransmitterDirectory,
    TransmitterDiscovery, TRANSMITTER_PAYLOAD_LEN,
};
pub use dispatcher::{RetryPolicy, UpdateDispatcher, UpdateSink};
pub use switch::{decode_switch, encode_switch, StateReport, SwitchSolver, SWITCH_OFF, SWITCH_ON};
pub use tracker::ChangeTracker;
