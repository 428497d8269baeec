//! # wmlink - client and solver core for a world model store
//!
//! A world model holds named entities (URIs) and their timestamped
//! attributes. This crate talks to one from both sides:
//!
//! - **Clients** issue point-in-time snapshot queries ([`Response`]) and
//!   paced subscriptions ([`StreamingResponse`]) over a
//!   [`ClientConnection`].
//! - **Solvers** derive attribute values from raw sensor samples and push
//!   changes through an [`UpdateDispatcher`], which retries only failures
//!   the transport classified as transient.
//!
//! The socket session itself sits behind the [`Transport`] trait;
//! [`TcpTransport`] carries typed frames as JSON lines.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use wmlink::{inbound_channel, ClientConfig, ClientConnection, TcpTransport};
//!
//! let (tx, rx) = inbound_channel(1024);
//! let transport = Arc::new(TcpTransport::connect("localhost:7010", tx, None)?);
//! let client = ClientConnection::new(transport, rx, ClientConfig::default());
//!
//! // Non-blocking; `get` waits for the whole snapshot.
//! let state = client.current_snapshot_request(".*", [".*"]).get()?;
//! for (uri, attributes) in &state {
//!     println!("{uri}: {} attributes", attributes.len());
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod error;
pub mod model;
pub mod pattern;
pub mod solver;
pub mod transport;

pub use client::{
    ClientConfig, ClientConnection, Response, StreamBuffer, StreamCanceller, StreamPoll, StreamingResponse,
};
pub use config::{CliArgs, TypeConfig};
pub use error::{
    ConfigError, DeliveryError, DispatchError, FailureKind, PatternError, SendFailure, WmError, WmResult,
};
pub use model::{
    AttrUpdate, Attribute, GrailTime, Rule, SampleData, TransmitterId, TransmitterKey, TransmitterMask,
    TypeRegistration, Uri, WorldState,
};
pub use pattern::{class_filter, PatternSet, UriFilter};
pub use solver::{
    ChangeTracker, RetryPolicy, SolverConfig, SolverConnection, StateReport, SwitchSolver, TransmitterDirectory,
    TransmitterDiscovery, UpdateDispatcher, UpdateSink,
};
pub use transport::{inbound_channel, ClientFrame, ServerFrame, TcpTransport, Ticket, Transport};
