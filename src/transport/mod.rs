//! Connection boundary to the world model.
//!
//! A transport owns the socket session and moves already-typed frames.
//! Outbound frames go through [`Transport::send`], which reports failures
//! with an explicit [`FailureKind`](crate::error::FailureKind). Inbound
//! frames are pushed into the crossbeam sender the transport was built
//! with; closing that channel (or sending [`ServerFrame::Disconnected`])
//! tells the consumer the session is over.

mod frames;
pub mod tcp;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::SendFailure;

pub use frames::{ClientFrame, ServerFrame, Ticket};
pub use tcp::TcpTransport;

/// Default capacity of an inbound frame channel.
pub const DEFAULT_INBOUND_CAPACITY: usize = 1024;

/// An open session to the world model.
pub trait Transport: Send + Sync {
    /// Returns true while the session is usable.
    fn connected(&self) -> bool;

    /// Sends one frame.
    ///
    /// # Errors
    ///
    /// Returns a classified [`SendFailure`].
    fn send(&self, frame: &ClientFrame) -> Result<(), SendFailure>;

    /// Closes the session. Idempotent.
    fn close(&self);
}

/// Creates the channel a transport uses to hand inbound frames over.
#[must_use]
pub fn inbound_channel(capacity: usize) -> (Sender<ServerFrame>, Receiver<ServerFrame>) {
    bounded(capacity.max(1))
}
