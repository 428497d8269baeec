//! Client side of the world model protocol.
//!
//! A [`ClientConnection`] issues snapshot and stream requests over a
//! [`Transport`](crate::transport::Transport) and routes the replies to
//! [`Response`] and [`StreamingResponse`] handles.

mod connection;
mod response;
mod stream;

pub use connection::{ClientConfig, ClientConnection, StreamBuffer};
pub use response::Response;
pub use stream::{StreamCanceller, StreamPoll, StreamingResponse};
