//! Client connection worker.
//!
//! Owns the ticket table and demultiplexes inbound frames to pending
//! snapshot responses and open streams. The worker sends each request
//! frame itself, after registering its ticket, so a fast reply can never
//! race its own registration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, never, select, unbounded, Receiver, Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::error::{DeliveryError, FailureKind, SendFailure, WmResult};
use crate::model::{GrailTime, WorldState};
use crate::pattern::UriFilter;
use crate::transport::{ClientFrame, ServerFrame, Ticket, Transport};

use super::response::Response;
use super::stream::StreamingResponse;

/// Client connection configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Max queued control messages (register/cancel).
    pub control_queue_capacity: usize,
    /// Per-stream buffer of undelivered world states.
    pub stream_capacity: usize,
    /// Send attempts for a request frame hitting transient failures.
    pub request_send_attempts: u32,
    /// Pause between those attempts.
    pub request_retry_backoff: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            control_queue_capacity: 1024,
            stream_capacity: 1024,
            request_send_attempts: 8,
            request_retry_backoff: Duration::from_millis(10),
        }
    }
}

/// How a stream buffers deliveries its consumer has not read yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamBuffer {
    /// Hold at most this many; newer deliveries are dropped and counted
    /// in [`ClientConnection::dropped_states`] while the buffer is full.
    Bounded(usize),
    /// Never drop. Memory grows while the consumer is behind.
    Unbounded,
}

#[derive(Debug)]
pub(crate) enum ControlMsg {
    /// Track `ticket`, then send `frame`. `reply` reports the send outcome.
    Register {
        ticket: Ticket,
        pending: Pending,
        frame: ClientFrame,
        reply: Option<Sender<Result<(), DeliveryError>>>,
    },
    /// Stop delivering and tell the store.
    Cancel {
        ticket: Ticket,
    },
}

#[derive(Debug)]
pub(crate) enum Pending {
    Snapshot {
        partial: WorldState,
        reply: Sender<Result<WorldState, DeliveryError>>,
    },
    Stream {
        tx: Sender<WorldState>,
    },
}

impl Pending {
    fn fail(self, err: DeliveryError) {
        match self {
            Self::Snapshot { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            // Dropping the sender ends the stream.
            Self::Stream { .. } => {}
        }
    }
}

/// Client session with the world model.
///
/// Runs one worker thread that routes inbound frames by ticket. Snapshot
/// data is accumulated until the store marks the request complete; stream
/// data is forwarded one delivery at a time.
pub struct ClientConnection {
    cfg: ClientConfig,
    transport: Arc<dyn Transport>,
    control_tx: Sender<ControlMsg>,
    next_ticket: AtomicU32,
    closed: Arc<AtomicBool>,
    dropped_states: Arc<AtomicU64>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ClientConnection {
    /// Starts the connection worker.
    ///
    /// `inbound` must be the receiving end of the channel `transport`
    /// delivers frames into.
    pub fn new(transport: Arc<dyn Transport>, inbound: Receiver<ServerFrame>, cfg: ClientConfig) -> Self {
        let (control_tx, control_rx) = bounded::<ControlMsg>(cfg.control_queue_capacity.max(1));
        let closed = Arc::new(AtomicBool::new(false));
        let dropped_states = Arc::new(AtomicU64::new(0));

        let worker = Worker {
            transport: Arc::clone(&transport),
            send_attempts: cfg.request_send_attempts.max(1),
            retry_backoff: cfg.request_retry_backoff,
            pending: HashMap::new(),
            closed: Arc::clone(&closed),
            dropped_states: Arc::clone(&dropped_states),
        };
        let join = thread::Builder::new()
            .name("wmlink-client".to_string())
            .spawn(move || worker.run(control_rx, inbound))
            .expect("failed to spawn wmlink client worker");

        Self {
            cfg,
            transport,
            control_tx,
            next_ticket: AtomicU32::new(1),
            closed,
            dropped_states,
            join: Mutex::new(Some(join)),
        }
    }

    /// Returns true while requests can be issued.
    #[must_use]
    pub fn connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.transport.connected()
    }

    /// Requests the current values of matching URIs and attributes.
    ///
    /// Does not wait for the data; see [`Response::get`].
    pub fn current_snapshot_request<I, S>(&self, uri_pattern: &str, attribute_patterns: I) -> Response
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.range_request(uri_pattern, attribute_patterns, GrailTime(0), GrailTime(0))
    }

    /// Requests attribute values created in `[start, stop)`.
    ///
    /// Returns as soon as the request is queued for the worker. Pattern
    /// errors, send failures and a closed connection all surface from
    /// [`Response::get`].
    pub fn range_request<I, S>(
        &self,
        uri_pattern: &str,
        attribute_patterns: I,
        start: GrailTime,
        stop: GrailTime,
    ) -> Response
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ticket = self.allocate_ticket();
        let attribute_patterns: Vec<String> = attribute_patterns.into_iter().map(Into::into).collect();

        if let Err(err) = validate_patterns(ticket, uri_pattern, &attribute_patterns) {
            return Response::failed(ticket, err);
        }

        let (reply, rx) = bounded(1);
        let pending = Pending::Snapshot {
            partial: WorldState::new(),
            reply,
        };
        let frame = ClientFrame::SnapshotRequest {
            ticket,
            uri_pattern: uri_pattern.to_string(),
            attribute_patterns,
            start,
            stop,
        };
        if let Err(err) = self.enqueue(ticket, pending, frame, None) {
            return Response::failed(ticket, err);
        }

        debug!(ticket, uri_pattern, "Snapshot request queued");
        Response::new(ticket, rx)
    }

    /// Opens a subscription delivering changes at most once per `interval`.
    ///
    /// The stream buffers up to [`ClientConfig::stream_capacity`]
    /// deliveries. A consumer that falls further behind loses deliveries
    /// (counted in [`dropped_states`](Self::dropped_states)); use
    /// [`stream_request_with`](Self::stream_request_with) and
    /// [`StreamBuffer::Unbounded`] when every delivery matters.
    ///
    /// # Errors
    ///
    /// `WmError::Delivery` if the connection is closed, a pattern does not
    /// compile, or the request frame cannot be sent.
    pub fn stream_request<I, S>(
        &self,
        uri_pattern: &str,
        attribute_patterns: I,
        interval: Duration,
    ) -> WmResult<StreamingResponse>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let buffer = StreamBuffer::Bounded(self.cfg.stream_capacity);
        self.stream_request_with(uri_pattern, attribute_patterns, interval, buffer)
    }

    /// Like [`stream_request`](Self::stream_request) with an explicit buffer.
    ///
    /// Waits until the request frame has been sent.
    ///
    /// # Errors
    ///
    /// Same as [`stream_request`](Self::stream_request).
    pub fn stream_request_with<I, S>(
        &self,
        uri_pattern: &str,
        attribute_patterns: I,
        interval: Duration,
        buffer: StreamBuffer,
    ) -> WmResult<StreamingResponse>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ticket = self.allocate_ticket();
        let attribute_patterns: Vec<String> = attribute_patterns.into_iter().map(Into::into).collect();
        validate_patterns(ticket, uri_pattern, &attribute_patterns)?;

        let (tx, rx) = match buffer {
            StreamBuffer::Bounded(capacity) => bounded(capacity.max(1)),
            StreamBuffer::Unbounded => unbounded(),
        };
        let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        let frame = ClientFrame::StreamRequest {
            ticket,
            uri_pattern: uri_pattern.to_string(),
            attribute_patterns,
            interval_ms,
        };

        let (reply, reply_rx) = bounded(1);
        self.enqueue(ticket, Pending::Stream { tx }, frame, Some(reply))?;
        reply_rx.recv().map_err(|_| DeliveryError::Closed)??;

        debug!(ticket, uri_pattern, interval_ms, "Stream request sent");
        Ok(StreamingResponse::new(ticket, rx, self.control_tx.clone()))
    }

    /// Closes the session. Pending snapshots fail and streams end.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("Closing world model client connection");
        }
        self.transport.close();
    }

    /// Stream deliveries dropped because a consumer fell behind.
    #[must_use]
    pub fn dropped_states(&self) -> u64 {
        self.dropped_states.load(Ordering::Relaxed)
    }

    fn allocate_ticket(&self) -> Ticket {
        loop {
            let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
            if ticket != 0 {
                return ticket;
            }
        }
    }

    fn enqueue(
        &self,
        ticket: Ticket,
        pending: Pending,
        frame: ClientFrame,
        reply: Option<Sender<Result<(), DeliveryError>>>,
    ) -> Result<(), DeliveryError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DeliveryError::Closed);
        }
        self.control_tx
            .send(ControlMsg::Register {
                ticket,
                pending,
                frame,
                reply,
            })
            .map_err(|_| DeliveryError::Closed)
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("connected", &self.connected())
            .field("next_ticket", &self.next_ticket.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.close();
        if let Ok(mut guard) = self.join.lock() {
            // Detach: open streams hold a control sender and keep the
            // worker alive until they are dropped.
            drop(guard.take());
        }
    }
}

fn validate_patterns(ticket: Ticket, uri_pattern: &str, attribute_patterns: &[String]) -> Result<(), DeliveryError> {
    let reject = |reason: String| DeliveryError::Rejected { ticket, reason };
    UriFilter::new(uri_pattern).map_err(|e| reject(e.to_string()))?;
    for pattern in attribute_patterns {
        UriFilter::new(pattern.as_str()).map_err(|e| reject(e.to_string()))?;
    }
    Ok(())
}

struct Worker {
    transport: Arc<dyn Transport>,
    send_attempts: u32,
    retry_backoff: Duration,
    pending: HashMap<Ticket, Pending>,
    closed: Arc<AtomicBool>,
    dropped_states: Arc<AtomicU64>,
}

impl Worker {
    fn run(mut self, control_rx: Receiver<ControlMsg>, inbound_rx: Receiver<ServerFrame>) {
        let mut control_rx = control_rx;
        let mut inbound_rx = inbound_rx;
        let mut control_open = true;
        let mut inbound_open = true;

        loop {
            select! {
                recv(control_rx) -> msg => match msg {
                    Ok(msg) => self.handle_control(msg, inbound_open),
                    Err(_) => {
                        // Every handle is gone; nobody can read stream data.
                        control_rx = never();
                        control_open = false;
                        self.pending.retain(|_, p| matches!(p, Pending::Snapshot { .. }));
                    }
                },
                recv(inbound_rx) -> frame => match frame {
                    Ok(ServerFrame::Disconnected) | Err(_) => {
                        inbound_rx = never();
                        inbound_open = false;
                        self.disconnect();
                    }
                    Ok(frame) => self.handle_frame(frame),
                },
            }

            if !control_open && (!inbound_open || self.pending.is_empty()) {
                break;
            }
        }

        debug!("Client worker stopped");
    }

    fn handle_control(&mut self, msg: ControlMsg, inbound_open: bool) {
        match msg {
            ControlMsg::Register {
                ticket,
                pending,
                frame,
                reply,
            } => {
                let outcome = if inbound_open {
                    self.pending.insert(ticket, pending);
                    match self.send_request(&frame) {
                        Ok(()) => Ok(()),
                        Err(failure) => {
                            warn!(ticket, error = %failure, "Failed to send request");
                            let err = DeliveryError::SendFailed {
                                ticket,
                                reason: failure.to_string(),
                            };
                            if let Some(pending) = self.pending.remove(&ticket) {
                                pending.fail(err.clone());
                            }
                            Err(err)
                        }
                    }
                } else {
                    pending.fail(DeliveryError::Closed);
                    Err(DeliveryError::Closed)
                };
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
            ControlMsg::Cancel { ticket } => {
                if self.pending.remove(&ticket).is_some() && inbound_open {
                    if let Err(failure) = self.transport.send(&ClientFrame::CancelRequest { ticket }) {
                        warn!(ticket, error = %failure, "Failed to send cancel request");
                    }
                }
            }
        }
    }

    /// Sends a request frame, retrying transient failures a bounded number of times.
    fn send_request(&self, frame: &ClientFrame) -> Result<(), SendFailure> {
        let mut attempt = 1;
        loop {
            match self.transport.send(frame) {
                Ok(()) => return Ok(()),
                Err(failure)
                    if failure.kind == FailureKind::Transient
                        && attempt < self.send_attempts
                        && self.transport.connected() =>
                {
                    debug!(attempt, error = %failure, "Transient failure sending request; retrying");
                    attempt += 1;
                    if !self.retry_backoff.is_zero() {
                        thread::sleep(self.retry_backoff);
                    }
                }
                Err(failure) => return Err(failure),
            }
        }
    }

    fn handle_frame(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::Data { ticket, state } => match self.pending.get_mut(&ticket) {
                Some(Pending::Snapshot { partial, .. }) => partial.merge(state),
                Some(Pending::Stream { tx }) => match tx.try_send(state) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        self.dropped_states.fetch_add(1, Ordering::Relaxed);
                        warn!(ticket, "Stream consumer is behind; dropping a delivery");
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        self.pending.remove(&ticket);
                    }
                },
                None => debug!(ticket, "Data for unknown ticket"),
            },
            ServerFrame::RequestComplete { ticket } => match self.pending.remove(&ticket) {
                Some(Pending::Snapshot { partial, reply }) => {
                    let _ = reply.send(Ok(partial));
                }
                Some(Pending::Stream { .. }) => debug!(ticket, "Stream ended by world model"),
                None => {}
            },
            ServerFrame::Rejected { ticket, reason } => {
                if let Some(pending) = self.pending.remove(&ticket) {
                    warn!(ticket, reason = %reason, "Request rejected");
                    pending.fail(DeliveryError::Rejected { ticket, reason });
                }
            }
            ServerFrame::Sample { .. } => debug!("Ignoring sensor sample on client connection"),
            ServerFrame::Disconnected => self.disconnect(),
        }
    }

    fn disconnect(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            warn!(pending = self.pending.len(), "World model connection lost");
        }
        for (ticket, pending) in self.pending.drain() {
            pending.fail(DeliveryError::ConnectionLost { ticket });
        }
    }
}
