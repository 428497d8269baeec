use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, Sender};

use crate::model::WorldState;
use crate::transport::Ticket;

use super::connection::ControlMsg;

/// Outcome of a bounded wait on a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamPoll {
    /// The next incremental world state.
    Data(WorldState),
    /// Nothing arrived within the timeout.
    Pending,
    /// Cancelled, closed, or ended by the store.
    Finished,
}

struct CancelState {
    ticket: Ticket,
    cancelled: AtomicBool,
    // Dropping the sender wakes every waiter selecting on `signal_rx`.
    signal_tx: Mutex<Option<Sender<()>>>,
    signal_rx: Receiver<()>,
    control_tx: Sender<ControlMsg>,
}

/// Cloneable handle that cancels a stream from any thread.
#[derive(Clone)]
pub struct StreamCanceller(Arc<CancelState>);

impl StreamCanceller {
    /// Marks the stream terminal and wakes blocked readers.
    ///
    /// Non-blocking and idempotent. The store is asked to stop sending on a
    /// best-effort basis.
    pub fn cancel(&self) {
        if self.0.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        drop(
            self.0
                .signal_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let _ = self.0.control_tx.try_send(ControlMsg::Cancel {
            ticket: self.0.ticket,
        });
    }

    /// Returns true once `cancel` has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for StreamCanceller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCanceller")
            .field("ticket", &self.0.ticket)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Single-pass sequence of incremental world states from a subscription.
///
/// [`StreamingResponse::has_next`] blocks until either data or termination
/// is known. Once it returns false it always returns false. A URI mapped to
/// an empty attribute list in a delivery means "matched, nothing changed".
///
/// Dropping the stream cancels it.
pub struct StreamingResponse {
    ticket: Ticket,
    rx: Receiver<WorldState>,
    canceller: StreamCanceller,
    pending: Mutex<Option<WorldState>>,
    finished: AtomicBool,
}

impl StreamingResponse {
    pub(crate) fn new(ticket: Ticket, rx: Receiver<WorldState>, control_tx: Sender<ControlMsg>) -> Self {
        let (signal_tx, signal_rx) = bounded::<()>(0);
        let canceller = StreamCanceller(Arc::new(CancelState {
            ticket,
            cancelled: AtomicBool::new(false),
            signal_tx: Mutex::new(Some(signal_tx)),
            signal_rx,
            control_tx,
        }));
        Self {
            ticket,
            rx,
            canceller,
            pending: Mutex::new(None),
            finished: AtomicBool::new(false),
        }
    }

    /// Ticket assigned to the subscription.
    #[must_use]
    pub const fn ticket(&self) -> Ticket {
        self.ticket
    }

    /// Handle for cancelling from another thread.
    #[must_use]
    pub fn canceller(&self) -> StreamCanceller {
        self.canceller.clone()
    }

    /// Cancels the subscription. See [`StreamCanceller::cancel`].
    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    /// Returns true if another state will be delivered.
    ///
    /// Blocks until a state arrives or the stream terminates.
    pub fn has_next(&self) -> bool {
        if self.finished.load(Ordering::Acquire) {
            return false;
        }
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if self.canceller.is_cancelled() {
            return self.finish(&mut pending);
        }
        if pending.is_some() {
            return true;
        }

        select! {
            recv(self.rx) -> msg => match msg {
                Ok(state) if !self.canceller.is_cancelled() => {
                    *pending = Some(state);
                    true
                }
                _ => self.finish(&mut pending),
            },
            recv(self.canceller.0.signal_rx) -> _ => self.finish(&mut pending),
        }
    }

    /// Blocks for the next state; `None` once the stream has terminated.
    pub fn recv(&self) -> Option<WorldState> {
        if !self.has_next() {
            return None;
        }
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Waits at most `timeout` for the next state.
    pub fn poll_timeout(&self, timeout: Duration) -> StreamPoll {
        if self.finished.load(Ordering::Acquire) {
            return StreamPoll::Finished;
        }
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if self.canceller.is_cancelled() {
            self.finish(&mut pending);
            return StreamPoll::Finished;
        }
        if let Some(state) = pending.take() {
            return StreamPoll::Data(state);
        }

        select! {
            recv(self.rx) -> msg => match msg {
                Ok(state) if !self.canceller.is_cancelled() => StreamPoll::Data(state),
                _ => {
                    self.finish(&mut pending);
                    StreamPoll::Finished
                }
            },
            recv(self.canceller.0.signal_rx) -> _ => {
                self.finish(&mut pending);
                StreamPoll::Finished
            },
            default(timeout) => StreamPoll::Pending,
        }
    }

    /// Returns true once the stream can no longer yield data.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn finish(&self, pending: &mut Option<WorldState>) -> bool {
        *pending = None;
        self.finished.store(true, Ordering::Release);
        false
    }
}

impl Iterator for StreamingResponse {
    type Item = WorldState;

    fn next(&mut self) -> Option<WorldState> {
        self.recv()
    }
}

impl Iterator for &StreamingResponse {
    type Item = WorldState;

    fn next(&mut self) -> Option<WorldState> {
        self.recv()
    }
}

impl std::fmt::Debug for StreamingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingResponse")
            .field("ticket", &self.ticket)
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

impl Drop for StreamingResponse {
    fn drop(&mut self) {
        // Best-effort: do not block on shutdown.
        self.canceller.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Uri;
    use std::thread;
    use std::time::Instant;

    fn stream_with_feed() -> (StreamingResponse, Sender<WorldState>, Receiver<ControlMsg>) {
        let (data_tx, data_rx) = bounded(16);
        let (control_tx, control_rx) = bounded(16);
        (StreamingResponse::new(7, data_rx, control_tx), data_tx, control_rx)
    }

    fn state_with(uri: &str) -> WorldState {
        let mut ws = WorldState::new();
        ws.insert_uri(Uri::from(uri));
        ws
    }

    #[test]
    fn test_has_next_and_recv() {
        let (stream, tx, _control) = stream_with_feed();
        tx.send(state_with("a")).unwrap();
        tx.send(state_with("b")).unwrap();

        assert!(stream.has_next());
        assert!(stream.has_next()); // idempotent while a state is buffered
        assert!(stream.recv().unwrap().contains(&Uri::from("a")));
        assert!(stream.recv().unwrap().contains(&Uri::from("b")));
    }

    #[test]
    fn test_end_of_stream() {
        let (stream, tx, _control) = stream_with_feed();
        tx.send(state_with("a")).unwrap();
        drop(tx);

        let collected: Vec<WorldState> = (&stream).collect();
        assert_eq!(collected.len(), 1);
        assert!(!stream.has_next());
        assert!(stream.is_finished());
    }

    #[test]
    fn test_cancel_unblocks_waiter() {
        let (stream, _tx, control) = stream_with_feed();
        let canceller = stream.canceller();

        let started = Instant::now();
        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            canceller.cancel();
        });

        assert!(stream.recv().is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!stream.has_next());
        waker.join().unwrap();

        match control.try_recv().unwrap() {
            ControlMsg::Cancel { ticket } => assert_eq!(ticket, 7),
            other => panic!("unexpected control message: {other:?}"),
        }
    }

    #[test]
    fn test_cancel_discards_buffered_data() {
        let (stream, tx, _control) = stream_with_feed();
        tx.send(state_with("a")).unwrap();
        assert!(stream.has_next());

        stream.cancel();
        assert!(!stream.has_next());
        assert!(stream.recv().is_none());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let (stream, _tx, control) = stream_with_feed();
        stream.cancel();
        stream.cancel();
        stream.canceller().cancel();
        assert_eq!(control.len(), 1);
    }

    #[test]
    fn test_poll_timeout() {
        let (stream, tx, _control) = stream_with_feed();
        assert_eq!(stream.poll_timeout(Duration::from_millis(10)), StreamPoll::Pending);

        tx.send(state_with("a")).unwrap();
        assert!(matches!(stream.poll_timeout(Duration::from_millis(10)), StreamPoll::Data(_)));

        drop(tx);
        assert_eq!(stream.poll_timeout(Duration::from_millis(10)), StreamPoll::Finished);
        assert!(!stream.has_next());
    }

    #[test]
    fn test_drop_sends_cancel() {
        let (stream, _tx, control) = stream_with_feed();
        drop(stream);
        assert!(matches!(control.try_recv(), Ok(ControlMsg::Cancel { ticket: 7 })));
    }
}
