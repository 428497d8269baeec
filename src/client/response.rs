use std::sync::{Mutex, PoisonError, TryLockError};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, TryRecvError};

use crate::error::{DeliveryError, WmResult};
use crate::model::WorldState;
use crate::transport::Ticket;

type Delivery = Result<WorldState, DeliveryError>;

/// Pending result of a snapshot query.
///
/// Issuing the request never blocks; [`Response::get`] does. The snapshot
/// arrives atomically or not at all, and once resolved the outcome is
/// cached so repeated calls return the same value or error.
#[derive(Debug)]
pub struct Response {
    ticket: Ticket,
    rx: Receiver<Delivery>,
    outcome: Mutex<Option<Delivery>>,
}

impl Response {
    pub(crate) fn new(ticket: Ticket, rx: Receiver<Delivery>) -> Self {
        Self {
            ticket,
            rx,
            outcome: Mutex::new(None),
        }
    }

    /// A response that has already failed.
    pub(crate) fn failed(ticket: Ticket, err: DeliveryError) -> Self {
        let (tx, rx) = bounded(1);
        let _ = tx.send(Err(err));
        Self::new(ticket, rx)
    }

    /// Ticket assigned to the request.
    #[must_use]
    pub const fn ticket(&self) -> Ticket {
        self.ticket
    }

    /// Non-blocking check whether [`Response::get`] would return immediately.
    #[must_use]
    pub fn ready(&self) -> bool {
        match self.outcome.try_lock() {
            Ok(mut outcome) => {
                if outcome.is_some() {
                    return true;
                }
                match self.rx.try_recv() {
                    Ok(delivery) => {
                        *outcome = Some(delivery);
                        true
                    }
                    Err(TryRecvError::Empty) => false,
                    Err(TryRecvError::Disconnected) => {
                        *outcome = Some(Err(self.lost()));
                        true
                    }
                }
            }
            // Another thread is blocked in `get`.
            Err(TryLockError::WouldBlock) => !self.rx.is_empty(),
            Err(TryLockError::Poisoned(_)) => true,
        }
    }

    /// Blocks until the snapshot arrives or the request fails.
    ///
    /// # Errors
    ///
    /// `WmError::Delivery` if the connection failed or the store rejected
    /// the request. The same error is returned on every later call.
    pub fn get(&self) -> WmResult<WorldState> {
        let mut outcome = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        if outcome.is_none() {
            let delivery = self.rx.recv().unwrap_or_else(|_| Err(self.lost()));
            *outcome = Some(delivery);
        }
        match outcome.as_ref() {
            Some(Ok(state)) => Ok(state.clone()),
            Some(Err(err)) => Err(err.clone().into()),
            None => Err(self.lost().into()),
        }
    }

    /// Like [`Response::get`] but gives up after `timeout`.
    ///
    /// Returns `None` if nothing arrived in time; the response stays usable.
    pub fn get_timeout(&self, timeout: Duration) -> Option<WmResult<WorldState>> {
        let mut outcome = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        if outcome.is_none() {
            let delivery = match self.rx.recv_timeout(timeout) {
                Ok(delivery) => delivery,
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => Err(self.lost()),
            };
            *outcome = Some(delivery);
        }
        drop(outcome);
        Some(self.get())
    }

    /// Consumes the response, blocking until the snapshot arrives.
    ///
    /// # Errors
    ///
    /// See [`Response::get`].
    pub fn wait(self) -> WmResult<WorldState> {
        let cached = self.outcome.into_inner().unwrap_or_else(PoisonError::into_inner);
        let delivery = match cached {
            Some(delivery) => delivery,
            None => self.rx.recv().unwrap_or(Err(DeliveryError::ConnectionLost { ticket: self.ticket })),
        };
        delivery.map_err(Into::into)
    }

    fn lost(&self) -> DeliveryError {
        DeliveryError::ConnectionLost { ticket: self.ticket }
    }
}
