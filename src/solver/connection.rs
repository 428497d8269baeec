//! Solver session with the world model.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

use crate::error::{SendFailure, WmResult};
use crate::model::{AttrUpdate, Rule, SampleData, TypeRegistration};
use crate::transport::{ClientFrame, ServerFrame, Transport};

use super::dispatcher::UpdateSink;

/// Solver-side runtime settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolverConfig {
    /// Origin string attached to every published value.
    pub origin: String,
    /// Minimum interval requested for the transmitter stream.
    pub stream_interval: Duration,
    /// Attribute pattern naming transmitter attributes.
    pub transmitter_attribute: String,
    /// Ask the world model to create URIs it does not know yet.
    pub create_uris: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            origin: "binary_state_solver".to_string(),
            stream_interval: Duration::from_millis(1000),
            transmitter_attribute: "sensor.switch.*".to_string(),
            create_uris: false,
        }
    }
}

/// Connection used to publish solutions and receive raw samples.
///
/// Announces its solution types when constructed. Implements
/// [`UpdateSink`] so it can back an
/// [`UpdateDispatcher`](super::UpdateDispatcher).
pub struct SolverConnection {
    transport: Arc<dyn Transport>,
    inbound: Receiver<ServerFrame>,
    origin: String,
    create_uris: bool,
}

impl SolverConnection {
    /// Opens a solver session and announces `types`.
    ///
    /// # Errors
    ///
    /// `WmError::Send` if the announcement cannot be sent.
    pub fn new(
        transport: Arc<dyn Transport>,
        inbound: Receiver<ServerFrame>,
        cfg: &SolverConfig,
        types: &[TypeRegistration],
    ) -> WmResult<Self> {
        transport.send(&ClientFrame::TypeAnnounce {
            origin: cfg.origin.clone(),
            types: types.to_vec(),
        })?;
        info!(origin = %cfg.origin, types = types.len(), "Announced solution types");

        Ok(Self {
            transport,
            inbound,
            origin: cfg.origin.clone(),
            create_uris: cfg.create_uris,
        })
    }

    /// Origin attached to published values.
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Asks the sensor feed for samples matching `rules`.
    ///
    /// # Errors
    ///
    /// Returns the transport's classified failure.
    pub fn request_rules(&self, rules: Vec<Rule>) -> Result<(), SendFailure> {
        debug!(rules = rules.len(), "Sending rule request");
        self.transport.send(&ClientFrame::RuleRequest { rules })
    }

    /// Delivers inbound samples to `on_sample` until the session ends.
    ///
    /// Returns the number of samples delivered once the connection closes.
    ///
    /// # Errors
    ///
    /// Stops at the first error returned by `on_sample` and returns it.
    pub fn run_samples<F, E>(&self, mut on_sample: F) -> Result<u64, E>
    where
        F: FnMut(&SampleData) -> Result<(), E>,
    {
        let mut delivered = 0;
        while let Ok(frame) = self.inbound.recv() {
            match frame {
                ServerFrame::Sample { sample } => {
                    delivered += 1;
                    on_sample(&sample)?;
                }
                ServerFrame::Disconnected => break,
                other => debug!(frame = ?other, "Ignoring frame on solver connection"),
            }
        }
        warn!(delivered, "Solver connection closed");
        Ok(delivered)
    }

    /// Closes the session.
    pub fn close(&self) {
        self.transport.close();
    }
}

impl UpdateSink for SolverConnection {
    fn send_data(&self, updates: &[AttrUpdate], synchronous: bool) -> Result<(), SendFailure> {
        if synchronous {
            debug!(updates = updates.len(), "Synchronous send requested; transport writes are already blocking");
        }
        self.transport.send(&ClientFrame::SolverData {
            origin: self.origin.clone(),
            create_uris: self.create_uris,
            updates: updates.to_vec(),
        })
    }

    fn connected(&self) -> bool {
        self.transport.connected()
    }
}

impl std::fmt::Debug for SolverConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolverConnection")
            .field("origin", &self.origin)
            .field("connected", &self.transport.connected())
            .finish_non_exhaustive()
    }
}
