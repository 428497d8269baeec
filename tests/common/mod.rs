//! In-memory world model used by the integration tests.
//!
//! Every [`LoopbackTransport`] is one session against a shared
//! [`LoopbackStore`]. Requests are answered synchronously from inside
//! `send`, so replies are already queued when the call returns.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};

use wmlink::{
    inbound_channel, AttrUpdate, Attribute, ClientConfig, ClientConnection, ClientFrame, GrailTime, PatternSet,
    Rule, SampleData, SendFailure, ServerFrame, Ticket, Transport, TypeRegistration, UriFilter, Uri, WorldState,
};

struct Subscription {
    session: u64,
    ticket: Ticket,
    uris: UriFilter,
    attributes: PatternSet,
    tx: Sender<ServerFrame>,
}

#[derive(Default)]
struct StoreInner {
    world: BTreeMap<Uri, Vec<Attribute>>,
    subscriptions: Vec<Subscription>,
    announced: Vec<(String, Vec<TypeRegistration>)>,
    rules: Vec<Vec<Rule>>,
    cancelled: Vec<Ticket>,
}

/// Shared world model state.
#[derive(Clone, Default)]
pub struct LoopbackStore {
    inner: Arc<Mutex<StoreInner>>,
    next_session: Arc<AtomicU64>,
}

impl LoopbackStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a URI with no attributes.
    pub fn create(&self, uri: &str) {
        self.inner.lock().unwrap().world.entry(Uri::from(uri)).or_default();
    }

    /// Stores an attribute and notifies matching subscriptions.
    pub fn put(&self, uri: &str, attribute: Attribute) {
        let mut inner = self.inner.lock().unwrap();
        apply(&mut inner, Uri::from(uri), attribute);
    }

    /// Current attributes of a URI.
    pub fn attributes(&self, uri: &str) -> Option<Vec<Attribute>> {
        self.inner.lock().unwrap().world.get(&Uri::from(uri)).cloned()
    }

    pub fn announced(&self) -> Vec<(String, Vec<TypeRegistration>)> {
        self.inner.lock().unwrap().announced.clone()
    }

    pub fn rule_requests(&self) -> Vec<Vec<Rule>> {
        self.inner.lock().unwrap().rules.clone()
    }

    pub fn cancelled(&self) -> Vec<Ticket> {
        self.inner.lock().unwrap().cancelled.clone()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.lock().unwrap().subscriptions.len()
    }

    /// Opens a session. The receiver gets every frame addressed to it.
    pub fn session(&self) -> (Arc<LoopbackTransport>, Receiver<ServerFrame>) {
        let (tx, rx) = inbound_channel(1024);
        let transport = Arc::new(LoopbackTransport {
            id: self.next_session.fetch_add(1, Ordering::Relaxed),
            store: self.clone(),
            inbound: Mutex::new(Some(tx)),
            connected: AtomicBool::new(true),
            failures: Mutex::new(VecDeque::new()),
            sends: AtomicU64::new(0),
        });
        (transport, rx)
    }

    /// Opens a session wrapped in a client connection.
    pub fn client(&self) -> (ClientConnection, Arc<LoopbackTransport>) {
        let (transport, rx) = self.session();
        let conn = ClientConnection::new(transport.clone(), rx, ClientConfig::default());
        (conn, transport)
    }
}

fn apply(inner: &mut StoreInner, uri: Uri, attribute: Attribute) {
    let attrs = inner.world.entry(uri.clone()).or_default();
    attrs.retain(|a| a.name != attribute.name);
    attrs.push(attribute.clone());

    for sub in &inner.subscriptions {
        if sub.uris.is_match(uri.as_str()) && sub.attributes.matches(&attribute.name) {
            let mut state = WorldState::new();
            state.push(uri.clone(), attribute.clone());
            let _ = sub.tx.send(ServerFrame::Data {
                ticket: sub.ticket,
                state,
            });
        }
    }
}

fn select(
    world: &BTreeMap<Uri, Vec<Attribute>>,
    uris: &UriFilter,
    attributes: &PatternSet,
    window: Option<(GrailTime, GrailTime)>,
) -> WorldState {
    world
        .iter()
        .filter(|(uri, _)| uris.is_match(uri.as_str()))
        .map(|(uri, attrs)| {
            let matched = attrs
                .iter()
                .filter(|a| attributes.matches(&a.name))
                .filter(|a| window.map_or(true, |(start, stop)| a.creation_date >= start && a.creation_date < stop))
                .cloned()
                .collect();
            (uri.clone(), matched)
        })
        .collect()
}

/// One session against a [`LoopbackStore`].
pub struct LoopbackTransport {
    id: u64,
    store: LoopbackStore,
    inbound: Mutex<Option<Sender<ServerFrame>>>,
    connected: AtomicBool,
    failures: Mutex<VecDeque<SendFailure>>,
    sends: AtomicU64,
}

impl LoopbackTransport {
    /// The next sends fail with these failures, in order.
    pub fn fail_next(&self, failures: impl IntoIterator<Item = SendFailure>) {
        self.failures.lock().unwrap().extend(failures);
    }

    /// Number of `send` calls, failed ones included.
    pub fn sends(&self) -> u64 {
        self.sends.load(Ordering::Relaxed)
    }

    /// Pushes a raw sample to this session.
    pub fn deliver_sample(&self, sample: SampleData) {
        self.push(ServerFrame::Sample { sample });
    }

    /// Queues a disconnect notice behind already delivered frames without
    /// closing the session.
    pub fn end_of_samples(&self) {
        self.push(ServerFrame::Disconnected);
    }

    /// Simulates the store dropping the session.
    pub fn drop_session(&self) {
        self.connected.store(false, Ordering::Release);
        if let Some(tx) = self.inbound.lock().unwrap().take() {
            let _ = tx.send(ServerFrame::Disconnected);
        }
        let id = self.id;
        self.store.inner.lock().unwrap().subscriptions.retain(|s| s.session != id);
    }

    fn push(&self, frame: ServerFrame) {
        if let Some(tx) = self.inbound.lock().unwrap().as_ref() {
            let _ = tx.send(frame);
        }
    }

    fn reply_to(&self, frame: &ClientFrame) {
        let Some(tx) = self.inbound.lock().unwrap().clone() else {
            return;
        };
        let mut inner = self.store.inner.lock().unwrap();

        match frame {
            ClientFrame::SnapshotRequest {
                ticket,
                uri_pattern,
                attribute_patterns,
                start,
                stop,
            } => {
                let (Ok(uris), Ok(attributes)) = (UriFilter::new(uri_pattern.as_str()), PatternSet::new(attribute_patterns.clone())) else {
                    let _ = tx.send(ServerFrame::Rejected {
                        ticket: *ticket,
                        reason: "bad pattern".to_string(),
                    });
                    return;
                };
                let window = (start.millis() != 0 || stop.millis() != 0).then_some((*start, *stop));
                let state = select(&inner.world, &uris, &attributes, window);

                // One frame per URI so the client has to merge them.
                for (uri, attrs) in state {
                    let mut part = WorldState::new();
                    part.insert(uri, attrs);
                    let _ = tx.send(ServerFrame::Data {
                        ticket: *ticket,
                        state: part,
                    });
                }
                let _ = tx.send(ServerFrame::RequestComplete { ticket: *ticket });
            }
            ClientFrame::StreamRequest {
                ticket,
                uri_pattern,
                attribute_patterns,
                ..
            } => {
                let (Ok(uris), Ok(attributes)) = (UriFilter::new(uri_pattern.as_str()), PatternSet::new(attribute_patterns.clone())) else {
                    let _ = tx.send(ServerFrame::Rejected {
                        ticket: *ticket,
                        reason: "bad pattern".to_string(),
                    });
                    return;
                };
                let initial = select(&inner.world, &uris, &attributes, None);
                if !initial.is_empty() {
                    let _ = tx.send(ServerFrame::Data {
                        ticket: *ticket,
                        state: initial,
                    });
                }
                inner.subscriptions.push(Subscription {
                    session: self.id,
                    ticket: *ticket,
                    uris,
                    attributes,
                    tx,
                });
            }
            ClientFrame::CancelRequest { ticket } => {
                let id = self.id;
                inner.subscriptions.retain(|s| !(s.session == id && s.ticket == *ticket));
                inner.cancelled.push(*ticket);
            }
            ClientFrame::TypeAnnounce { origin, types } => {
                inner.announced.push((origin.clone(), types.clone()));
            }
            ClientFrame::SolverData { origin, updates, .. } => {
                for AttrUpdate {
                    name,
                    creation_date,
                    uri,
                    data,
                } in updates.iter().cloned()
                {
                    let attribute = Attribute::new(name, data, creation_date, origin.clone());
                    apply(&mut inner, uri, attribute);
                }
            }
            ClientFrame::RuleRequest { rules } => {
                inner.rules.push(rules.clone());
            }
        }
    }
}

impl Transport for LoopbackTransport {
    fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn send(&self, frame: &ClientFrame) -> Result<(), SendFailure> {
        self.sends.fetch_add(1, Ordering::Relaxed);
        if !self.connected() {
            return Err(SendFailure::fatal("not connected"));
        }
        if let Some(failure) = self.failures.lock().unwrap().pop_front() {
            return Err(failure);
        }
        self.reply_to(frame);
        Ok(())
    }

    fn close(&self) {
        self.drop_session();
    }
}
