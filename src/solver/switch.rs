//! Binary switch solver.
//!
//! Per URI the state moves `Unknown -> Known(on)` and then between known
//! values. A sample only counts if it is valid and carries exactly one
//! sense byte equal to `0` (off) or `255` (on); anything else is filtered
//! silently. Each change is published once for every configured class the
//! URI belongs to.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::TypeConfig;
use crate::error::{DispatchError, PatternError};
use crate::model::{AttrUpdate, SampleData, Uri};
use crate::pattern::UriFilter;

use super::discovery::TransmitterDirectory;
use super::dispatcher::{UpdateDispatcher, UpdateSink};
use super::tracker::ChangeTracker;

/// Sense byte for "off".
pub const SWITCH_OFF: u8 = 0;
/// Sense byte for "on".
pub const SWITCH_ON: u8 = 255;

/// Decodes a switch reading. `None` means the sample is not a switch event.
#[must_use]
pub fn decode_switch(sample: &SampleData) -> Option<bool> {
    if !sample.valid {
        return None;
    }
    match sample.sense_data.as_slice() {
        [SWITCH_OFF] => Some(false),
        [SWITCH_ON] => Some(true),
        _ => None,
    }
}

/// Attribute payload for a switch value.
#[must_use]
pub fn encode_switch(on: bool) -> Vec<u8> {
    vec![u8::from(on)]
}

/// A published state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateReport {
    /// Object whose switch changed.
    pub uri: Uri,
    /// Solution name written for the object's class.
    pub solution: String,
    /// New switch value.
    pub on: bool,
}

impl fmt::Display for StateReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.on {
            write!(f, "{} is {}", self.uri, self.solution)
        } else {
            write!(f, "{} is not {}", self.uri, self.solution)
        }
    }
}

/// Derives switch solutions from raw samples and publishes changes.
#[derive(Debug)]
pub struct SwitchSolver<S> {
    types: TypeConfig,
    directory: Arc<TransmitterDirectory>,
    tracker: ChangeTracker<bool>,
    dispatcher: UpdateDispatcher<S>,
}

impl<S: UpdateSink> SwitchSolver<S> {
    /// Creates a solver resolving transmitters through `directory`.
    pub fn new(types: TypeConfig, directory: Arc<TransmitterDirectory>, dispatcher: UpdateDispatcher<S>) -> Self {
        Self {
            types,
            directory,
            tracker: ChangeTracker::new(),
            dispatcher,
        }
    }

    /// URI filter selecting every object of a configured class.
    ///
    /// # Errors
    ///
    /// Propagates pattern construction errors.
    pub fn uri_filter(&self) -> Result<UriFilter, PatternError> {
        UriFilter::for_classes(self.types.class_names())
    }

    /// Handles one raw sample.
    ///
    /// Returns one report per update pushed; empty when the sample was
    /// filtered, came from an unknown transmitter, or repeated the known
    /// state.
    ///
    /// # Errors
    ///
    /// Returns the dispatcher error for the first update that could not be
    /// pushed. Reports for updates already pushed are lost with it.
    pub fn on_sample(&self, sample: &SampleData) -> Result<Vec<StateReport>, DispatchError> {
        let Some(on) = decode_switch(sample) else {
            return Ok(Vec::new());
        };

        let key = sample.transmitter();
        let Some(uri) = self.directory.lookup(key) else {
            debug!(transmitter = %key, "Sample from unbound transmitter; ignoring");
            return Ok(Vec::new());
        };

        if !self.tracker.should_report(&uri, on) {
            return Ok(Vec::new());
        }

        let mut reports = Vec::new();
        for (_, solution) in self.types.solutions_for(uri.as_str()) {
            let update = AttrUpdate::now(solution, uri.clone(), encode_switch(on));
            self.dispatcher.send_data(std::slice::from_ref(&update), false)?;

            let report = StateReport {
                uri: uri.clone(),
                solution: solution.to_string(),
                on,
            };
            info!(uri = %uri, solution, on, "Switch state changed");
            reports.push(report);
        }
        Ok(reports)
    }

    /// Last published value for `uri`.
    #[must_use]
    pub fn state_of(&self, uri: &Uri) -> Option<bool> {
        self.tracker.last_known(uri)
    }

    /// The class configuration.
    #[must_use]
    pub const fn types(&self) -> &TypeConfig {
        &self.types
    }

    /// The transmitter directory shared with discovery.
    #[must_use]
    pub fn directory(&self) -> &Arc<TransmitterDirectory> {
        &self.directory
    }

    /// The dispatcher used for publishing.
    #[must_use]
    pub const fn dispatcher(&self) -> &UpdateDispatcher<S> {
        &self.dispatcher
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SendFailure;
    use crate::model::{TransmitterId, TransmitterKey};
    use std::io::Cursor;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<AttrUpdate>>,
        fail_with: Mutex<Option<SendFailure>>,
    }

    impl UpdateSink for RecordingSink {
        fn send_data(&self, updates: &[AttrUpdate], _synchronous: bool) -> Result<(), SendFailure> {
            if let Some(failure) = self.fail_with.lock().unwrap().clone() {
                return Err(failure);
            }
            self.sent.lock().unwrap().extend_from_slice(updates);
            Ok(())
        }

        fn connected(&self) -> bool {
            true
        }
    }

    const TX: TransmitterKey = TransmitterKey::new(1, TransmitterId(42));

    fn solver(config: &str) -> SwitchSolver<Arc<RecordingSink>> {
        let types = TypeConfig::from_reader(Cursor::new(config.to_string())).unwrap();
        let directory = Arc::new(TransmitterDirectory::new());
        directory.bind(TX, Uri::from("room1.mug.mug42"));
        SwitchSolver::new(types, directory, UpdateDispatcher::new(Arc::new(RecordingSink::default())))
    }

    fn sample(data: &[u8]) -> SampleData {
        SampleData {
            valid: true,
            physical_layer: TX.physical_layer,
            tx_id: TX.tx_id,
            sense_data: data.to_vec(),
        }
    }

    fn sent(s: &SwitchSolver<Arc<RecordingSink>>) -> Vec<AttrUpdate> {
        s.dispatcher().sink().sent.lock().unwrap().clone()
    }

    #[test]
    fn test_decode_switch() {
        assert_eq!(decode_switch(&sample(&[0])), Some(false));
        assert_eq!(decode_switch(&sample(&[255])), Some(true));
        assert_eq!(decode_switch(&sample(&[1])), None);
        assert_eq!(decode_switch(&sample(&[255, 0])), None);
        assert_eq!(decode_switch(&sample(&[])), None);

        let mut invalid = sample(&[255]);
        invalid.valid = false;
        assert_eq!(decode_switch(&invalid), None);
    }

    #[test]
    fn test_on_sample_publishes_once() {
        let s = solver("mug switch_state\n");
        let reports = s.on_sample(&sample(&[255])).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].to_string(), "room1.mug.mug42 is switch_state");

        let updates = sent(&s);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].name, "switch_state");
        assert_eq!(updates[0].uri, Uri::from("room1.mug.mug42"));
        assert_eq!(updates[0].data, vec![1]);

        assert!(s.on_sample(&sample(&[255])).unwrap().is_empty());
        assert_eq!(sent(&s).len(), 1);
        assert_eq!(s.state_of(&Uri::from("room1.mug.mug42")), Some(true));
    }

    #[test]
    fn test_off_report() {
        let s = solver("mug switch_state\n");
        let reports = s.on_sample(&sample(&[0])).unwrap();
        assert_eq!(reports[0].to_string(), "room1.mug.mug42 is not switch_state");
        assert_eq!(sent(&s)[0].data, vec![0]);
    }

    #[test]
    fn test_every_matching_class_gets_an_update() {
        let s = solver("mug switch_state\nmug42 other_state\nroom1 room_state\ndoor door_open\n");
        let reports = s.on_sample(&sample(&[255])).unwrap();
        let mut names: Vec<String> = reports.into_iter().map(|r| r.solution).collect();
        names.sort();
        // `room1` and `mug42` are not interior segments.
        assert_eq!(names, vec!["switch_state".to_string()]);
    }

    #[test]
    fn test_unbound_transmitter_ignored() {
        let s = solver("mug switch_state\n");
        let mut other = sample(&[255]);
        other.tx_id = TransmitterId(7);
        assert!(s.on_sample(&other).unwrap().is_empty());
        assert!(sent(&s).is_empty());
    }

    #[test]
    fn test_midrange_ignored() {
        let s = solver("mug switch_state\n");
        for byte in [1_u8, 127, 254] {
            assert!(s.on_sample(&sample(&[byte])).unwrap().is_empty());
        }
        assert!(sent(&s).is_empty());
        assert_eq!(s.state_of(&Uri::from("room1.mug.mug42")), None);
    }

    #[test]
    fn test_permanent_failure_propagates() {
        let s = solver("mug switch_state\n");
        *s.dispatcher().sink().fail_with.lock().unwrap() = Some(SendFailure::permanent("bad"));
        assert!(matches!(
            s.on_sample(&sample(&[255])),
            Err(DispatchError::Permanent(_))
        ));
    }

    #[test]
    fn test_uri_filter() {
        let s = solver("mug switch_state\ncoffee_pot brewing\n");
        let filter = s.uri_filter().unwrap();
        assert!(filter.is_match("room1.mug.mug42"));
        assert!(filter.is_match("kitchen.coffee pot.1"));
        assert!(!filter.is_match("room1.mugshot.1"));
    }
}
