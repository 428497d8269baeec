//! Change tracker: last reported derived value per URI.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::model::Uri;

/// Suppresses repeated reports of an unchanged derived value.
///
/// The compare and the update happen under one lock, so concurrent callers
/// deriving the same value for the same URI report it at most once.
#[derive(Debug)]
pub struct ChangeTracker<V> {
    last: Mutex<HashMap<Uri, V>>,
}

impl<V> Default for ChangeTracker<V> {
    fn default() -> Self {
        Self {
            last: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: PartialEq> ChangeTracker<V> {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true and records `value` if it differs from the last value
    /// recorded for `uri` (or nothing was recorded yet).
    pub fn should_report(&self, uri: &Uri, value: V) -> bool {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        match last.get_mut(uri) {
            Some(current) if *current == value => false,
            Some(current) => {
                *current = value;
                true
            }
            None => {
                last.insert(uri.clone(), value);
                true
            }
        }
    }

    /// Drops the recorded value for `uri`, returning it.
    pub fn forget(&self, uri: &Uri) -> Option<V> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner).remove(uri)
    }

    /// Number of URIs with a recorded value.
    #[must_use]
    pub fn len(&self) -> usize {
        self.last.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns true if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: PartialEq + Clone> ChangeTracker<V> {
    /// Last value recorded for `uri`.
    #[must_use]
    pub fn last_known(&self, uri: &Uri) -> Option<V> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uri)
            .cloned()
    }
}
