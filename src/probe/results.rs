use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::ProbeResult;

/// A visible probe result changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResultUpdate {
    /// Endpoint id, see [`crate::ThirdComponent::endpoint_id`].
    pub id: String,
    /// The new result.
    pub result: ProbeResult,
}

/// Last visible probe result per endpoint.
///
/// Writers only notify when the stored value actually changes, so the
/// receiving side sees each transition once.
#[derive(Debug)]
pub struct ResultsCache {
    results: Mutex<HashMap<String, ProbeResult>>,
    updates: mpsc::Sender<ResultUpdate>,
}

impl ResultsCache {
    /// Creates an empty cache and the receiving end of its change queue.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ResultUpdate>) {
        let (updates, rx) = mpsc::channel(capacity.max(1));
        let cache = Self {
            results: Mutex::new(HashMap::new()),
            updates,
        };
        (cache, rx)
    }

    /// The stored result of an endpoint.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<ProbeResult> {
        self.results.lock().get(id).copied()
    }

    /// Stores a result; returns `true` and notifies when it differs from the
    /// stored one.
    pub fn set(&self, id: &str, result: ProbeResult) -> bool {
        {
            let mut results = self.results.lock();
            if results.get(id) == Some(&result) {
                return false;
            }
            results.insert(id.to_string(), result);
        }

        let update = ResultUpdate {
            id: id.to_string(),
            result,
        };
        match self.updates.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(update)) => {
                tracing::debug!(id = %update.id, "probe result queue full, dropping notification");
            }
            Err(TrySendError::Closed(_)) => {}
        }
        true
    }

    /// Drops the stored result of an endpoint.
    pub fn remove(&self, id: &str) {
        self.results.lock().remove(id);
    }

    /// Number of stored results.
    #[must_use]
    pub fn len(&self) -> usize {
        self.results.lock().len()
    }

    /// Whether no result is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
