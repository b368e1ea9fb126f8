use tracing::debug;

use crate::host::{FlushScope, TranslationHost};

/// Translation cache flushes waiting for the next safe point.
///
/// A queued [`FlushScope::All`] subsumes every other request, and identical page or block
/// requests collapse into one.
#[derive(Debug, Default)]
pub struct FlushQueue {
    pending: Vec<FlushScope>,
    flush_all: bool,
}

impl FlushQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a flush.
    pub fn push(&mut self, scope: FlushScope) {
        if self.flush_all {
            return;
        }

        match scope {
            FlushScope::All => {
                self.pending.clear();
                self.flush_all = true;
            }
            scope if !self.pending.contains(&scope) => self.pending.push(scope),
            _ => {}
        }
        debug!(%scope, "queued translation cache flush");
    }

    /// Returns `true` if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.flush_all && self.pending.is_empty()
    }

    /// Requests currently queued, in the order they will be performed.
    #[must_use]
    pub fn pending(&self) -> Vec<FlushScope> {
        if self.flush_all {
            vec![FlushScope::All]
        } else {
            self.pending.clone()
        }
    }

    /// Performs every queued flush on `host` and empties the queue.
    ///
    /// # Returns
    ///
    /// Number of flushes issued.
    pub fn perform(&mut self, host: &mut dyn TranslationHost) -> usize {
        let requests = self.pending();
        self.pending.clear();
        self.flush_all = false;

        for scope in &requests {
            debug!(%scope, "flushing translation cache");
            host.flush_translation_cache(*scope);
        }
        requests.len()
    }
}
