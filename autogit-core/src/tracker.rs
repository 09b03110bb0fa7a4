//! In-process tracking of queued and in-progress sync requests
//!
//! Both maps sit behind one mutex so that "is it queued?", "is it running?"
//! and the hand-off between the two are atomic with respect to each other.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::request::RequestId;
use crate::signal::{DoneSignal, PendingCounter};

/// Outcome of trying to take the in-progress slot for an identity
#[derive(Debug)]
pub(crate) enum Claim {
    /// The caller now owns the identity
    Acquired,
    /// Another request with the same identity is running; wait on it and retry
    Busy(DoneSignal),
}

#[derive(Debug, Default)]
struct Maps {
    queued: HashMap<RequestId, DoneSignal>,
    in_progress: HashMap<RequestId, DoneSignal>,
}

#[derive(Debug, Default)]
pub(crate) struct RequestTracker {
    maps: Mutex<Maps>,
    pending: PendingCounter,
}

impl RequestTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn maps(&self) -> MutexGuard<'_, Maps> {
        self.maps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new request, or return the signal of the queued request it
    /// coalesces into.
    ///
    /// On `None` the caller has promised to deliver the request to the queue
    /// (or to call [`RequestTracker::unregister`] if the queue is gone).
    pub(crate) fn register(&self, id: &RequestId, signal: &DoneSignal) -> Option<DoneSignal> {
        let mut maps = self.maps();
        if let Some(existing) = maps.queued.get(id) {
            return Some(existing.clone());
        }
        self.pending.add();
        maps.queued.insert(id.clone(), signal.clone());
        None
    }

    /// Undo a registration whose request never made it into the queue
    pub(crate) fn unregister(&self, id: &RequestId) {
        let mut maps = self.maps();
        if maps.queued.remove(id).is_some() {
            self.pending.done();
        }
    }

    /// Take the in-progress slot for `id` if nobody else holds it
    pub(crate) fn try_claim(&self, id: &RequestId, signal: &DoneSignal) -> Claim {
        let mut maps = self.maps();
        if let Some(running) = maps.in_progress.get(id) {
            return Claim::Busy(running.clone());
        }
        maps.queued.remove(id);
        maps.in_progress.insert(id.clone(), signal.clone());
        Claim::Acquired
    }

    /// Release the in-progress slot and account for the finished request
    pub(crate) fn retire(&self, id: &RequestId) {
        let mut maps = self.maps();
        maps.in_progress.remove(id);
        self.pending.done();
    }

    /// Counter of registered-but-not-retired requests
    pub(crate) fn pending(&self) -> &PendingCounter {
        &self.pending
    }

    #[cfg(test)]
    pub(crate) fn queued_len(&self) -> usize {
        self.maps().queued.len()
    }

    #[cfg(test)]
    pub(crate) fn in_progress_len(&self) -> usize {
        self.maps().in_progress.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Destination, RequestId};
    use crate::signal::done_pair;

    fn id(repo: &str) -> RequestId {
        RequestId::new(&Destination::parse("teamB/mirror").unwrap(), repo)
    }

    #[test]
    fn test_duplicate_registration_coalesces() {
        let tracker = RequestTracker::new();
        let (_t1, first) = done_pair();
        let (_t2, second) = done_pair();

        assert!(tracker.register(&id("proj"), &first).is_none());
        let existing = tracker.register(&id("proj"), &second).unwrap();
        assert!(existing.same_as(&first));
        assert_eq!(tracker.pending().count(), 1);
        assert_eq!(tracker.queued_len(), 1);
    }

    #[test]
    fn test_claim_moves_request_to_in_progress() {
        let tracker = RequestTracker::new();
        let (_t, signal) = done_pair();
        tracker.register(&id("proj"), &signal);

        assert!(matches!(tracker.try_claim(&id("proj"), &signal), Claim::Acquired));
        assert_eq!(tracker.queued_len(), 0);
        assert_eq!(tracker.in_progress_len(), 1);

        // A new request for the same identity no longer coalesces...
        let (_t2, next) = done_pair();
        assert!(tracker.register(&id("proj"), &next).is_none());
        assert_eq!(tracker.pending().count(), 2);

        // ...and has to wait for the running one.
        match tracker.try_claim(&id("proj"), &next) {
            Claim::Busy(running) => assert!(running.same_as(&signal)),
            Claim::Acquired => panic!("identity claimed twice"),
        }
    }

    #[test]
    fn test_retire_frees_identity() {
        let tracker = RequestTracker::new();
        let (_t, signal) = done_pair();
        tracker.register(&id("proj"), &signal);
        tracker.try_claim(&id("proj"), &signal);
        tracker.retire(&id("proj"));

        assert_eq!(tracker.in_progress_len(), 0);
        assert_eq!(tracker.pending().count(), 0);

        let (_t2, next) = done_pair();
        assert!(matches!(tracker.try_claim(&id("proj"), &next), Claim::Acquired));
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let tracker = RequestTracker::new();
        let (_t, signal) = done_pair();
        tracker.register(&id("proj"), &signal);
        tracker.unregister(&id("proj"));
        tracker.unregister(&id("proj"));
        assert_eq!(tracker.pending().count(), 0);
        assert_eq!(tracker.queued_len(), 0);
    }

    #[test]
    fn test_distinct_identities_do_not_interact() {
        let tracker = RequestTracker::new();
        let (_t1, a) = done_pair();
        let (_t2, b) = done_pair();
        tracker.register(&id("one"), &a);
        tracker.register(&id("two"), &b);
        assert!(matches!(tracker.try_claim(&id("one"), &a), Claim::Acquired));
        assert!(matches!(tracker.try_claim(&id("two"), &b), Claim::Acquired));
        assert_eq!(tracker.pending().count(), 2);
    }
}
