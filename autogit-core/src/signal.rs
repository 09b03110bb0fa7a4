//! Completion signals and drain counters
//!
//! A [`DoneTrigger`] is owned by exactly one party and consumed when fired;
//! any number of [`DoneSignal`] clones observe it. Dropping an unfired trigger
//! also releases the waiters, so an abandoned request can never hang a caller.

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::watch;

/// Create a connected trigger/signal pair
pub fn done_pair() -> (DoneTrigger, DoneSignal) {
    let (tx, rx) = watch::channel(false);
    (DoneTrigger(tx), DoneSignal(rx))
}

/// The single writer side of a completion signal
#[derive(Debug)]
pub struct DoneTrigger(watch::Sender<bool>);

impl DoneTrigger {
    /// Fire the signal; every current and future waiter observes it
    pub fn fire(self) {
        self.0.send_replace(true);
    }
}

/// A broadcast-once completion signal
#[derive(Debug, Clone)]
pub struct DoneSignal(watch::Receiver<bool>);

impl DoneSignal {
    /// Wait until the signal fires (or its trigger is dropped)
    pub async fn wait(&self) {
        let mut rx = self.0.clone();
        // An error means the trigger was dropped, which also counts as done.
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Whether the signal has already fired
    pub fn is_done(&self) -> bool {
        *self.0.borrow() || self.0.has_changed().is_err()
    }

    /// Whether both handles observe the same underlying signal
    pub fn same_as(&self, other: &DoneSignal) -> bool {
        self.0.same_channel(&other.0)
    }
}

/// A counter that can be waited on until it drops back to zero
///
/// Unlike a one-shot wait group it may be reused: it can go from zero to
/// non-zero and back any number of times.
#[derive(Debug, Clone)]
pub struct PendingCounter(Arc<watch::Sender<usize>>);

impl Default for PendingCounter {
    fn default() -> Self {
        Self(Arc::new(watch::channel(0).0))
    }
}

impl PendingCounter {
    /// Create a counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the counter
    pub fn add(&self) {
        self.0.send_modify(|count| *count += 1);
    }

    /// Decrement the counter, saturating at zero
    pub fn done(&self) {
        self.0.send_modify(|count| *count = count.saturating_sub(1));
    }

    /// Current count
    pub fn count(&self) -> usize {
        *self.0.borrow()
    }

    /// Wait until the count reaches zero
    pub async fn wait_idle(&self) {
        let mut rx = self.0.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

/// Decrements a [`PendingCounter`] when dropped, including on panic
#[derive(Debug)]
struct PendingGuard(PendingCounter);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.done();
    }
}

/// A group of fire-and-forget tasks whose completion can still be awaited
#[derive(Debug, Clone, Default)]
pub struct TaskGroup {
    running: PendingCounter,
}

impl TaskGroup {
    /// Create an empty task group
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a tracked task on the given runtime
    pub fn spawn<F>(&self, runtime: &Handle, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.running.add();
        let guard = PendingGuard(self.running.clone());
        runtime.spawn(async move {
            let _guard = guard;
            task.await;
        });
    }

    /// Number of tasks still running
    pub fn running(&self) -> usize {
        self.running.count()
    }

    /// Wait for every spawned task to finish
    pub async fn wait(&self) {
        self.running.wait_idle().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_fire_releases_all_waiters() {
        let (trigger, signal) = done_pair();
        let other = signal.clone();
        assert!(!signal.is_done());

        let waiter = tokio::spawn(async move { other.wait().await });
        trigger.fire();

        timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
        assert!(signal.is_done());
        // Late waiters return immediately.
        timeout(Duration::from_secs(1), signal.wait()).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_trigger_counts_as_done() {
        let (trigger, signal) = done_pair();
        drop(trigger);
        assert!(signal.is_done());
        timeout(Duration::from_secs(1), signal.wait()).await.unwrap();
    }

    #[test]
    fn test_same_as() {
        let (_t1, s1) = done_pair();
        let (_t2, s2) = done_pair();
        assert!(s1.same_as(&s1.clone()));
        assert!(!s1.same_as(&s2));
    }

    #[tokio::test]
    async fn test_pending_counter_is_reusable() {
        let counter = PendingCounter::new();
        timeout(Duration::from_secs(1), counter.wait_idle()).await.unwrap();

        counter.add();
        counter.add();
        assert_eq!(counter.count(), 2);

        let waiter = {
            let counter = counter.clone();
            tokio::spawn(async move { counter.wait_idle().await })
        };
        counter.done();
        assert!(!waiter.is_finished());
        counter.done();
        timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();

        counter.add();
        assert_eq!(counter.count(), 1);
    }

    #[tokio::test]
    async fn test_task_group_waits_for_spawned_tasks() {
        let group = TaskGroup::new();
        let (trigger, signal) = done_pair();

        group.spawn(&Handle::current(), async move { signal.wait().await });
        assert_eq!(group.running(), 1);

        trigger.fire();
        timeout(Duration::from_secs(5), group.wait()).await.unwrap();
        assert_eq!(group.running(), 0);
    }
}
