use std::fmt::{self, Debug, Formatter};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;

use parking_lot::Mutex;
use slab::Slab;

use crate::engine::panic_message;
use crate::error::TransformError;

/// Where an entry is in its lifecycle.
///
/// Transitions only ever go from `Pending` to one of the terminal states.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Status {
    /// The owning computation has not finished yet.
    Pending,
    /// The output is available.
    Ready,
    /// The computation failed; the error is available.
    Failed,
}

impl Status {
    /// Whether the entry will never change again.
    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

/// Identifies a subscription on a pending entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SubscriptionId(usize);

type ReadyFn<Out> = Box<dyn FnOnce(&Out) + Send>;
type FailedFn = Box<dyn FnOnce(&TransformError) + Send>;

/// A callback pair waiting for an entry to settle.
struct Subscriber<Out> {
    on_ready: ReadyFn<Out>,
    on_failed: FailedFn,
}

enum State<Out> {
    Pending(Slab<Subscriber<Out>>),
    Ready(Out),
    Failed(TransformError),
}

/// The shared result slot for one input value.
///
/// Created by [`MemoCache::lookup_or_create`](crate::MemoCache::lookup_or_create)
/// and written exactly once through the [`Completer`] handed to the caller that
/// created it. Everybody else observes it through [`subscribe`](Self::subscribe).
pub struct TransformResult<K, Out> {
    key: K,
    raw: String,
    state: Mutex<State<Out>>,
    /// How many evictions have passed since the entry was last looked up.
    age: AtomicUsize,
}

impl<K, Out> TransformResult<K, Out> {
    pub(crate) fn new(key: K, raw: String) -> Self {
        Self {
            key,
            raw,
            state: Mutex::new(State::Pending(Slab::new())),
            age: AtomicUsize::new(0),
        }
    }

    /// The canonical key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// The raw value the entry was created for.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The current status.
    pub fn status(&self) -> Status {
        match &*self.state.lock() {
            State::Pending(_) => Status::Pending,
            State::Ready(_) => Status::Ready,
            State::Failed(_) => Status::Failed,
        }
    }

    /// The error, if the entry failed.
    pub fn error(&self) -> Option<TransformError> {
        match &*self.state.lock() {
            State::Failed(error) => Some(error.clone()),
            _ => None,
        }
    }

    /// How many subscribers are still waiting.
    pub fn subscribers(&self) -> usize {
        match &*self.state.lock() {
            State::Pending(subscribers) => subscribers.len(),
            _ => 0,
        }
    }

    /// Remove a subscription before the entry settles.
    ///
    /// The computation itself is unaffected and still completes for the
    /// benefit of the cache and other subscribers. Returns whether the
    /// subscription was still registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match &mut *self.state.lock() {
            State::Pending(subscribers) => subscribers.try_remove(id.0).is_some(),
            _ => false,
        }
    }

    pub(crate) fn touch(&self) {
        self.age.store(0, Ordering::Relaxed);
    }

    /// Age the entry by one eviction round and return the new age.
    pub(crate) fn grow_older(&self) -> usize {
        self.age.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl<K, Out: Clone> TransformResult<K, Out> {
    /// The output, if the entry is ready.
    pub fn output(&self) -> Option<Out> {
        match &*self.state.lock() {
            State::Ready(output) => Some(output.clone()),
            _ => None,
        }
    }

    /// Register callbacks for when the entry settles.
    ///
    /// If the entry is already terminal, the matching callback runs right away
    /// on the calling thread and `None` is returned. Otherwise exactly one of
    /// the callbacks runs exactly once, on the thread of the computation that
    /// settles the entry.
    pub fn subscribe<R, F>(&self, on_ready: R, on_failed: F) -> Option<SubscriptionId>
    where
        R: FnOnce(&Out) + Send + 'static,
        F: FnOnce(&TransformError) + Send + 'static,
    {
        let outcome = match &mut *self.state.lock() {
            State::Pending(subscribers) => {
                let id = subscribers.insert(Subscriber {
                    on_ready: Box::new(on_ready),
                    on_failed: Box::new(on_failed),
                });
                return Some(SubscriptionId(id));
            }
            State::Ready(output) => Ok(output.clone()),
            State::Failed(error) => Err(error.clone()),
        };

        // The lock is released here, so the callback may look at the entry.
        match outcome {
            Ok(output) => on_ready(&output),
            Err(error) => on_failed(&error),
        }
        None
    }

    /// Block the current thread until the entry settles.
    ///
    /// The thread is woken by the settling computation; nothing polls.
    pub fn wait(&self) -> Result<Out, TransformError>
    where
        Out: Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        let failed = tx.clone();
        self.subscribe(
            move |output: &Out| {
                let _ = tx.send(Ok(output.clone()));
            },
            move |error| {
                let _ = failed.send(Err(error.clone()));
            },
        );
        rx.recv().unwrap_or(Err(TransformError::Abandoned))
    }

    /// Move the entry into a terminal state and notify every subscriber.
    fn settle(&self, terminal: State<Out>) {
        let (subscribers, outcome) = {
            let mut state = self.state.lock();
            let State::Pending(subscribers) = &mut *state else {
                panic!("transmemo: concurrency violation: entry settled twice");
            };
            let subscribers = std::mem::take(subscribers);
            let outcome = match &terminal {
                State::Ready(output) => Ok(output.clone()),
                State::Failed(error) => Err(error.clone()),
                State::Pending(_) => unreachable!("entries only settle into terminal states"),
            };
            *state = terminal;
            (subscribers, outcome)
        };

        // Callbacks run without the lock so that they may look at the entry.
        // A panicking subscriber must not keep the others from their result.
        for (_, subscriber) in subscribers {
            let notified = panic::catch_unwind(AssertUnwindSafe(|| match &outcome {
                Ok(output) => (subscriber.on_ready)(output),
                Err(error) => (subscriber.on_failed)(error),
            }));
            if let Err(payload) = notified {
                tracing::warn!(
                    message = %panic_message(payload.as_ref()),
                    "subscriber panicked while being notified"
                );
            }
        }
    }
}

impl<K: Debug, Out> Debug for TransformResult<K, Out> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("TransformResult")
            .field("key", &self.key)
            .field("raw", &self.raw)
            .field("status", &self.status())
            .finish()
    }
}

/// The right to settle one entry.
///
/// Handed out exactly once per entry, to the caller that created it. Consumed
/// by [`complete`](Self::complete) or [`fail`](Self::fail). Dropping it unused
/// fails the entry with [`TransformError::Abandoned`] so that no subscriber is
/// left waiting forever.
pub struct Completer<K, Out: Clone> {
    entry: Option<Arc<TransformResult<K, Out>>>,
}

impl<K, Out: Clone> Completer<K, Out> {
    pub(crate) fn new(entry: Arc<TransformResult<K, Out>>) -> Self {
        Self { entry: Some(entry) }
    }

    /// The entry this completer owns.
    pub fn entry(&self) -> &Arc<TransformResult<K, Out>> {
        self.entry.as_ref().expect("completer is only emptied on consumption")
    }

    /// Store the output and notify all subscribers.
    pub fn complete(mut self, output: Out) {
        if let Some(entry) = self.entry.take() {
            entry.settle(State::Ready(output));
        }
    }

    /// Store the error and notify all subscribers.
    pub fn fail(mut self, error: TransformError) {
        if let Some(entry) = self.entry.take() {
            entry.settle(State::Failed(error));
        }
    }
}

impl<K, Out: Clone> Drop for Completer<K, Out> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            tracing::warn!(raw = entry.raw(), "transform computation abandoned");
            entry.settle(State::Failed(TransformError::Abandoned));
        }
    }
}

impl<K: Debug, Out: Clone> Debug for Completer<K, Out> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_tuple("Completer").field(&self.entry).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn pending() -> Completer<&'static str, String> {
        Completer::new(Arc::new(TransformResult::new("k", "raw".into())))
    }

    #[test]
    fn test_fan_out_exactly_once() {
        let completer = pending();
        let entry = completer.entry().clone();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let hits = hits.clone();
            let id = entry.subscribe(
                move |out: &String| {
                    assert_eq!(out, "done");
                    hits.fetch_add(1, Ordering::SeqCst);
                },
                |_| panic!("must not fail"),
            );
            assert!(id.is_some());
        }
        assert_eq!(entry.subscribers(), 5);
        completer.complete("done".into());
        assert_eq!(hits.load(Ordering::SeqCst), 5);
        assert_eq!(entry.subscribers(), 0);
        assert_eq!(entry.status(), Status::Ready);
        assert_eq!(entry.output().as_deref(), Some("done"));
    }

    #[test]
    fn test_panicking_subscriber_does_not_starve_others() {
        let completer = pending();
        let entry = completer.entry().clone();
        let hits = Arc::new(AtomicUsize::new(0));
        entry.subscribe(|_| panic!("sink blew up"), |_| {});
        let inner = hits.clone();
        entry.subscribe(
            move |out: &String| {
                assert_eq!(out, "done");
                inner.fetch_add(1, Ordering::SeqCst);
            },
            |_| panic!("must not fail"),
        );
        completer.complete("done".into());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(entry.status(), Status::Ready);

        let completer = pending();
        let entry = completer.entry().clone();
        let inner = hits.clone();
        entry.subscribe(|_| {}, |_| panic!("sink blew up"));
        entry.subscribe(|_| {}, move |_| {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        drop(completer);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(entry.error(), Some(TransformError::Abandoned));
    }

    #[test]
    fn test_subscribe_after_settle_runs_immediately() {
        let completer = pending();
        let entry = completer.entry().clone();
        completer.fail(TransformError::fault("test", "nope"));
        let seen = Arc::new(AtomicUsize::new(0));
        let inner = seen.clone();
        let id = entry.subscribe(
            |_| panic!("must not succeed"),
            move |error| {
                assert_eq!(error, &TransformError::fault("test", "nope"));
                inner.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert_eq!(id, None);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(entry.status(), Status::Failed);
    }

    #[test]
    fn test_unsubscribe_skips_callback() {
        let completer = pending();
        let entry = completer.entry().clone();
        let id = entry
            .subscribe(|_| panic!("unsubscribed"), |_| panic!("unsubscribed"))
            .unwrap();
        assert!(entry.unsubscribe(id));
        assert!(!entry.unsubscribe(id));
        completer.complete("value".into());
        assert_eq!(entry.status(), Status::Ready);
    }

    #[test]
    fn test_dropped_completer_abandons() {
        let completer = pending();
        let entry = completer.entry().clone();
        drop(completer);
        assert_eq!(entry.error(), Some(TransformError::Abandoned));
    }

    #[test]
    fn test_wait_across_threads() {
        let completer = pending();
        let entry = completer.entry().clone();
        let handle = std::thread::spawn(move || entry.wait());
        completer.complete("late".into());
        assert_eq!(handle.join().unwrap(), Ok("late".to_string()));
    }

    #[test]
    #[should_panic(expected = "transmemo: concurrency violation")]
    fn test_double_settle_is_fatal() {
        let entry = Arc::new(TransformResult::<&str, String>::new("k", "raw".into()));
        entry.settle(State::Ready("a".into()));
        entry.settle(State::Ready("b".into()));
    }
}
