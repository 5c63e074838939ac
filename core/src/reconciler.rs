//! Reconciles a synchronously captured snapshot with a change feed's own asynchronous notifications.
//!
//! A [`FeedSubscription`] owns exactly one upstream registration and moves through three phases:
//!
//! ```text
//!   subscribe ──► AwaitingInitial ──(Initial)──► Live ──(Update)*──┐
//!                       │                         │ ◄──────────────┘
//!                       └──(Failure / cancel / protocol violation)─┴──► Disposed
//! ```
//!
//! On subscribe the listener immediately receives `Reset` with the snapshot taken at that moment. The
//! upstream's own `Initial` is then compared with that snapshot: if equal it is swallowed, otherwise
//! the difference is delivered as one ordinary batch. Every later `Update` becomes one framed batch
//! (`BeginBatch`, `Insert`, `Delete`, `Update`, `EndBatch`, with empty sets left out), and updates
//! that change nothing produce no events at all.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, ThreadId};

use hottake_signals::{Release, SubscribeListener};
use tracing::{debug, error, trace, warn};
use ulid::Ulid;

use crate::{
    changes::{BatchBuilder, ChangeEvent, StreamItem},
    config::ReconcileConfig,
    diff::diff,
    error::{FeedError, ProtocolViolation},
    feed::{ChangeFeedSource, FeedToken, Notification},
    snapshot::{Item, Snapshot},
};

/// Identifies one feed subscription in logs. Only meaningful within this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(Ulid);

impl Default for SubscriptionId {
    fn default() -> Self { Self::new() }
}

impl SubscriptionId {
    pub fn new() -> Self { Self(Ulid::new()) }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "FS-{}", self.0) }
}

enum Phase<T> {
    /// `Reset(shown)` has been delivered; the upstream has not reported its initial state yet
    AwaitingInitial { shown: Snapshot<T> },
    Live,
    Disposed,
}

struct Inner<T> {
    id: SubscriptionId,
    config: ReconcileConfig,
    // held for the whole of each notification, so a disposer on another thread waits for it to finish
    phase: Mutex<Phase<T>>,
    disposed: AtomicBool,
    // thread currently processing a notification, so a listener cancelling from inside its own
    // callback does not wait on itself
    delivering: Mutex<Option<ThreadId>>,
    token: Mutex<Option<FeedToken>>,
    listener: SubscribeListener<StreamItem<T>>,
}

/// A consumer's subscription to a change feed. Cancelled explicitly or on drop.
pub struct FeedSubscription<T>(Arc<Inner<T>>);

impl<T: Item> FeedSubscription<T> {
    /// Captures the source's current state, delivers it to `listener` as `Reset`, then registers with
    /// the source. The upstream may deliver its initial notification before this returns.
    pub fn start<S>(source: &S, listener: SubscribeListener<StreamItem<T>>, config: ReconcileConfig) -> Self
    where S: ChangeFeedSource<T> + ?Sized {
        let shown = source.snapshot();
        let inner = Arc::new(Inner {
            id: SubscriptionId::new(),
            config,
            phase: Mutex::new(Phase::AwaitingInitial { shown: shown.clone() }),
            disposed: AtomicBool::new(false),
            delivering: Mutex::new(None),
            token: Mutex::new(None),
            listener,
        });
        debug!(subscription = %inner.id, items = shown.len(), "subscribe");

        // Reset goes out before the upstream registration exists, so nothing can precede it
        (inner.listener)(Ok(ChangeEvent::reset(shown)));

        if inner.is_disposed() {
            // cancelled from inside the reset callback
            return Self(inner);
        }

        let weak: Weak<Inner<T>> = Arc::downgrade(&inner);
        let token = source.subscribe(Box::new(move |notification: Notification<T>| {
            if let Some(inner) = weak.upgrade() {
                inner.on_notification(notification);
            }
        }));

        // The upstream may have failed, or the listener cancelled, while we were registering
        {
            let mut slot = lock(&inner.token);
            if inner.is_disposed() {
                drop(slot);
                token.cancel();
            } else {
                *slot = Some(token);
            }
        }

        Self(inner)
    }

    pub fn id(&self) -> SubscriptionId { self.0.id }

    /// False once cancelled, failed, or terminated by a protocol violation
    pub fn is_active(&self) -> bool { !self.0.is_disposed() }

    /// Stops delivery and releases the upstream registration. Idempotent.
    ///
    /// If a notification is being processed on another thread, waits for it to complete so the
    /// listener never observes a partial batch. Called from inside the listener, delivery stops
    /// once the batch in progress has been closed.
    pub fn cancel(&self) { self.0.dispose() }
}

impl<T: Item> Release for FeedSubscription<T> {
    fn release(&self) { self.cancel() }
}

impl<T> Drop for FeedSubscription<T> {
    fn drop(&mut self) { self.0.dispose() }
}

impl<T> std::fmt::Debug for FeedSubscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedSubscription").field("id", &self.0.id).field("disposed", &self.0.is_disposed()).finish()
    }
}

enum Outcome<T> {
    Deliver(Vec<ChangeEvent<T>>),
    Terminate(FeedError),
}

impl<T: Item> Inner<T> {
    fn on_notification(&self, notification: Notification<T>) {
        if self.is_disposed() {
            trace!(subscription = %self.id, "discarding notification after disposal");
            return;
        }
        let mut phase = lock(&self.phase);
        if self.is_disposed() {
            trace!(subscription = %self.id, "discarding notification after disposal");
            return;
        }

        let _delivering = DeliveringGuard::enter(&self.delivering);
        match self.transition(&mut phase, notification) {
            Outcome::Deliver(events) => self.deliver(events),
            Outcome::Terminate(err) => {
                *phase = Phase::Disposed;
                if err.is_protocol_violation() {
                    error!(subscription = %self.id, %err, "change feed broke its notification contract");
                } else {
                    warn!(subscription = %self.id, %err, "change feed failed");
                }
                if !self.disposed.swap(true, Ordering::SeqCst) {
                    (self.listener)(Err(err));
                }
                drop(phase);
                self.release_upstream();
            }
        }
    }

    fn transition(&self, phase: &mut Phase<T>, notification: Notification<T>) -> Outcome<T> {
        match notification {
            Notification::Failure(reason) => Outcome::Terminate(FeedError::upstream(reason)),
            Notification::Initial(upstream) => match std::mem::replace(phase, Phase::Live) {
                Phase::AwaitingInitial { shown } => {
                    if upstream == shown {
                        trace!(subscription = %self.id, "upstream initial matches reset");
                        return Outcome::Deliver(Vec::new());
                    }
                    let d = diff(&shown, &upstream, self.config.replace);
                    debug!(
                        subscription = %self.id,
                        shown = shown.len(),
                        upstream = upstream.len(),
                        deleted = d.deleted.len(),
                        inserted = d.inserted.len(),
                        "upstream initial diverged from reset"
                    );
                    // a replacement applies deletes before inserts
                    Outcome::Deliver(BatchBuilder::new(upstream).delete(d.deleted).insert(d.inserted).finish())
                }
                previous => {
                    *phase = previous;
                    Outcome::Terminate(ProtocolViolation::DuplicateInitial.into())
                }
            },
            Notification::Update { snapshot, deleted, inserted, modified } => match phase {
                Phase::Live => Outcome::Deliver(self.update_batch(snapshot, deleted, inserted, modified)),
                _ => Outcome::Terminate(ProtocolViolation::UpdateBeforeInitial.into()),
            },
        }
    }

    fn update_batch(
        &self,
        snapshot: Snapshot<T>,
        deleted: BTreeSet<usize>,
        inserted: BTreeSet<usize>,
        modified: BTreeSet<usize>,
    ) -> Vec<ChangeEvent<T>> {
        trace!(
            subscription = %self.id,
            inserted = inserted.len(),
            deleted = deleted.len(),
            modified = modified.len(),
            "update"
        );
        // insert, delete, update is the order binding layers animate in
        BatchBuilder::new(snapshot).insert(inserted).delete(deleted).update(modified).finish()
    }

    /// Delivers one batch. A batch that has started is always finished, even if the listener
    /// cancels from inside its own callback; nothing is delivered after it.
    fn deliver(&self, events: Vec<ChangeEvent<T>>) {
        if self.is_disposed() {
            return;
        }
        for event in events {
            (self.listener)(Ok(event));
        }
    }
}

impl<T> Inner<T> {
    fn is_disposed(&self) -> bool { self.disposed.load(Ordering::SeqCst) }

    fn delivering_here(&self) -> bool { is_delivering_here(&self.delivering) }

    fn dispose(&self) {
        let already = if self.delivering_here() {
            self.disposed.swap(true, Ordering::SeqCst)
        } else {
            let mut phase = lock(&self.phase);
            *phase = Phase::Disposed;
            self.disposed.swap(true, Ordering::SeqCst)
        };
        if !already {
            debug!(subscription = %self.id, "cancelled");
        }
        self.release_upstream();
    }

    fn release_upstream(&self) {
        let token = lock(&self.token).take();
        if let Some(token) = token {
            trace!(subscription = %self.id, "releasing upstream registration");
            token.cancel();
        }
    }
}

/// Marks the current thread as the one delivering, until dropped
pub(crate) struct DeliveringGuard<'a>(&'a Mutex<Option<ThreadId>>);

impl<'a> DeliveringGuard<'a> {
    pub(crate) fn enter(slot: &'a Mutex<Option<ThreadId>>) -> Self {
        *lock(slot) = Some(thread::current().id());
        Self(slot)
    }
}

impl Drop for DeliveringGuard<'_> {
    fn drop(&mut self) { *lock(self.0) = None; }
}

pub(crate) fn is_delivering_here(slot: &Mutex<Option<ThreadId>>) -> bool { *lock(slot) == Some(thread::current().id()) }

/// Locks, recovering the guard if a listener panicked while it was held
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> { mutex.lock().unwrap_or_else(|e| e.into_inner()) }

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::ChangeKind;
    use crate::config::ReplaceStrategy;
    use crate::feed::NotificationCallback;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// A feed source driven entirely by the test
    #[derive(Default)]
    struct ScriptedSource {
        current: Mutex<Vec<&'static str>>,
        callback: Arc<Mutex<Option<Arc<NotificationCallback<&'static str>>>>>,
        released: Arc<AtomicUsize>,
        // delivered synchronously from inside subscribe()
        on_subscribe: Mutex<Option<Notification<&'static str>>>,
    }

    impl ScriptedSource {
        fn new(items: &[&'static str]) -> Self { Self { current: Mutex::new(items.to_vec()), ..Default::default() } }

        fn emit(&self, notification: Notification<&'static str>) {
            let callback = self.callback.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback(notification);
            }
        }

        fn released(&self) -> usize { self.released.load(Ordering::SeqCst) }
    }

    impl ChangeFeedSource<&'static str> for ScriptedSource {
        fn snapshot(&self) -> Snapshot<&'static str> { Snapshot::from(self.current.lock().unwrap().clone()) }

        fn subscribe(&self, callback: NotificationCallback<&'static str>) -> FeedToken {
            let callback = Arc::new(callback);
            *self.callback.lock().unwrap() = Some(callback.clone());
            if let Some(notification) = self.on_subscribe.lock().unwrap().take() {
                callback(notification);
            }
            let slot = self.callback.clone();
            let released = self.released.clone();
            FeedToken::new(move || {
                slot.lock().unwrap().take();
                released.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    type Recorded = Arc<Mutex<Vec<StreamItem<&'static str>>>>;

    fn recorder() -> (SubscribeListener<StreamItem<&'static str>>, Recorded) {
        let items: Recorded = Default::default();
        let sink = items.clone();
        (Box::new(move |item: StreamItem<&'static str>| sink.lock().unwrap().push(item)), items)
    }

    fn kinds(items: &Recorded) -> Vec<ChangeKind> {
        items.lock().unwrap().iter().map(|item| item.as_ref().expect("unexpected error").change.clone()).collect()
    }

    fn set(indices: &[usize]) -> BTreeSet<usize> { indices.iter().copied().collect() }

    #[test]
    fn test_reset_first_and_matching_initial_is_suppressed() {
        let source = ScriptedSource::new(&["a"]);
        let (listener, items) = recorder();
        let _sub = FeedSubscription::start(&source, listener, ReconcileConfig::default());

        source.emit(Notification::Initial(Snapshot::from(["a"])));

        assert_eq!(kinds(&items), [ChangeKind::Reset]);
        assert_eq!(items.lock().unwrap()[0].as_ref().unwrap().source, ["a"]);
    }

    #[test]
    fn test_divergent_initial_full_replace() {
        let source = ScriptedSource::new(&["a"]);
        let (listener, items) = recorder();
        let _sub = FeedSubscription::start(&source, listener, ReconcileConfig::default());

        source.emit(Notification::Initial(Snapshot::from(["a", "b"])));

        assert_eq!(
            kinds(&items),
            [ChangeKind::Reset, ChangeKind::BeginBatch, ChangeKind::Delete(set(&[0])), ChangeKind::Insert(set(&[0, 1])), ChangeKind::EndBatch]
        );
        assert!(items.lock().unwrap()[1..].iter().all(|item| item.as_ref().unwrap().source == ["a", "b"]));
    }

    #[test]
    fn test_divergent_initial_trimmed_replace() {
        let source = ScriptedSource::new(&["a"]);
        let (listener, items) = recorder();
        let config = ReconcileConfig::new().with_replace(ReplaceStrategy::TrimCommonEnds);
        let _sub = FeedSubscription::start(&source, listener, config);

        source.emit(Notification::Initial(Snapshot::from(["a", "b"])));

        assert_eq!(kinds(&items), [ChangeKind::Reset, ChangeKind::BeginBatch, ChangeKind::Insert(set(&[1])), ChangeKind::EndBatch]);
    }

    #[test]
    fn test_update_order_is_insert_delete_update() {
        let source = ScriptedSource::new(&["a", "b"]);
        let (listener, items) = recorder();
        let _sub = FeedSubscription::start(&source, listener, ReconcileConfig::default());
        source.emit(Notification::Initial(Snapshot::from(["a", "b"])));

        source.emit(Notification::update(Snapshot::from(["c", "B"]), [0], [0], [1]));

        assert_eq!(
            kinds(&items),
            [
                ChangeKind::Reset,
                ChangeKind::BeginBatch,
                ChangeKind::Insert(set(&[0])),
                ChangeKind::Delete(set(&[0])),
                ChangeKind::Update(set(&[1])),
                ChangeKind::EndBatch
            ]
        );
    }

    #[test]
    fn test_empty_update_is_suppressed() {
        let source = ScriptedSource::new(&[]);
        let (listener, items) = recorder();
        let _sub = FeedSubscription::start(&source, listener, ReconcileConfig::default());
        source.emit(Notification::Initial(Snapshot::empty()));

        source.emit(Notification::update(Snapshot::empty(), [], [], []));

        assert_eq!(kinds(&items), [ChangeKind::Reset]);
    }

    #[test]
    fn test_duplicate_initial_is_a_protocol_violation() {
        let source = ScriptedSource::new(&["a"]);
        let (listener, items) = recorder();
        let sub = FeedSubscription::start(&source, listener, ReconcileConfig::default());

        source.emit(Notification::Initial(Snapshot::from(["a"])));
        source.emit(Notification::Initial(Snapshot::from(["a"])));
        source.emit(Notification::update(Snapshot::from(["a", "b"]), [], [1], []));

        let items = items.lock().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1], Err(FeedError::Protocol(ProtocolViolation::DuplicateInitial)));
        assert!(!sub.is_active());
        assert_eq!(source.released(), 1);
    }

    #[test]
    fn test_update_before_initial_is_a_protocol_violation() {
        let source = ScriptedSource::new(&["a"]);
        let (listener, items) = recorder();
        let _sub = FeedSubscription::start(&source, listener, ReconcileConfig::default());

        source.emit(Notification::update(Snapshot::from(["a", "b"]), [], [1], []));

        let items = items.lock().unwrap();
        assert_eq!(items.len(), 2);
        assert!(items[1].as_ref().unwrap_err().is_protocol_violation());
        assert_eq!(source.released(), 1);
    }

    #[test]
    fn test_failure_is_terminal() {
        let source = ScriptedSource::new(&["a"]);
        let (listener, items) = recorder();
        let sub = FeedSubscription::start(&source, listener, ReconcileConfig::default());

        source.emit(Notification::Failure("store unavailable".into()));
        source.emit(Notification::Initial(Snapshot::from(["a"])));

        let items = items.lock().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1], Err(FeedError::upstream("store unavailable")));
        assert!(!sub.is_active());
        assert_eq!(source.released(), 1);
    }

    #[test]
    fn test_failure_during_subscribe_releases_registration() {
        let source = ScriptedSource::new(&[]);
        *source.on_subscribe.lock().unwrap() = Some(Notification::Failure("cannot open".into()));
        let (listener, items) = recorder();
        let sub = FeedSubscription::start(&source, listener, ReconcileConfig::default());

        assert!(!sub.is_active());
        assert_eq!(source.released(), 1);
        assert_eq!(items.lock().unwrap().len(), 2);
        drop(sub);
        assert_eq!(source.released(), 1);
    }

    #[test]
    fn test_cancel_silences_and_is_idempotent() {
        let source = ScriptedSource::new(&["a"]);
        let (listener, items) = recorder();
        let sub = FeedSubscription::start(&source, listener, ReconcileConfig::default());
        source.emit(Notification::Initial(Snapshot::from(["a"])));

        sub.cancel();
        sub.cancel();
        // a notification already in flight when the registration went away
        source.emit(Notification::update(Snapshot::from(["a", "b"]), [], [1], []));
        drop(sub);

        assert_eq!(kinds(&items), [ChangeKind::Reset]);
        assert_eq!(source.released(), 1);
    }

    #[test]
    fn test_in_flight_notification_after_cancel_is_discarded() {
        let source = ScriptedSource::new(&["a"]);
        let (listener, items) = recorder();
        let sub = FeedSubscription::start(&source, listener, ReconcileConfig::default());
        source.emit(Notification::Initial(Snapshot::from(["a"])));

        // grab the callback the way a deliverer on another thread would before the cancel lands
        let in_flight = source.callback.lock().unwrap().clone().unwrap();
        sub.cancel();
        in_flight(Notification::update(Snapshot::from(["a", "b"]), [], [1], []));

        assert_eq!(kinds(&items), [ChangeKind::Reset]);
    }

    #[test]
    fn test_cancel_from_inside_listener_closes_the_batch() {
        let source = ScriptedSource::new(&[]);
        let slot: Arc<Mutex<Option<FeedSubscription<&'static str>>>> = Default::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let listener: SubscribeListener<StreamItem<&'static str>> = {
            let slot = slot.clone();
            let seen = seen.clone();
            Box::new(move |item: StreamItem<&'static str>| {
                let kind = item.expect("no errors expected").change;
                let stop = matches!(kind, ChangeKind::Insert(_));
                seen.lock().unwrap().push(kind);
                if stop {
                    if let Some(sub) = slot.lock().unwrap().as_ref() {
                        sub.cancel();
                    }
                }
            })
        };
        let sub = FeedSubscription::start(&source, listener, ReconcileConfig::default());
        *slot.lock().unwrap() = Some(sub);
        source.emit(Notification::Initial(Snapshot::empty()));

        source.emit(Notification::update(Snapshot::from(["x"]), [], [0], []));
        source.emit(Notification::update(Snapshot::from(["x", "y"]), [], [1], []));

        // the batch that was in progress is closed, the next one never starts
        assert_eq!(
            *seen.lock().unwrap(),
            [ChangeKind::Reset, ChangeKind::BeginBatch, ChangeKind::Insert(set(&[0])), ChangeKind::EndBatch]
        );
        assert_eq!(source.released(), 1);
    }

    #[test]
    fn test_cancel_waits_for_in_flight_batch() {
        let source = Arc::new(ScriptedSource::new(&[]));
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let started_tx = Mutex::new(started_tx);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let listener: SubscribeListener<StreamItem<&'static str>> = {
            let seen = seen.clone();
            Box::new(move |item: StreamItem<&'static str>| {
                let kind = item.expect("no errors expected").change;
                let begin = kind == ChangeKind::BeginBatch;
                seen.lock().unwrap().push(kind);
                if begin {
                    let _ = started_tx.lock().unwrap().send(());
                    std::thread::sleep(Duration::from_millis(50));
                }
            })
        };
        let sub = FeedSubscription::start(&*source, listener, ReconcileConfig::default());
        source.emit(Notification::Initial(Snapshot::empty()));

        let deliverer = {
            let source = source.clone();
            std::thread::spawn(move || source.emit(Notification::update(Snapshot::from(["x"]), [], [0], [])))
        };
        started_rx.recv().unwrap();
        sub.cancel();
        deliverer.join().unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            [ChangeKind::Reset, ChangeKind::BeginBatch, ChangeKind::Insert(set(&[0])), ChangeKind::EndBatch]
        );
    }
}
