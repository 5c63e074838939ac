//! A container holding a swappable data source behind one continuous change stream.
//!
//! Downstream subscribers see a single `Reset` when they subscribe, and from then on only batches.
//! Replacing the active source does not reset anyone: the container reconciles its last known
//! items against the new source's initial state exactly the way a [`FeedSubscription`] reconciles a
//! reset against an upstream initial, and forwards the difference as an ordinary batch.
//!
//! Batches reach each subscriber whole. Releasing a subscription from another thread waits for a
//! batch in flight to finish, and a subscription released from inside its own callback is closed
//! once the current batch has ended. Listeners of a container must not subscribe to it or swap its
//! source from inside their callback.
//!
//! [`FeedSubscription`]: crate::reconciler::FeedSubscription

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, Weak};
use std::thread::ThreadId;

use hottake_signals::{
    broadcast::{Broadcast, ListenerGuard},
    Release, Subscribe, SubscribeListener, SubscriptionGuard,
};
use tracing::{debug, trace, warn};

use crate::{
    changes::{BatchBuilder, ChangeEvent, ChangeKind, StreamItem},
    config::ReconcileConfig,
    datasource::DataSource,
    diff::diff,
    reconciler::{is_delivering_here, DeliveringGuard},
    snapshot::{Item, Snapshot},
    stream::{ChangeStream, StreamOrigin},
};

pub struct Container<T: Item>(Arc<Inner<T>>);

struct Inner<T: Item> {
    config: ReconcileConfig,
    // also serializes swaps
    source: Mutex<Arc<dyn DataSource<T>>>,
    upstream: Mutex<Option<SubscriptionGuard>>,
    // held while an upstream item is processed and forwarded, and while a downstream subscriber is
    // added, so every subscriber sees its reset followed by exactly the batches after it
    feed: Mutex<Feed>,
    // signalled whenever a forwarded batch ends
    idle: Condvar,
    delivering: Mutex<Option<ThreadId>>,
    items: RwLock<Snapshot<T>>,
    broadcast: Broadcast<StreamItem<T>>,
}

struct Feed {
    /// Bumped on every attach; items from older sources are discarded
    generation: u64,
    /// The attached source has not delivered its reset yet
    awaiting_reset: bool,
    /// No source has ever delivered a reset
    pristine: bool,
    /// A batch has been forwarded up to its `BeginBatch` but not its `EndBatch`
    in_batch: bool,
}

impl<T: Item> Container<T> {
    pub fn new(source: impl DataSource<T> + 'static) -> Self { Self::with_config(source, ReconcileConfig::default()) }

    pub fn with_config(source: impl DataSource<T> + 'static, config: ReconcileConfig) -> Self {
        let source: Arc<dyn DataSource<T>> = Arc::new(source);
        let inner = Arc::new(Inner {
            config,
            source: Mutex::new(source.clone()),
            upstream: Mutex::new(None),
            feed: Mutex::new(Feed { generation: 0, awaiting_reset: false, pristine: true, in_batch: false }),
            idle: Condvar::new(),
            delivering: Mutex::new(None),
            items: RwLock::new(Snapshot::empty()),
            broadcast: Broadcast::new(),
        });
        inner.attach(&*source);
        Self(inner)
    }

    /// The container's current contents
    pub fn items(&self) -> Snapshot<T> { self.0.items() }

    pub fn source(&self) -> Arc<dyn DataSource<T>> { lock(&self.0.source).clone() }

    /// Replaces the active source.
    ///
    /// The old source's registration is released before this returns, and nothing it reports
    /// afterwards reaches downstream. If the new source's contents differ from the current items,
    /// downstream subscribers receive one batch describing the difference.
    pub fn set_source(&self, source: impl DataSource<T> + 'static) {
        let source: Arc<dyn DataSource<T>> = Arc::new(source);
        let mut active = lock(&self.0.source);
        *active = source.clone();

        let previous = lock(&self.0.upstream).take();
        // waits for an in-flight batch from the old source to finish
        drop(previous);

        debug!(items = self.0.items().len(), "swapping container source");
        self.0.attach(&*source);
    }

    /// Changes of the container's contents, continuous across source swaps
    pub fn changes(&self) -> ChangeStream<T> { ChangeStream::new(Arc::new(Downstream(self.0.clone()))) }

    /// Number of registered downstream subscribers
    pub fn subscriber_count(&self) -> usize { self.0.broadcast.listener_count() }
}

impl<T: Item> Clone for Container<T> {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

impl<T: Item> DataSource<T> for Container<T> {
    fn items(&self) -> Snapshot<T> { self.0.items() }

    fn mutations(&self) -> ChangeStream<T> { self.changes() }
}

impl<T: Item> Inner<T> {
    fn items(&self) -> Snapshot<T> { self.items.read().unwrap_or_else(|e| e.into_inner()).clone() }

    fn set_items(&self, items: Snapshot<T>) { *self.items.write().unwrap_or_else(|e| e.into_inner()) = items; }

    fn attach(self: &Arc<Self>, source: &dyn DataSource<T>) {
        let generation = {
            let mut feed = lock(&self.feed);
            feed.generation += 1;
            feed.awaiting_reset = true;
            feed.in_batch = false;
            feed.generation
        };
        self.idle.notify_all();
        trace!(generation, "attaching source");

        let weak: Weak<Self> = Arc::downgrade(self);
        let guard = source.mutations().subscribe(move |item: StreamItem<T>| {
            if let Some(inner) = weak.upgrade() {
                inner.on_upstream(generation, item);
            }
        });
        *lock(&self.upstream) = Some(guard);
    }

    fn on_upstream(&self, generation: u64, item: StreamItem<T>) {
        let mut feed = lock(&self.feed);
        if feed.generation != generation {
            trace!(generation, current = feed.generation, "discarding item from a replaced source");
            return;
        }
        let _delivering = DeliveringGuard::enter(&self.delivering);

        match item {
            Ok(event) if feed.awaiting_reset && event.change == ChangeKind::Reset => {
                feed.awaiting_reset = false;
                let incoming = event.source;
                if std::mem::replace(&mut feed.pristine, false) {
                    trace!(items = incoming.len(), "adopting initial contents");
                    self.set_items(incoming);
                    return;
                }

                let current = self.items();
                if current == incoming {
                    trace!("new source matches current contents");
                    return;
                }
                let d = diff(&current, &incoming, self.config.replace);
                debug!(deleted = d.deleted.len(), inserted = d.inserted.len(), "reconciling swapped source");
                self.set_items(incoming.clone());
                for event in BatchBuilder::new(incoming).delete(d.deleted).insert(d.inserted).finish() {
                    self.broadcast.send(Ok(event));
                }
            }
            Ok(event) => {
                let ends = match event.change {
                    ChangeKind::BeginBatch => {
                        feed.in_batch = true;
                        false
                    }
                    ChangeKind::EndBatch => true,
                    _ => false,
                };
                self.set_items(event.source.clone());
                self.broadcast.send(Ok(event));
                if ends {
                    feed.in_batch = false;
                    self.idle.notify_all();
                }
            }
            Err(err) => {
                warn!(%err, subscribers = self.broadcast.listener_count(), "container source failed");
                self.broadcast.send(Err(err));
                self.broadcast.clear();
                feed.in_batch = false;
                self.idle.notify_all();
            }
        }
    }

    /// Locks the feed once no forwarded batch is open
    fn lock_idle(&self) -> MutexGuard<'_, Feed> {
        self.idle.wait_while(lock(&self.feed), |feed| feed.in_batch).unwrap_or_else(|e| e.into_inner())
    }
}

struct Downstream<T: Item>(Arc<Inner<T>>);

impl<T: Item> StreamOrigin<T> for Downstream<T> {
    fn open(&self, listener: SubscribeListener<StreamItem<T>>) -> SubscriptionGuard {
        let _feed = lock(&self.0.feed);
        let _delivering = DeliveringGuard::enter(&self.0.delivering);
        listener(Ok(ChangeEvent::reset(self.0.items())));

        let subscriber = Arc::new(Subscriber {
            container: Arc::downgrade(&self.0),
            listener,
            disposed: AtomicBool::new(false),
            in_batch: AtomicBool::new(false),
            registration: Mutex::new(None),
        });
        let target = subscriber.clone();
        let registration = self.0.broadcast.listen(move |item: StreamItem<T>| target.deliver(item));
        *lock(&subscriber.registration) = Some(registration);
        SubscriptionGuard::new(subscriber)
    }
}

/// One downstream subscription. Only ever sees whole batches.
struct Subscriber<T: Item> {
    container: Weak<Inner<T>>,
    listener: SubscribeListener<StreamItem<T>>,
    disposed: AtomicBool,
    // this subscriber has seen a BeginBatch without its EndBatch
    in_batch: AtomicBool,
    registration: Mutex<Option<ListenerGuard<StreamItem<T>>>>,
}

impl<T: Item> Subscriber<T> {
    fn deliver(&self, item: StreamItem<T>) {
        let in_batch = self.in_batch.load(Ordering::SeqCst);
        if self.disposed.load(Ordering::SeqCst) && !in_batch {
            return;
        }
        if let Ok(event) = &item {
            match event.change {
                ChangeKind::BeginBatch => self.in_batch.store(true, Ordering::SeqCst),
                ChangeKind::EndBatch => self.in_batch.store(false, Ordering::SeqCst),
                _ => {}
            }
        }
        (self.listener)(item);
        if self.disposed.load(Ordering::SeqCst) && !self.in_batch.load(Ordering::SeqCst) {
            // released from inside the callback; the batch it was in is now closed
            self.detach();
        }
    }

    fn detach(&self) {
        let registration = lock(&self.registration).take();
        drop(registration);
    }
}

impl<T: Item> Release for Subscriber<T> {
    fn release(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.container.upgrade() {
            Some(inner) if is_delivering_here(&inner.delivering) => {
                // deliver() detaches once the current batch is closed
                if !self.in_batch.load(Ordering::SeqCst) {
                    self.detach();
                }
            }
            Some(inner) => {
                // a batch in flight on another thread is allowed to finish first
                let _feed = inner.lock_idle();
                self.detach();
            }
            None => self.detach(),
        }
        trace!("container subscriber released");
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> { mutex.lock().unwrap_or_else(|e| e.into_inner()) }
