//! An in-memory, change-notifying collection.
//!
//! [`MemoryCollection`] behaves like a storage engine's live query result: every mutation is committed
//! immediately and reported to registered listeners as one [`Notification::Update`], and each new
//! registration first receives a [`Notification::Initial`] describing the state at the moment it is
//! delivered. In [`Delivery::Deferred`] mode nothing is delivered until [`MemoryCollection::flush`],
//! which makes it possible to mutate the collection between a subscriber's synchronous snapshot and
//! its initial notification.
//!
//! Notifications are delivered without any internal lock held, one at a time: a mutation made from
//! inside a listener is queued and delivered after the current notification returns.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    feed::{ChangeFeedSource, FeedToken, Notification, NotificationCallback},
    snapshot::{Item, Snapshot},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// Deliver as part of the call that caused the notification
    #[default]
    Immediate,
    /// Queue until [`MemoryCollection::flush`]
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("index {index} out of bounds for collection of length {len}")]
    OutOfBounds { index: usize, len: usize },

    #[error("collection has failed: {0}")]
    Failed(String),
}

pub struct MemoryCollection<T>(Arc<Inner<T>>);

impl<T> Clone for MemoryCollection<T> {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

struct Inner<T> {
    state: Mutex<State<T>>,
}

struct State<T> {
    items: Snapshot<T>,
    delivery: Delivery,
    failure: Option<String>,
    registrations: BTreeMap<u64, Registration<T>>,
    next_id: u64,
    draining: bool,
}

struct Registration<T> {
    callback: Arc<NotificationCallback<T>>,
    initial_pending: bool,
    queue: VecDeque<Notification<T>>,
}

impl<T: Item + Clone> MemoryCollection<T> {
    pub fn new(items: impl IntoIterator<Item = T>) -> Self { Self::with_delivery(items, Delivery::Immediate) }

    /// A collection whose notifications wait for [`flush`](Self::flush)
    pub fn deferred(items: impl IntoIterator<Item = T>) -> Self { Self::with_delivery(items, Delivery::Deferred) }

    pub fn with_delivery(items: impl IntoIterator<Item = T>, delivery: Delivery) -> Self {
        Self(Arc::new(Inner {
            state: Mutex::new(State {
                items: items.into_iter().collect(),
                delivery,
                failure: None,
                registrations: BTreeMap::new(),
                next_id: 0,
                draining: false,
            }),
        }))
    }

    pub fn items(&self) -> Snapshot<T> { self.0.lock().items.clone() }

    pub fn len(&self) -> usize { self.0.lock().items.len() }

    pub fn is_empty(&self) -> bool { self.0.lock().items.is_empty() }

    pub fn delivery(&self) -> Delivery { self.0.lock().delivery }

    /// Switching to immediate delivery flushes anything already queued
    pub fn set_delivery(&self, delivery: Delivery) {
        self.0.lock().delivery = delivery;
        if delivery == Delivery::Immediate {
            self.flush();
        }
    }

    /// Number of registrations
    pub fn listener_count(&self) -> usize { self.0.lock().registrations.len() }

    /// Notifications (initial ones included) not yet delivered
    pub fn pending(&self) -> usize {
        let state = self.0.lock();
        state.registrations.values().map(|r| r.queue.len() + usize::from(r.initial_pending)).sum()
    }

    /// Delivers every queued notification, including any queued by listeners while flushing
    pub fn flush(&self) { Inner::drain(&self.0) }

    pub fn push(&self, item: T) -> Result<(), MemoryError> {
        self.commit(|items| {
            items.push(item);
            Ok((Changes::inserted([items.len() - 1]), ()))
        })
    }

    pub fn extend(&self, new_items: impl IntoIterator<Item = T>) -> Result<(), MemoryError> {
        self.commit(|items| {
            let start = items.len();
            items.extend(new_items);
            Ok((Changes::inserted(start..items.len()), ()))
        })
    }

    pub fn insert(&self, index: usize, item: T) -> Result<(), MemoryError> {
        self.commit(|items| {
            if index > items.len() {
                return Err(MemoryError::OutOfBounds { index, len: items.len() });
            }
            items.insert(index, item);
            Ok((Changes::inserted([index]), ()))
        })
    }

    pub fn remove(&self, index: usize) -> Result<T, MemoryError> {
        self.commit(|items| {
            if index >= items.len() {
                return Err(MemoryError::OutOfBounds { index, len: items.len() });
            }
            Ok((Changes::deleted([index]), items.remove(index)))
        })
    }

    /// Modifies the item at `index` in place, returning the previous value
    pub fn set(&self, index: usize, item: T) -> Result<T, MemoryError> {
        self.commit(|items| {
            let len = items.len();
            let slot = items.get_mut(index).ok_or(MemoryError::OutOfBounds { index, len })?;
            Ok((Changes::modified([index]), std::mem::replace(slot, item)))
        })
    }

    /// Removes every item for which `keep` returns false, in one notification
    pub fn retain(&self, mut keep: impl FnMut(&T) -> bool) -> Result<(), MemoryError> {
        self.commit(|items| {
            let mut deleted = BTreeSet::new();
            let mut index = 0;
            items.retain(|item| {
                let kept = keep(item);
                if !kept {
                    deleted.insert(index);
                }
                index += 1;
                kept
            });
            Ok((Changes { deleted, ..Default::default() }, ()))
        })
    }

    pub fn clear(&self) -> Result<(), MemoryError> {
        self.commit(|items| {
            let deleted = 0..items.len();
            items.clear();
            Ok((Changes::deleted(deleted), ()))
        })
    }

    /// Replaces the whole contents in one notification (every old position deleted, every new one inserted)
    pub fn replace_all(&self, new_items: impl IntoIterator<Item = T>) -> Result<(), MemoryError> {
        self.commit(|items| {
            let deleted = (0..items.len()).collect();
            items.clear();
            items.extend(new_items);
            Ok((Changes { deleted, inserted: (0..items.len()).collect(), ..Default::default() }, ()))
        })
    }

    /// Commits a write that changes nothing. Listeners still receive an (empty) update.
    pub fn touch(&self) -> Result<(), MemoryError> { self.commit(|_| Ok((Changes::default(), ()))) }

    /// Puts the collection into a failed state: every registration receives `Failure(reason)` in place
    /// of anything still queued and is then detached, and later registrations fail immediately.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut state = self.0.lock();
            debug!(%reason, registrations = state.registrations.len(), "memory collection failed");
            for registration in state.registrations.values_mut() {
                registration.initial_pending = false;
                registration.queue.clear();
                registration.queue.push_back(Notification::Failure(reason.clone()));
            }
            state.failure = Some(reason);
        }
        self.after_commit();
    }

    /// Applies `mutate` to a copy of the items and, if it succeeds, publishes the copy and queues one
    /// update per registration. Returns whatever `mutate` produced alongside its changes.
    fn commit<R>(&self, mutate: impl FnOnce(&mut Vec<T>) -> Result<(Changes, R), MemoryError>) -> Result<R, MemoryError> {
        let output = {
            let mut state = self.0.lock();
            if let Some(reason) = &state.failure {
                return Err(MemoryError::Failed(reason.clone()));
            }
            let mut items = state.items.to_vec();
            let (changes, output) = mutate(&mut items)?;
            let snapshot = Snapshot::from(items);
            trace!(
                len = snapshot.len(),
                inserted = changes.inserted.len(),
                deleted = changes.deleted.len(),
                modified = changes.modified.len(),
                "commit"
            );
            for registration in state.registrations.values_mut() {
                // a pending initial will already reflect this write
                if !registration.initial_pending {
                    registration.queue.push_back(Notification::Update {
                        snapshot: snapshot.clone(),
                        deleted: changes.deleted.clone(),
                        inserted: changes.inserted.clone(),
                        modified: changes.modified.clone(),
                    });
                }
            }
            state.items = snapshot;
            output
        };
        self.after_commit();
        Ok(output)
    }

    fn after_commit(&self) {
        if self.delivery() == Delivery::Immediate {
            self.flush();
        }
    }
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> { self.state.lock().unwrap_or_else(|e| e.into_inner()) }

    fn drain(this: &Arc<Self>) {
        {
            let mut state = this.lock();
            if state.draining {
                // the outer drain loop will pick up whatever was queued
                return;
            }
            state.draining = true;
        }
        let _draining = DrainGuard(this);

        while let Some((callback, notification)) = this.next_notification() {
            callback(notification);
        }
    }

    /// Pops the next deliverable notification, in registration order
    fn next_notification(&self) -> Option<(Arc<NotificationCallback<T>>, Notification<T>)> {
        let mut state = self.lock();
        let State { items, registrations, .. } = &mut *state;

        let (&id, registration) = registrations.iter_mut().find(|(_, r)| r.initial_pending || !r.queue.is_empty())?;
        let notification = if registration.initial_pending {
            registration.initial_pending = false;
            Notification::Initial(items.clone())
        } else {
            registration.queue.pop_front()?
        };
        let callback = registration.callback.clone();
        if matches!(notification, Notification::Failure(_)) {
            registrations.remove(&id);
        }
        Some((callback, notification))
    }

    fn unregister(&self, id: u64) {
        if self.lock().registrations.remove(&id).is_some() {
            trace!(registration = id, "unregistered");
        }
    }
}

struct DrainGuard<'a, T>(&'a Arc<Inner<T>>);

impl<T> Drop for DrainGuard<'_, T> {
    fn drop(&mut self) { self.0.lock().draining = false; }
}

impl<T: Item + Clone> ChangeFeedSource<T> for MemoryCollection<T> {
    fn snapshot(&self) -> Snapshot<T> { self.items() }

    fn subscribe(&self, callback: NotificationCallback<T>) -> FeedToken {
        let id = {
            let mut state = self.0.lock();
            let id = state.next_id;
            state.next_id += 1;
            let mut registration = Registration { callback: Arc::new(callback), initial_pending: true, queue: VecDeque::new() };
            if let Some(reason) = &state.failure {
                registration.initial_pending = false;
                registration.queue.push_back(Notification::Failure(reason.clone()));
            }
            state.registrations.insert(id, registration);
            id
        };
        trace!(registration = id, "registered");
        self.after_commit();

        let weak: Weak<Inner<T>> = Arc::downgrade(&self.0);
        FeedToken::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.unregister(id);
            }
        })
    }
}

#[derive(Default)]
struct Changes {
    deleted: BTreeSet<usize>,
    inserted: BTreeSet<usize>,
    modified: BTreeSet<usize>,
}

impl Changes {
    fn inserted(indices: impl IntoIterator<Item = usize>) -> Self { Self { inserted: indices.into_iter().collect(), ..Default::default() } }

    fn deleted(indices: impl IntoIterator<Item = usize>) -> Self { Self { deleted: indices.into_iter().collect(), ..Default::default() } }

    fn modified(indices: impl IntoIterator<Item = usize>) -> Self { Self { modified: indices.into_iter().collect(), ..Default::default() } }
}
