//! The change feed source capability: a live ordered collection that reports its own state and
//! structural changes through notifications.
//!
//! A source must deliver notifications for one registration serially (never concurrently with
//! itself), although it may deliver them from a thread other than the subscriber's. The first
//! notification of a registration is [`Notification::Initial`], followed by any number of
//! [`Notification::Update`]s. [`Notification::Failure`] ends the registration.

use std::collections::BTreeSet;
use std::sync::Mutex;

use hottake_signals::Release;

use crate::snapshot::Snapshot;

#[derive(Debug, Clone, PartialEq)]
pub enum Notification<T> {
    /// The state of the collection when the registration became live. May reflect mutations made
    /// after the registration was requested.
    Initial(Snapshot<T>),
    /// A committed mutation. `deleted` indexes the previous state, `inserted` and `modified` index `snapshot`.
    Update { snapshot: Snapshot<T>, deleted: BTreeSet<usize>, inserted: BTreeSet<usize>, modified: BTreeSet<usize> },
    /// The source could not continue (eg. its backing store failed to open)
    Failure(String),
}

impl<T> Notification<T> {
    pub fn update(
        snapshot: Snapshot<T>,
        deleted: impl IntoIterator<Item = usize>,
        inserted: impl IntoIterator<Item = usize>,
        modified: impl IntoIterator<Item = usize>,
    ) -> Self {
        Self::Update {
            snapshot,
            deleted: deleted.into_iter().collect(),
            inserted: inserted.into_iter().collect(),
            modified: modified.into_iter().collect(),
        }
    }
}

pub type NotificationCallback<T> = Box<dyn Fn(Notification<T>) + Send + Sync + 'static>;

pub trait ChangeFeedSource<T>: Send + Sync {
    /// Captures the current state synchronously
    fn snapshot(&self) -> Snapshot<T>;

    /// Registers for notifications. Delivery stops once the returned token is cancelled or dropped.
    fn subscribe(&self, callback: NotificationCallback<T>) -> FeedToken;
}

impl<T, S: ChangeFeedSource<T> + ?Sized> ChangeFeedSource<T> for std::sync::Arc<S> {
    fn snapshot(&self) -> Snapshot<T> { (**self).snapshot() }

    fn subscribe(&self, callback: NotificationCallback<T>) -> FeedToken { (**self).subscribe(callback) }
}

/// Cancellation token for an upstream registration.
///
/// Cancelling runs the source's release hook exactly once; later calls are no-ops. Dropping the token
/// cancels it, so a registration can never outlive its token.
#[must_use = "dropping a FeedToken cancels the registration"]
pub struct FeedToken {
    release: Mutex<Option<Box<dyn FnOnce() + Send + 'static>>>,
}

impl FeedToken {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self { Self { release: Mutex::new(Some(Box::new(release))) } }

    pub fn cancel(&self) {
        // take under the lock, run outside it
        let release = self.release.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(release) = release {
            release();
        }
    }

    pub fn is_cancelled(&self) -> bool { self.release.lock().unwrap_or_else(|e| e.into_inner()).is_none() }
}

impl Release for FeedToken {
    fn release(&self) { self.cancel() }
}

impl Drop for FeedToken {
    fn drop(&mut self) { self.cancel() }
}

impl std::fmt::Debug for FeedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedToken").field("cancelled", &self.is_cancelled()).finish()
    }
}
