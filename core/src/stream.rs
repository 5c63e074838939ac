use std::sync::Arc;

use hottake_signals::{IntoSubscribeListener, Subscribe, SubscribeListener, SubscriptionGuard};

use crate::{
    changes::StreamItem,
    config::ReconcileConfig,
    feed::ChangeFeedSource,
    reconciler::FeedSubscription,
    snapshot::Item,
};

/// Anything a [`ChangeStream`] can be opened against.
///
/// Every call to `open` must create an independent subscription whose first item is a `Reset` of the
/// state at that moment.
pub trait StreamOrigin<T: Item>: Send + Sync {
    fn open(&self, listener: SubscribeListener<StreamItem<T>>) -> SubscriptionGuard;
}

/// A subscribable sequence of change events.
///
/// Each subscriber gets its own upstream registration and its own `Reset`; nothing is shared or
/// replayed between subscribers.
pub struct ChangeStream<T: Item>(Arc<dyn StreamOrigin<T>>);

impl<T: Item> ChangeStream<T> {
    pub fn new(origin: Arc<dyn StreamOrigin<T>>) -> Self { Self(origin) }

    /// A stream reconciling the notifications of `source`
    pub fn from_feed<S>(source: Arc<S>, config: ReconcileConfig) -> Self
    where S: ChangeFeedSource<T> + 'static {
        Self(Arc::new(FeedOrigin { source, config }))
    }
}

impl<T: Item> Clone for ChangeStream<T> {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

impl<T: Item> Subscribe<StreamItem<T>> for ChangeStream<T> {
    fn subscribe<F>(&self, listener: F) -> SubscriptionGuard
    where F: IntoSubscribeListener<StreamItem<T>> {
        self.0.open(listener.into_subscribe_listener())
    }
}

struct FeedOrigin<S> {
    source: Arc<S>,
    config: ReconcileConfig,
}

impl<T: Item, S: ChangeFeedSource<T>> StreamOrigin<T> for FeedOrigin<S> {
    fn open(&self, listener: SubscribeListener<StreamItem<T>>) -> SubscriptionGuard {
        SubscriptionGuard::new(FeedSubscription::start(&*self.source, listener, self.config.clone()))
    }
}
