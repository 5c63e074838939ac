use std::sync::Arc;

use crate::{config::ReconcileConfig, feed::ChangeFeedSource, snapshot::{Item, Snapshot}, stream::ChangeStream};

/// A live ordered collection as seen by consumers.
pub trait DataSource<T: Item>: Send + Sync {
    /// The current contents
    fn items(&self) -> Snapshot<T>;

    /// Structural changes: a `Reset` of the contents at subscription time, then one batch per mutation
    fn mutations(&self) -> ChangeStream<T>;
}

impl<T: Item, D: DataSource<T> + ?Sized> DataSource<T> for Arc<D> {
    fn items(&self) -> Snapshot<T> { (**self).items() }

    fn mutations(&self) -> ChangeStream<T> { (**self).mutations() }
}

/// Exposes a [`ChangeFeedSource`] as a [`DataSource`], reconciling its notifications for each subscriber.
pub struct FeedDataSource<S> {
    source: Arc<S>,
    config: ReconcileConfig,
}

impl<S> FeedDataSource<S> {
    pub fn new(source: S) -> Self { Self::from_arc(Arc::new(source)) }

    pub fn from_arc(source: Arc<S>) -> Self { Self { source, config: ReconcileConfig::default() } }

    pub fn with_config(mut self, config: ReconcileConfig) -> Self {
        self.config = config;
        self
    }

    pub fn source(&self) -> &Arc<S> { &self.source }
}

impl<T: Item, S: ChangeFeedSource<T> + 'static> DataSource<T> for FeedDataSource<S> {
    fn items(&self) -> Snapshot<T> { self.source.snapshot() }

    fn mutations(&self) -> ChangeStream<T> { ChangeStream::from_feed(self.source.clone(), self.config.clone()) }
}
