//! Reconciliation of change feeds for live, ordered collections.
//!
//! A [`ChangeFeedSource`] reports an initial snapshot and then incremental index-set updates, with
//! delivery that may lag behind the moment a consumer subscribes. [`FeedSubscription`] turns that
//! into a clean [`ChangeStream`]: one synchronous `Reset` with the state at subscription time, then
//! only framed batches. A divergent initial is reconciled into a batch instead of a second reset.
//!
//! [`Container`] keeps one continuous stream across swaps of its underlying [`DataSource`], and
//! [`MemoryCollection`] is an in-process source with controllable delivery.

pub mod changes;
pub mod config;
pub mod container;
pub mod datasource;
pub mod diff;
pub mod error;
pub mod feed;
pub mod memory;
pub mod reconciler;
pub mod snapshot;
pub mod stream;

pub use changes::{ChangeEvent, ChangeKind, StreamItem};
pub use config::{ReconcileConfig, ReplaceStrategy};
pub use container::Container;
pub use datasource::{DataSource, FeedDataSource};
pub use error::{FeedError, ProtocolViolation};
pub use feed::{ChangeFeedSource, FeedToken, Notification, NotificationCallback};
pub use memory::{Delivery, MemoryCollection, MemoryError};
pub use reconciler::{FeedSubscription, SubscriptionId};
pub use snapshot::{Item, Snapshot};
pub use stream::{ChangeStream, StreamOrigin};

pub use hottake_signals as signals;
pub use hottake_signals::{Subscribe, SubscriptionGuard};
