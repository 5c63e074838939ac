use crate::{broadcast::ListenerGuard, release::Release};

/// Type alias for subscribe listeners
pub type SubscribeListener<T> = Box<dyn Fn(T) + Send + Sync + 'static>;

/// Trait for types that can be converted into subscribe listeners
pub trait IntoSubscribeListener<T> {
    fn into_subscribe_listener(self) -> SubscribeListener<T>;
}

/// Trait for subscribing to a sequence of values - provides the subscribe method
pub trait Subscribe<T: 'static> {
    /// Subscribe with a listener that receives every subsequent value
    fn subscribe<F>(&self, listener: F) -> SubscriptionGuard
    where F: IntoSubscribeListener<T>;
}

pub trait DynSubscribe<T: 'static> {
    fn dyn_subscribe(&self, listener: SubscribeListener<T>) -> SubscriptionGuard;
}

impl<S, T: 'static> DynSubscribe<T> for S
where S: Subscribe<T>
{
    fn dyn_subscribe(&self, listener: SubscribeListener<T>) -> SubscriptionGuard { Subscribe::subscribe(self, listener) }
}

/// Keeps a subscription alive. Releasing (explicitly, or by dropping the guard) tears it down.
#[must_use = "dropping a SubscriptionGuard ends the subscription"]
pub struct SubscriptionGuard {
    inner: Box<dyn Release>,
}

impl SubscriptionGuard {
    pub fn new<R: Release + 'static>(inner: R) -> Self { Self { inner: Box::new(inner) } }

    /// Ends the subscription now. Idempotent.
    pub fn release(&self) { self.inner.release() }
}

impl<T: 'static> From<ListenerGuard<T>> for SubscriptionGuard {
    fn from(guard: ListenerGuard<T>) -> Self { Self::new(guard) }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) { self.inner.release() }
}

impl<T: Send + 'static> IntoSubscribeListener<T> for std::sync::mpsc::Sender<T> {
    fn into_subscribe_listener(self) -> SubscribeListener<T> {
        // mpsc::Sender is Send but only recently Sync; keep it behind a mutex
        let sender = std::sync::Mutex::new(self);
        Box::new(move |value| {
            let _ = sender.lock().unwrap_or_else(|e| e.into_inner()).send(value);
        })
    }
}

#[cfg(feature = "tokio")]
impl<T: Send + 'static> IntoSubscribeListener<T> for tokio::sync::mpsc::UnboundedSender<T> {
    fn into_subscribe_listener(self) -> SubscribeListener<T> {
        Box::new(move |value| {
            let _ = self.send(value);
        })
    }
}

impl<F, T> IntoSubscribeListener<T> for F
where F: Fn(T) + Send + Sync + 'static
{
    fn into_subscribe_listener(self) -> SubscribeListener<T> { Box::new(self) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Broadcast;
    use std::sync::{Arc, Mutex};

    struct Counter(Broadcast<u8>);

    impl Subscribe<u8> for Counter {
        fn subscribe<F>(&self, listener: F) -> SubscriptionGuard
        where F: IntoSubscribeListener<u8> {
            let listener = listener.into_subscribe_listener();
            self.0.listen(move |v: u8| listener(v)).into()
        }
    }

    #[test]
    fn test_guard_release_stops_delivery() {
        let counter = Counter(Broadcast::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let guard = {
            let seen = seen.clone();
            counter.subscribe(move |v: u8| seen.lock().unwrap().push(v))
        };
        counter.0.send(1);
        guard.release();
        counter.0.send(2);
        drop(guard);

        assert_eq!(*seen.lock().unwrap(), [1]);
        assert_eq!(counter.0.listener_count(), 0);
    }

    #[test]
    fn test_std_channel_listener() {
        let counter = Counter(Broadcast::new());
        let (tx, rx) = std::sync::mpsc::channel();
        let _guard = counter.subscribe(tx);

        counter.0.send(3);
        counter.0.send(4);
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), [3, 4]);
    }

    #[test]
    fn test_dyn_subscribe() {
        let counter = Counter(Broadcast::new());
        let seen = Arc::new(Mutex::new(0u8));
        let listener: SubscribeListener<u8> = {
            let seen = seen.clone();
            Box::new(move |v| *seen.lock().unwrap() += v)
        };

        let _guard = counter.dyn_subscribe(listener);
        counter.0.send(5);
        assert_eq!(*seen.lock().unwrap(), 5);
    }
}
