use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

use tracing::trace;

use crate::release::Release;

/// Identifies a broadcast for comparison/deduplication. Derived from the broadcast's address,
/// so it cannot be forged and stays unique for as long as any guard references the broadcast.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct BroadcastId(usize);

impl std::fmt::Display for BroadcastId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "B-{:x}", self.0) }
}

/// A listener registered with a broadcast
pub type BroadcastListener<T> = Arc<dyn Fn(T) + Send + Sync + 'static>;

/// Trait for types that can be converted into broadcast listeners.
pub trait IntoBroadcastListener<T> {
    fn into_broadcast_listener(self) -> BroadcastListener<T>;
}

/// Delivers each sent value to every registered listener, synchronously and in registration order.
#[derive(Clone)]
pub struct Broadcast<T>(Arc<Inner<T>>);

struct Inner<T> {
    // BTreeMap so delivery order is registration order
    listeners: RwLock<BTreeMap<usize, BroadcastListener<T>>>,
    next_id: AtomicUsize,
}

impl<T> std::fmt::Debug for Broadcast<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcast").field("id", &self.id()).field("listeners", &self.listener_count()).finish()
    }
}

/// Unregisters its listener when released or dropped. Does not keep the broadcast alive.
pub struct ListenerGuard<T> {
    inner: Weak<Inner<T>>,
    id: usize,
}

impl<T> ListenerGuard<T> {
    /// The broadcast this guard's listener is registered with
    pub fn broadcast_id(&self) -> BroadcastId { BroadcastId(self.inner.as_ptr() as *const () as usize) }
}

impl<T: Clone> Default for Broadcast<T> {
    fn default() -> Self { Self::new() }
}

impl<T> Broadcast<T> {
    pub fn id(&self) -> BroadcastId { BroadcastId(Arc::as_ptr(&self.0) as *const () as usize) }

    pub fn listener_count(&self) -> usize { self.0.listeners.read().unwrap_or_else(|e| e.into_inner()).len() }

    /// Unregisters every listener. Outstanding guards become no-ops.
    pub fn clear(&self) {
        let removed = std::mem::take(&mut *self.0.listeners.write().unwrap_or_else(|e| e.into_inner()));
        trace!(broadcast = %self.id(), removed = removed.len(), "cleared listeners");
    }

    /// Registers a listener. The listener stays registered until the returned guard is released or dropped.
    pub fn listen<L>(&self, listener: L) -> ListenerGuard<T>
    where L: IntoBroadcastListener<T> {
        let id = self.0.next_id.fetch_add(1, Ordering::Relaxed);
        self.0.listeners.write().unwrap_or_else(|e| e.into_inner()).insert(id, listener.into_broadcast_listener());
        ListenerGuard { inner: Arc::downgrade(&self.0), id }
    }
}

impl<T: Clone> Broadcast<T> {
    pub fn new() -> Self { Self(Arc::new(Inner { listeners: RwLock::new(BTreeMap::new()), next_id: AtomicUsize::new(0) })) }

    /// Sends a value to all registered listeners
    pub fn send(&self, value: T) {
        // Snapshot the listeners so none of our locks are held while they run. Listeners may
        // register or unregister (themselves included) from inside the callback.
        let listeners: Vec<_> = self.0.listeners.read().unwrap_or_else(|e| e.into_inner()).values().cloned().collect();
        trace!(broadcast = %self.id(), listeners = listeners.len(), "send");

        // clone the value for each listener except the last one
        if let Some((last, rest)) = listeners.split_last() {
            for listener in rest {
                listener(value.clone());
            }
            last(value);
        }
    }
}

impl<T> Release for ListenerGuard<T> {
    fn release(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.listeners.write().unwrap_or_else(|e| e.into_inner()).remove(&self.id);
        }
    }
}

impl<T> Drop for ListenerGuard<T> {
    fn drop(&mut self) { self.release() }
}

impl<F, T> IntoBroadcastListener<T> for F
where F: Fn(T) + Send + Sync + 'static
{
    fn into_broadcast_listener(self) -> BroadcastListener<T> { Arc::new(self) }
}

#[cfg(feature = "tokio")]
impl<T> IntoBroadcastListener<T> for tokio::sync::mpsc::UnboundedSender<T>
where T: Send + Sync + 'static
{
    fn into_broadcast_listener(self) -> BroadcastListener<T> {
        Arc::new(move |value| {
            let _ = self.send(value); // receiver gone
        })
    }
}

impl<T> IntoBroadcastListener<T> for std::sync::mpsc::Sender<T>
where T: Send + Sync + 'static
{
    fn into_broadcast_listener(self) -> BroadcastListener<T> {
        Arc::new(move |value| {
            let _ = self.send(value); // receiver gone
        })
    }
}
