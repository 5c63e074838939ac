use tracing::Level;

use hottake_core::{ChangeKind, StreamItem};
use std::sync::{Arc, Mutex};

// Initialize tracing for tests
#[ctor::ctor]
fn init_tracing() { tracing_subscriber::fmt().with_max_level(Level::INFO).with_test_writer().init(); }

/// A listener recording every item it receives, and a check draining what was recorded so far
#[allow(unused)]
pub fn change_watcher<T: Send + Sync + 'static>(
) -> (Box<dyn Fn(StreamItem<T>) + Send + Sync>, Box<dyn Fn() -> Vec<StreamItem<T>> + Send + Sync>) {
    let items = Arc::new(Mutex::new(Vec::new()));
    let watcher = {
        let items = items.clone();
        Box::new(move |item: StreamItem<T>| {
            items.lock().unwrap().push(item);
        })
    };

    let check = Box::new(move || items.lock().unwrap().drain(..).collect());

    (watcher, check)
}

/// Kinds of a list of items, panicking on a failure
#[allow(unused)]
pub fn kinds<T>(items: &[StreamItem<T>]) -> Vec<ChangeKind> {
    items.iter().map(|item| item.as_ref().expect("unexpected failure").change.clone()).collect()
}

/// Applies the structural events of `items` to a local copy, the way a list view would.
///
/// A reset replaces everything. Within a batch, deletes are applied first in descending order
/// against the pre-change copy, then inserts and updates read their values from the event's snapshot.
#[allow(unused)]
pub fn replay<T: Clone>(mirror: &mut Vec<T>, items: &[StreamItem<T>]) {
    let mut pending = Vec::new();
    for item in items {
        let event = item.as_ref().expect("unexpected failure");
        match &event.change {
            ChangeKind::Reset => *mirror = event.source.to_vec(),
            ChangeKind::BeginBatch => pending.clear(),
            ChangeKind::Insert(_) | ChangeKind::Delete(_) | ChangeKind::Update(_) => pending.push(event),
            ChangeKind::EndBatch => {
                for event in pending.iter().filter(|e| matches!(e.change, ChangeKind::Delete(_))) {
                    for &index in event.indices().into_iter().flatten().rev() {
                        mirror.remove(index);
                    }
                }
                for event in pending.iter().filter(|e| matches!(e.change, ChangeKind::Insert(_))) {
                    for &index in event.indices().into_iter().flatten() {
                        mirror.insert(index, event.source[index].clone());
                    }
                }
                for event in pending.iter().filter(|e| matches!(e.change, ChangeKind::Update(_))) {
                    for &index in event.indices().into_iter().flatten() {
                        mirror[index] = event.source[index].clone();
                    }
                }
                pending.clear();
            }
        }
    }
}
