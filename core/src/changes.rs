use std::collections::BTreeSet;

use crate::{error::FeedError, snapshot::Snapshot};

/// What a [`ChangeEvent`] did to the collection.
///
/// Insert and update positions refer to the post-change sequence. Delete positions refer to the
/// pre-change sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    /// The full current state. Always the first event of a subscription, and never repeated.
    Reset,
    BeginBatch,
    Insert(BTreeSet<usize>),
    Delete(BTreeSet<usize>),
    Update(BTreeSet<usize>),
    EndBatch,
}

/// A structural change, carrying the snapshot of the collection after the change.
#[derive(Debug, PartialEq)]
pub struct ChangeEvent<T> {
    pub change: ChangeKind,
    pub source: Snapshot<T>,
}

// manual impl: the snapshot is shared, so T need not be Clone
impl<T> Clone for ChangeEvent<T> {
    fn clone(&self) -> Self { Self { change: self.change.clone(), source: self.source.clone() } }
}

/// What a change stream delivers. An `Err` is terminal: nothing follows it.
pub type StreamItem<T> = Result<ChangeEvent<T>, FeedError>;

impl<T> ChangeEvent<T> {
    pub fn new(change: ChangeKind, source: Snapshot<T>) -> Self { Self { change, source } }

    pub fn reset(source: Snapshot<T>) -> Self { Self::new(ChangeKind::Reset, source) }

    /// Begin/end batch markers carry no structural change of their own
    pub fn is_signpost(&self) -> bool { matches!(self.change, ChangeKind::BeginBatch | ChangeKind::EndBatch) }

    /// Number of positions touched by this event. A reset touches the whole collection.
    pub fn affected_count(&self) -> usize {
        match &self.change {
            ChangeKind::Reset => self.source.len(),
            ChangeKind::BeginBatch | ChangeKind::EndBatch => 0,
            ChangeKind::Insert(indices) | ChangeKind::Delete(indices) | ChangeKind::Update(indices) => indices.len(),
        }
    }

    pub fn indices(&self) -> Option<&BTreeSet<usize>> {
        match &self.change {
            ChangeKind::Insert(indices) | ChangeKind::Delete(indices) | ChangeKind::Update(indices) => Some(indices),
            _ => None,
        }
    }
}

/// Builds the events of one batch. Empty index sets are skipped, and a batch with nothing in it
/// produces no events at all.
pub(crate) struct BatchBuilder<T> {
    source: Snapshot<T>,
    body: Vec<ChangeKind>,
}

impl<T> BatchBuilder<T> {
    pub fn new(source: Snapshot<T>) -> Self { Self { source, body: Vec::new() } }

    pub fn insert(mut self, indices: BTreeSet<usize>) -> Self {
        if !indices.is_empty() {
            self.body.push(ChangeKind::Insert(indices));
        }
        self
    }

    pub fn delete(mut self, indices: BTreeSet<usize>) -> Self {
        if !indices.is_empty() {
            self.body.push(ChangeKind::Delete(indices));
        }
        self
    }

    pub fn update(mut self, indices: BTreeSet<usize>) -> Self {
        if !indices.is_empty() {
            self.body.push(ChangeKind::Update(indices));
        }
        self
    }

    /// The framed batch, or an empty vec if nothing changed
    pub fn finish(self) -> Vec<ChangeEvent<T>> {
        if self.body.is_empty() {
            return Vec::new();
        }
        let mut events = Vec::with_capacity(self.body.len() + 2);
        events.push(ChangeEvent::new(ChangeKind::BeginBatch, self.source.clone()));
        for change in self.body {
            events.push(ChangeEvent::new(change, self.source.clone()));
        }
        events.push(ChangeEvent::new(ChangeKind::EndBatch, self.source));
        events
    }
}
