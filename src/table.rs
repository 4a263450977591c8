//! Exchange Correlation Table.
//!
//! Maps stream ids to in-flight exchanges and promised ids to the stream that
//! triggered the push. Both maps are `DashMap`s: insert, lookup and remove are
//! linearizable per key, so submitters on arbitrary threads and the I/O loop can
//! work on the table at the same time. Closures passed to [`CorrelationTable::with_entry`]
//! run under the key's shard lock and must not touch the table again.

use crate::error::MuxError;
use crate::frame::StreamId;
use crate::streams::{ExchangeEntry, StreamMetrics};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Notify;

pub(crate) struct CorrelationTable {
    streams: DashMap<StreamId, ExchangeEntry>,
    push_links: DashMap<StreamId, StreamId>,
    idle: Notify,
}

impl CorrelationTable {
    pub(crate) fn new() -> Self {
        Self {
            streams: DashMap::new(),
            push_links: DashMap::new(),
            idle: Notify::new(),
        }
    }

    pub(crate) fn register(&self, stream_id: StreamId, entry: ExchangeEntry) -> Result<(), MuxError> {
        match self.streams.entry(stream_id) {
            Entry::Occupied(_) => Err(MuxError::DuplicateStream(stream_id)),
            Entry::Vacant(slot) => {
                if let Some(origin) = entry.origin {
                    self.push_links.insert(stream_id, origin);
                }
                slot.insert(entry);
                Ok(())
            }
        }
    }

    pub(crate) fn contains(&self, stream_id: StreamId) -> bool {
        self.streams.contains_key(&stream_id)
    }

    /// Run `f` on the entry for `stream_id`, if registered.
    pub(crate) fn with_entry<R>(
        &self,
        stream_id: StreamId,
        f: impl FnOnce(&mut ExchangeEntry) -> R,
    ) -> Option<R> {
        self.streams
            .get_mut(&stream_id)
            .map(|mut entry| f(entry.value_mut()))
    }

    /// Originating stream of a pushed stream.
    pub(crate) fn origin_of(&self, promised_id: StreamId) -> Option<StreamId> {
        self.push_links.get(&promised_id).map(|origin| *origin)
    }

    pub(crate) fn remove(&self, stream_id: StreamId) -> Option<ExchangeEntry> {
        self.push_links.remove(&stream_id);
        let removed = self.streams.remove(&stream_id).map(|(_, entry)| entry);
        if removed.is_some() && self.streams.is_empty() {
            self.idle.notify_one();
        }
        removed
    }

    /// Remove the entry only if `should_remove` holds for it, atomically.
    pub(crate) fn remove_if(
        &self,
        stream_id: StreamId,
        should_remove: impl FnOnce(&ExchangeEntry) -> bool,
    ) -> Option<ExchangeEntry> {
        let removed = self
            .streams
            .remove_if(&stream_id, |_, entry| should_remove(entry))
            .map(|(_, entry)| entry);
        if removed.is_some() {
            self.push_links.remove(&stream_id);
            if self.streams.is_empty() {
                self.idle.notify_one();
            }
        }
        removed
    }

    /// Ids matching `predicate`, ascending.
    pub(crate) fn stream_ids_where(&self, predicate: impl Fn(StreamId) -> bool) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self
            .streams
            .iter()
            .map(|entry| *entry.key())
            .filter(|id| predicate(*id))
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Remove every entry, returning them in ascending stream order.
    pub(crate) fn drain(&self) -> Vec<(StreamId, ExchangeEntry)> {
        let mut drained = Vec::new();
        for stream_id in self.stream_ids_where(|_| true) {
            if let Some((stream_id, entry)) = self.streams.remove(&stream_id) {
                drained.push((stream_id, entry));
            }
        }
        self.push_links.clear();
        if !drained.is_empty() {
            self.idle.notify_one();
        }
        drained
    }

    pub(crate) fn len(&self) -> usize {
        self.streams.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub(crate) fn push_link_count(&self) -> usize {
        self.push_links.len()
    }

    /// Resolves after a removal leaves the table empty.
    pub(crate) async fn emptied(&self) {
        self.idle.notified().await
    }

    pub(crate) fn metrics(&self) -> StreamMetrics {
        let mut metrics = StreamMetrics::default();
        for entry in self.streams.iter() {
            metrics.record(entry.value());
        }
        metrics
    }
}
