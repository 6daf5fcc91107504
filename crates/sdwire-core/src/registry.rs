//! Stream tag pool and bus registry.

use crate::bus::{Bus, BusId};
use crate::error::{Error, Result};
use crate::stream::{Stream, StreamTag};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Shared handle to one stream.
pub(crate) type StreamHandle = Arc<Mutex<Stream>>;

struct TagSlot {
    key: Option<String>,
    ref_count: u32,
    stream: StreamHandle,
}

/// Outcome of [`StreamRegistry::release`].
pub(crate) enum Released {
    /// The tag was not allocated.
    Unknown,
    /// Other holders remain.
    Shared(u32),
    /// Last reference dropped; the stream left the pool.
    Freed(StreamHandle),
}

/// Fixed-size pool of stream tags.
///
/// Holders that allocate with the same key share one stream and one tag;
/// unkeyed allocations always get a fresh tag.
pub struct StreamRegistry {
    slots: Mutex<Vec<Option<TagSlot>>>,
}

impl StreamRegistry {
    /// A pool with `capacity` tags.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new((0..capacity).map(|_| None).collect()),
        }
    }

    /// Number of tags in the pool.
    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    /// Allocate a tag, or take another reference on the tag holding `key`.
    pub fn alloc(&self, key: Option<&str>) -> Result<StreamTag> {
        let mut slots = self.slots.lock();
        if let Some(key) = key {
            let existing = slots.iter_mut().enumerate().find_map(|(i, s)| {
                s.as_mut()
                    .filter(|s| s.key.as_deref() == Some(key))
                    .map(|s| (i, s))
            });
            if let Some((idx, slot)) = existing {
                slot.ref_count += 1;
                tracing::debug!(tag = idx + 1, key, refs = slot.ref_count, "stream tag shared");
                return Ok(tag_for(idx));
            }
        }
        let idx = slots
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| Error::ResourceExhausted("no free stream tag".to_string()))?;
        let tag = tag_for(idx);
        slots[idx] = Some(TagSlot {
            key: key.map(str::to_string),
            ref_count: 1,
            stream: Arc::new(Mutex::new(Stream::new(tag))),
        });
        tracing::debug!(tag = tag.0, key, "stream tag allocated");
        Ok(tag)
    }

    /// Drop one reference on `tag`.
    pub(crate) fn release(&self, tag: StreamTag) -> Released {
        let mut slots = self.slots.lock();
        let Some(entry) = index_of(tag).and_then(|i| slots.get_mut(i)) else {
            return Released::Unknown;
        };
        let Some(slot) = entry.as_mut() else {
            return Released::Unknown;
        };
        slot.ref_count -= 1;
        if slot.ref_count > 0 {
            return Released::Shared(slot.ref_count);
        }
        match entry.take() {
            Some(slot) => Released::Freed(slot.stream),
            None => Released::Unknown,
        }
    }

    pub(crate) fn get(&self, tag: StreamTag) -> Option<StreamHandle> {
        let slots = self.slots.lock();
        index_of(tag)
            .and_then(|i| slots.get(i))
            .and_then(Option::as_ref)
            .map(|s| Arc::clone(&s.stream))
    }

    /// Holders of `tag`, or `None` if it is free.
    pub fn ref_count(&self, tag: StreamTag) -> Option<u32> {
        let slots = self.slots.lock();
        index_of(tag)
            .and_then(|i| slots.get(i))
            .and_then(Option::as_ref)
            .map(|s| s.ref_count)
    }

    /// Allocated tags in ascending order.
    pub fn tags(&self) -> Vec<StreamTag> {
        self.slots
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| tag_for(i))
            .collect()
    }
}

fn tag_for(idx: usize) -> StreamTag {
    StreamTag(idx as u32 + 1)
}

fn index_of(tag: StreamTag) -> Option<usize> {
    (tag.0 as usize).checked_sub(1)
}

/// All buses known to the manager.
#[derive(Default)]
pub struct BusRegistry {
    buses: RwLock<Vec<Arc<Bus>>>,
    next_id: AtomicU32,
}

impl BusRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next bus id. Ids are never reused.
    pub(crate) fn next_id(&self) -> BusId {
        BusId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn insert(&self, bus: Arc<Bus>) {
        self.buses.write().push(bus);
    }

    pub(crate) fn remove(&self, id: BusId) -> Option<Arc<Bus>> {
        let mut buses = self.buses.write();
        let idx = buses.iter().position(|b| b.id() == id)?;
        Some(buses.remove(idx))
    }

    /// Look up a bus.
    pub fn get(&self, id: BusId) -> Option<Arc<Bus>> {
        self.buses.read().iter().find(|b| b.id() == id).cloned()
    }

    /// Ids of all buses in registration order.
    pub fn ids(&self) -> Vec<BusId> {
        self.buses.read().iter().map(|b| b.id()).collect()
    }

    pub(crate) fn drain(&self) -> Vec<Arc<Bus>> {
        std::mem::take(&mut *self.buses.write())
    }
}
