use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tracing::warn;

use crate::codec::DataValue;

/// Largest packed payload sent as a single frame.
pub const CHUNKED_MTU: usize = 16_300;
pub const DEFAULT_MAX_INFLIGHT: usize = 1024;

const GROUP_KEY: &str = "__peerData";
const INDEX_KEY: &str = "n";
const TOTAL_KEY: &str = "total";
const DATA_KEY: &str = "data";

static NEXT_GROUP: AtomicU32 = AtomicU32::new(0);

/// One numbered fragment of a packed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub group_id: u32,
    pub index: u32,
    pub total: u32,
    pub fragment: Bytes,
}

impl Chunk {
    pub fn into_value(self) -> DataValue {
        let mut map = BTreeMap::new();
        map.insert(GROUP_KEY.to_string(), DataValue::Int(i64::from(self.group_id)));
        map.insert(INDEX_KEY.to_string(), DataValue::Int(i64::from(self.index)));
        map.insert(TOTAL_KEY.to_string(), DataValue::Int(i64::from(self.total)));
        map.insert(DATA_KEY.to_string(), DataValue::Bytes(self.fragment));
        DataValue::Map(map)
    }

    /// `None` when the value carries no chunk metadata.
    pub fn from_value(value: &DataValue) -> Option<Chunk> {
        let group_id = value.get(GROUP_KEY)?.as_i64()?;
        let index = value.get(INDEX_KEY).and_then(DataValue::as_i64)?;
        let total = value.get(TOTAL_KEY).and_then(DataValue::as_i64)?;
        let fragment = value.get(DATA_KEY).and_then(DataValue::as_bytes)?.clone();
        Some(Chunk {
            group_id: u32::try_from(group_id).ok()?,
            index: u32::try_from(index).ok()?,
            total: u32::try_from(total).ok()?,
            fragment,
        })
    }

    pub fn is_chunk(value: &DataValue) -> bool {
        value.get(GROUP_KEY).is_some()
    }
}

/// Split `payload` into fragments of at most `mtu` bytes under a fresh group id.
pub fn split(payload: &Bytes, mtu: usize) -> Vec<Chunk> {
    let mtu = mtu.max(1);
    let group_id = NEXT_GROUP.fetch_add(1, Ordering::Relaxed);
    let total = u32::try_from(payload.len().div_ceil(mtu).max(1)).unwrap_or(u32::MAX);
    let starts = (0..payload.len().max(1)).step_by(mtu);
    (0..total)
        .zip(starts)
        .map(|(index, start)| {
            let end = (start + mtu).min(payload.len());
            Chunk {
                group_id,
                index,
                total,
                fragment: payload.slice(start..end),
            }
        })
        .collect()
}

#[derive(Debug)]
struct PartialGroup {
    created_at: Instant,
    slots: Vec<Option<Bytes>>,
    received: usize,
}

/// Rebuilds payloads from fragments delivered in any order.
#[derive(Debug)]
pub struct ChunkReassembler {
    groups: HashMap<u32, PartialGroup>,
    max_inflight: usize,
}

impl Default for ChunkReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INFLIGHT)
    }
}

impl ChunkReassembler {
    pub fn new(max_inflight: usize) -> Self {
        Self {
            groups: HashMap::new(),
            max_inflight: max_inflight.max(1),
        }
    }

    /// Store a fragment; returns the joined payload once every index arrived.
    /// A repeated index replaces the stored fragment and is counted once.
    pub fn accept(&mut self, chunk: Chunk) -> Option<Bytes> {
        let Chunk {
            group_id,
            index,
            total,
            fragment,
        } = chunk;
        if total == 0 || index >= total {
            warn!(
                target: "peerlink::chunk",
                group_id, index, total, "dropping chunk with out-of-range index"
            );
            return None;
        }

        if !self.groups.contains_key(&group_id) && self.groups.len() >= self.max_inflight {
            self.evict_oldest();
        }

        let group = self.groups.entry(group_id).or_insert_with(|| PartialGroup {
            created_at: Instant::now(),
            slots: vec![None; total as usize],
            received: 0,
        });
        if group.slots.len() != total as usize {
            warn!(
                target: "peerlink::chunk",
                group_id,
                expected = group.slots.len(),
                total,
                "chunk total changed mid-group; discarding group"
            );
            self.groups.remove(&group_id);
            return None;
        }

        let slot = &mut group.slots[index as usize];
        if slot.is_none() {
            group.received += 1;
        }
        *slot = Some(fragment);

        if group.received < group.slots.len() {
            return None;
        }

        let group = self.groups.remove(&group_id)?;
        let size = group.slots.iter().flatten().map(Bytes::len).sum();
        let mut combined = BytesMut::with_capacity(size);
        for fragment in group.slots.into_iter().flatten() {
            combined.extend_from_slice(&fragment);
        }
        Some(combined.freeze())
    }

    pub fn pending_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn clear(&mut self) {
        self.groups.clear();
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .groups
            .iter()
            .min_by_key(|(_, group)| group.created_at)
            .map(|(id, _)| *id);
        if let Some(id) = oldest {
            warn!(target: "peerlink::chunk", group_id = id, "evicting stale chunk group");
            self.groups.remove(&id);
        }
    }
}
