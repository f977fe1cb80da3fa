//! # Lazy-Sort Leaf Node
//!
//! A leaf is logically a multiset of operations against keys, observed
//! newest-first. Inserts and erases *append*; nothing is moved until the
//! page is compacted, sorted, or split. That is what makes a hot leaf an
//! O(1) append target for the fast path while it is unsorted.
//!
//! ## Page Layout
//!
//! ```text
//! Offset              Content
//! ------              -------
//! 0                   node-kind discriminator (0 = leaf)
//! 1                   LeafHeader (16 bytes)
//! 17                  cached min_key (K::ENCODED_LEN bytes)
//! 17 + L              cached max_key (K::ENCODED_LEN bytes)
//! 17 + 2L             slot[0] slot[1] ...      ← grows upward
//! ...                 free space
//! heap_end            (op, payload) records    ← grows downward
//! page end
//! ```
//!
//! Slots are `(offset, length)` pairs in **insertion order** — not key
//! order — while the sorted bit is clear. Each heap record starts with an
//! op byte: an Insert payload is a serialized tuple, a Delete payload is a
//! raw encoded key (a tombstone).
//!
//! ## Read Discipline
//!
//! While unsorted, point reads scan slots newest-first: the first record
//! mentioning the key wins, so a tombstone hides every older insert and a
//! re-insert shadows its own tombstone. Once the background sorter has run,
//! the sorted bit is set, tombstones and duplicates are gone, and reads
//! binary-search the slot array.
//!
//! ## State Machine
//!
//! ```text
//! (unsorted, hot) ──displaced──> (unsorted, cold) ──sorter──> (sorted, cold)
//!        ^                                                        │
//!        └──────────────────────── insert ────────────────────────┘
//! ```
//!
//! ## Thread Safety
//!
//! A leaf view borrows pinned page bytes and is not synchronized; callers
//! hold the tree's per-leaf RwLock around every view.

use std::marker::PhantomData;

use eyre::{bail, ensure, eyre, Result};
use hashbrown::HashSet;
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::SplitPolicy;
use crate::key::Key;
use crate::record::{Schema, Tuple};
use crate::tree::{NodeKind, INVALID_NODE_ID, NODE_KIND_OFFSET};

pub const LEAF_HEADER_SIZE: usize = 16;
pub const SLOT_SIZE: usize = 4;

pub const OP_INSERT: u8 = 0;
pub const OP_DELETE: u8 = 1;

const HEADER_OFFSET: usize = NODE_KIND_OFFSET + 1;

const FLAG_SORTED: u8 = 0b0000_0001;
const FLAG_COLD: u8 = 0b0000_0010;

/// First byte usable for the slot array in a leaf page for key type `K`.
pub fn leaf_content_start<K: Key>() -> usize {
    HEADER_OFFSET + LEAF_HEADER_SIZE + 2 * K::ENCODED_LEN
}

/// Bytes a leaf page can devote to slots plus heap records.
pub fn leaf_available_space<K: Key>(page_size: usize) -> usize {
    page_size.saturating_sub(leaf_content_start::<K>())
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct LeafHeader {
    id: U32,
    next_id: U32,
    live_count: U16,
    slot_count: U16,
    heap_end: U16,
    flags: u8,
    reserved: u8,
}

const _: () = assert!(std::mem::size_of::<LeafHeader>() == LEAF_HEADER_SIZE);

impl LeafHeader {
    pub fn id(&self) -> u32 {
        self.id.get()
    }

    pub fn next_id(&self) -> u32 {
        self.next_id.get()
    }

    pub fn live_count(&self) -> u16 {
        self.live_count.get()
    }

    pub fn slot_count(&self) -> u16 {
        self.slot_count.get()
    }

    pub fn heap_end(&self) -> u16 {
        self.heap_end.get()
    }

    pub fn is_sorted(&self) -> bool {
        self.flags & FLAG_SORTED != 0
    }

    pub fn is_cold(&self) -> bool {
        self.flags & FLAG_COLD != 0
    }
}

#[repr(C)]
#[derive(
    Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, PartialEq, Eq,
)]
pub struct Slot {
    offset: U16,
    len: U16,
}

impl Slot {
    fn new(offset: u16, len: u16) -> Self {
        Self {
            offset: U16::new(offset),
            len: U16::new(len),
        }
    }

    pub fn offset(&self) -> usize {
        self.offset.get() as usize
    }

    pub fn len(&self) -> usize {
        self.len.get() as usize
    }
}

/// Read-only view over a leaf page.
#[derive(Debug)]
pub struct LeafNode<'a, K: Key> {
    data: &'a [u8],
    schema: &'a Schema,
    key_index: usize,
    _key: PhantomData<K>,
}

/// Mutable view over a leaf page.
pub struct LeafNodeMut<'a, K: Key> {
    data: &'a mut [u8],
    schema: &'a Schema,
    key_index: usize,
    _key: PhantomData<K>,
}

/// Pulls the key field out of an in-memory tuple.
pub(crate) fn extract_key<K: Key>(tuple: &Tuple, key_index: usize) -> Result<K> {
    let field = tuple
        .field(key_index)
        .ok_or_else(|| eyre!("tuple has no field {}", key_index))?;
    K::from_value(field)
        .ok_or_else(|| eyre!("field {} does not hold the tree's key type: {:?}", key_index, field))
}

impl<'a, K: Key> LeafNode<'a, K> {
    pub fn from_page(data: &'a [u8], schema: &'a Schema, key_index: usize) -> Result<Self> {
        ensure!(
            data.len() > leaf_content_start::<K>(),
            "page of {} bytes too small for a leaf with {}-byte keys",
            data.len(),
            K::ENCODED_LEN
        );
        ensure!(
            NodeKind::from_byte(data[NODE_KIND_OFFSET]) == Some(NodeKind::Leaf),
            "expected a leaf page, found discriminator {:#04x}",
            data[NODE_KIND_OFFSET]
        );
        Ok(Self {
            data,
            schema,
            key_index,
            _key: PhantomData,
        })
    }

    fn header(&self) -> &LeafHeader {
        LeafHeader::ref_from_bytes(&self.data[HEADER_OFFSET..HEADER_OFFSET + LEAF_HEADER_SIZE])
            .expect("leaf header validated at construction")
    }

    pub fn id(&self) -> u32 {
        self.header().id()
    }

    /// Right sibling, or `None` at the end of the chain.
    pub fn next_id(&self) -> Option<u32> {
        match self.header().next_id() {
            INVALID_NODE_ID => None,
            id => Some(id),
        }
    }

    pub fn live_count(&self) -> usize {
        self.header().live_count() as usize
    }

    pub fn slot_count(&self) -> usize {
        self.header().slot_count() as usize
    }

    pub fn is_sorted(&self) -> bool {
        self.header().is_sorted()
    }

    pub fn is_cold(&self) -> bool {
        self.header().is_cold()
    }

    fn heap_end(&self) -> usize {
        self.header().heap_end() as usize
    }

    /// Cached lower bound; `K::MAX` sentinel while the leaf has no live keys.
    pub fn min_key(&self) -> K {
        K::decode(&self.data[HEADER_OFFSET + LEAF_HEADER_SIZE..])
    }

    /// Cached upper bound; `K::MIN` sentinel while the leaf has no live keys.
    pub fn max_key(&self) -> K {
        K::decode(&self.data[HEADER_OFFSET + LEAF_HEADER_SIZE + K::ENCODED_LEN..])
    }

    /// Slot bytes plus heap bytes currently in use.
    pub fn used_space(&self) -> usize {
        (self.data.len() - self.heap_end()) + SLOT_SIZE * self.slot_count()
    }

    fn slot_offset(&self, index: usize) -> usize {
        leaf_content_start::<K>() + index * SLOT_SIZE
    }

    pub fn slot_at(&self, index: usize) -> Result<&Slot> {
        ensure!(
            index < self.slot_count(),
            "slot index {} out of bounds (slot_count={})",
            index,
            self.slot_count()
        );
        let offset = self.slot_offset(index);
        Slot::ref_from_bytes(&self.data[offset..offset + SLOT_SIZE])
            .map_err(|e| eyre!("failed to read slot {}: {:?}", index, e))
    }

    /// Op byte and payload of one heap record.
    pub fn record(&self, index: usize) -> Result<(u8, &'a [u8])> {
        let slot = self.slot_at(index)?;
        let (offset, len) = (slot.offset(), slot.len());
        ensure!(
            len >= 1 && offset + len <= self.data.len(),
            "slot {} points outside the page: offset={}, len={}",
            index,
            offset,
            len
        );
        Ok((self.data[offset], &self.data[offset + 1..offset + len]))
    }

    fn tombstone_key(payload: &[u8]) -> Result<K> {
        ensure!(
            payload.len() >= K::ENCODED_LEN,
            "tombstone payload of {} bytes is shorter than the key",
            payload.len()
        );
        Ok(K::decode(payload))
    }

    fn insert_key(&self, payload: &[u8]) -> Result<K> {
        let field = self.schema.read_field(payload, self.key_index)?;
        K::from_value(&field).ok_or_else(|| {
            eyre!(
                "field {} does not hold the tree's key type: {:?}",
                self.key_index,
                field
            )
        })
    }

    /// Key of the record behind slot `index`, whatever its op.
    pub fn key_at(&self, index: usize) -> Result<K> {
        let (op, payload) = self.record(index)?;
        match op {
            OP_DELETE => Self::tombstone_key(payload),
            OP_INSERT => self.insert_key(payload),
            other => bail!("invalid op byte {:#04x} in slot {}", other, index),
        }
    }

    /// Live tuple behind slot `index`, or `None` for a tombstone.
    pub fn tuple_at(&self, index: usize) -> Result<Option<Tuple>> {
        let (op, payload) = self.record(index)?;
        match op {
            OP_DELETE => Ok(None),
            OP_INSERT => Ok(Some(self.schema.deserialize(payload)?)),
            other => bail!("invalid op byte {:#04x} in slot {}", other, index),
        }
    }

    /// Index of the first slot whose key is >= `key`. Only meaningful while
    /// the leaf is sorted.
    pub fn value_slot(&self, key: K) -> Result<usize> {
        let mut left = 0;
        let mut right = self.slot_count();
        while left < right {
            let mid = left + (right - left) / 2;
            if self.key_at(mid)? < key {
                left = mid + 1;
            } else {
                right = mid;
            }
        }
        Ok(left)
    }

    /// Most recent value for `key`: binary search when sorted, newest-first
    /// scan honouring tombstones otherwise.
    pub fn get(&self, key: K) -> Result<Option<Tuple>> {
        if self.is_sorted() {
            let index = self.value_slot(key)?;
            if index < self.slot_count() && self.key_at(index)? == key {
                return self.tuple_at(index);
            }
            return Ok(None);
        }

        for index in (0..self.slot_count()).rev() {
            let (op, payload) = self.record(index)?;
            if op == OP_DELETE {
                if Self::tombstone_key(payload)? == key {
                    return Ok(None);
                }
                continue;
            }
            if self.insert_key(payload)? == key {
                return Ok(Some(self.schema.deserialize(payload)?));
            }
        }
        Ok(None)
    }

    /// Live tuples with keys in `[lo, hi]`, ascending.
    pub fn get_range(&self, lo: K, hi: K) -> Result<Vec<Tuple>> {
        let mut result = Vec::new();
        if self.live_count() == 0 || self.min_key() > hi {
            return Ok(result);
        }

        if self.is_sorted() {
            for index in 0..self.slot_count() {
                let key = self.key_at(index)?;
                if key < lo {
                    continue;
                }
                if key > hi {
                    break;
                }
                if let Some(tuple) = self.tuple_at(index)? {
                    result.push(tuple);
                }
            }
            return Ok(result);
        }

        let mut seen: HashSet<K> = HashSet::new();
        let mut tombstones: HashSet<K> = HashSet::new();
        for index in (0..self.slot_count()).rev() {
            let (op, payload) = self.record(index)?;
            if op == OP_DELETE {
                tombstones.insert(Self::tombstone_key(payload)?);
                continue;
            }
            let key = self.insert_key(payload)?;
            if key < lo || key > hi || seen.contains(&key) || tombstones.contains(&key) {
                continue;
            }
            seen.insert(key);
            result.push(self.schema.deserialize(payload)?);
        }
        result.reverse();
        Ok(result)
    }

    /// Live, deduplicated tuples in insertion order: newest-first scan with
    /// a seen-set, tombstones applied, then reversed. Does not mutate the
    /// page.
    pub fn compact(&self) -> Result<Vec<(K, Tuple)>> {
        let mut compacted = Vec::new();
        let mut seen: HashSet<K> = HashSet::new();
        let mut tombstones: HashSet<K> = HashSet::new();

        for index in (0..self.slot_count()).rev() {
            let (op, payload) = self.record(index)?;
            if op == OP_DELETE {
                tombstones.insert(Self::tombstone_key(payload)?);
                continue;
            }
            let key = self.insert_key(payload)?;
            if !seen.contains(&key) && !tombstones.contains(&key) {
                compacted.push((key, self.schema.deserialize(payload)?));
            }
            seen.insert(key);
        }
        compacted.reverse();
        Ok(compacted)
    }
}

impl<'a, K: Key> LeafNodeMut<'a, K> {
    pub fn from_page(data: &'a mut [u8], schema: &'a Schema, key_index: usize) -> Result<Self> {
        ensure!(
            data.len() > leaf_content_start::<K>(),
            "page of {} bytes too small for a leaf with {}-byte keys",
            data.len(),
            K::ENCODED_LEN
        );
        ensure!(
            NodeKind::from_byte(data[NODE_KIND_OFFSET]) == Some(NodeKind::Leaf),
            "expected a leaf page, found discriminator {:#04x}",
            data[NODE_KIND_OFFSET]
        );
        Ok(Self {
            data,
            schema,
            key_index,
            _key: PhantomData,
        })
    }

    /// Formats `data` as a fresh, empty leaf.
    pub fn init(
        data: &'a mut [u8],
        schema: &'a Schema,
        key_index: usize,
        id: u32,
        next_id: u32,
        cold: bool,
    ) -> Result<Self> {
        ensure!(
            data.len() > leaf_content_start::<K>() + SLOT_SIZE,
            "page of {} bytes too small for a leaf with {}-byte keys",
            data.len(),
            K::ENCODED_LEN
        );
        ensure!(
            data.len() <= u16::MAX as usize,
            "page of {} bytes overflows the leaf's 16-bit offsets",
            data.len()
        );

        data[NODE_KIND_OFFSET] = NodeKind::Leaf as u8;
        let heap_end = data.len() as u16;
        let header = LeafHeader {
            id: U32::new(id),
            next_id: U32::new(next_id),
            live_count: U16::new(0),
            slot_count: U16::new(0),
            heap_end: U16::new(heap_end),
            flags: if cold { FLAG_COLD } else { 0 },
            reserved: 0,
        };
        data[HEADER_OFFSET..HEADER_OFFSET + LEAF_HEADER_SIZE].copy_from_slice(header.as_bytes());

        let mut leaf = Self {
            data,
            schema,
            key_index,
            _key: PhantomData,
        };
        leaf.write_min(K::MAX);
        leaf.write_max(K::MIN);
        Ok(leaf)
    }

    pub fn as_ref(&self) -> LeafNode<'_, K> {
        LeafNode {
            data: self.data,
            schema: self.schema,
            key_index: self.key_index,
            _key: PhantomData,
        }
    }

    fn header(&self) -> &LeafHeader {
        LeafHeader::ref_from_bytes(&self.data[HEADER_OFFSET..HEADER_OFFSET + LEAF_HEADER_SIZE])
            .expect("leaf header validated at construction")
    }

    fn header_mut(&mut self) -> &mut LeafHeader {
        LeafHeader::mut_from_bytes(
            &mut self.data[HEADER_OFFSET..HEADER_OFFSET + LEAF_HEADER_SIZE],
        )
        .expect("leaf header validated at construction")
    }

    pub fn id(&self) -> u32 {
        self.header().id()
    }

    pub fn next_id(&self) -> Option<u32> {
        self.as_ref().next_id()
    }

    pub fn set_next_id(&mut self, next_id: u32) {
        self.header_mut().next_id = U32::new(next_id);
    }

    pub fn live_count(&self) -> usize {
        self.header().live_count() as usize
    }

    pub fn slot_count(&self) -> usize {
        self.header().slot_count() as usize
    }

    pub fn is_sorted(&self) -> bool {
        self.header().is_sorted()
    }

    pub fn is_cold(&self) -> bool {
        self.header().is_cold()
    }

    pub fn set_sorted(&mut self, sorted: bool) {
        let header = self.header_mut();
        if sorted {
            header.flags |= FLAG_SORTED;
        } else {
            header.flags &= !FLAG_SORTED;
        }
    }

    pub fn set_cold(&mut self, cold: bool) {
        let header = self.header_mut();
        if cold {
            header.flags |= FLAG_COLD;
        } else {
            header.flags &= !FLAG_COLD;
        }
    }

    pub fn min_key(&self) -> K {
        self.as_ref().min_key()
    }

    pub fn max_key(&self) -> K {
        self.as_ref().max_key()
    }

    fn write_min(&mut self, key: K) {
        key.encode(&mut self.data[HEADER_OFFSET + LEAF_HEADER_SIZE..]);
    }

    fn write_max(&mut self, key: K) {
        key.encode(&mut self.data[HEADER_OFFSET + LEAF_HEADER_SIZE + K::ENCODED_LEN..]);
    }

    /// Whether a record of `len` heap bytes plus its slot still fits.
    fn can_insert(&self, len: usize) -> bool {
        let header = self.header();
        let heap_end = header.heap_end() as usize;
        let needed_end =
            leaf_content_start::<K>() + (header.slot_count() as usize + 1) * SLOT_SIZE;
        heap_end >= len && heap_end - len >= needed_end
    }

    fn append_record(&mut self, len: usize) -> usize {
        let header = self.header();
        let new_end = header.heap_end() as usize - len;
        let slot_index = header.slot_count() as usize;

        let slot = Slot::new(new_end as u16, len as u16);
        let slot_offset = leaf_content_start::<K>() + slot_index * SLOT_SIZE;
        self.data[slot_offset..slot_offset + SLOT_SIZE].copy_from_slice(slot.as_bytes());

        let header = self.header_mut();
        header.heap_end = U16::new(new_end as u16);
        header.slot_count = U16::new(slot_index as u16 + 1);
        new_end
    }

    /// Appends an Insert record. Returns `false` (page untouched) when the
    /// record would cross the slot/heap boundary — the caller's cue to
    /// split.
    pub fn insert(&mut self, tuple: &Tuple) -> Result<bool> {
        let key = extract_key::<K>(tuple, self.key_index)?;
        let len = 1 + self.schema.length(tuple)?;
        if !self.can_insert(len) {
            return Ok(false);
        }

        let offset = self.append_record(len);
        self.data[offset] = OP_INSERT;
        self.schema
            .serialize(&mut self.data[offset + 1..offset + len], tuple)?;

        let header = self.header_mut();
        header.live_count = U16::new(header.live_count() + 1);
        header.flags &= !FLAG_SORTED;

        if key < self.min_key() {
            self.write_min(key);
        }
        if key > self.max_key() {
            self.write_max(key);
        }
        Ok(true)
    }

    /// Appends a newer version of an existing key; the newest-first scan
    /// makes this a logical update, so the live count is unchanged.
    pub fn update(&mut self, tuple: &Tuple) -> Result<bool> {
        if self.insert(tuple)? {
            let header = self.header_mut();
            header.live_count = U16::new(header.live_count().saturating_sub(1));
            return Ok(true);
        }
        Ok(false)
    }

    /// Appends a Delete tombstone. Returns `false` when the page is full.
    pub fn erase(&mut self, key: K) -> Result<bool> {
        let len = 1 + K::ENCODED_LEN;
        if !self.can_insert(len) {
            return Ok(false);
        }

        let offset = self.append_record(len);
        self.data[offset] = OP_DELETE;
        key.encode(&mut self.data[offset + 1..]);

        let header = self.header_mut();
        header.live_count = U16::new(header.live_count().saturating_sub(1));
        // A tombstone breaks the sorted invariant (no tombstones, slot
        // order = key order), so the leaf falls back to scan reads.
        header.flags &= !FLAG_SORTED;

        if key == self.min_key() || key == self.max_key() {
            self.recompute_bounds()?;
        }
        Ok(true)
    }

    /// Re-derives the cached min/max from the live keys after a boundary
    /// key was erased. O(n).
    fn recompute_bounds(&mut self) -> Result<()> {
        let (new_min, new_max) = {
            let view = self.as_ref();
            let mut seen: HashSet<K> = HashSet::new();
            let mut tombstones: HashSet<K> = HashSet::new();
            let mut new_min = K::MAX;
            let mut new_max = K::MIN;

            for index in (0..view.slot_count()).rev() {
                let (op, payload) = view.record(index)?;
                if op == OP_DELETE {
                    tombstones.insert(LeafNode::<K>::tombstone_key(payload)?);
                    continue;
                }
                let key = view.insert_key(payload)?;
                if seen.contains(&key) || tombstones.contains(&key) {
                    continue;
                }
                seen.insert(key);
                new_min = new_min.min(key);
                new_max = new_max.max(key);
            }
            (new_min, new_max)
        };
        self.write_min(new_min);
        self.write_max(new_max);
        Ok(())
    }

    /// Resets the slot array and heap, keeping identity, chain link and
    /// flags.
    fn clear(&mut self) {
        let heap_end = self.data.len() as u16;
        let header = self.header_mut();
        header.slot_count = U16::new(0);
        header.live_count = U16::new(0);
        header.heap_end = U16::new(heap_end);
        self.write_min(K::MAX);
        self.write_max(K::MIN);
    }

    /// Compacts, clears, and re-inserts everything in key order, then sets
    /// the sorted bit. After this the leaf serves reads in O(log n) with no
    /// tombstones or duplicates.
    pub fn sort(&mut self) -> Result<()> {
        let mut items = self.as_ref().compact()?;
        items.sort_by_key(|(key, _)| *key);

        self.clear();
        for (_, tuple) in &items {
            ensure!(
                self.insert(tuple)?,
                "leaf {} overflowed while rewriting its own compaction",
                self.id()
            );
        }
        self.set_sorted(true);
        Ok(())
    }

    /// Moves the upper portion of this leaf's live tuples into `new_leaf`
    /// and links it into the sibling chain. Returns the separator key: the
    /// smallest key of `new_leaf`.
    pub fn split_into(
        &mut self,
        new_leaf: &mut LeafNodeMut<'_, K>,
        policy: SplitPolicy,
        split_percentage: usize,
    ) -> Result<K> {
        let items = self.as_ref().compact()?;
        ensure!(
            items.len() >= 2,
            "cannot split leaf {} with {} live tuples",
            self.id(),
            items.len()
        );

        let (split_key, left, right, sorted) = match policy {
            SplitPolicy::SortOnSplit => {
                let mut items = items;
                items.sort_by_key(|(key, _)| *key);
                let n = items.len();
                let keep = (n * (split_percentage - 1))
                    .div_ceil(split_percentage)
                    .clamp(1, n - 1);
                let right = items.split_off(keep);
                (right[0].0, items, right, true)
            }
            SplitPolicy::QuickPartition => {
                // Compacted keys are distinct, so the (p-1)/p-rank pivot is
                // strictly above the minimum and neither side ends empty.
                let mut keys: Vec<K> = items.iter().map(|(key, _)| *key).collect();
                let pivot_index =
                    (keys.len() * (split_percentage - 1) / split_percentage).min(keys.len() - 1);
                let (_, pivot, _) = keys.select_nth_unstable(pivot_index);
                let pivot = *pivot;

                let (mut left, mut right) = (Vec::new(), Vec::new());
                for item in items {
                    if item.0 < pivot {
                        left.push(item);
                    } else {
                        right.push(item);
                    }
                }
                (pivot, left, right, false)
            }
        };

        let old_next = self.header().next_id();
        self.clear();
        for (_, tuple) in &left {
            ensure!(
                self.insert(tuple)?,
                "left half of split leaf {} overflowed",
                self.id()
            );
        }
        for (_, tuple) in &right {
            ensure!(
                new_leaf.insert(tuple)?,
                "right half of split leaf {} overflowed",
                self.id()
            );
        }
        if sorted {
            self.set_sorted(true);
            new_leaf.set_sorted(true);
        }

        new_leaf.set_next_id(old_next);
        self.set_next_id(new_leaf.id());
        Ok(split_key)
    }

    pub fn get(&self, key: K) -> Result<Option<Tuple>> {
        self.as_ref().get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FieldType, Value};

    const PAGE: usize = 1024;

    fn schema() -> Schema {
        Schema::new(vec![FieldType::Long, FieldType::Text])
    }

    fn tuple(key: i64, payload: &str) -> Tuple {
        Tuple::new(vec![Value::Long(key), Value::Text(payload.into())])
    }

    fn make_leaf<'a>(page: &'a mut [u8], schema: &'a Schema) -> LeafNodeMut<'a, i64> {
        LeafNodeMut::init(page, schema, 0, 1, INVALID_NODE_ID, false).unwrap()
    }

    #[test]
    fn init_writes_header_and_sentinels() {
        let schema = schema();
        let mut page = vec![0u8; PAGE];
        let leaf = make_leaf(&mut page, &schema);

        assert_eq!(leaf.id(), 1);
        assert_eq!(leaf.next_id(), None);
        assert_eq!(leaf.live_count(), 0);
        assert_eq!(leaf.slot_count(), 0);
        assert!(!leaf.is_sorted());
        assert!(!leaf.is_cold());
        assert_eq!(leaf.min_key(), i64::MAX);
        assert_eq!(leaf.max_key(), i64::MIN);
    }

    #[test]
    fn insert_and_get_single_tuple() {
        let schema = schema();
        let mut page = vec![0u8; PAGE];
        let mut leaf = make_leaf(&mut page, &schema);

        assert!(leaf.insert(&tuple(42, "x")).unwrap());
        assert_eq!(leaf.live_count(), 1);
        assert_eq!(leaf.min_key(), 42);
        assert_eq!(leaf.max_key(), 42);
        assert_eq!(leaf.get(42).unwrap(), Some(tuple(42, "x")));
        assert_eq!(leaf.get(43).unwrap(), None);
    }

    #[test]
    fn newest_insert_shadows_older_duplicate() {
        let schema = schema();
        let mut page = vec![0u8; PAGE];
        let mut leaf = make_leaf(&mut page, &schema);

        leaf.insert(&tuple(7, "old")).unwrap();
        leaf.insert(&tuple(7, "new")).unwrap();

        assert_eq!(leaf.get(7).unwrap(), Some(tuple(7, "new")));
        assert_eq!(leaf.slot_count(), 2);
    }

    #[test]
    fn tombstone_hides_key_until_reinserted() {
        let schema = schema();
        let mut page = vec![0u8; PAGE];
        let mut leaf = make_leaf(&mut page, &schema);

        leaf.insert(&tuple(42, "a")).unwrap();
        assert!(leaf.erase(42).unwrap());
        assert_eq!(leaf.get(42).unwrap(), None);

        leaf.insert(&tuple(42, "b")).unwrap();
        assert_eq!(leaf.get(42).unwrap(), Some(tuple(42, "b")));
    }

    #[test]
    fn erasing_a_boundary_key_recomputes_bounds() {
        let schema = schema();
        let mut page = vec![0u8; PAGE];
        let mut leaf = make_leaf(&mut page, &schema);

        for key in [5, 1, 9] {
            leaf.insert(&tuple(key, "v")).unwrap();
        }
        leaf.erase(9).unwrap();
        assert_eq!(leaf.min_key(), 1);
        assert_eq!(leaf.max_key(), 5);

        leaf.erase(1).unwrap();
        assert_eq!(leaf.min_key(), 5);
        assert_eq!(leaf.max_key(), 5);
    }

    #[test]
    fn unsorted_range_is_ascending_and_deduped() {
        let schema = schema();
        let mut page = vec![0u8; PAGE];
        let mut leaf = make_leaf(&mut page, &schema);

        for key in [4, 2, 8, 6] {
            leaf.insert(&tuple(key, "v")).unwrap();
        }
        leaf.insert(&tuple(4, "newer")).unwrap();
        leaf.erase(6).unwrap();

        let tuples = leaf.as_ref().get_range(2, 8).unwrap();
        let keys: Vec<i64> = tuples
            .iter()
            .map(|t| match t.field(0) {
                Some(Value::Long(k)) => *k,
                other => panic!("unexpected key field {:?}", other),
            })
            .collect();
        assert_eq!(keys, vec![2, 4, 8]);
        assert_eq!(tuples[1], tuple(4, "newer"));
    }

    #[test]
    fn sort_dedups_orders_and_sets_the_bit() {
        let schema = schema();
        let mut page = vec![0u8; PAGE];
        let mut leaf = make_leaf(&mut page, &schema);

        for key in [9, 3, 7, 1] {
            leaf.insert(&tuple(key, "v")).unwrap();
        }
        leaf.insert(&tuple(7, "latest")).unwrap();
        leaf.erase(9).unwrap();

        leaf.sort().unwrap();

        assert!(leaf.is_sorted());
        assert_eq!(leaf.slot_count(), 3);
        assert_eq!(leaf.live_count(), 3);
        let view = leaf.as_ref();
        assert_eq!(view.key_at(0).unwrap(), 1);
        assert_eq!(view.key_at(1).unwrap(), 3);
        assert_eq!(view.key_at(2).unwrap(), 7);
        assert_eq!(view.get(7).unwrap(), Some(tuple(7, "latest")));
        assert_eq!(view.get(9).unwrap(), None);
    }

    #[test]
    fn erase_after_sort_falls_back_to_scan_reads() {
        let schema = schema();
        let mut page = vec![0u8; PAGE];
        let mut leaf = make_leaf(&mut page, &schema);

        for key in [2, 4, 6, 8] {
            leaf.insert(&tuple(key, "v")).unwrap();
        }
        leaf.sort().unwrap();

        assert!(leaf.erase(4).unwrap());
        assert!(!leaf.is_sorted());
        assert_eq!(leaf.get(4).unwrap(), None);
        assert_eq!(leaf.get(6).unwrap(), Some(tuple(6, "v")));
    }

    #[test]
    fn insert_after_sort_clears_the_bit() {
        let schema = schema();
        let mut page = vec![0u8; PAGE];
        let mut leaf = make_leaf(&mut page, &schema);

        leaf.insert(&tuple(1, "a")).unwrap();
        leaf.insert(&tuple(2, "b")).unwrap();
        leaf.sort().unwrap();
        assert!(leaf.is_sorted());

        leaf.insert(&tuple(3, "c")).unwrap();
        assert!(!leaf.is_sorted());
    }

    #[test]
    fn compact_applies_tombstones_and_keeps_insertion_order() {
        let schema = schema();
        let mut page = vec![0u8; PAGE];
        let mut leaf = make_leaf(&mut page, &schema);

        leaf.insert(&tuple(5, "a")).unwrap();
        leaf.insert(&tuple(3, "b")).unwrap();
        leaf.insert(&tuple(5, "c")).unwrap();
        leaf.insert(&tuple(8, "d")).unwrap();
        leaf.erase(3).unwrap();

        let items = leaf.as_ref().compact().unwrap();
        let keys: Vec<i64> = items.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![5, 8]);
        assert_eq!(items[0].1, tuple(5, "c"));
    }

    #[test]
    fn full_page_insert_returns_false_and_leaves_page_intact() {
        let schema = schema();
        let mut page = vec![0u8; 256];
        let mut leaf = LeafNodeMut::init(&mut page, &schema, 0, 1, INVALID_NODE_ID, false).unwrap();

        let mut key = 0i64;
        while leaf.insert(&tuple(key, "filler")).unwrap() {
            key += 1;
        }
        assert!(key > 0);

        let slots_before = leaf.slot_count();
        let heap_before = leaf.header().heap_end();
        assert!(!leaf.insert(&tuple(key, "filler")).unwrap());
        assert_eq!(leaf.slot_count(), slots_before);
        assert_eq!(leaf.header().heap_end(), heap_before);

        // Every accepted key is still served.
        for k in 0..key {
            assert!(leaf.get(k).unwrap().is_some(), "lost key {}", k);
        }
    }

    #[test]
    fn update_keeps_live_count() {
        let schema = schema();
        let mut page = vec![0u8; PAGE];
        let mut leaf = make_leaf(&mut page, &schema);

        leaf.insert(&tuple(1, "a")).unwrap();
        assert!(leaf.update(&tuple(1, "a2")).unwrap());

        assert_eq!(leaf.live_count(), 1);
        assert_eq!(leaf.get(1).unwrap(), Some(tuple(1, "a2")));
    }

    #[test]
    fn sort_on_split_keeps_three_quarters_and_marks_both_sorted() {
        let schema = schema();
        let mut page = vec![0u8; PAGE];
        let mut right_page = vec![0u8; PAGE];
        let mut leaf = make_leaf(&mut page, &schema);

        for key in (0..8).rev() {
            leaf.insert(&tuple(key, "v")).unwrap();
        }

        let mut right =
            LeafNodeMut::init(&mut right_page, &schema, 0, 2, INVALID_NODE_ID, false).unwrap();
        let split_key = leaf
            .split_into(&mut right, SplitPolicy::SortOnSplit, 4)
            .unwrap();

        assert_eq!(split_key, 6);
        assert_eq!(leaf.live_count(), 6);
        assert_eq!(right.live_count(), 2);
        assert!(leaf.is_sorted());
        assert!(right.is_sorted());
        assert_eq!(split_key, right.min_key());
        assert_eq!(leaf.next_id(), Some(2));
        assert_eq!(right.next_id(), None);
    }

    #[test]
    fn quick_partition_splits_by_pivot_without_sorting() {
        let schema = schema();
        let mut page = vec![0u8; PAGE];
        let mut right_page = vec![0u8; PAGE];
        let mut leaf = make_leaf(&mut page, &schema);

        for key in [3, 9, 1, 7, 5, 11, 13, 15] {
            leaf.insert(&tuple(key, "v")).unwrap();
        }

        let mut right =
            LeafNodeMut::init(&mut right_page, &schema, 0, 2, INVALID_NODE_ID, false).unwrap();
        let split_key = leaf
            .split_into(&mut right, SplitPolicy::QuickPartition, 4)
            .unwrap();

        // 75th-percentile key of {1,3,5,7,9,11,13,15}.
        assert_eq!(split_key, 13);
        assert!(!leaf.is_sorted());
        assert!(!right.is_sorted());
        assert!(leaf.max_key() < split_key);
        assert!(right.min_key() >= split_key);
        assert_eq!(leaf.live_count() + right.live_count(), 8);
    }

    #[test]
    fn split_preserves_the_live_multiset() {
        let schema = schema();
        let mut page = vec![0u8; PAGE];
        let mut right_page = vec![0u8; PAGE];
        let mut leaf = make_leaf(&mut page, &schema);

        for key in [10, 2, 8, 4, 6, 12] {
            leaf.insert(&tuple(key, "v")).unwrap();
        }
        leaf.erase(4).unwrap();

        let mut right =
            LeafNodeMut::init(&mut right_page, &schema, 0, 2, INVALID_NODE_ID, false).unwrap();
        leaf.split_into(&mut right, SplitPolicy::SortOnSplit, 4)
            .unwrap();

        let mut keys: Vec<i64> = Vec::new();
        for (k, _) in leaf.as_ref().compact().unwrap() {
            keys.push(k);
        }
        for (k, _) in right.as_ref().compact().unwrap() {
            keys.push(k);
        }
        keys.sort_unstable();
        assert_eq!(keys, vec![2, 6, 8, 10, 12]);
    }
}
