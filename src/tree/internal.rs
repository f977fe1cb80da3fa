//! # Internal Node
//!
//! Separator keys and child page ids in two fixed-capacity regions over the
//! page bytes. Key `i` partitions its neighbours the usual way: child `i`
//! holds keys strictly below `keys[i]`, the last child holds everything at
//! or above the last key.
//!
//! ## Page Layout
//!
//! ```text
//! Offset          Content
//! ------          -------
//! 0               node-kind discriminator (1 = internal)
//! 1               InternalHeader (8 bytes): id, key count
//! 9               keys region, capacity × K::ENCODED_LEN
//! 9 + cap·L       children region, (capacity + 1) × 4 bytes
//! ```
//!
//! Capacity is derived from the page size at runtime so one binary serves
//! any configured page granularity. In-place insertion shifts both regions
//! with `copy_within`; splits are driven by the tree engine, which reads
//! the arrays out, slices them around the median, and writes both halves
//! back.

use std::marker::PhantomData;

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::key::Key;
use crate::tree::{NodeKind, NODE_KIND_OFFSET};

pub const INTERNAL_HEADER_SIZE: usize = 8;
pub const CHILD_ID_SIZE: usize = 4;

const HEADER_OFFSET: usize = NODE_KIND_OFFSET + 1;
const KEYS_OFFSET: usize = HEADER_OFFSET + INTERNAL_HEADER_SIZE;

/// Separator keys one internal page can hold for key type `K`.
pub fn internal_capacity<K: Key>(page_size: usize) -> usize {
    (page_size - KEYS_OFFSET - CHILD_ID_SIZE) / (K::ENCODED_LEN + CHILD_ID_SIZE)
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct InternalHeader {
    id: U32,
    key_count: U16,
    reserved: [u8; 2],
}

const _: () = assert!(std::mem::size_of::<InternalHeader>() == INTERNAL_HEADER_SIZE);

/// Read-only view over an internal page.
#[derive(Debug)]
pub struct InternalNode<'a, K: Key> {
    data: &'a [u8],
    _key: PhantomData<K>,
}

/// Mutable view over an internal page.
pub struct InternalNodeMut<'a, K: Key> {
    data: &'a mut [u8],
    _key: PhantomData<K>,
}

impl<'a, K: Key> InternalNode<'a, K> {
    pub fn from_page(data: &'a [u8]) -> Result<Self> {
        ensure!(
            internal_capacity::<K>(data.len()) >= 1,
            "page of {} bytes too small for an internal node with {}-byte keys",
            data.len(),
            K::ENCODED_LEN
        );
        ensure!(
            NodeKind::from_byte(data[NODE_KIND_OFFSET]) == Some(NodeKind::Internal),
            "expected an internal page, found discriminator {:#04x}",
            data[NODE_KIND_OFFSET]
        );
        Ok(Self {
            data,
            _key: PhantomData,
        })
    }

    fn header(&self) -> &InternalHeader {
        InternalHeader::ref_from_bytes(
            &self.data[HEADER_OFFSET..HEADER_OFFSET + INTERNAL_HEADER_SIZE],
        )
        .expect("internal header validated at construction")
    }

    pub fn id(&self) -> u32 {
        self.header().id.get()
    }

    pub fn key_count(&self) -> usize {
        self.header().key_count.get() as usize
    }

    fn key_offset(&self, index: usize) -> usize {
        KEYS_OFFSET + index * K::ENCODED_LEN
    }

    fn child_offset(&self, index: usize) -> usize {
        KEYS_OFFSET + internal_capacity::<K>(self.data.len()) * K::ENCODED_LEN
            + index * CHILD_ID_SIZE
    }

    pub fn key_at(&self, index: usize) -> K {
        debug_assert!(index < self.key_count());
        K::decode(&self.data[self.key_offset(index)..])
    }

    pub fn child_at(&self, index: usize) -> u32 {
        debug_assert!(index <= self.key_count());
        let offset = self.child_offset(index);
        let mut b = [0u8; CHILD_ID_SIZE];
        b.copy_from_slice(&self.data[offset..offset + CHILD_ID_SIZE]);
        u32::from_le_bytes(b)
    }

    /// Index of the first key strictly greater than `key`; also the index
    /// of the child owning `key`.
    pub fn child_slot(&self, key: K) -> usize {
        let mut left = 0;
        let mut right = self.key_count();
        while left < right {
            let mid = left + (right - left) / 2;
            if self.key_at(mid) <= key {
                left = mid + 1;
            } else {
                right = mid;
            }
        }
        left
    }

    pub fn keys_vec(&self) -> Vec<K> {
        (0..self.key_count()).map(|i| self.key_at(i)).collect()
    }

    pub fn children_vec(&self) -> Vec<u32> {
        (0..=self.key_count()).map(|i| self.child_at(i)).collect()
    }
}

impl<'a, K: Key> InternalNodeMut<'a, K> {
    pub fn from_page(data: &'a mut [u8]) -> Result<Self> {
        ensure!(
            internal_capacity::<K>(data.len()) >= 1,
            "page of {} bytes too small for an internal node with {}-byte keys",
            data.len(),
            K::ENCODED_LEN
        );
        ensure!(
            NodeKind::from_byte(data[NODE_KIND_OFFSET]) == Some(NodeKind::Internal),
            "expected an internal page, found discriminator {:#04x}",
            data[NODE_KIND_OFFSET]
        );
        Ok(Self {
            data,
            _key: PhantomData,
        })
    }

    /// Formats `data` as an empty internal node.
    pub fn init(data: &'a mut [u8], id: u32) -> Result<Self> {
        ensure!(
            internal_capacity::<K>(data.len()) >= 3,
            "page of {} bytes holds fewer than 3 separators of {} bytes",
            data.len(),
            K::ENCODED_LEN
        );
        data[NODE_KIND_OFFSET] = NodeKind::Internal as u8;
        let header = InternalHeader {
            id: U32::new(id),
            key_count: U16::new(0),
            reserved: [0; 2],
        };
        data[HEADER_OFFSET..HEADER_OFFSET + INTERNAL_HEADER_SIZE]
            .copy_from_slice(header.as_bytes());
        Ok(Self {
            data,
            _key: PhantomData,
        })
    }

    pub fn as_ref(&self) -> InternalNode<'_, K> {
        InternalNode {
            data: self.data,
            _key: PhantomData,
        }
    }

    fn header_mut(&mut self) -> &mut InternalHeader {
        InternalHeader::mut_from_bytes(
            &mut self.data[HEADER_OFFSET..HEADER_OFFSET + INTERNAL_HEADER_SIZE],
        )
        .expect("internal header validated at construction")
    }

    pub fn id(&self) -> u32 {
        self.as_ref().id()
    }

    pub fn key_count(&self) -> usize {
        self.as_ref().key_count()
    }

    pub fn key_at(&self, index: usize) -> K {
        self.as_ref().key_at(index)
    }

    pub fn child_at(&self, index: usize) -> u32 {
        self.as_ref().child_at(index)
    }

    pub fn child_slot(&self, key: K) -> usize {
        self.as_ref().child_slot(key)
    }

    fn key_offset(&self, index: usize) -> usize {
        KEYS_OFFSET + index * K::ENCODED_LEN
    }

    fn child_offset(&self, index: usize) -> usize {
        KEYS_OFFSET + internal_capacity::<K>(self.data.len()) * K::ENCODED_LEN
            + index * CHILD_ID_SIZE
    }

    pub fn set_child(&mut self, index: usize, child: u32) {
        let offset = self.child_offset(index);
        self.data[offset..offset + CHILD_ID_SIZE].copy_from_slice(&child.to_le_bytes());
    }

    /// Opens slot `index`, placing `key` there and `child` to its right.
    /// The caller has already checked capacity via [`internal_capacity`].
    pub fn insert_at(&mut self, index: usize, key: K, child: u32) -> Result<()> {
        let count = self.key_count();
        let capacity = internal_capacity::<K>(self.data.len());
        ensure!(
            count < capacity,
            "internal node {} is full ({} separators)",
            self.id(),
            capacity
        );
        ensure!(
            index <= count,
            "separator index {} out of bounds (key_count={})",
            index,
            count
        );

        let key_src = self.key_offset(index);
        let key_end = self.key_offset(count);
        self.data.copy_within(key_src..key_end, key_src + K::ENCODED_LEN);
        key.encode(&mut self.data[key_src..]);

        let child_src = self.child_offset(index + 1);
        let child_end = self.child_offset(count + 1);
        self.data
            .copy_within(child_src..child_end, child_src + CHILD_ID_SIZE);
        self.set_child(index + 1, child);

        let header = self.header_mut();
        header.key_count = U16::new(header.key_count.get() + 1);
        Ok(())
    }

    /// Replaces the whole key/child content; used by splits and root
    /// copying.
    pub fn rewrite(&mut self, keys: &[K], children: &[u32]) -> Result<()> {
        let capacity = internal_capacity::<K>(self.data.len());
        ensure!(
            children.len() == keys.len() + 1,
            "internal node needs {} children for {} keys, got {}",
            keys.len() + 1,
            keys.len(),
            children.len()
        );
        ensure!(
            keys.len() <= capacity,
            "{} separators exceed node capacity {}",
            keys.len(),
            capacity
        );

        for (i, key) in keys.iter().enumerate() {
            let offset = self.key_offset(i);
            key.encode(&mut self.data[offset..]);
        }
        for (i, child) in children.iter().enumerate() {
            self.set_child(i, *child);
        }
        self.header_mut().key_count = U16::new(keys.len() as u16);
        Ok(())
    }
}
