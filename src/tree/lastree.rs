//! # LaS Tree Engine
//!
//! A B+ tree tuned for near-sorted insertion streams. Two ideas carry the
//! design:
//!
//! 1. **Fast-path hint.** The engine remembers the currently hot leaf and
//!    the key range it owns. An insert whose key falls inside the hint
//!    skips the root-to-leaf descent entirely and appends to the hot leaf
//!    in O(1). Sequential loads hit this path for all but one insert per
//!    leaf.
//! 2. **Lazy-sort leaves.** The hot leaf appends without maintaining key
//!    order. When the hint moves on, the displaced leaf id goes onto a
//!    cold queue and a background thread sorts it in place, restoring
//!    O(log n) point reads without ever blocking the insert path for a
//!    sort.
//!
//! ## Hint Maintenance
//!
//! An out-of-range insert lands via normal descent. If its key extends the
//! hinted run by exactly one (the inserted key is the successor of the
//! hint's right bound), the hint follows it immediately. Otherwise a
//! soft-failure counter ticks; after `max_soft_fails` misses the hint is
//! hard-reset to the last written leaf. Either way the displaced leaf is
//! queued for the background sorter.
//!
//! ## Structure Changes
//!
//! Leaf contents are guarded by per-leaf RwLocks. Structural changes —
//! leaf splits, internal-node splits, root growth — serialize on a
//! tree-wide structure lock held exclusively, while descents hold it
//! shared. A writer that finds its leaf full drops its shared guard,
//! re-acquires exclusively, re-descends (the world may have changed), and
//! only then splits. The root page never changes identity: growing the
//! tree copies the old root into a fresh left child and rewrites the root
//! in place.
//!
//! ## Shutdown
//!
//! Dropping the tree stops the sorter (it drains what is already queued),
//! joins it, and flushes the tree's file through the buffer pool.

use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use eyre::{bail, ensure, Result};
use hashbrown::HashSet;
use parking_lot::{Condvar, Mutex, RwLock};
use smallvec::SmallVec;
use std::collections::VecDeque;

use crate::config::TreeOptions;
use crate::database::Database;
use crate::key::Key;
use crate::record::{Schema, Tuple, Value};
use crate::storage::PageId;
use crate::tree::internal::{internal_capacity, InternalNode, InternalNodeMut};
use crate::tree::leaf::{
    extract_key, leaf_available_space, LeafNode, LeafNodeMut, SLOT_SIZE,
};
use crate::tree::{NodeKind, INVALID_NODE_ID, NODE_KIND_OFFSET};

/// The head leaf always lives in page 0 of the tree's file.
const HEAD_PAGE_NO: u32 = 0;
/// The root always lives in page 1 and keeps that identity for the tree's
/// lifetime; growth copies it aside instead of moving it.
const ROOT_PAGE_NO: u32 = 1;

type DescentPath = SmallVec<[u32; 8]>;

/// Chain-walk statistics for the observability surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeafStats {
    pub leaf_count: usize,
    /// used bytes / available bytes across all leaves.
    pub utilization: f64,
}

/// One leaf's state as seen while walking the sibling chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafInfo<K: Key> {
    pub id: u32,
    pub live_count: usize,
    pub sorted: bool,
    pub min_key: Option<K>,
    pub max_key: Option<K>,
    pub used_space: usize,
}

struct FastPath<K: Key> {
    leaf_id: u32,
    min: K,
    max: K,
    soft_fails: u32,
}

impl<K: Key> FastPath<K> {
    fn covers(&self, key: K) -> bool {
        self.min <= key && key < self.max
    }
}

struct ColdQueue {
    queue: VecDeque<u32>,
    enqueued: HashSet<u32>,
    stop: bool,
}

struct Descent<K: Key> {
    leaf_id: u32,
    /// Separator immediately right of the chosen child at the deepest
    /// level that had one; `None` means the leaf is rightmost everywhere.
    next_leaf_min: Option<K>,
    path: DescentPath,
}

struct TreeInner<K: Key> {
    db: Arc<Database>,
    file: u32,
    schema: Schema,
    key_index: usize,
    options: TreeOptions,
    page_size: usize,

    root_id: u32,
    head_id: u32,
    next_page_no: AtomicU32,

    structure: RwLock<()>,
    fast: Mutex<FastPath<K>>,
    leaf_locks: Mutex<hashbrown::HashMap<u32, Arc<RwLock<()>>>>,
    cold: Mutex<ColdQueue>,
    cold_cv: Condvar,

    len: AtomicUsize,
    height: AtomicUsize,
    fast_path_hits: AtomicU64,
    sorted_leaf_searches: AtomicU64,
    background_sorts: AtomicU64,
}

/// Disk-backed ordered index over tuples keyed by field `key_index`.
pub struct LasTree<K: Key> {
    inner: Arc<TreeInner<K>>,
    sorter: Option<JoinHandle<()>>,
}

impl<K: Key> LasTree<K> {
    /// Creates a fresh tree in the file at `path`, registered with `db`.
    pub fn create(
        db: Arc<Database>,
        path: impl AsRef<Path>,
        schema: Schema,
        key_index: usize,
        options: TreeOptions,
    ) -> Result<Self> {
        let inner = Self::build_inner(db, path, schema, key_index, options)?;
        inner.next_page_no.store(2, Ordering::Relaxed);

        {
            let mut head_page = inner.db.pool().get_mut(inner.pid(inner.head_id))?;
            LeafNodeMut::<K>::init(
                head_page.data_mut(),
                &inner.schema,
                inner.key_index,
                inner.head_id,
                INVALID_NODE_ID,
                false,
            )?;
        }
        {
            let mut root_page = inner.db.pool().get_mut(inner.pid(inner.root_id))?;
            let mut root = InternalNodeMut::<K>::init(root_page.data_mut(), inner.root_id)?;
            root.set_child(0, inner.head_id);
        }

        {
            let mut fast = inner.fast.lock();
            fast.leaf_id = inner.head_id;
            fast.min = K::MIN;
            fast.max = K::MAX;
        }

        Self::start(inner)
    }

    /// Re-opens a tree persisted by an earlier run. The page counter comes
    /// from the file length; head and root are at their fixed pages.
    pub fn open(
        db: Arc<Database>,
        path: impl AsRef<Path>,
        schema: Schema,
        key_index: usize,
        options: TreeOptions,
    ) -> Result<Self> {
        let display = path.as_ref().display().to_string();
        let inner = Self::build_inner(db, path, schema, key_index, options)?;

        let page_count = inner.db.files().get(inner.file)?.page_count()?;
        ensure!(
            page_count >= 2,
            "{} does not contain an initialized tree ({} pages)",
            display,
            page_count
        );
        inner.next_page_no.store(page_count, Ordering::Relaxed);

        // Recompute the derived metadata by walking the leftmost spine and
        // the leaf chain.
        let mut height = 0usize;
        let mut node_id = inner.root_id;
        loop {
            let guard = inner.db.pool().get_mut(inner.pid(node_id))?;
            let data = guard.data();
            match NodeKind::from_byte(data[NODE_KIND_OFFSET]) {
                Some(NodeKind::Leaf) => break,
                Some(NodeKind::Internal) => {
                    height += 1;
                    node_id = InternalNode::<K>::from_page(data)?.child_at(0);
                }
                None => bail!("unexpected page content at node {}", node_id),
            }
        }
        ensure!(
            height >= 1,
            "{} is not a tree file: root page holds no internal node",
            display
        );
        inner.height.store(height, Ordering::Relaxed);

        let mut live = 0usize;
        for info in inner.leaves()? {
            live += info.live_count;
        }
        inner.len.store(live, Ordering::Relaxed);

        // Empty hint range: the first inserts repair it through the normal
        // soft/hard update rules.
        {
            let mut fast = inner.fast.lock();
            fast.leaf_id = inner.head_id;
            fast.min = K::MAX;
            fast.max = K::MIN;
        }

        Self::start(inner)
    }

    fn build_inner(
        db: Arc<Database>,
        path: impl AsRef<Path>,
        schema: Schema,
        key_index: usize,
        options: TreeOptions,
    ) -> Result<Arc<TreeInner<K>>> {
        options.validate()?;
        let page_size = db.page_size();
        ensure!(
            key_index < schema.field_count(),
            "key index {} out of range for a schema with {} fields",
            key_index,
            schema.field_count()
        );
        ensure!(
            leaf_available_space::<K>(page_size) >= 4 * (SLOT_SIZE + 1 + K::ENCODED_LEN),
            "page size {} leaves no usable leaf space for {}-byte keys",
            page_size,
            K::ENCODED_LEN
        );
        ensure!(
            internal_capacity::<K>(page_size) >= 3,
            "page size {} holds fewer than 3 separators of {} bytes",
            page_size,
            K::ENCODED_LEN
        );

        let file = db.register_file(path)?;
        Ok(Arc::new(TreeInner {
            db,
            file,
            schema,
            key_index,
            options,
            page_size,
            root_id: ROOT_PAGE_NO,
            head_id: HEAD_PAGE_NO,
            next_page_no: AtomicU32::new(2),
            structure: RwLock::new(()),
            fast: Mutex::new(FastPath {
                leaf_id: HEAD_PAGE_NO,
                min: K::MAX,
                max: K::MIN,
                soft_fails: 0,
            }),
            leaf_locks: Mutex::new(hashbrown::HashMap::new()),
            cold: Mutex::new(ColdQueue {
                queue: VecDeque::new(),
                enqueued: HashSet::new(),
                stop: false,
            }),
            cold_cv: Condvar::new(),
            len: AtomicUsize::new(0),
            height: AtomicUsize::new(1),
            fast_path_hits: AtomicU64::new(0),
            sorted_leaf_searches: AtomicU64::new(0),
            background_sorts: AtomicU64::new(0),
        }))
    }

    fn start(inner: Arc<TreeInner<K>>) -> Result<Self> {
        let worker_inner = Arc::clone(&inner);
        let sorter = thread::Builder::new()
            .name("lastree-sorter".into())
            .spawn(move || sort_worker(worker_inner))?;
        Ok(Self {
            inner,
            sorter: Some(sorter),
        })
    }

    pub fn insert(&self, tuple: &Tuple) -> Result<()> {
        let key = extract_key::<K>(tuple, self.inner.key_index)?;
        if self.inner.try_fast_insert(key, tuple)? {
            return Ok(());
        }
        self.inner.insert_slow(key, tuple)
    }

    pub fn get(&self, key: K) -> Result<Option<Tuple>> {
        self.inner.get(key)
    }

    /// Whether `key` is currently visible.
    pub fn contains(&self, key: K) -> Result<bool> {
        Ok(self.inner.get(key)?.is_some())
    }

    /// Live tuples with keys in `[lo, hi]`, ascending.
    pub fn range(&self, lo: K, hi: K) -> Result<Vec<Tuple>> {
        self.inner.range(lo, hi)
    }

    /// Applies `(field index, new value)` pairs to the tuple stored under
    /// `key`. Returns `false` when the key is absent.
    pub fn update(&self, key: K, updates: &[(usize, Value)]) -> Result<bool> {
        self.inner.update(key, updates)
    }

    /// Logically deletes `key` by appending a tombstone. Returns `false`
    /// when the key is absent.
    pub fn erase(&self, key: K) -> Result<bool> {
        self.inner.erase(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Internal levels between root and leaves.
    pub fn height(&self) -> usize {
        self.inner.height.load(Ordering::Relaxed)
    }

    pub fn fast_path_hits(&self) -> u64 {
        self.inner.fast_path_hits.load(Ordering::Relaxed)
    }

    pub fn sorted_leaf_searches(&self) -> u64 {
        self.inner.sorted_leaf_searches.load(Ordering::Relaxed)
    }

    pub fn background_sorts(&self) -> u64 {
        self.inner.background_sorts.load(Ordering::Relaxed)
    }

    /// Walks the sibling chain and reports leaf count and byte
    /// utilization.
    pub fn leaf_stats(&self) -> Result<LeafStats> {
        let leaves = self.inner.leaves()?;
        let available = leaf_available_space::<K>(self.inner.page_size) * leaves.len();
        let used: usize = leaves.iter().map(|info| info.used_space).sum();
        Ok(LeafStats {
            leaf_count: leaves.len(),
            utilization: if available > 0 {
                used as f64 / available as f64
            } else {
                0.0
            },
        })
    }

    /// Snapshot of every leaf in chain order.
    pub fn leaves(&self) -> Result<Vec<LeafInfo<K>>> {
        self.inner.leaves()
    }

    /// Blocks until the cold queue is drained and the sorter is idle.
    pub fn wait_for_sorter(&self) {
        loop {
            {
                let cold = self.inner.cold.lock();
                if cold.queue.is_empty() && cold.enqueued.is_empty() {
                    return;
                }
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl<K: Key> Drop for LasTree<K> {
    fn drop(&mut self) {
        {
            let mut cold = self.inner.cold.lock();
            cold.stop = true;
        }
        self.inner.cold_cv.notify_all();
        if let Some(handle) = self.sorter.take() {
            if handle.join().is_err() {
                tracing::debug!("background sorter panicked");
            }
        }
        if let Err(e) = self.inner.db.pool().flush_file(self.inner.file) {
            tracing::debug!(error = %e, "flush on tree teardown failed");
        }
    }
}

impl<K: Key> TreeInner<K> {
    fn pid(&self, page_no: u32) -> PageId {
        PageId::new(self.file, page_no)
    }

    fn leaf_lock(&self, leaf_id: u32) -> Arc<RwLock<()>> {
        self.leaf_locks
            .lock()
            .entry(leaf_id)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    fn enqueue_cold(&self, leaf_id: u32) {
        let mut cold = self.cold.lock();
        if cold.enqueued.insert(leaf_id) {
            cold.queue.push_back(leaf_id);
            tracing::trace!(leaf = leaf_id, "queued displaced leaf for background sort");
            self.cold_cv.notify_one();
        }
    }

    /// Root-to-leaf descent, recording the path and the closest separator
    /// right of the descent. Pins one page at a time.
    fn locate(&self, key: K) -> Result<Descent<K>> {
        let mut path = DescentPath::new();
        let mut next_leaf_min = None;
        let mut node_id = self.root_id;

        loop {
            let guard = self.db.pool().get_mut(self.pid(node_id))?;
            let data = guard.data();
            match NodeKind::from_byte(data[NODE_KIND_OFFSET]) {
                Some(NodeKind::Leaf) => break,
                Some(NodeKind::Internal) => {
                    let node = InternalNode::<K>::from_page(data)?;
                    path.push(node_id);
                    let slot = node.child_slot(key);
                    if slot < node.key_count() {
                        next_leaf_min = Some(node.key_at(slot));
                    }
                    node_id = node.child_at(slot);
                }
                None => bail!("unexpected page content at node {}", node_id),
            }
        }

        Ok(Descent {
            leaf_id: node_id,
            next_leaf_min,
            path,
        })
    }

    fn try_fast_insert(&self, key: K, tuple: &Tuple) -> Result<bool> {
        let hinted = {
            let fast = self.fast.lock();
            fast.covers(key).then_some(fast.leaf_id)
        };
        let Some(leaf_id) = hinted else {
            return Ok(false);
        };

        let lock = self.leaf_lock(leaf_id);
        let _leaf_guard = lock.write();

        // Re-validate under the leaf lock: a concurrent split may have
        // retargeted or narrowed the hint while we waited, and appending
        // here would then file the key in the wrong leaf.
        {
            let fast = self.fast.lock();
            if fast.leaf_id != leaf_id || !fast.covers(key) {
                return Ok(false);
            }
        }

        let mut page = self.db.pool().get_mut(self.pid(leaf_id))?;
        let mut leaf = LeafNodeMut::<K>::from_page(page.data_mut(), &self.schema, self.key_index)?;
        if leaf.insert(tuple)? {
            self.fast_path_hits.fetch_add(1, Ordering::Relaxed);
            self.len.fetch_add(1, Ordering::Relaxed);
            return Ok(true);
        }
        // Full page: the slow path re-descends and splits.
        Ok(false)
    }

    fn insert_slow(&self, key: K, tuple: &Tuple) -> Result<()> {
        {
            let _descent = self.structure.read();
            let descent = self.locate(key)?;
            let lock = self.leaf_lock(descent.leaf_id);
            let _leaf_guard = lock.write();

            let mut page = self.db.pool().get_mut(self.pid(descent.leaf_id))?;
            let mut leaf =
                LeafNodeMut::<K>::from_page(page.data_mut(), &self.schema, self.key_index)?;
            if leaf.insert(tuple)? {
                let leaf_min = leaf.min_key();
                let leaf_next = leaf.next_id();
                drop(leaf);
                drop(page);
                self.len.fetch_add(1, Ordering::Relaxed);
                self.note_out_of_range_insert(
                    descent.leaf_id,
                    key,
                    leaf_min,
                    leaf_next,
                    descent.next_leaf_min,
                );
                return Ok(());
            }
        }
        self.split_insert(key, tuple)
    }

    /// Soft/hard fast-path maintenance after a successful out-of-hint
    /// insert.
    fn note_out_of_range_insert(
        &self,
        leaf_id: u32,
        key: K,
        leaf_min: K,
        leaf_next: Option<u32>,
        next_leaf_min: Option<K>,
    ) {
        let displaced = {
            let mut fast = self.fast.lock();
            let original = fast.leaf_id;
            let extends_run = fast.max.successor() == Some(key);
            let retarget = if extends_run {
                fast.soft_fails = 0;
                true
            } else {
                fast.soft_fails += 1;
                if fast.soft_fails >= self.options.max_soft_fails {
                    fast.soft_fails = 0;
                    true
                } else {
                    false
                }
            };
            if retarget {
                fast.leaf_id = leaf_id;
                fast.min = leaf_min;
                fast.max = match (leaf_next, next_leaf_min) {
                    (None, _) | (Some(_), None) => K::MAX,
                    (Some(_), Some(min)) => min.predecessor().unwrap_or(K::MIN),
                };
                (original != leaf_id).then_some(original)
            } else {
                None
            }
        };
        if let Some(id) = displaced {
            self.enqueue_cold(id);
        }
    }

    /// The split path: exclusive structure lock, fresh descent, split, and
    /// separator propagation. The tuple lands in whichever half owns its
    /// key, and the fast path follows it.
    fn split_insert(&self, key: K, tuple: &Tuple) -> Result<()> {
        let _structure = self.structure.write();
        let descent = self.locate(key)?;
        let leaf_id = descent.leaf_id;

        let lock = self.leaf_lock(leaf_id);
        let _leaf_guard = lock.write();
        let mut page = self.db.pool().get_mut(self.pid(leaf_id))?;
        let mut leaf = LeafNodeMut::<K>::from_page(page.data_mut(), &self.schema, self.key_index)?;

        // Space may have appeared while we waited for the structure lock.
        if leaf.insert(tuple)? {
            let leaf_min = leaf.min_key();
            let leaf_next = leaf.next_id();
            drop(leaf);
            drop(page);
            self.len.fetch_add(1, Ordering::Relaxed);
            self.note_out_of_range_insert(leaf_id, key, leaf_min, leaf_next, descent.next_leaf_min);
            return Ok(());
        }

        let new_leaf_id = self.next_page_no.fetch_add(1, Ordering::Relaxed);
        let new_lock = self.leaf_lock(new_leaf_id);
        let _new_leaf_guard = new_lock.write();
        let mut new_page = self.db.pool().get_mut(self.pid(new_leaf_id))?;
        let mut new_leaf = LeafNodeMut::<K>::init(
            new_page.data_mut(),
            &self.schema,
            self.key_index,
            new_leaf_id,
            INVALID_NODE_ID,
            false,
        )?;

        let split_key =
            leaf.split_into(&mut new_leaf, self.options.split_policy, self.options.split_percentage)?;
        tracing::debug!(leaf = leaf_id, new_leaf = new_leaf_id, "split full leaf");

        let (target_id, target_min, target_max) = if key < split_key {
            ensure!(
                leaf.insert(tuple)?,
                "leaf {} rejected its key right after splitting",
                leaf_id
            );
            (
                leaf_id,
                leaf.min_key(),
                split_key.predecessor().unwrap_or(K::MIN),
            )
        } else {
            ensure!(
                new_leaf.insert(tuple)?,
                "leaf {} rejected its key right after splitting",
                new_leaf_id
            );
            let max = match (new_leaf.next_id(), descent.next_leaf_min) {
                (None, _) | (Some(_), None) => K::MAX,
                (Some(_), Some(min)) => min.predecessor().unwrap_or(K::MIN),
            };
            (new_leaf_id, split_key, max)
        };
        drop(new_leaf);
        drop(new_page);
        drop(leaf);
        drop(page);
        self.len.fetch_add(1, Ordering::Relaxed);

        let displaced = {
            let mut fast = self.fast.lock();
            let original = fast.leaf_id;
            fast.leaf_id = target_id;
            fast.min = target_min;
            fast.max = target_max;
            (original != target_id).then_some(original)
        };
        if let Some(id) = displaced {
            self.enqueue_cold(id);
        }

        self.internal_insert(&descent.path, split_key, new_leaf_id)
    }

    /// Splits the leaf owning `key` without inserting anything; used when
    /// an update or erase needs room for its append. Caller does not hold
    /// the structure lock.
    fn split_leaf_for(&self, key: K) -> Result<()> {
        let _structure = self.structure.write();
        let descent = self.locate(key)?;
        let leaf_id = descent.leaf_id;

        let lock = self.leaf_lock(leaf_id);
        let _leaf_guard = lock.write();
        let mut page = self.db.pool().get_mut(self.pid(leaf_id))?;
        let mut leaf = LeafNodeMut::<K>::from_page(page.data_mut(), &self.schema, self.key_index)?;

        if leaf.as_ref().compact()?.len() < 2 {
            bail!("leaf {} is full but cannot be split", leaf_id);
        }

        let new_leaf_id = self.next_page_no.fetch_add(1, Ordering::Relaxed);
        let new_lock = self.leaf_lock(new_leaf_id);
        let _new_leaf_guard = new_lock.write();
        let mut new_page = self.db.pool().get_mut(self.pid(new_leaf_id))?;
        let mut new_leaf = LeafNodeMut::<K>::init(
            new_page.data_mut(),
            &self.schema,
            self.key_index,
            new_leaf_id,
            INVALID_NODE_ID,
            false,
        )?;

        let split_key =
            leaf.split_into(&mut new_leaf, self.options.split_policy, self.options.split_percentage)?;
        let left_min = leaf.min_key();
        drop(new_leaf);
        drop(new_page);
        drop(leaf);
        drop(page);

        // The split leaf's range narrowed; a hint still pointing at it
        // must narrow too or the fast path would file keys in the wrong
        // leaf.
        {
            let mut fast = self.fast.lock();
            if fast.leaf_id == leaf_id {
                fast.min = left_min;
                fast.max = split_key.predecessor().unwrap_or(K::MIN);
            }
        }

        self.internal_insert(&descent.path, split_key, new_leaf_id)
    }

    /// Walks the recorded path upward, inserting the separator and
    /// splitting full internal nodes at the median, growing a new root if
    /// the path is exhausted.
    fn internal_insert(&self, path: &[u32], key: K, child: u32) -> Result<()> {
        let mut key = key;
        let mut child = child;
        let capacity = internal_capacity::<K>(self.page_size);
        let split_pos = capacity / 2;

        for &node_id in path.iter().rev() {
            let mut page = self.db.pool().get_mut(self.pid(node_id))?;
            let mut node = InternalNodeMut::<K>::from_page(page.data_mut())?;
            let index = node.child_slot(key);

            if node.key_count() < capacity {
                node.insert_at(index, key, child)?;
                return Ok(());
            }

            let mut keys = node.as_ref().keys_vec();
            let mut children = node.as_ref().children_vec();
            keys.insert(index, key);
            children.insert(index + 1, child);

            let promoted = keys[split_pos];
            let new_node_id = self.next_page_no.fetch_add(1, Ordering::Relaxed);

            node.rewrite(&keys[..split_pos], &children[..=split_pos])?;
            drop(node);
            drop(page);

            let mut new_page = self.db.pool().get_mut(self.pid(new_node_id))?;
            let mut new_node = InternalNodeMut::<K>::init(new_page.data_mut(), new_node_id)?;
            new_node.rewrite(&keys[split_pos + 1..], &children[split_pos + 1..])?;
            drop(new_node);
            drop(new_page);
            tracing::debug!(node = node_id, new_node = new_node_id, "split internal node");

            key = promoted;
            child = new_node_id;
        }

        self.create_new_root(key, child)
    }

    /// Copies the current root into a fresh left child, then rewrites the
    /// root in place with one separator and two children.
    fn create_new_root(&self, key: K, right_child: u32) -> Result<()> {
        let left_child_id = self.next_page_no.fetch_add(1, Ordering::Relaxed);

        let mut root_page = self.db.pool().get_mut(self.pid(self.root_id))?;
        let (keys, children) = {
            let view = InternalNode::<K>::from_page(root_page.data())?;
            (view.keys_vec(), view.children_vec())
        };

        {
            let mut left_page = self.db.pool().get_mut(self.pid(left_child_id))?;
            let mut left = InternalNodeMut::<K>::init(left_page.data_mut(), left_child_id)?;
            left.rewrite(&keys, &children)?;
        }

        let mut root = InternalNodeMut::<K>::from_page(root_page.data_mut())?;
        root.rewrite(&[key], &[left_child_id, right_child])?;
        self.height.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            left = left_child_id,
            right = right_child,
            "grew the tree with a new root level"
        );
        Ok(())
    }

    fn get(&self, key: K) -> Result<Option<Tuple>> {
        let _descent = self.structure.read();
        let leaf_id = self.locate(key)?.leaf_id;

        let lock = self.leaf_lock(leaf_id);
        let _leaf_guard = lock.read();
        let page = self.db.pool().get_mut(self.pid(leaf_id))?;
        let leaf = LeafNode::<K>::from_page(page.data(), &self.schema, self.key_index)?;
        if leaf.is_sorted() {
            self.sorted_leaf_searches.fetch_add(1, Ordering::Relaxed);
        }
        leaf.get(key)
    }

    fn range(&self, lo: K, hi: K) -> Result<Vec<Tuple>> {
        let mut current = {
            let _descent = self.structure.read();
            Some(self.locate(lo)?.leaf_id)
        };

        let mut result = Vec::new();
        while let Some(leaf_id) = current {
            let lock = self.leaf_lock(leaf_id);
            let _leaf_guard = lock.read();
            let page = self.db.pool().get_mut(self.pid(leaf_id))?;
            let leaf = LeafNode::<K>::from_page(page.data(), &self.schema, self.key_index)?;

            let part = leaf.get_range(lo, hi)?;
            let past_range = part.is_empty() && leaf.live_count() > 0 && leaf.min_key() > hi;
            let next = leaf.next_id();
            result.extend(part);
            if past_range {
                break;
            }
            current = next;
        }
        Ok(result)
    }

    fn update(&self, key: K, updates: &[(usize, Value)]) -> Result<bool> {
        for _ in 0..2 {
            let appended = {
                let _descent = self.structure.read();
                let leaf_id = self.locate(key)?.leaf_id;
                let lock = self.leaf_lock(leaf_id);
                let _leaf_guard = lock.write();
                let mut page = self.db.pool().get_mut(self.pid(leaf_id))?;
                let mut leaf =
                    LeafNodeMut::<K>::from_page(page.data_mut(), &self.schema, self.key_index)?;

                let Some(mut tuple) = leaf.get(key)? else {
                    return Ok(false);
                };
                for (index, value) in updates {
                    tuple.set_field(*index, value.clone())?;
                }
                ensure!(
                    extract_key::<K>(&tuple, self.key_index)? == key,
                    "update of key {:?} must not change the key field",
                    key
                );
                leaf.update(&tuple)?
            };
            if appended {
                return Ok(true);
            }
            // Full page: make room, then retry once.
            self.split_leaf_for(key)?;
        }
        bail!("update of key {:?} found no space even after a split", key)
    }

    fn erase(&self, key: K) -> Result<bool> {
        for _ in 0..2 {
            let appended = {
                let _descent = self.structure.read();
                let leaf_id = self.locate(key)?.leaf_id;
                let lock = self.leaf_lock(leaf_id);
                let _leaf_guard = lock.write();
                let mut page = self.db.pool().get_mut(self.pid(leaf_id))?;
                let mut leaf =
                    LeafNodeMut::<K>::from_page(page.data_mut(), &self.schema, self.key_index)?;

                if leaf.get(key)?.is_none() {
                    return Ok(false);
                }
                leaf.erase(key)?
            };
            if appended {
                self.len.fetch_sub(1, Ordering::Relaxed);
                return Ok(true);
            }
            self.split_leaf_for(key)?;
        }
        bail!("erase of key {:?} found no space even after a split", key)
    }

    fn leaves(&self) -> Result<Vec<LeafInfo<K>>> {
        let mut out = Vec::new();
        let mut current = Some(self.head_id);
        while let Some(leaf_id) = current {
            let lock = self.leaf_lock(leaf_id);
            let _leaf_guard = lock.read();
            let page = self.db.pool().get_mut(self.pid(leaf_id))?;
            let leaf = LeafNode::<K>::from_page(page.data(), &self.schema, self.key_index)?;
            out.push(LeafInfo {
                id: leaf_id,
                live_count: leaf.live_count(),
                sorted: leaf.is_sorted(),
                min_key: (leaf.live_count() > 0).then(|| leaf.min_key()),
                max_key: (leaf.live_count() > 0).then(|| leaf.max_key()),
                used_space: leaf.used_space(),
            });
            current = leaf.next_id();
        }
        Ok(out)
    }

    fn sort_leaf(&self, leaf_id: u32) -> Result<()> {
        let mut page = self.db.pool().get_mut(self.pid(leaf_id))?;
        let mut leaf = LeafNodeMut::<K>::from_page(page.data_mut(), &self.schema, self.key_index)?;
        if !leaf.is_sorted() {
            leaf.set_cold(true);
            leaf.sort()?;
            self.background_sorts.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(leaf = leaf_id, "sorted cold leaf in the background");
        }
        Ok(())
    }
}

/// Background worker: waits for displaced leaf ids and sorts them under
/// the same per-leaf locks foreground writers use. Keeps draining after
/// stop is set until the queue is empty.
fn sort_worker<K: Key>(inner: Arc<TreeInner<K>>) {
    loop {
        let leaf_id = {
            let mut cold = inner.cold.lock();
            loop {
                if let Some(id) = cold.queue.pop_front() {
                    break id;
                }
                if cold.stop {
                    return;
                }
                inner.cold_cv.wait(&mut cold);
            }
        };

        {
            let lock = inner.leaf_lock(leaf_id);
            let _leaf_guard = lock.write();
            if let Err(e) = inner.sort_leaf(leaf_id) {
                tracing::debug!(leaf = leaf_id, error = %e, "background sort failed");
            }
        }

        let mut cold = inner.cold.lock();
        cold.enqueued.remove(&leaf_id);
    }
}
