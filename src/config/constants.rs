//! # Configuration Constants
//!
//! Centralizes the tunable constants of the engine. Values that depend on
//! each other are co-located so a change to one is checked against the
//! others.
//!
//! ## Dependency Graph
//!
//! ```text
//! DEFAULT_PAGE_SIZE (4096 bytes)
//!       │
//!       ├─> every page buffer, pool frame, and on-disk page uses this
//!       │   granularity
//!       │
//!       ├─> MIN_PAGE_SIZE (256) keeps room for a leaf header, one slot and
//!       │   one small record
//!       │
//!       └─> MAX_PAGE_SIZE (32768) caps it so slot offsets and the heap-end
//!           cursor fit in the u16 fields of the leaf header
//!
//! DEFAULT_POOL_SIZE (64 frames)
//!       │
//!       └─> an operation pins at most three pages at once (both halves of a
//!           leaf split plus an internal node), so even a tiny pool cannot
//!           self-deadlock
//!
//! DEFAULT_SPLIT_PERCENTAGE (4)
//!       │
//!       └─> a splitting leaf keeps (p-1)/p of its live tuples in place,
//!           i.e. 3/4 with the default
//!
//! DEFAULT_MAX_SOFT_FAILS (3)
//!       │
//!       └─> consecutive out-of-range inserts tolerated before the fast-path
//!           hint is hard-reset to the last written leaf
//! ```

pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const MIN_PAGE_SIZE: usize = 256;
pub const MAX_PAGE_SIZE: usize = 32768;

pub const DEFAULT_POOL_SIZE: usize = 64;

pub const DEFAULT_SPLIT_PERCENTAGE: usize = 4;
pub const DEFAULT_MAX_SOFT_FAILS: u32 = 3;
