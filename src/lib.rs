//! # lastree — Lazy-Sorted B+ Tree Storage Engine
//!
//! A disk-backed, single-key ordered index tuned for workloads whose keys
//! arrive in *near-sorted* order with bounded local disorder. The headline
//! mechanism is a **fast-path insertion hint** paired with **lazy-sort
//! leaves**: the currently hot leaf accepts appends in O(1) without
//! maintaining key order, and a background worker sorts it once the hint
//! moves on. Random workloads degrade gracefully to the usual O(log N)
//! descent.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use lastree::{Database, FieldType, LasTree, Schema, Tuple, TreeOptions, Value};
//!
//! let db = Arc::new(Database::new()?);
//! let schema = Schema::new(vec![FieldType::Long, FieldType::Text]);
//! let tree: LasTree<i64> =
//!     LasTree::create(Arc::clone(&db), "orders.idx", schema, 0, TreeOptions::default())?;
//!
//! tree.insert(&Tuple::new(vec![Value::Long(1), Value::Text("first".into())]))?;
//! let hit = tree.get(1)?;
//! let rows = tree.range(0, 100)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │        LasTree<K>  (tree engine)      │
//! │  fast-path hint · split cascade ·     │
//! │  cold queue · background sorter       │
//! ├──────────────────────────────────────┤
//! │  Leaf / Internal node page layouts    │
//! ├──────────────────────────────────────┤
//! │  BufferPool  (LRU · pins · dirty)     │
//! ├──────────────────────────────────────┤
//! │  PagedFile  (page-granular file I/O)  │
//! └──────────────────────────────────────┘
//! ```
//!
//! The [`Database`] context owns the buffer pool and the file registry;
//! trees are registered with it and resolve every page access through it.
//!
//! ## Module Overview
//!
//! - [`storage`]: paged file I/O and the buffer pool
//! - [`tree`]: node layouts and the tree engine
//! - [`record`]: the tuple codec consumed at the engine's boundary
//! - [`key`]: the ordered-key abstraction the tree is generic over
//! - [`config`]: options and defaults

pub mod config;
pub mod database;
pub mod key;
pub mod record;
pub mod storage;
pub mod tree;

pub use config::{DatabaseOptions, SplitPolicy, TreeOptions};
pub use database::Database;
pub use key::Key;
pub use record::{FieldType, Schema, Tuple, Value};
pub use tree::{LasTree, LeafInfo, LeafStats};
