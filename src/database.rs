//! # Database Context
//!
//! The context that trees are registered with. It owns the two shared
//! resources of the process: the open-file registry and the buffer pool in
//! front of it. Trees hold an `Arc<Database>` and resolve every page access
//! through it, so the context must outlive the trees — which the `Arc`
//! enforces — and tearing it down flushes whatever is still dirty (the
//! pool's drop).
//!
//! ```text
//! Database
//! ├── FileTable      path ↔ file-id registry, one PagedFile per tree
//! └── BufferPool     frames shared by every registered tree
//! ```

use std::path::Path;
use std::sync::Arc;

use eyre::Result;

use crate::config::DatabaseOptions;
use crate::storage::{BufferPool, FileTable};

#[derive(Debug)]
pub struct Database {
    files: Arc<FileTable>,
    pool: BufferPool,
    page_size: usize,
}

impl Database {
    pub fn new() -> Result<Self> {
        Self::with_options(DatabaseOptions::default())
    }

    pub fn with_options(options: DatabaseOptions) -> Result<Self> {
        options.validate()?;
        let files = Arc::new(FileTable::new(options.page_size));
        let pool = BufferPool::new(options.pool_size, options.page_size, Arc::clone(&files));
        Ok(Self {
            files,
            pool,
            page_size: options.page_size,
        })
    }

    /// Opens (or reuses) the file backing one tree and returns its id.
    pub fn register_file(&self, path: impl AsRef<Path>) -> Result<u32> {
        self.files.open(path)
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn files(&self) -> &FileTable {
        &self.files
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn register_file_is_idempotent_per_path() {
        let dir = tempdir().unwrap();
        let db = Database::new().unwrap();

        let a = db.register_file(dir.path().join("a.idx")).unwrap();
        let b = db.register_file(dir.path().join("a.idx")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn context_applies_configured_page_size() {
        let db = Database::with_options(DatabaseOptions {
            page_size: 1024,
            pool_size: 8,
        })
        .unwrap();

        assert_eq!(db.page_size(), 1024);
        assert_eq!(db.pool().page_size(), 1024);
        assert_eq!(db.pool().pool_size(), 8);
    }

    #[test]
    fn invalid_options_are_rejected_at_construction() {
        let err = Database::with_options(DatabaseOptions {
            page_size: 32,
            pool_size: 8,
        })
        .unwrap_err();
        assert!(err.to_string().contains("page size"));
    }
}
