//! # Paged File I/O
//!
//! A [`PagedFile`] reads and writes fixed-size pages at byte offset
//! `page_no × page_size` with positioned I/O, so no seek state is shared
//! between threads. Reads past the end of the file — and short reads at the
//! tail — come back zero-filled, which is what a freshly allocated page
//! looks like. The file does no caching of its own; that is the buffer
//! pool's job.
//!
//! The [`FileTable`] is the context-wide registry mapping each opened path
//! to a small integer file id. Page identities above this layer are
//! `(file_id, page_no)` pairs, so the registry is what makes those ids
//! resolvable.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use eyre::{ensure, eyre, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug)]
pub struct PagedFile {
    file: File,
    path: PathBuf,
    page_size: usize,
}

impl PagedFile {
    /// Opens `path` read/write, creating it if absent.
    pub fn open(path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .wrap_err_with(|| format!("failed to open {}", path.display()))?;
        Ok(Self {
            file,
            path,
            page_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of whole pages currently backed by the file.
    pub fn page_count(&self) -> Result<u32> {
        let len = self.file.metadata()?.len();
        Ok((len / self.page_size as u64) as u32)
    }

    /// Fills `buf` with the page's bytes; anything past end-of-file reads
    /// as zero.
    pub fn read_page(&self, page_no: u32, buf: &mut [u8]) -> Result<()> {
        ensure!(
            buf.len() == self.page_size,
            "page buffer of {} bytes does not match page size {}",
            buf.len(),
            self.page_size
        );
        buf.fill(0);
        let offset = page_no as u64 * self.page_size as u64;
        let mut read = 0;
        while read < buf.len() {
            match self.file.read_at(&mut buf[read..], offset + read as u64) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(e).wrap_err_with(|| {
                        format!("read of page {} from {} failed", page_no, self.path.display())
                    })
                }
            }
        }
        Ok(())
    }

    pub fn write_page(&self, page_no: u32, buf: &[u8]) -> Result<()> {
        ensure!(
            buf.len() == self.page_size,
            "page buffer of {} bytes does not match page size {}",
            buf.len(),
            self.page_size
        );
        let offset = page_no as u64 * self.page_size as u64;
        self.file.write_all_at(buf, offset).wrap_err_with(|| {
            format!("write of page {} to {} failed", page_no, self.path.display())
        })
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FileTableInner {
    files: Vec<Arc<PagedFile>>,
    by_path: HashMap<PathBuf, u32>,
}

/// Registry of open paged files, shared by the database context and the
/// buffer pool.
#[derive(Debug)]
pub struct FileTable {
    page_size: usize,
    inner: RwLock<FileTableInner>,
}

impl FileTable {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            inner: RwLock::new(FileTableInner::default()),
        }
    }

    /// Opens (or reuses) the file at `path` and returns its id.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<u32> {
        let path = path.as_ref().to_path_buf();
        {
            let inner = self.inner.read();
            if let Some(&id) = inner.by_path.get(&path) {
                return Ok(id);
            }
        }
        let mut inner = self.inner.write();
        if let Some(&id) = inner.by_path.get(&path) {
            return Ok(id);
        }
        let file = PagedFile::open(&path, self.page_size)?;
        let id = inner.files.len() as u32;
        inner.files.push(Arc::new(file));
        inner.by_path.insert(path, id);
        Ok(id)
    }

    pub fn get(&self, id: u32) -> Result<Arc<PagedFile>> {
        self.inner
            .read()
            .files
            .get(id as usize)
            .cloned()
            .ok_or_else(|| eyre!("unknown file id {}", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn read_past_end_of_file_is_zero_filled() {
        let dir = tempdir().unwrap();
        let file = PagedFile::open(dir.path().join("t.db"), 512).unwrap();

        let mut buf = vec![0xAAu8; 512];
        file.read_page(7, &mut buf).unwrap();

        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn write_then_read_roundtrips_a_page() {
        let dir = tempdir().unwrap();
        let file = PagedFile::open(dir.path().join("t.db"), 512).unwrap();

        let page = vec![0x5Cu8; 512];
        file.write_page(3, &page).unwrap();

        let mut out = vec![0u8; 512];
        file.read_page(3, &mut out).unwrap();
        assert_eq!(out, page);

        assert_eq!(file.page_count().unwrap(), 4);
    }

    #[test]
    fn mismatched_buffer_is_rejected() {
        let dir = tempdir().unwrap();
        let file = PagedFile::open(dir.path().join("t.db"), 512).unwrap();

        let mut small = vec![0u8; 256];
        assert!(file.read_page(0, &mut small).is_err());
        assert!(file.write_page(0, &small).is_err());
    }

    #[test]
    fn file_table_reuses_ids_per_path() {
        let dir = tempdir().unwrap();
        let table = FileTable::new(512);

        let a = table.open(dir.path().join("a.db")).unwrap();
        let b = table.open(dir.path().join("b.db")).unwrap();
        let a_again = table.open(dir.path().join("a.db")).unwrap();

        assert_eq!(a, a_again);
        assert_ne!(a, b);
        assert_eq!(table.get(a).unwrap().page_size(), 512);
        assert!(table.get(99).is_err());
    }
}
