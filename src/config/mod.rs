//! # Configuration Module
//!
//! Construction-time options for the database context and for individual
//! trees, plus the numeric defaults in [`constants`]. All options are
//! validated up front so that invalid parameters surface as configuration
//! errors instead of corrupting pages later.

pub mod constants;
pub use constants::*;

use eyre::{ensure, Result};

/// How a full leaf distributes its live tuples between the two halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SplitPolicy {
    /// Compact, sort by key, keep the lower portion in place and move the
    /// upper portion out. Both halves end up sorted; the separator is the
    /// right half's minimum key.
    #[default]
    SortOnSplit,
    /// Compact, pick the (p-1)/p-quantile key without sorting, and
    /// redistribute by comparison against it. Both halves stay unsorted;
    /// the separator is the chosen pivot.
    QuickPartition,
}

/// Options owned by the [`Database`](crate::Database) context: page
/// granularity and buffer pool capacity are shared by every tree registered
/// with the context.
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub page_size: usize,
    pub pool_size: usize,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

impl DatabaseOptions {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.page_size >= MIN_PAGE_SIZE,
            "page size {} below minimum {}",
            self.page_size,
            MIN_PAGE_SIZE
        );
        ensure!(
            self.page_size <= MAX_PAGE_SIZE,
            "page size {} exceeds maximum {} (slot offsets are 16-bit)",
            self.page_size,
            MAX_PAGE_SIZE
        );
        ensure!(self.pool_size >= 1, "buffer pool needs at least one frame");
        Ok(())
    }
}

/// Per-tree options. `split_percentage` is the denominator p of the kept
/// fraction (p-1)/p; the reference configuration keeps 3/4, i.e. p = 4.
#[derive(Debug, Clone)]
pub struct TreeOptions {
    pub split_policy: SplitPolicy,
    pub split_percentage: usize,
    pub max_soft_fails: u32,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            split_policy: SplitPolicy::default(),
            split_percentage: DEFAULT_SPLIT_PERCENTAGE,
            max_soft_fails: DEFAULT_MAX_SOFT_FAILS,
        }
    }
}

impl TreeOptions {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.split_percentage >= 2,
            "split percentage {} must be at least 2 (keep fraction (p-1)/p)",
            self.split_percentage
        );
        ensure!(
            self.max_soft_fails >= 1,
            "max soft fails must be at least 1"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_valid() {
        DatabaseOptions::default().validate().unwrap();
        TreeOptions::default().validate().unwrap();
    }

    #[test]
    fn rejects_undersized_page() {
        let opts = DatabaseOptions {
            page_size: 64,
            ..Default::default()
        };
        let err = opts.validate().unwrap_err();
        assert!(err.to_string().contains("below minimum"));
    }

    #[test]
    fn rejects_oversized_page() {
        let opts = DatabaseOptions {
            page_size: 1 << 20,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn rejects_empty_pool() {
        let opts = DatabaseOptions {
            pool_size: 0,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn rejects_degenerate_split_percentage() {
        let opts = TreeOptions {
            split_percentage: 1,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }
}
