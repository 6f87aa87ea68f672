//! Grouping of sorted positions into contiguous ranges.

/// A run of consecutive positions: `start..start + count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexRange {
    /// First position of the run.
    pub start: usize,
    /// Number of positions in the run. Always at least 1.
    pub count: usize,
}

impl IndexRange {
    /// Create a range.
    pub fn new(start: usize, count: usize) -> Self {
        Self { start, count }
    }

    /// One past the last position of the run.
    #[must_use]
    pub fn end(&self) -> usize {
        self.start + self.count
    }
}

/// Collapse strictly ascending positions into the minimal list of
/// maximal runs, ordered by start.
///
/// The input must be sorted and free of duplicates. This is checked in
/// debug builds only; in release builds a violating input yields an
/// unspecified (but memory-safe) result.
///
/// # Example
///
/// ```
/// use crdt_attrs::{compact_indices, IndexRange};
///
/// let ranges = compact_indices(&[2, 3, 4, 7, 9, 10]);
/// assert_eq!(
///     ranges,
///     vec![IndexRange::new(2, 3), IndexRange::new(7, 1), IndexRange::new(9, 2)]
/// );
/// ```
pub fn compact_indices(indices: &[usize]) -> Vec<IndexRange> {
    debug_assert!(
        indices.windows(2).all(|w| w[0] < w[1]),
        "indices must be strictly ascending: {indices:?}"
    );

    let mut ranges = Vec::new();
    let Some((&first, rest)) = indices.split_first() else {
        return ranges;
    };

    let mut current = IndexRange::new(first, 1);
    for &index in rest {
        if index == current.end() {
            current.count += 1;
        } else {
            ranges.push(current);
            current = IndexRange::new(index, 1);
        }
    }
    ranges.push(current);

    ranges
}
