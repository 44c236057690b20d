//! Enumeration of the upper triangle of the marker × marker grid.
//!
//! Marker pairs `(row, col)` with `row <= col` are numbered column by column,
//! which is the packed layout of an upper-triangular symmetric matrix:
//!
//! ```text
//!        col 0  col 1  col 2  col 3
//! row 0    0      1      3      6
//! row 1           2      4      7
//! row 2                  5      8
//! row 3                         9
//! ```
//!
//! So pair index `k` belongs to column `col` with `col (col + 1) / 2 <= k`,
//! and the conversion in both directions is closed-form.

/// Number of marker pairs (including each marker paired with itself).
pub fn count_pairs(n_markers: usize) -> usize {
    n_markers * (n_markers + 1) / 2
}

/// The linear index of the pair `(row, col)`; requires `row <= col`.
pub fn pair_index(row: usize, col: usize) -> usize {
    debug_assert!(row <= col);
    col * (col + 1) / 2 + row
}

/// The `(row, col)` pair at linear index `index`.
pub fn pair_at(index: usize) -> (usize, usize) {
    // the float estimate can be off by one for very large indices
    let mut col = ((((8 * index + 1) as f64).sqrt() as usize).saturating_sub(1)) / 2;
    while col * (col + 1) / 2 > index {
        col -= 1;
    }
    while (col + 1) * (col + 2) / 2 <= index {
        col += 1;
    }
    (index - col * (col + 1) / 2, col)
}

/// A forward-only cursor over the canonical pair enumeration.
///
/// A cursor can be seeded at any offset, so that a worker can process a
/// contiguous range of pairs without stepping from the start.
#[derive(Debug, Clone)]
pub struct TriangularIterator {
    n_markers: usize,
    index: usize,
    row: usize,
    col: usize,
}

impl TriangularIterator {
    pub fn new(n_markers: usize) -> Self {
        Self::at(n_markers, 0)
    }

    /// Create a cursor positioned at pair `index`.
    pub fn at(n_markers: usize, index: usize) -> Self {
        let (row, col) = pair_at(index);
        Self {
            n_markers,
            index,
            row,
            col,
        }
    }

    /// The current `(row, col)` pair.
    pub fn get(&self) -> (usize, usize) {
        (self.row, self.col)
    }

    /// The linear index of the current pair.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether the cursor has moved past the last pair.
    pub fn is_done(&self) -> bool {
        self.col >= self.n_markers
    }

    /// Move forward by exactly one pair.
    pub fn advance(&mut self) {
        self.index += 1;
        self.row += 1;
        if self.row > self.col {
            self.col += 1;
            self.row = 0;
        }
    }

    /// Move forward to pair `target`.
    ///
    /// # Panics
    /// If `target` is behind the current position; cursors only move forward.
    pub fn skip_to(&mut self, target: usize) {
        assert!(
            target >= self.index,
            "Internal error: triangular iterator asked to move from {} back to {}",
            self.index,
            target
        );
        while self.index < target {
            self.advance();
        }
    }
}

impl Iterator for TriangularIterator {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_done() {
            return None;
        }
        let pair = self.get();
        self.advance();
        Some(pair)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = count_pairs(self.n_markers).saturating_sub(self.index);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for TriangularIterator {}
