use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::error::EstimateError;

/// The integer type of raw, host-supplied genotype codes.
pub type RawCode = i32;

/// Integer-coded genotypes, one row per line and one column per marker.
/// `None` is a missing call.
#[derive(Debug, Clone)]
pub struct GenotypeMatrix {
    pub line_names: Vec<String>,
    pub marker_names: Vec<String>,
    pub calls: Array2<Option<RawCode>>,
}

impl GenotypeMatrix {
    pub fn new(
        line_names: Vec<String>,
        marker_names: Vec<String>,
        calls: Array2<Option<RawCode>>,
    ) -> Result<Self, EstimateError> {
        let (n_lines, n_markers) = calls.dim();
        if line_names.len() != n_lines || marker_names.len() != n_markers {
            return Err(EstimateError::DimensionMismatch(format!(
                "genotype matrix is {} x {} but has {} line names and {} marker names",
                n_lines,
                n_markers,
                line_names.len(),
                marker_names.len()
            )));
        }
        Ok(Self {
            line_names,
            marker_names,
            calls,
        })
    }

    /// Build a matrix from rows of calls, naming markers `M1..Mn`.
    pub fn from_rows(
        line_names: &[&str],
        rows: &[Vec<Option<RawCode>>],
    ) -> Result<Self, EstimateError> {
        let n_markers = rows.first().map_or(0, |row| row.len());
        if let Some(bad) = rows.iter().find(|row| row.len() != n_markers) {
            return Err(EstimateError::DimensionMismatch(format!(
                "ragged genotype rows ({} and {} markers)",
                n_markers,
                bad.len()
            )));
        }
        let calls = Array2::from_shape_fn((rows.len(), n_markers), |(i, j)| rows[i][j]);
        Self::new(
            line_names.iter().map(|s| s.to_string()).collect(),
            (1..=n_markers).map(|m| format!("M{}", m)).collect(),
            calls,
        )
    }

    pub fn n_lines(&self) -> usize {
        self.calls.nrows()
    }

    pub fn n_markers(&self) -> usize {
        self.calls.ncols()
    }

    /// All calls at one marker.
    pub fn marker(&self, marker: usize) -> ArrayView1<'_, Option<RawCode>> {
        self.calls.column(marker)
    }
}

/// One row of a heterozygote table: a line carrying `allele_a` and
/// `allele_b` is observed as `code`.
///
/// Homozygotes are rows with `allele_a == allele_b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HetEntry<T = RawCode> {
    pub allele_a: T,
    pub allele_b: T,
    pub code: T,
}

impl<T: Copy + PartialEq> HetEntry<T> {
    pub fn new(allele_a: T, allele_b: T, code: T) -> Self {
        Self {
            allele_a,
            allele_b,
            code,
        }
    }

    pub fn is_homozygous(&self) -> bool {
        self.allele_a == self.allele_b
    }

    /// Whether this row describes the unordered allele pair `{a, b}`.
    pub fn matches(&self, a: T, b: T) -> bool {
        (self.allele_a == a && self.allele_b == b) || (self.allele_a == b && self.allele_b == a)
    }
}

/// Per-marker heterozygote definitions.
pub type HetTable = Vec<Vec<HetEntry>>;

/// The fully-informative table for a marker whose founders carry `alleles`:
/// homozygotes display as their allele, and each heterozygote gets a fresh
/// code above the largest allele.
pub fn fully_informative_hets(alleles: &[RawCode]) -> Vec<HetEntry> {
    let mut sorted = alleles.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    let mut entries: Vec<HetEntry> = sorted.iter().map(|&a| HetEntry::new(a, a, a)).collect();
    let mut next_code = sorted.last().map_or(0, |&a| a + 1);
    for (i, &a) in sorted.iter().enumerate() {
        for &b in &sorted[i + 1..] {
            entries.push(HetEntry::new(a, b, next_code));
            entries.push(HetEntry::new(b, a, next_code));
            next_code += 1;
        }
    }
    entries
}
