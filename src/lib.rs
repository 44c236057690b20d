//! Pairwise recombination-fraction likelihoods for multi-parent crosses.
//!
//! Given the genotypes of the founders and of the final lines of a two- or
//! four-way cross, the pedigree that connects them, and a heterozygote table
//! describing how allele pairs are displayed at each marker, this crate
//! computes for every pair of markers the log-likelihood of the observed
//! final genotypes at a grid of candidate recombination fractions.
//!
//! Preparation (pedigree classification, recoding, pattern indexing) is done
//! once in [`PreparedDesign::new`]. Pairs are then estimated in contiguous
//! chunks of the triangular pair order, see [`pair_at`] and [`PairChunk`].
//!
//! ```no_run
//! use mprf::prelude::*;
//!
//! # fn inputs() -> (GenotypeMatrix, GenotypeMatrix, Pedigree, HetTable) { unimplemented!() }
//! let (founders, finals, pedigree, hets) = inputs();
//! let design = PreparedDesign::new(
//!     &founders,
//!     &finals,
//!     &pedigree,
//!     &hets,
//!     None,
//!     EstimateConfig::default(),
//! )
//! .expect("invalid design");
//!
//! let rfs = [0.0, 0.01, 0.05, 0.1, 0.2, 0.5];
//! let chunk = PairChunk::all(design.n_markers());
//! let likelihoods = design
//!     .estimate(&rfs, chunk, &|done: u64| eprintln!("{} pairs done", done))
//!     .expect("estimation failed");
//!
//! for (k, row) in likelihoods.outer_iter().enumerate() {
//!     let (m1, m2) = pair_at(chunk.start + k);
//!     println!("{}\t{}\t{:?}", m1, m2, row.to_vec());
//! }
//! ```

pub mod accumulate;
pub mod design;
pub mod error;
pub mod genotypes;
pub mod model;
mod numeric;
pub mod patterns;
pub mod pedigree;
pub mod recode;
pub mod table;
pub mod triangular;

pub use design::{EstimateConfig, PairChunk, PreparedDesign};
pub use error::{Diagnostics, EstimateError, Outcome};
pub use genotypes::{fully_informative_hets, GenotypeMatrix, HetEntry, HetTable, RawCode};
pub use pedigree::{Pedigree, SelfingMode};
pub use recode::MAX_ALLELES;
pub use triangular::{count_pairs, pair_at, pair_index, TriangularIterator};

pub mod prelude {
    pub use crate::design::{EstimateConfig, PairChunk, PreparedDesign};
    pub use crate::error::{EstimateError, Outcome};
    pub use crate::genotypes::{fully_informative_hets, GenotypeMatrix, HetEntry, HetTable};
    pub use crate::pedigree::{Pedigree, SelfingMode};
    pub use crate::triangular::{count_pairs, pair_at};
}
