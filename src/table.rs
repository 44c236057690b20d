//! Lookup tables of genotype-pair log-probabilities.
//!
//! Lines are grouped into categories by how they descend from the founders:
//! one category per funnel (no intercrossing) and one per intercrossing
//! generation, each split again by the number of selfing generations. For a
//! pair of marker patterns, every category key and every candidate
//! recombination fraction gets an `A × A` array of log-probabilities of the
//! two observed codes. The table is built once per estimation run and then
//! only read, from every worker.
//!
//! Only pattern pairs `p1 <= p2` are stored, in the same triangular layout as
//! the marker pairs themselves; callers swap the two observed codes for
//! `p1 > p2`.

use rayon::prelude::*;
use std::mem::size_of;

use crate::model::{IntercrossPools, TwoLocus};
use crate::numeric::ln_prob;
use crate::patterns::{FunnelId, MarkerPatterns, PatternId};
use crate::pedigree::SelfingMode;
use crate::triangular::{count_pairs, pair_at, pair_index};

/// The recombination fraction at which every founder genotype reachable
/// under some recombination fraction has positive probability.
const SUPPORT_RECOMBINATION_FRACTION: f64 = 0.5;

/// How a line descends from the founders, apart from selfing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lineage {
    /// Funnel line without intercrossing.
    Funnel(FunnelId),
    /// Intercrossing generation, at least 1.
    Intercross(u32),
}

/// Dense numbering of (lineage, selfing generations) category keys.
///
/// Funnels come first, then intercrossing generations `1..=max`; each is
/// repeated for every selfing count between the population minimum and
/// maximum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryLayout {
    n_funnels: usize,
    max_intercrossing: u32,
    min_selfing: u32,
    n_selfing: usize,
}

impl CategoryLayout {
    pub fn new(n_funnels: usize, lines: &[(Lineage, u32)]) -> Self {
        let max_intercrossing = lines
            .iter()
            .filter_map(|(lineage, _)| match lineage {
                Lineage::Intercross(generation) => Some(*generation),
                Lineage::Funnel(_) => None,
            })
            .max()
            .unwrap_or(0);
        let min_selfing = lines.iter().map(|&(_, s)| s).min().unwrap_or(0);
        let max_selfing = lines.iter().map(|&(_, s)| s).max().unwrap_or(0);
        Self {
            n_funnels,
            max_intercrossing,
            min_selfing,
            n_selfing: (max_selfing - min_selfing) as usize + 1,
        }
    }

    pub fn n_categories(&self) -> usize {
        self.n_funnels + self.max_intercrossing as usize
    }

    pub fn n_keys(&self) -> usize {
        self.n_categories() * self.n_selfing
    }

    pub fn max_intercrossing(&self) -> u32 {
        self.max_intercrossing
    }

    /// The key of a line with `selfing` generations of selfing.
    pub fn key(&self, lineage: Lineage, selfing: u32) -> usize {
        let category = match lineage {
            Lineage::Funnel(id) => id,
            Lineage::Intercross(generation) => self.n_funnels + generation as usize - 1,
        };
        category * self.n_selfing + (selfing - self.min_selfing) as usize
    }

    /// Inverse of [`CategoryLayout::key`].
    pub fn decode(&self, key: usize) -> (Lineage, u32) {
        let category = key / self.n_selfing;
        let selfing = self.min_selfing + (key % self.n_selfing) as u32;
        let lineage = if category < self.n_funnels {
            Lineage::Funnel(category)
        } else {
            Lineage::Intercross((category - self.n_funnels + 1) as u32)
        };
        (lineage, selfing)
    }
}

/// What the genetic model needs to know about the breeding design.
#[derive(Debug, Clone)]
pub struct FounderModel {
    pub n_founders: usize,
    pub selfing: SelfingMode,
    /// Founder order of every funnel id.
    pub funnels: Vec<Vec<usize>>,
}

impl FounderModel {
    /// Founder genotype distribution of a category at recombination
    /// fraction `r`. `pools` must cover the intercrossing generations of
    /// `lineage`.
    pub fn distribution(
        &self,
        lineage: Lineage,
        selfing: u32,
        r: f64,
        pools: Option<&IntercrossPools>,
    ) -> Option<TwoLocus> {
        let outcrossed = match lineage {
            Lineage::Funnel(id) => TwoLocus::funnel(self.n_founders, self.funnels.get(id)?, r),
            Lineage::Intercross(generation) => pools?.line(generation),
        };
        Some(match self.selfing {
            SelfingMode::Finite => outcrossed.self_generations(selfing, r),
            SelfingMode::Infinite => outcrossed.self_to_fixation(r),
        })
    }

    /// Distributions of every key flagged in `present`.
    fn distributions(
        &self,
        layout: &CategoryLayout,
        present: &[bool],
        r: f64,
    ) -> Vec<Option<TwoLocus>> {
        let pools = (layout.max_intercrossing() > 0).then(|| {
            IntercrossPools::new(self.n_founders, layout.max_intercrossing() - 1, r)
        });
        present
            .iter()
            .enumerate()
            .map(|(key, &present)| {
                if !present {
                    return None;
                }
                let (lineage, selfing) = layout.decode(key);
                self.distribution(lineage, selfing, r, pools.as_ref())
            })
            .collect()
    }
}

/// Log-probabilities of one pattern pair.
#[derive(Debug, Clone)]
pub struct PairEntry<const A: usize> {
    n_keys: usize,
    allowable: Vec<bool>,
    /// Indexed by `rf * n_keys + key`, then by the two observed codes.
    values: Vec<[[f64; A]; A]>,
}

impl<const A: usize> PairEntry<A> {
    /// Whether the model is defined for lines of category `key` at this
    /// pattern pair. A disallowed key contributes nothing.
    pub fn is_allowable(&self, key: usize) -> bool {
        self.allowable[key]
    }

    pub fn log_probs(&self, rf: usize, key: usize) -> &[[f64; A]; A] {
        &self.values[rf * self.n_keys + key]
    }
}

/// Log-probability tables for every pair of marker patterns.
#[derive(Debug, Clone)]
pub struct ProbabilityTable<const A: usize> {
    n_keys: usize,
    entries: Vec<PairEntry<A>>,
}

impl<const A: usize> ProbabilityTable<A> {
    /// Build the tables for `N` founders and codes below `A`.
    ///
    /// A key is allowable for a pattern pair if some line in the population
    /// has that key, and every founder genotype the model can produce for it
    /// displays a code at both markers.
    pub fn build<const N: usize>(
        patterns: &MarkerPatterns,
        layout: &CategoryLayout,
        present: &[bool],
        model: &FounderModel,
        recombination_fractions: &[f64],
    ) -> Self {
        let n_keys = layout.n_keys();
        let codes: Vec<[[Option<u8>; N]; N]> =
            patterns.iter().map(|p| p.code_map::<N>()).collect();
        let support = model.distributions(layout, present, SUPPORT_RECOMBINATION_FRACTION);
        let per_rf: Vec<Vec<Option<TwoLocus>>> = recombination_fractions
            .par_iter()
            .map(|&r| model.distributions(layout, present, r))
            .collect();

        let entries = (0..count_pairs(patterns.len()))
            .into_par_iter()
            .map(|idx| {
                let (p1, p2) = pair_at(idx);
                let (codes1, codes2) = (&codes[p1], &codes[p2]);
                let allowable: Vec<bool> = support
                    .iter()
                    .map(|dist| match dist {
                        Some(dist) => dist.observe::<N, A>(codes1, codes2).1 == 0.0,
                        None => false,
                    })
                    .collect();
                let mut values = vec![[[f64::NEG_INFINITY; A]; A]; per_rf.len() * n_keys];
                for (rf, distributions) in per_rf.iter().enumerate() {
                    for (key, dist) in distributions.iter().enumerate() {
                        let Some(dist) = dist.as_ref().filter(|_| allowable[key]) else {
                            continue;
                        };
                        let (observed, _) = dist.observe::<N, A>(codes1, codes2);
                        let cell = &mut values[rf * n_keys + key];
                        for (row, probs) in cell.iter_mut().zip(observed.iter()) {
                            for (value, &prob) in row.iter_mut().zip(probs.iter()) {
                                *value = ln_prob(prob);
                            }
                        }
                    }
                }
                PairEntry {
                    n_keys,
                    allowable,
                    values,
                }
            })
            .collect();
        Self { n_keys, entries }
    }

    pub fn n_keys(&self) -> usize {
        self.n_keys
    }

    /// The stored entry for `(p1, p2)`, and whether the caller must swap the
    /// two markers' codes to use it.
    pub fn entry(&self, p1: PatternId, p2: PatternId) -> (&PairEntry<A>, bool) {
        if p1 <= p2 {
            (&self.entries[pair_index(p1, p2)], false)
        } else {
            (&self.entries[pair_index(p2, p1)], true)
        }
    }
}

/// Approximate size in bytes of a probability table.
pub fn estimated_bytes(n_patterns: usize, n_rf: usize, n_keys: usize, n_alleles: usize) -> usize {
    count_pairs(n_patterns) * n_rf * n_keys * n_alleles * n_alleles * size_of::<f64>()
}
