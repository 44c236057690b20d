//! Dense identifiers for marker patterns and founder funnels.
//!
//! Both are many-to-one collapses: many markers share a pattern, many lines
//! share a funnel. Ids are contiguous from zero and identical signatures
//! always get the same id, so ids can be used to index dense tables directly.

use indexmap::IndexSet;
use std::collections::BTreeSet;

use crate::genotypes::HetEntry;
use crate::recode::RecodedData;

/// Dense id of a [`MarkerPattern`].
pub type PatternId = usize;

/// Dense id of a funnel.
pub type FunnelId = usize;

/// The segregation signature of a marker: recoded founder alleles and the
/// recoded heterozygote table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MarkerPattern {
    pub founders: Vec<u8>,
    pub hets: Vec<HetEntry<u8>>,
}

impl MarkerPattern {
    /// The observed code for a line carrying founder `a` on one chromosome
    /// and founder `b` on the other, if the table defines one.
    pub fn code(&self, a: usize, b: usize) -> Option<u8> {
        let (allele_a, allele_b) = (self.founders[a], self.founders[b]);
        self.hets
            .iter()
            .find(|h| h.matches(allele_a, allele_b))
            .map(|h| h.code)
    }

    /// The code for every ordered pair of founders.
    pub fn code_map<const N: usize>(&self) -> [[Option<u8>; N]; N] {
        let mut codes = [[None; N]; N];
        for (a, row) in codes.iter_mut().enumerate() {
            for (b, code) in row.iter_mut().enumerate() {
                *code = self.code(a, b);
            }
        }
        codes
    }
}

/// Distinct marker patterns and the pattern of every marker.
#[derive(Debug, Clone)]
pub struct MarkerPatterns {
    patterns: IndexSet<MarkerPattern>,
    marker_ids: Vec<PatternId>,
}

impl MarkerPatterns {
    /// Assign pattern ids in order of first appearance.
    pub fn from_recoded(data: &RecodedData) -> Self {
        let mut patterns = IndexSet::new();
        let marker_ids = data
            .founders
            .iter()
            .zip(data.hets.iter())
            .map(|(founders, hets)| {
                let (id, _) = patterns.insert_full(MarkerPattern {
                    founders: founders.clone(),
                    hets: hets.clone(),
                });
                id
            })
            .collect();
        Self {
            patterns,
            marker_ids,
        }
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// The pattern id of every marker.
    pub fn marker_ids(&self) -> &[PatternId] {
        &self.marker_ids
    }

    pub fn get(&self, id: PatternId) -> Option<&MarkerPattern> {
        self.patterns.get_index(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MarkerPattern> {
        self.patterns.iter()
    }
}

/// Canonical integer for a funnel: its founders as base-`n_founders` digits,
/// first founder least significant.
pub fn encode_funnel(funnel: &[usize], n_founders: usize) -> u64 {
    funnel
        .iter()
        .rev()
        .fold(0u64, |acc, &founder| acc * n_founders as u64 + founder as u64)
}

/// Inverse of [`encode_funnel`].
pub fn decode_funnel(mut encoding: u64, n_founders: usize) -> Vec<usize> {
    (0..n_founders)
        .map(|_| {
            let founder = (encoding % n_founders as u64) as usize;
            encoding /= n_founders as u64;
            founder
        })
        .collect()
}

/// The distinct funnels of a population, with ids in increasing encoding
/// order.
#[derive(Debug, Clone)]
pub struct FunnelIds {
    encodings: IndexSet<u64>,
    n_founders: usize,
}

impl FunnelIds {
    pub fn new<'a, I>(funnels: I, n_founders: usize) -> Self
    where
        I: IntoIterator<Item = &'a [usize]>,
    {
        let sorted: BTreeSet<u64> = funnels
            .into_iter()
            .map(|funnel| encode_funnel(funnel, n_founders))
            .collect();
        Self {
            encodings: sorted.into_iter().collect(),
            n_founders,
        }
    }

    pub fn len(&self) -> usize {
        self.encodings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encodings.is_empty()
    }

    /// The id of a funnel seen at construction.
    pub fn id(&self, funnel: &[usize]) -> Option<FunnelId> {
        self.encodings
            .get_index_of(&encode_funnel(funnel, self.n_founders))
    }

    /// The founder order of funnel `id`.
    pub fn funnel(&self, id: FunnelId) -> Option<Vec<usize>> {
        self.encodings
            .get_index(id)
            .map(|&encoding| decode_funnel(encoding, self.n_founders))
    }
}
