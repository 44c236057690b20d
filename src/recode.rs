//! Normalization of raw genotype codes to a dense per-marker alphabet.
//!
//! At every marker, the founder alleles and all values in the heterozygote
//! table are collected, sorted, and replaced by their rank. Markers with the
//! same segregation structure then look identical regardless of which raw
//! codes the host used, which is what lets markers share probability tables.

use ndarray::Array2;

use crate::error::{Diagnostics, EstimateError};
use crate::genotypes::{GenotypeMatrix, HetEntry, HetTable, RawCode};

/// The largest number of distinct values supported at a single marker.
pub const MAX_ALLELES: usize = 10;

/// Genotype data rewritten in terms of per-marker ranks.
#[derive(Debug, Clone)]
pub struct RecodedData {
    /// Founder alleles, indexed by marker then founder.
    pub founders: Vec<Vec<u8>>,
    /// Final calls, markers × lines, so that one marker is contiguous.
    pub finals: Array2<Option<u8>>,
    /// Recoded heterozygote table per marker, sorted and de-duplicated.
    pub hets: Vec<Vec<HetEntry<u8>>>,
    /// The largest alphabet over all markers.
    pub max_alleles: usize,
}

/// Recode founders, finals and heterozygote table.
///
/// Coding problems (missing founder calls, final values that aren't a code in
/// the heterozygote table, heterozygote alleles no founder carries) are
/// collected and returned together as [`EstimateError::InvalidCoding`]. A
/// marker with more than [`MAX_ALLELES`] values aborts immediately.
pub fn recode(
    founders: &GenotypeMatrix,
    finals: &GenotypeMatrix,
    hets: &HetTable,
    max_messages: usize,
) -> Result<RecodedData, EstimateError> {
    let n_markers = finals.n_markers();
    let mut errors = Diagnostics::new(max_messages);
    let mut recoded = RecodedData {
        founders: Vec::with_capacity(n_markers),
        finals: Array2::from_elem((n_markers, finals.n_lines()), None),
        hets: Vec::with_capacity(n_markers),
        max_alleles: 1,
    };

    for marker in 0..n_markers {
        let marker_name = &finals.marker_names[marker];
        let entries = &hets[marker];
        let mut alphabet: Vec<RawCode> = founders
            .marker(marker)
            .iter()
            .flatten()
            .copied()
            .chain(
                entries
                    .iter()
                    .flat_map(|h| [h.allele_a, h.allele_b, h.code]),
            )
            .collect();
        alphabet.sort_unstable();
        alphabet.dedup();
        if alphabet.len() > MAX_ALLELES {
            return Err(EstimateError::AlleleCountExceeded {
                marker: marker_name.clone(),
                count: alphabet.len(),
            });
        }
        recoded.max_alleles = recoded.max_alleles.max(alphabet.len());
        let rank = |value: RawCode| alphabet.binary_search(&value).ok().map(|i| i as u8);

        let mut founder_alleles = Vec::with_capacity(founders.n_lines());
        for (line, call) in founders.marker(marker).iter().enumerate() {
            match call.and_then(rank) {
                Some(allele) => founder_alleles.push(allele),
                None => {
                    errors.push(format!(
                        "Founder '{}' has a missing value at marker '{}'",
                        founders.line_names[line], marker_name
                    ));
                    founder_alleles.push(0);
                }
            }
        }
        let mut het_alleles: Vec<RawCode> = entries
            .iter()
            .flat_map(|h| [h.allele_a, h.allele_b])
            .collect();
        het_alleles.sort_unstable();
        het_alleles.dedup();
        for allele in het_alleles {
            if !founders.marker(marker).iter().any(|&call| call == Some(allele)) {
                errors.push(format!(
                    "Marker '{}': heterozygote table allele {} is not carried by any founder",
                    marker_name, allele
                ));
            }
        }

        let mut marker_hets: Vec<HetEntry<u8>> = entries
            .iter()
            .filter_map(|h| Some(HetEntry::new(rank(h.allele_a)?, rank(h.allele_b)?, rank(h.code)?)))
            .collect();
        marker_hets.sort_unstable();
        marker_hets.dedup();

        for (line, call) in finals.marker(marker).iter().enumerate() {
            let Some(value) = *call else { continue };
            if entries.iter().any(|h| h.code == value) {
                recoded.finals[[marker, line]] = rank(value);
            } else {
                errors.push(format!(
                    "Line '{}' has value {} at marker '{}', which is not a code of the heterozygote table",
                    finals.line_names[line], value, marker_name
                ));
            }
        }

        recoded.founders.push(founder_alleles);
        recoded.hets.push(marker_hets);
    }

    errors.into_result(EstimateError::InvalidCoding)?;
    Ok(recoded)
}

/// Replace every heterozygous final call with a missing value.
///
/// A code is heterozygous if no homozygous row of the marker's table maps to
/// it. Returns the number of calls replaced.
pub fn replace_hets_with_missing(data: &mut RecodedData) -> usize {
    let mut replaced = 0;
    for (marker, mut calls) in data.finals.outer_iter_mut().enumerate() {
        let hets = &data.hets[marker];
        let is_homozygous_code =
            |code: u8| hets.iter().any(|h| h.is_homozygous() && h.code == code);
        for call in calls.iter_mut() {
            if let Some(code) = *call {
                if !is_homozygous_code(code) {
                    *call = None;
                    replaced += 1;
                }
            }
        }
    }
    replaced
}
