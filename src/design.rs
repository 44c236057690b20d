//! The estimation entry point.
//!
//! A [`PreparedDesign`] is built once from the genotype matrices, pedigree
//! and heterozygote table; everything that does not depend on the candidate
//! recombination fractions (classification, recoding, pattern and funnel
//! ids, category keys) is done there. Each call to
//! [`PreparedDesign::estimate_into`] then builds the probability table for
//! its recombination fractions and accumulates one chunk of marker pairs.

use log::{debug, info, warn};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::accumulate::{accumulate, PairKernel, Progress, Strategy};
use crate::error::{Diagnostics, EstimateError, DEFAULT_MESSAGE_CAP};
use crate::genotypes::{GenotypeMatrix, HetTable};
use crate::patterns::{FunnelIds, MarkerPatterns};
use crate::pedigree::{classify, Pedigree, SelfingMode};
use crate::recode::{recode, replace_hets_with_missing};
use crate::table::{estimated_bytes, CategoryLayout, FounderModel, Lineage, ProbabilityTable};
use crate::triangular::count_pairs;

/// Worker blocks per thread; more blocks balance uneven pair costs.
const BLOCKS_PER_THREAD: usize = 8;

/// Tunables of an estimation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimateConfig {
    /// Worker threads; `None` uses rayon's default.
    pub threads: Option<usize>,
    /// Worker 0 reports progress after every this many pairs.
    pub progress_interval: u64,
    /// Cap on the messages kept in a [`Diagnostics`] list.
    pub max_reported_messages: usize,
}

impl Default for EstimateConfig {
    fn default() -> Self {
        Self {
            threads: None,
            progress_interval: 10,
            max_reported_messages: DEFAULT_MESSAGE_CAP,
        }
    }
}

/// A contiguous range of marker pairs in triangular order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairChunk {
    pub start: usize,
    pub count: usize,
}

impl PairChunk {
    /// Every pair of `n_markers` markers, including each marker with itself.
    pub fn all(n_markers: usize) -> Self {
        Self {
            start: 0,
            count: count_pairs(n_markers),
        }
    }
}

/// A validated, classified and recoded population, ready to estimate.
#[derive(Debug, Clone)]
pub struct PreparedDesign {
    n_founders: usize,
    n_markers: usize,
    max_alleles: usize,
    /// Recoded final calls, markers × lines.
    finals: Array2<Option<u8>>,
    patterns: MarkerPatterns,
    layout: CategoryLayout,
    /// Whether some line has each category key.
    present: Vec<bool>,
    /// Category key of every final line.
    keys: Vec<usize>,
    weights: Vec<f64>,
    model: FounderModel,
    config: EstimateConfig,
    warnings: Vec<String>,
    strategy: Option<Strategy>,
}

impl PreparedDesign {
    /// Validate and prepare a population.
    ///
    /// `founders` has one row per founder and `finals` one row per final
    /// line, both with one column per marker; `hets` has one list per marker.
    /// `weights` defaults to 1 for every final line.
    pub fn new(
        founders: &GenotypeMatrix,
        finals: &GenotypeMatrix,
        pedigree: &Pedigree,
        hets: &HetTable,
        weights: Option<Vec<f64>>,
        config: EstimateConfig,
    ) -> Result<Self, EstimateError> {
        let n_founders = founders.n_lines();
        if n_founders != 2 && n_founders != 4 {
            return Err(EstimateError::UnsupportedFounderCount(n_founders));
        }
        let n_markers = finals.n_markers();
        let n_lines = finals.n_lines();
        if founders.n_markers() != n_markers {
            return Err(EstimateError::DimensionMismatch(format!(
                "founders have {} markers but finals have {}",
                founders.n_markers(),
                n_markers
            )));
        }
        if hets.len() != n_markers {
            return Err(EstimateError::DimensionMismatch(format!(
                "heterozygote table covers {} markers but there are {}",
                hets.len(),
                n_markers
            )));
        }
        let weights = weights.unwrap_or_else(|| vec![1.0; n_lines]);
        if weights.len() != n_lines {
            return Err(EstimateError::DimensionMismatch(format!(
                "{} weights given for {} final lines",
                weights.len(),
                n_lines
            )));
        }

        let cap = config.max_reported_messages;
        let classes = classify(pedigree, &finals.line_names, &founders.line_names, cap)
            .map_err(EstimateError::PedigreeInconsistency)?;
        let mut recoded = recode(founders, finals, hets, cap)?;

        let funnel_ids = FunnelIds::new(
            classes.iter().filter_map(|c| c.funnel.as_deref()),
            n_founders,
        );
        let mut missing_funnels = Diagnostics::new(cap);
        let mut lines: Vec<(Lineage, u32)> = Vec::with_capacity(n_lines);
        for (name, class) in finals.line_names.iter().zip(&classes) {
            let lineage = if class.intercrossing > 0 {
                Lineage::Intercross(class.intercrossing)
            } else if let Some(id) = class.funnel.as_deref().and_then(|f| funnel_ids.id(f)) {
                Lineage::Funnel(id)
            } else {
                missing_funnels.push(format!("Line '{}' has no founder funnel", name));
                continue;
            };
            lines.push((lineage, class.selfing));
        }
        missing_funnels.into_result(EstimateError::PedigreeInconsistency)?;

        let mut warnings = Vec::new();
        if pedigree.selfing == SelfingMode::Infinite {
            let replaced = replace_hets_with_missing(&mut recoded);
            if replaced > 0 {
                let message = format!(
                    "Under infinite selfing {} heterozygous calls were treated as missing",
                    replaced
                );
                warn!("{}", message);
                warnings.push(message);
            }
            for (_, selfing) in lines.iter_mut() {
                *selfing = 0;
            }
        }

        let layout = CategoryLayout::new(funnel_ids.len(), &lines);
        let keys: Vec<usize> = lines
            .iter()
            .map(|&(lineage, selfing)| layout.key(lineage, selfing))
            .collect();
        let mut present = vec![false; layout.n_keys()];
        for &key in &keys {
            present[key] = true;
        }
        let model = FounderModel {
            n_founders,
            selfing: pedigree.selfing,
            funnels: (0..funnel_ids.len())
                .filter_map(|id| funnel_ids.funnel(id))
                .collect(),
        };
        let patterns = MarkerPatterns::from_recoded(&recoded);

        info!(
            "Prepared {} final lines at {} markers from {} founders",
            n_lines, n_markers, n_founders
        );
        debug!(
            "{} marker patterns, {} funnels, {} category keys, up to {} alleles per marker",
            patterns.len(),
            funnel_ids.len(),
            layout.n_keys(),
            recoded.max_alleles
        );

        Ok(Self {
            n_founders,
            n_markers,
            max_alleles: recoded.max_alleles,
            finals: recoded.finals,
            patterns,
            layout,
            present,
            keys,
            weights,
            model,
            config,
            warnings,
            strategy: None,
        })
    }

    pub fn n_markers(&self) -> usize {
        self.n_markers
    }

    pub fn n_founders(&self) -> usize {
        self.n_founders
    }

    /// Recoverable anomalies found while preparing.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Approximate size of the probability table for `n_rf` recombination
    /// fractions.
    pub fn lookup_table_bytes(&self, n_rf: usize) -> usize {
        estimated_bytes(
            self.patterns.len(),
            n_rf,
            self.layout.n_keys(),
            self.max_alleles,
        )
    }

    /// Force an accumulation strategy instead of picking it from the weights.
    #[cfg(test)]
    pub(crate) fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Add the log-likelihoods of the pairs in `chunk` into `result`, which
    /// holds `chunk.count` rows of one value per recombination fraction.
    ///
    /// `progress` receives the number of completed pairs, from worker 0
    /// while running and once more with the chunk size at the end.
    pub fn estimate_into(
        &self,
        recombination_fractions: &[f64],
        chunk: PairChunk,
        result: &mut [f64],
        progress: &(dyn Fn(u64) + Sync),
    ) -> Result<(), EstimateError> {
        if recombination_fractions.is_empty() {
            return Err(EstimateError::DimensionMismatch(
                "no recombination fractions given".to_string(),
            ));
        }
        if let Some(&bad) = recombination_fractions
            .iter()
            .find(|r| !(0.0..=0.5).contains(*r))
        {
            return Err(EstimateError::InvalidRecombinationFraction(bad));
        }
        let total = count_pairs(self.n_markers);
        match chunk.start.checked_add(chunk.count) {
            Some(end) if end <= total => {}
            _ => {
                return Err(EstimateError::ChunkOutOfRange {
                    start: chunk.start,
                    count: chunk.count,
                    total,
                })
            }
        }
        let expected = chunk.count * recombination_fractions.len();
        if result.len() != expected {
            return Err(EstimateError::ResultBufferSize {
                expected,
                actual: result.len(),
            });
        }

        let mut builder = rayon::ThreadPoolBuilder::new();
        if let Some(threads) = self.config.threads {
            builder = builder.num_threads(threads);
        }
        let pool = builder.build()?;
        let block_pairs = (chunk.count / (pool.current_num_threads() * BLOCKS_PER_THREAD)).max(1);
        let progress = Progress::new(self.config.progress_interval, progress);

        debug!(
            "Probability table needs about {} bytes",
            self.lookup_table_bytes(recombination_fractions.len())
        );
        info!(
            "Estimating {} marker pairs at {} recombination fractions on {} threads",
            chunk.count,
            recombination_fractions.len(),
            pool.current_num_threads()
        );

        let start = chunk.start;
        pool.install(|| match self.n_founders {
            2 => self.dispatch::<2>(recombination_fractions, start, result, block_pairs, &progress),
            4 => self.dispatch::<4>(recombination_fractions, start, result, block_pairs, &progress),
            other => unreachable!("Internal error: {} founders reached the estimator", other),
        });

        let completed = progress.finish();
        info!("Finished {} marker pairs", completed);
        Ok(())
    }

    /// Like [`PreparedDesign::estimate_into`], returning a fresh
    /// `chunk.count × n_rf` array.
    pub fn estimate(
        &self,
        recombination_fractions: &[f64],
        chunk: PairChunk,
        progress: &(dyn Fn(u64) + Sync),
    ) -> Result<Array2<f64>, EstimateError> {
        let n_rf = recombination_fractions.len();
        let mut values = vec![0.0; chunk.count * n_rf];
        self.estimate_into(recombination_fractions, chunk, &mut values, progress)?;
        Array2::from_shape_vec((chunk.count, n_rf), values)
            .map_err(|e| EstimateError::DimensionMismatch(e.to_string()))
    }

    /// Pick the allele-count specialization for `N` founders.
    fn dispatch<const N: usize>(
        &self,
        recombination_fractions: &[f64],
        start: usize,
        result: &mut [f64],
        block_pairs: usize,
        progress: &Progress<'_>,
    ) {
        macro_rules! with_alleles {
            ($this:ident; $($a:literal),+) => {
                match $this.max_alleles {
                    $($a => $this.run::<N, $a>(recombination_fractions, start, result, block_pairs, progress),)+
                    other => unreachable!("Internal error: {} alleles reached the estimator", other),
                }
            };
        }
        with_alleles!(self; 1, 2, 3, 4, 5, 6, 7, 8, 9, 10)
    }

    fn run<const N: usize, const A: usize>(
        &self,
        recombination_fractions: &[f64],
        start: usize,
        result: &mut [f64],
        block_pairs: usize,
        progress: &Progress<'_>,
    ) {
        let table = ProbabilityTable::<A>::build::<N>(
            &self.patterns,
            &self.layout,
            &self.present,
            &self.model,
            recombination_fractions,
        );
        let kernel = PairKernel::new(
            &table,
            self.finals.view(),
            self.patterns.marker_ids(),
            &self.keys,
            &self.weights,
            recombination_fractions.len(),
        );
        let strategy = self
            .strategy
            .unwrap_or_else(|| Strategy::for_weights(&self.weights));
        accumulate(
            &kernel,
            self.n_markers,
            start,
            result,
            strategy,
            block_pairs,
            progress,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Outcome;
    use crate::genotypes::{fully_informative_hets, HetEntry, RawCode};
    use crate::numeric::{assert_float_eq, assert_floats_eq};
    use crate::pedigree::tests::f2_pedigree;
    use std::sync::Mutex;

    fn ln(x: f64) -> f64 {
        x.ln()
    }

    fn founders() -> GenotypeMatrix {
        GenotypeMatrix::from_rows(&["A", "B"], &[vec![Some(1), Some(1)], vec![Some(2), Some(2)]])
            .unwrap()
    }

    fn f2_finals(rows: &[Vec<Option<RawCode>>]) -> GenotypeMatrix {
        let names = ["F2_1", "F2_2", "F2_3"];
        GenotypeMatrix::from_rows(&names[..rows.len()], rows).unwrap()
    }

    fn hets() -> HetTable {
        vec![fully_informative_hets(&[1, 2]); 2]
    }

    fn prepare(finals: &GenotypeMatrix, weights: Option<Vec<f64>>) -> PreparedDesign {
        let config = EstimateConfig {
            threads: Some(2),
            ..EstimateConfig::default()
        };
        PreparedDesign::new(&founders(), finals, &f2_pedigree(), &hets(), weights, config)
            .unwrap()
    }

    fn silent(_: u64) {}

    #[test]
    fn test_config_defaults() {
        let config = EstimateConfig::default();
        assert_eq!(config.threads, None);
        assert_eq!(config.progress_interval, 10);
        assert_eq!(config.max_reported_messages, 6);
        assert_eq!(PairChunk::all(4), PairChunk { start: 0, count: 10 });
    }

    #[test]
    fn test_f2_scenario() {
        let finals = f2_finals(&[
            vec![Some(1), Some(1)],
            vec![Some(2), Some(2)],
            vec![Some(3), Some(3)],
        ]);
        let design = prepare(&finals, None);
        let result = design.estimate(&[0.0, 0.5], PairChunk::all(2), &silent).unwrap();
        assert_eq!(result.dim(), (3, 2));
        // pair index 1 is markers (0, 1)
        assert_float_eq(result[[1, 0]], ln(0.25) + ln(0.25) + ln(0.5), 1e-10);
        assert_float_eq(result[[1, 1]], 2.0 * ln(1.0 / 16.0) + ln(0.25), 1e-10);
    }

    #[test]
    fn test_impossible_pair_is_negative_infinity() {
        let finals = f2_finals(&[vec![Some(1), Some(1)], vec![Some(1), Some(2)]]);
        let design = prepare(&finals, None);
        let result = design.estimate(&[0.0, 0.5], PairChunk { start: 1, count: 1 }, &silent).unwrap();
        assert_eq!(result[[0, 0]], f64::NEG_INFINITY);
        assert_float_eq(result[[0, 1]], 2.0 * ln(1.0 / 16.0), 1e-10);
    }

    #[test]
    fn test_tiny_recombination_fraction_stays_finite() {
        // AA then BB needs a recombinant gamete from both sides: (r / 2)²
        let finals = f2_finals(&[vec![Some(1), Some(2)]]);
        let design = prepare(&finals, None);
        let r = 1e-17;
        let result = design.estimate(&[r], PairChunk { start: 1, count: 1 }, &silent).unwrap();
        assert!(result[[0, 0]].is_finite());
        assert_float_eq(result[[0, 0]], 2.0 * ln(r / 2.0), 1e-9);
    }

    #[test]
    fn test_missing_calls_are_skipped() {
        let finals = f2_finals(&[
            vec![Some(1), Some(1)],
            vec![Some(2), Some(2)],
            vec![Some(3), None],
        ]);
        let design = prepare(&finals, None);
        let result = design.estimate(&[0.0, 0.5], PairChunk { start: 1, count: 1 }, &silent).unwrap();
        assert_float_eq(result[[0, 0]], 2.0 * ln(0.25), 1e-10);
        assert_float_eq(result[[0, 1]], 2.0 * ln(1.0 / 16.0), 1e-10);
    }

    #[test]
    fn test_unobserved_marker_contributes_nothing() {
        let finals = f2_finals(&[vec![Some(1), None], vec![None, Some(2)], vec![Some(3), None]]);
        let design = prepare(&finals, None);
        let result = design.estimate(&[0.0, 0.25, 0.5], PairChunk::all(2), &silent).unwrap();
        // no line is called at both markers of pair (0, 1)
        assert_floats_eq(result.row(1).to_vec().as_slice(), &[0.0, 0.0, 0.0], 1e-15);
        assert!(result.row(0).iter().all(|v| *v < 0.0));
    }

    #[test]
    fn test_weights_and_strategies() {
        let finals = f2_finals(&[
            vec![Some(1), Some(1)],
            vec![Some(2), Some(2)],
            vec![Some(3), Some(3)],
        ]);
        let weighted = prepare(&finals, Some(vec![2.0, 1.0, 1.0]));
        let result = weighted.estimate(&[0.0], PairChunk { start: 1, count: 1 }, &silent).unwrap();
        assert_float_eq(result[[0, 0]], 3.0 * ln(0.25) + ln(0.5), 1e-10);

        let rfs = [0.0, 0.05, 0.2, 0.5];
        let counting = prepare(&finals, None).with_strategy(Strategy::Counting);
        let direct = prepare(&finals, None).with_strategy(Strategy::Direct);
        let a = counting.estimate(&rfs, PairChunk::all(2), &silent).unwrap();
        let b = direct.estimate(&rfs, PairChunk::all(2), &silent).unwrap();
        assert_floats_eq(a.as_slice().unwrap(), b.as_slice().unwrap(), 1e-10);
    }

    #[test]
    fn test_chunks_and_repeat_runs() {
        let finals = f2_finals(&[
            vec![Some(1), Some(3)],
            vec![Some(2), Some(2)],
            vec![Some(3), Some(1)],
        ]);
        let design = prepare(&finals, None);
        let rfs = [0.01, 0.1, 0.3];
        let full = design.estimate(&rfs, PairChunk::all(2), &silent).unwrap();
        let again = design.estimate(&rfs, PairChunk::all(2), &silent).unwrap();
        assert_floats_eq(full.as_slice().unwrap(), again.as_slice().unwrap(), 1e-12);

        let tail = design.estimate(&rfs, PairChunk { start: 1, count: 2 }, &silent).unwrap();
        assert_floats_eq(
            tail.as_slice().unwrap(),
            &full.as_slice().unwrap()[rfs.len()..],
            1e-12,
        );

        // values are added into the caller's buffer
        let mut buffer = vec![1.0; rfs.len()];
        design
            .estimate_into(&rfs, PairChunk { start: 1, count: 1 }, &mut buffer, &silent)
            .unwrap();
        for (value, expected) in buffer.iter().zip(full.row(1).iter()) {
            assert_float_eq(*value, expected + 1.0, 1e-12);
        }
    }

    #[test]
    fn test_progress_ends_with_chunk_size() {
        let finals = f2_finals(&[vec![Some(1), Some(1)]]);
        let design = prepare(&finals, None);
        let seen = Mutex::new(Vec::new());
        let callback = |count: u64| seen.lock().unwrap().push(count);
        design.estimate(&[0.1], PairChunk::all(2), &callback).unwrap();
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.last(), Some(&3));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_invalid_requests() {
        let finals = f2_finals(&[vec![Some(1), Some(1)]]);
        let design = prepare(&finals, None);
        assert!(matches!(
            design.estimate(&[0.2, 0.6], PairChunk::all(2), &silent),
            Err(EstimateError::InvalidRecombinationFraction(r)) if r == 0.6
        ));
        assert!(matches!(
            design.estimate(&[0.2], PairChunk { start: 2, count: 2 }, &silent),
            Err(EstimateError::ChunkOutOfRange { total: 3, .. })
        ));
        let mut short = vec![0.0; 2];
        assert!(matches!(
            design.estimate_into(&[0.2], PairChunk::all(2), &mut short, &silent),
            Err(EstimateError::ResultBufferSize { expected: 3, actual: 2 })
        ));
        assert!(design.estimate(&[], PairChunk::all(2), &silent).is_err());
    }

    #[test]
    fn test_invalid_designs() {
        let finals = f2_finals(&[vec![Some(1), Some(1)]]);
        let three = GenotypeMatrix::from_rows(
            &["A", "B", "C"],
            &[vec![Some(1), Some(1)], vec![Some(2), Some(2)], vec![Some(1), Some(2)]],
        )
        .unwrap();
        let result = PreparedDesign::new(
            &three,
            &finals,
            &f2_pedigree(),
            &hets(),
            None,
            EstimateConfig::default(),
        );
        assert!(matches!(result, Err(EstimateError::UnsupportedFounderCount(3))));
        let outcome = Outcome::from_result(&result);
        assert!(!outcome.success);
        assert!(outcome.error.contains("2 or 4"));

        let mut many = hets();
        many[1].extend((0..10).map(|code| HetEntry::new(1, 2, 100 + code)));
        let result = PreparedDesign::new(
            &founders(),
            &finals,
            &f2_pedigree(),
            &many,
            None,
            EstimateConfig::default(),
        );
        assert!(matches!(
            result,
            Err(EstimateError::AlleleCountExceeded { count: 13, .. })
        ));

        let stranger = GenotypeMatrix::from_rows(&["X"], &[vec![Some(1), Some(1)]]).unwrap();
        let result = PreparedDesign::new(
            &founders(),
            &stranger,
            &f2_pedigree(),
            &hets(),
            None,
            EstimateConfig::default(),
        );
        assert!(matches!(result, Err(EstimateError::PedigreeInconsistency(_))));

        let result = PreparedDesign::new(
            &founders(),
            &finals,
            &f2_pedigree(),
            &hets(),
            Some(vec![1.0, 1.0]),
            EstimateConfig::default(),
        );
        assert!(matches!(result, Err(EstimateError::DimensionMismatch(_))));
    }

    #[test]
    fn test_infinite_selfing() {
        let finals = f2_finals(&[
            vec![Some(1), Some(1)],
            vec![Some(2), Some(2)],
            vec![Some(3), Some(3)],
        ]);
        let mut pedigree = f2_pedigree();
        pedigree.selfing = SelfingMode::Infinite;
        let design = PreparedDesign::new(
            &founders(),
            &finals,
            &pedigree,
            &hets(),
            None,
            EstimateConfig::default(),
        )
        .unwrap();
        assert_eq!(design.warnings().len(), 1);
        assert!(design.warnings()[0].contains("2 heterozygous calls"));
        let result = design.estimate(&[0.0, 0.5], PairChunk { start: 1, count: 1 }, &silent).unwrap();
        assert_float_eq(result[[0, 0]], 2.0 * ln(0.5), 1e-10);
        assert_float_eq(result[[0, 1]], 2.0 * ln(0.25), 1e-10);
    }

    #[test]
    fn test_four_founders() {
        let founders = GenotypeMatrix::from_rows(
            &["A", "B", "C", "D"],
            &[
                vec![Some(1), Some(1)],
                vec![Some(1), Some(2)],
                vec![Some(2), Some(1)],
                vec![Some(2), Some(2)],
            ],
        )
        .unwrap();
        let names: Vec<String> = ["A", "B", "C", "D", "AB", "CD", "ABCD", "S1"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let pedigree = Pedigree::new(
            names,
            vec![0, 0, 0, 0, 1, 3, 5, 7],
            vec![0, 0, 0, 0, 2, 4, 6, 7],
            SelfingMode::Finite,
        );
        let finals = GenotypeMatrix::from_rows(
            &["ABCD", "S1"],
            &[vec![Some(3), Some(1)], vec![Some(1), Some(1)]],
        )
        .unwrap();
        let design = PreparedDesign::new(
            &founders,
            &finals,
            &pedigree,
            &hets(),
            None,
            EstimateConfig::default(),
        )
        .unwrap();
        assert_eq!(design.n_founders(), 4);
        assert!(design.lookup_table_bytes(2) > 0);
        let result = design.estimate(&[0.1, 0.5], PairChunk::all(2), &silent).unwrap();
        assert!(result.iter().all(|v| v.is_finite() && *v < 0.0));
    }
}
