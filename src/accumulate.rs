//! Parallel accumulation of per-line log-likelihoods over marker pairs.
//!
//! Each marker pair owns `n_rf` consecutive cells of the result buffer, one
//! per candidate recombination fraction. The buffer is cut into contiguous
//! blocks of pairs and every block is processed by a single worker, which
//! seeds a [`TriangularIterator`] at the block start and walks forward. No
//! cell is ever written by two workers.

use ndarray::ArrayView2;
use rayon::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::numeric::is_log_zero;
use crate::patterns::PatternId;
use crate::table::{PairEntry, ProbabilityTable};
use crate::triangular::TriangularIterator;

/// A running log-likelihood sum in which an impossible observation absorbs
/// every other contribution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogLikelihood {
    Finite(f64),
    Impossible,
}

impl Default for LogLikelihood {
    fn default() -> Self {
        LogLikelihood::Finite(0.0)
    }
}

impl LogLikelihood {
    /// Add `weight` copies of an observation with log-probability `log_prob`.
    pub fn add(&mut self, log_prob: f64, weight: f64) {
        if is_log_zero(log_prob) {
            *self = LogLikelihood::Impossible;
        } else if let LogLikelihood::Finite(sum) = self {
            *sum += weight * log_prob;
        }
    }

    /// Accumulate into a result cell; impossible cells become `-inf`.
    pub fn add_to(self, cell: &mut f64) {
        match self {
            LogLikelihood::Finite(sum) => *cell += sum,
            LogLikelihood::Impossible => *cell = f64::NEG_INFINITY,
        }
    }
}

/// How the lines' contributions are summed for a marker pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Every line separately, multiplied by its weight.
    Direct,
    /// Lines are first counted by (code, code, category key); only valid
    /// when every weight is 1.
    Counting,
}

impl Strategy {
    pub fn for_weights(weights: &[f64]) -> Self {
        if weights.iter().all(|&w| w == 1.0) {
            Strategy::Counting
        } else {
            Strategy::Direct
        }
    }
}

/// Per-worker scratch space for [`Strategy::Counting`].
#[derive(Debug, Clone)]
pub struct CountingScratch {
    histogram: Vec<u32>,
    occupied: Vec<usize>,
}

impl CountingScratch {
    pub fn new(len: usize) -> Self {
        Self {
            histogram: vec![0; len],
            occupied: Vec::new(),
        }
    }
}

/// Everything needed to compute the cells of one marker pair.
pub struct PairKernel<'a, const A: usize> {
    table: &'a ProbabilityTable<A>,
    /// Recoded calls, markers × lines.
    finals: ArrayView2<'a, Option<u8>>,
    pattern_ids: &'a [PatternId],
    /// Category key of every line.
    keys: &'a [usize],
    weights: &'a [f64],
    n_rf: usize,
}

impl<'a, const A: usize> PairKernel<'a, A> {
    pub fn new(
        table: &'a ProbabilityTable<A>,
        finals: ArrayView2<'a, Option<u8>>,
        pattern_ids: &'a [PatternId],
        keys: &'a [usize],
        weights: &'a [f64],
        n_rf: usize,
    ) -> Self {
        Self {
            table,
            finals,
            pattern_ids,
            keys,
            weights,
            n_rf,
        }
    }

    pub fn histogram_len(&self) -> usize {
        A * A * self.table.n_keys()
    }

    fn entry(&self, m1: usize, m2: usize) -> (&'a PairEntry<A>, bool) {
        self.table
            .entry(self.pattern_ids[m1], self.pattern_ids[m2])
    }

    /// Lines called at both markers, as `(line, code1, code2)` with the codes
    /// in the order of the stored pattern pair.
    fn observed(
        &self,
        m1: usize,
        m2: usize,
        swap: bool,
    ) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
        let calls1 = self.finals.row(m1);
        let calls2 = self.finals.row(m2);
        calls1
            .into_iter()
            .zip(calls2)
            .enumerate()
            .filter_map(move |(line, (&c1, &c2))| {
                let (c1, c2) = (c1? as usize, c2? as usize);
                Some(if swap { (line, c2, c1) } else { (line, c1, c2) })
            })
    }

    /// Sum every line's weighted contribution separately.
    pub fn direct(&self, m1: usize, m2: usize, cells: &mut [f64]) {
        let (entry, swap) = self.entry(m1, m2);
        for (rf, cell) in cells.iter_mut().enumerate().take(self.n_rf) {
            let mut sum = LogLikelihood::default();
            for (line, c1, c2) in self.observed(m1, m2, swap) {
                let key = self.keys[line];
                if entry.is_allowable(key) {
                    sum.add(entry.log_probs(rf, key)[c1][c2], self.weights[line]);
                }
            }
            sum.add_to(cell);
        }
    }

    /// Count lines by (code, code, key), then add `count × log-probability`
    /// per occupied histogram cell.
    pub fn counting(&self, m1: usize, m2: usize, scratch: &mut CountingScratch, cells: &mut [f64]) {
        let (entry, swap) = self.entry(m1, m2);
        let n_keys = self.table.n_keys();
        for &idx in &scratch.occupied {
            scratch.histogram[idx] = 0;
        }
        scratch.occupied.clear();
        for (line, c1, c2) in self.observed(m1, m2, swap) {
            let idx = (c1 * A + c2) * n_keys + self.keys[line];
            if scratch.histogram[idx] == 0 {
                scratch.occupied.push(idx);
            }
            scratch.histogram[idx] += 1;
        }

        for (rf, cell) in cells.iter_mut().enumerate().take(self.n_rf) {
            let mut sum = LogLikelihood::default();
            for &idx in &scratch.occupied {
                let key = idx % n_keys;
                if !entry.is_allowable(key) {
                    continue;
                }
                let (c1, c2) = ((idx / n_keys) / A, (idx / n_keys) % A);
                sum.add(
                    entry.log_probs(rf, key)[c1][c2],
                    scratch.histogram[idx] as f64,
                );
            }
            sum.add_to(cell);
        }
    }
}

/// Completed-pair counter shared by all workers.
///
/// Only the pool's worker 0 calls back into the host, on every
/// `interval`-th pair it completes, so the callback never runs concurrently
/// with itself.
pub struct Progress<'a> {
    completed: AtomicU64,
    reporter_ticks: AtomicU64,
    interval: u64,
    callback: &'a (dyn Fn(u64) + Sync),
}

impl<'a> Progress<'a> {
    pub fn new(interval: u64, callback: &'a (dyn Fn(u64) + Sync)) -> Self {
        Self {
            completed: AtomicU64::new(0),
            reporter_ticks: AtomicU64::new(0),
            interval: interval.max(1),
            callback,
        }
    }

    pub fn pair_done(&self) {
        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        if rayon::current_thread_index() == Some(0) {
            let ticks = self.reporter_ticks.fetch_add(1, Ordering::Relaxed) + 1;
            if ticks % self.interval == 0 {
                (self.callback)(completed);
            }
        }
    }

    /// Report the final count; call after all workers have joined.
    pub fn finish(&self) -> u64 {
        let completed = self.completed.load(Ordering::SeqCst);
        (self.callback)(completed);
        completed
    }
}

/// Compute the pairs `start..start + result.len() / n_rf` of an `n_markers`
/// triangle, adding into `result`.
///
/// Must run inside the thread pool whose worker 0 reports progress.
pub fn accumulate<const A: usize>(
    kernel: &PairKernel<'_, A>,
    n_markers: usize,
    start: usize,
    result: &mut [f64],
    strategy: Strategy,
    block_pairs: usize,
    progress: &Progress<'_>,
) {
    let n_rf = kernel.n_rf;
    if n_rf == 0 || result.is_empty() {
        return;
    }
    let block_pairs = block_pairs.max(1);
    let scratch_len = match strategy {
        Strategy::Counting => kernel.histogram_len(),
        Strategy::Direct => 0,
    };
    result
        .par_chunks_mut(block_pairs * n_rf)
        .enumerate()
        .for_each_init(
            || CountingScratch::new(scratch_len),
            |scratch, (block, cells)| {
                let mut cursor = TriangularIterator::at(n_markers, start + block * block_pairs);
                for pair_cells in cells.chunks_mut(n_rf) {
                    let (m1, m2) = cursor.get();
                    match strategy {
                        Strategy::Direct => kernel.direct(m1, m2, pair_cells),
                        Strategy::Counting => kernel.counting(m1, m2, scratch, pair_cells),
                    }
                    progress.pair_done();
                    cursor.advance();
                }
            },
        );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genotypes::HetEntry;
    use crate::numeric::{assert_float_eq, assert_floats_eq};
    use crate::patterns::MarkerPatterns;
    use crate::pedigree::SelfingMode;
    use crate::recode::RecodedData;
    use crate::table::{CategoryLayout, FounderModel, Lineage};
    use crate::triangular::count_pairs;
    use ndarray::Array2;
    use std::sync::Mutex;

    fn codominant() -> Vec<HetEntry<u8>> {
        vec![
            HetEntry::new(0, 0, 0),
            HetEntry::new(1, 1, 1),
            HetEntry::new(0, 1, 2),
            HetEntry::new(1, 0, 2),
        ]
    }

    fn dominant() -> Vec<HetEntry<u8>> {
        vec![
            HetEntry::new(0, 0, 0),
            HetEntry::new(1, 1, 1),
            HetEntry::new(0, 1, 1),
            HetEntry::new(1, 0, 1),
        ]
    }

    struct Fixture {
        table: ProbabilityTable<3>,
        finals: Array2<Option<u8>>,
        pattern_ids: Vec<PatternId>,
        keys: Vec<usize>,
    }

    /// F2 and F3 lines at three markers (codominant, dominant, codominant).
    fn fixture(rfs: &[f64]) -> Fixture {
        let hets = vec![codominant(), dominant(), codominant()];
        let recoded = RecodedData {
            founders: vec![vec![0, 1], vec![1, 0], vec![0, 1]],
            finals: Array2::from_shape_vec(
                (3, 6),
                vec![
                    Some(0), Some(2), Some(1), None, Some(2), Some(0),
                    Some(0), Some(1), Some(0), Some(1), None, Some(1),
                    Some(0), Some(2), Some(1), Some(2), Some(2), Some(1),
                ],
            )
            .unwrap(),
            hets,
            max_alleles: 3,
        };
        let patterns = MarkerPatterns::from_recoded(&recoded);
        let lines: Vec<(Lineage, u32)> = [1, 1, 2, 1, 2, 1]
            .iter()
            .map(|&s| (Lineage::Funnel(0), s))
            .collect();
        let layout = CategoryLayout::new(1, &lines);
        let model = FounderModel {
            n_founders: 2,
            selfing: SelfingMode::Finite,
            funnels: vec![vec![0, 1]],
        };
        let table =
            ProbabilityTable::<3>::build::<2>(&patterns, &layout, &[true, true], &model, rfs);
        Fixture {
            table,
            finals: recoded.finals,
            pattern_ids: patterns.marker_ids().to_vec(),
            keys: lines.iter().map(|&(l, s)| layout.key(l, s)).collect(),
        }
    }

    fn run(fixture: &Fixture, weights: &[f64], strategy: Strategy, n_rf: usize) -> Vec<f64> {
        let kernel = PairKernel::new(
            &fixture.table,
            fixture.finals.view(),
            &fixture.pattern_ids,
            &fixture.keys,
            weights,
            n_rf,
        );
        let mut result = vec![0.0; count_pairs(3) * n_rf];
        let silent = |_: u64| {};
        let progress = Progress::new(10, &silent);
        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        pool.install(|| accumulate(&kernel, 3, 0, &mut result, strategy, 1, &progress));
        result
    }

    #[test]
    fn test_log_likelihood_dominance() {
        let mut sum = LogLikelihood::default();
        sum.add(-1.0, 2.0);
        assert_eq!(sum, LogLikelihood::Finite(-2.0));
        sum.add(f64::NEG_INFINITY, 1.0);
        sum.add(-1.0, 1.0);
        assert_eq!(sum, LogLikelihood::Impossible);
        let mut cell = 3.0;
        sum.add_to(&mut cell);
        assert_eq!(cell, f64::NEG_INFINITY);

        let mut cell = 3.0;
        LogLikelihood::Finite(-1.5).add_to(&mut cell);
        assert_eq!(cell, 1.5);
    }

    #[test]
    fn test_strategy_selection() {
        assert_eq!(Strategy::for_weights(&[1.0, 1.0]), Strategy::Counting);
        assert_eq!(Strategy::for_weights(&[]), Strategy::Counting);
        assert_eq!(Strategy::for_weights(&[1.0, 0.5]), Strategy::Direct);
    }

    #[test]
    fn test_counting_matches_direct() {
        let rfs = [0.0, 0.01, 0.1, 0.25, 0.5];
        let fixture = fixture(&rfs);
        let ones = vec![1.0; 6];
        let direct = run(&fixture, &ones, Strategy::Direct, rfs.len());
        let counting = run(&fixture, &ones, Strategy::Counting, rfs.len());
        assert_floats_eq(&direct, &counting, 1e-10);
        assert!(direct.iter().any(|v| v.is_finite() && *v < 0.0));
    }

    #[test]
    fn test_weights_scale_contributions() {
        let rfs = [0.1, 0.3];
        let fixture = fixture(&rfs);
        let ones = run(&fixture, &[1.0; 6], Strategy::Direct, rfs.len());
        let doubled = run(&fixture, &[2.0; 6], Strategy::Direct, rfs.len());
        for (o, d) in ones.iter().zip(doubled.iter()) {
            assert_float_eq(2.0 * o, *d, 1e-10);
        }
    }

    #[test]
    fn test_swapped_markers_agree() {
        let rfs = [0.0, 0.05, 0.2, 0.5];
        let fixture = fixture(&rfs);
        let ones = vec![1.0; 6];
        let kernel = PairKernel::new(
            &fixture.table,
            fixture.finals.view(),
            &fixture.pattern_ids,
            &fixture.keys,
            &ones,
            rfs.len(),
        );
        for (m1, m2) in [(0, 1), (1, 2), (0, 2)] {
            let mut forward = vec![0.0; rfs.len()];
            let mut backward = vec![0.0; rfs.len()];
            kernel.direct(m1, m2, &mut forward);
            kernel.direct(m2, m1, &mut backward);
            assert_floats_eq(&forward, &backward, 1e-12);
            let mut scratch = CountingScratch::new(kernel.histogram_len());
            let mut counted = vec![0.0; rfs.len()];
            kernel.counting(m2, m1, &mut scratch, &mut counted);
            assert_floats_eq(&forward, &counted, 1e-10);
        }
    }

    #[test]
    fn test_accumulates_into_existing_values() {
        let rfs = [0.2];
        let fixture = fixture(&rfs);
        let once = run(&fixture, &[1.0; 6], Strategy::Counting, 1);
        let kernel = PairKernel::new(
            &fixture.table,
            fixture.finals.view(),
            &fixture.pattern_ids,
            &fixture.keys,
            &[1.0; 6],
            1,
        );
        let mut result = once.clone();
        let silent = |_: u64| {};
        let progress = Progress::new(10, &silent);
        accumulate(&kernel, 3, 0, &mut result, Strategy::Counting, 4, &progress);
        for (o, twice) in once.iter().zip(result.iter()) {
            assert_float_eq(2.0 * o, *twice, 1e-10);
        }
    }

    #[test]
    fn test_progress_reporting() {
        let seen = Mutex::new(Vec::new());
        let callback = |count: u64| seen.lock().unwrap().push(count);
        let progress = Progress::new(3, &callback);
        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        pool.install(|| {
            for _ in 0..10 {
                progress.pair_done();
            }
        });
        assert_eq!(progress.finish(), 10);
        assert_eq!(*seen.lock().unwrap(), vec![3, 6, 9, 10]);
    }
}
