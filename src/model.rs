//! Two-locus founder genotype distributions.
//!
//! A line's genotype at a pair of markers is an ordered pair of two-locus
//! haplotypes, and a two-locus haplotype is the pair of founders it carries at
//! the first and second marker. With `n` founders there are `n²` haplotypes
//! and `n⁴` genotypes, which is small enough (256 for four founders) to track
//! the exact distribution through every generation of the breeding design:
//!
//!  * a founder is homozygous for its own haplotype;
//!  * a funnel line is the cross of its two half-funnels;
//!  * intercrossing mixes the gamete pool of the population;
//!  * selfing combines two independent gametes of the same line.
//!
//! A gamete of genotype `(h, h')` is `h` or `h'` with probability `(1 - r)/2`
//! each, and one of the two recombinant haplotypes with probability `r/2`
//! each.

/// Heterozygous mass below which selfing counts as complete.
const FIXATION_TOLERANCE: f64 = 1e-15;

/// Safety cap on the number of selfing generations simulated for fixation.
const MAX_FIXATION_GENERATIONS: usize = 1000;

/// A distribution over two-locus haplotypes, indexed by
/// `founder_at_locus_1 * n + founder_at_locus_2`.
pub type Gametes = Vec<f64>;

/// A distribution over ordered pairs of two-locus haplotypes.
#[derive(Debug, Clone, PartialEq)]
pub struct TwoLocus {
    n_founders: usize,
    probs: Vec<f64>,
}

impl TwoLocus {
    fn zeros(n_founders: usize) -> Self {
        let n_haplotypes = n_founders * n_founders;
        Self {
            n_founders,
            probs: vec![0.0; n_haplotypes * n_haplotypes],
        }
    }

    fn n_haplotypes(&self) -> usize {
        self.n_founders * self.n_founders
    }

    fn haplotype(&self, locus1: usize, locus2: usize) -> usize {
        locus1 * self.n_founders + locus2
    }

    /// Split a haplotype index into its founders at the two loci.
    fn founders_of(&self, haplotype: usize) -> (usize, usize) {
        (haplotype / self.n_founders, haplotype % self.n_founders)
    }

    /// A founder line: both haplotypes carry `founder` at both loci.
    pub fn founder(n_founders: usize, founder: usize) -> Self {
        let mut dist = Self::zeros(n_founders);
        let h = dist.haplotype(founder, founder);
        let n_haplotypes = dist.n_haplotypes();
        dist.probs[h * n_haplotypes + h] = 1.0;
        dist
    }

    /// A line formed by two independent gametes.
    pub fn from_gametes(maternal: &[f64], paternal: &[f64]) -> Self {
        let n_haplotypes = maternal.len();
        let n_founders = (n_haplotypes as f64).sqrt().round() as usize;
        let mut probs = Vec::with_capacity(n_haplotypes * n_haplotypes);
        for &m in maternal {
            for &p in paternal {
                probs.push(m * p);
            }
        }
        Self { n_founders, probs }
    }

    /// The last line of a funnel: founders are combined pairwise in funnel
    /// order until a single line remains. `funnel.len()` must be a power of
    /// two.
    pub fn funnel(n_founders: usize, funnel: &[usize], r: f64) -> Self {
        if funnel.len() == 1 {
            return Self::founder(n_founders, funnel[0]);
        }
        let (left, right) = funnel.split_at(funnel.len() / 2);
        let mother = Self::funnel(n_founders, left, r);
        let father = Self::funnel(n_founders, right, r);
        Self::from_gametes(&mother.gametes(r), &father.gametes(r))
    }

    /// Nonzero-probability genotypes, as `(probability, haplotype, haplotype)`.
    fn support(&self) -> impl Iterator<Item = (f64, usize, usize)> + '_ {
        let n_haplotypes = self.n_haplotypes();
        self.probs
            .iter()
            .enumerate()
            .filter(|(_, &p)| p > 0.0)
            .map(move |(idx, &p)| (p, idx / n_haplotypes, idx % n_haplotypes))
    }

    /// The four possible gametes of genotype `(h1, h2)` and their
    /// probabilities.
    fn gametes_of(&self, h1: usize, h2: usize, r: f64) -> [(usize, f64); 4] {
        let (a1, a2) = self.founders_of(h1);
        let (b1, b2) = self.founders_of(h2);
        let parental = (1.0 - r) / 2.0;
        let recombinant = r / 2.0;
        [
            (h1, parental),
            (h2, parental),
            (self.haplotype(a1, b2), recombinant),
            (self.haplotype(b1, a2), recombinant),
        ]
    }

    /// The gamete distribution of this line.
    pub fn gametes(&self, r: f64) -> Gametes {
        let mut gametes = vec![0.0; self.n_haplotypes()];
        for (p, h1, h2) in self.support() {
            for (gamete, q) in self.gametes_of(h1, h2, r) {
                gametes[gamete] += p * q;
            }
        }
        gametes
    }

    /// One generation of self-fertilization.
    pub fn self_once(&self, r: f64) -> Self {
        let n_haplotypes = self.n_haplotypes();
        let mut next = Self::zeros(self.n_founders);
        for (p, h1, h2) in self.support() {
            let gametes = self.gametes_of(h1, h2, r);
            for &(maternal, q1) in &gametes {
                for &(paternal, q2) in &gametes {
                    next.probs[maternal * n_haplotypes + paternal] += p * q1 * q2;
                }
            }
        }
        next
    }

    pub fn self_generations(self, generations: u32, r: f64) -> Self {
        (0..generations).fold(self, |dist, _| dist.self_once(r))
    }

    /// Self until the line is (numerically) fully inbred, then drop the
    /// residual heterozygous states and renormalize.
    pub fn self_to_fixation(self, r: f64) -> Self {
        let mut dist = self;
        for _ in 0..MAX_FIXATION_GENERATIONS {
            if dist.heterozygous_mass() < FIXATION_TOLERANCE {
                break;
            }
            dist = dist.self_once(r);
        }
        let n_haplotypes = dist.n_haplotypes();
        for (idx, p) in dist.probs.iter_mut().enumerate() {
            if idx / n_haplotypes != idx % n_haplotypes {
                *p = 0.0;
            }
        }
        let total = dist.total();
        if total > 0.0 {
            dist.probs.iter_mut().for_each(|p| *p /= total);
        }
        dist
    }

    /// Probability that the two haplotypes differ.
    pub fn heterozygous_mass(&self) -> f64 {
        self.support()
            .filter(|&(_, h1, h2)| h1 != h2)
            .map(|(p, _, _)| p)
            .sum()
    }

    pub fn total(&self) -> f64 {
        self.probs.iter().sum()
    }

    /// Distribution of the observed code pair, given the code displayed by
    /// each ordered founder pair at each marker.
    ///
    /// Returns the probability of every `(code1, code2)` and the mass that
    /// falls on founder genotypes without a code at either marker.
    pub fn observe<const N: usize, const A: usize>(
        &self,
        codes1: &[[Option<u8>; N]; N],
        codes2: &[[Option<u8>; N]; N],
    ) -> ([[f64; A]; A], f64) {
        let mut observed = [[0.0; A]; A];
        let mut unmapped = 0.0;
        for (p, h1, h2) in self.support() {
            let (a1, a2) = self.founders_of(h1);
            let (b1, b2) = self.founders_of(h2);
            match (codes1[a1][b1], codes2[a2][b2]) {
                (Some(c1), Some(c2)) => observed[c1 as usize][c2 as usize] += p,
                _ => unmapped += p,
            }
        }
        (observed, unmapped)
    }
}

/// All orderings of `0..n`.
pub fn permutations(n: usize) -> Vec<Vec<usize>> {
    if n == 0 {
        return vec![Vec::new()];
    }
    let mut result = Vec::new();
    for smaller in permutations(n - 1) {
        for position in 0..=smaller.len() {
            let mut permutation = smaller.clone();
            permutation.insert(position, n - 1);
            result.push(permutation);
        }
    }
    result
}

/// Gamete pools of an intercrossing population, one per generation.
///
/// Pool 0 is the gametes of funnel lines averaged over every funnel. Each
/// intercrossing generation recombines two independent haplotypes from the
/// previous pool, so the pool moves towards linkage equilibrium:
/// `G ← (1 - r) G + r (marginal₁ ⊗ marginal₂)`.
#[derive(Debug, Clone)]
pub struct IntercrossPools {
    pools: Vec<Gametes>,
}

impl IntercrossPools {
    pub fn new(n_founders: usize, generations: u32, r: f64) -> Self {
        let funnels = permutations(n_founders);
        let mut pool = vec![0.0; n_founders * n_founders];
        for funnel in &funnels {
            let gametes = TwoLocus::funnel(n_founders, funnel, r).gametes(r);
            for (total, g) in pool.iter_mut().zip(gametes) {
                *total += g / funnels.len() as f64;
            }
        }
        let mut pools = Vec::with_capacity(generations as usize + 1);
        pools.push(pool);
        for _ in 0..generations {
            let next = Self::mix(pools[pools.len() - 1].as_slice(), n_founders, r);
            pools.push(next);
        }
        Self { pools }
    }

    fn mix(pool: &[f64], n_founders: usize, r: f64) -> Gametes {
        let mut marginal1 = vec![0.0; n_founders];
        let mut marginal2 = vec![0.0; n_founders];
        for (h, &p) in pool.iter().enumerate() {
            marginal1[h / n_founders] += p;
            marginal2[h % n_founders] += p;
        }
        pool.iter()
            .enumerate()
            .map(|(h, &p)| {
                (1.0 - r) * p + r * marginal1[h / n_founders] * marginal2[h % n_founders]
            })
            .collect()
    }

    /// A line of intercrossing generation `generation` (at least 1): two
    /// independent haplotypes from the pool of the previous generation.
    pub fn line(&self, generation: u32) -> TwoLocus {
        let pool = &self.pools[generation as usize - 1];
        TwoLocus::from_gametes(pool, pool)
    }
}
