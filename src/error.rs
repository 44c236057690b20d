use std::fmt;
use thiserror::Error;

/// The default number of messages kept by a [`Diagnostics`] list.
pub const DEFAULT_MESSAGE_CAP: usize = 6;

/// A bounded list of human-readable messages.
///
/// Systematically malformed input tends to produce the same complaint for
/// every line or marker, so only the first `cap` messages are kept and the
/// remainder is counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostics {
    cap: usize,
    messages: Vec<String>,
    suppressed: usize,
}

impl Diagnostics {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            messages: Vec::new(),
            suppressed: 0,
        }
    }

    pub fn push(&mut self, message: impl Into<String>) {
        if self.messages.len() < self.cap {
            self.messages.push(message.into());
        } else {
            self.suppressed += 1;
        }
    }

    /// Number of messages pushed, including suppressed ones.
    pub fn len(&self) -> usize {
        self.messages.len() + self.suppressed
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The retained messages.
    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    /// How many messages were dropped after the cap was reached.
    pub fn suppressed(&self) -> usize {
        self.suppressed
    }

    /// `Ok(())` if nothing was reported, otherwise hands the list to `into_err`.
    pub(crate) fn into_result<F>(self, into_err: F) -> Result<(), EstimateError>
    where
        F: FnOnce(Diagnostics) -> EstimateError,
    {
        if self.is_empty() {
            Ok(())
        } else {
            Err(into_err(self))
        }
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(DEFAULT_MESSAGE_CAP)
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for message in &self.messages {
            writeln!(f, "{}", message)?;
        }
        if self.suppressed > 0 {
            writeln!(f, "Suppressing {} further messages", self.suppressed)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum EstimateError {
    #[error("Number of founders must be 2 or 4, got {0}")]
    UnsupportedFounderCount(usize),
    #[error("Cannot have more than ten alleles per marker (marker '{marker}' has {count})")]
    AlleleCountExceeded { marker: String, count: usize },
    #[error("Pedigree is inconsistent with the final population:\n{0}")]
    PedigreeInconsistency(Diagnostics),
    #[error("Genotype data is inconsistent with the heterozygote table:\n{0}")]
    InvalidCoding(Diagnostics),
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
    #[error("Improper recombination fraction, must lie in [0, 0.5] ({0})")]
    InvalidRecombinationFraction(f64),
    #[error("Pair chunk [{start}, {start} + {count}) exceeds the {total} marker pairs")]
    ChunkOutOfRange {
        start: usize,
        count: usize,
        total: usize,
    },
    #[error("Result buffer has {actual} values but the chunk needs {expected}")]
    ResultBufferSize { expected: usize, actual: usize },
    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Flattened success flag and error text, for hosts that cannot receive a
/// Rust `Result`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub success: bool,
    pub error: String,
}

impl Outcome {
    pub fn from_result<T>(result: &Result<T, EstimateError>) -> Self {
        match result {
            Ok(_) => Self {
                success: true,
                error: String::new(),
            },
            Err(e) => Self {
                success: false,
                error: e.to_string(),
            },
        }
    }
}
