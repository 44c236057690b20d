//! Classification of final lines by how they descend from the founders.
//!
//! Every final line is traced back through its pedigree: first through the
//! selfing generations (rows whose mother and father are the same line), then
//! through the crossing generations down to a founder. The initial
//! `log2(nFounders)` crossing generations only combine the founders into a
//! funnel; any crossing generations beyond that are intercrossing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Diagnostics;
use crate::numeric::{log2_exact, search_sorted, SearchResult};

/// Whether the final lines were selfed a known number of times, or to
/// fixation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelfingMode {
    #[default]
    Finite,
    Infinite,
}

/// A breeding pedigree. Parents are 1-based row references, with 0 meaning
/// "no parent" (a founder).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pedigree {
    pub line_names: Vec<String>,
    pub mother: Vec<usize>,
    pub father: Vec<usize>,
    pub selfing: SelfingMode,
}

impl Pedigree {
    pub fn new(
        line_names: Vec<String>,
        mother: Vec<usize>,
        father: Vec<usize>,
        selfing: SelfingMode,
    ) -> Self {
        Self {
            line_names,
            mother,
            father,
            selfing,
        }
    }

    pub fn len(&self) -> usize {
        self.line_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.line_names.is_empty()
    }

    pub fn is_founder(&self, row: usize) -> bool {
        self.mother[row] == 0 && self.father[row] == 0
    }

    /// Convert a 1-based parent reference to a row index.
    fn parent_row(&self, reference: usize) -> Option<usize> {
        if reference == 0 || reference > self.len() {
            None
        } else {
            Some(reference - 1)
        }
    }
}

/// How a single final line descends from the founders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// Crossing generations after the funnel generations.
    pub intercrossing: u32,
    pub selfing: u32,
    /// The founder indices in funnel order. Only present when
    /// `intercrossing == 0`.
    pub funnel: Option<Vec<usize>>,
}

/// Pedigree line names sorted once for logarithmic lookup.
struct SortedLines<'a> {
    names: Vec<&'a str>,
    rows: Vec<usize>,
}

impl<'a> SortedLines<'a> {
    fn new(pedigree: &'a Pedigree) -> Self {
        let mut order: Vec<usize> = (0..pedigree.len()).collect();
        order.sort_by(|&a, &b| pedigree.line_names[a].cmp(&pedigree.line_names[b]));
        Self {
            names: order
                .iter()
                .map(|&row| pedigree.line_names[row].as_str())
                .collect(),
            rows: order,
        }
    }

    fn find(&self, name: &str) -> Option<usize> {
        match search_sorted(&self.names, name) {
            SearchResult::Exact(idx) => Some(self.rows[idx]),
            _ => None,
        }
    }

    fn duplicates(&self) -> impl Iterator<Item = &&'a str> {
        self.names
            .windows(2)
            .filter(|pair| pair[0] == pair[1])
            .map(|pair| &pair[0])
    }
}

/// Classify every final line by intercrossing generations, selfing
/// generations and (for lines without intercrossing) founder funnel.
///
/// All problems found are collected into a [`Diagnostics`] list capped at
/// `max_messages`; no partial classification is returned.
pub fn classify(
    pedigree: &Pedigree,
    final_names: &[String],
    founder_names: &[String],
    max_messages: usize,
) -> Result<Vec<Classification>, Diagnostics> {
    let mut errors = Diagnostics::new(max_messages);
    if pedigree.mother.len() != pedigree.len() || pedigree.father.len() != pedigree.len() {
        errors.push(format!(
            "Pedigree has {} lines but {} mothers and {} fathers",
            pedigree.len(),
            pedigree.mother.len(),
            pedigree.father.len()
        ));
        return Err(errors);
    }
    let funnel_depth = match log2_exact(founder_names.len()) {
        Some(depth) => depth,
        None => {
            errors.push(format!(
                "Number of founders ({}) must be a power of two",
                founder_names.len()
            ));
            return Err(errors);
        }
    };

    let lines = SortedLines::new(pedigree);
    for name in lines.duplicates() {
        errors.push(format!("Line name '{}' appears more than once in the pedigree", name));
    }
    let founder_index: HashMap<&str, usize> = founder_names
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();

    let mut classifications = Vec::with_capacity(final_names.len());
    for name in final_names {
        match classify_line(pedigree, &lines, &founder_index, funnel_depth, name) {
            Ok(classification) => classifications.push(classification),
            Err(message) => errors.push(message),
        }
    }

    if errors.is_empty() {
        Ok(classifications)
    } else {
        Err(errors)
    }
}

fn classify_line(
    pedigree: &Pedigree,
    lines: &SortedLines,
    founder_index: &HashMap<&str, usize>,
    funnel_depth: u32,
    name: &str,
) -> Result<Classification, String> {
    let mut row = lines
        .find(name)
        .ok_or_else(|| format!("Line '{}' was not found in the pedigree", name))?;
    let out_of_range = |row: usize| {
        format!(
            "Line '{}' has a parent reference outside the pedigree",
            pedigree.line_names[row]
        )
    };

    // selfing generations
    let mut selfing = 0;
    while pedigree.mother[row] == pedigree.father[row] {
        if pedigree.mother[row] == 0 {
            return Err(format!(
                "Line '{}' is a founder, not a descendant of the founders",
                name
            ));
        }
        row = pedigree
            .parent_row(pedigree.mother[row])
            .ok_or_else(|| out_of_range(row))?;
        selfing += 1;
        if selfing as usize > pedigree.len() {
            return Err(format!("Pedigree of line '{}' contains a cycle", name));
        }
    }
    let funnel_root = row;

    // crossing generations, including the ones building the funnel
    let mut crosses = 0;
    while pedigree.mother[row] > 0 {
        row = pedigree
            .parent_row(pedigree.mother[row])
            .ok_or_else(|| out_of_range(row))?;
        crosses += 1;
        if crosses > pedigree.len() {
            return Err(format!("Pedigree of line '{}' contains a cycle", name));
        }
    }
    let intercrossing = (crosses as u32).checked_sub(funnel_depth).ok_or_else(|| {
        format!(
            "Line '{}' has {} crossing generations, fewer than the {} needed to combine the founders",
            name, crosses, funnel_depth
        )
    })?;

    let funnel = if intercrossing == 0 {
        let funnel = funnel_below(pedigree, founder_index, funnel_root, funnel_depth)
            .map_err(|e| format!("Line '{}': {}", name, e))?;
        Some(funnel)
    } else {
        // the parent lines' funnels must be just as well formed
        let mut level = vec![funnel_root];
        for _ in 0..intercrossing {
            let mut parents = Vec::with_capacity(2 * level.len());
            for row in level {
                for parent in [pedigree.mother[row], pedigree.father[row]] {
                    parents.push(pedigree.parent_row(parent).ok_or_else(|| out_of_range(row))?);
                }
            }
            parents.sort_unstable();
            parents.dedup();
            level = parents;
        }
        for row in level {
            funnel_below(pedigree, founder_index, row, funnel_depth)
                .map_err(|e| format!("Line '{}': {}", name, e))?;
        }
        None
    };

    Ok(Classification {
        intercrossing,
        selfing,
        funnel,
    })
}

/// The funnel of the line at `row`: `2^depth` distinct founders.
fn funnel_below(
    pedigree: &Pedigree,
    founder_index: &HashMap<&str, usize>,
    row: usize,
    depth: u32,
) -> Result<Vec<usize>, String> {
    let mut funnel = Vec::with_capacity(1 << depth);
    collect_funnel(pedigree, founder_index, row, depth, &mut funnel)?;
    let mut distinct = funnel.clone();
    distinct.sort_unstable();
    distinct.dedup();
    if distinct.len() != funnel.len() {
        return Err(format!(
            "funnel of '{}' has a repeated founder",
            pedigree.line_names[row]
        ));
    }
    Ok(funnel)
}

/// Append the founders below `row` in order, mother's side first.
fn collect_funnel(
    pedigree: &Pedigree,
    founder_index: &HashMap<&str, usize>,
    row: usize,
    depth: u32,
    funnel: &mut Vec<usize>,
) -> Result<(), String> {
    let line = &pedigree.line_names[row];
    if depth == 0 {
        if !pedigree.is_founder(row) {
            return Err(format!("funnel line '{}' is not a founder", line));
        }
        let founder = founder_index
            .get(line.as_str())
            .ok_or_else(|| format!("founder '{}' has no genotype data", line))?;
        funnel.push(*founder);
        return Ok(());
    }
    let parents = [pedigree.mother[row], pedigree.father[row]];
    for parent in parents {
        let parent_row = pedigree
            .parent_row(parent)
            .ok_or_else(|| format!("funnel line '{}' is missing a parent", line))?;
        collect_funnel(pedigree, founder_index, parent_row, depth - 1, funnel)?;
    }
    Ok(())
}
