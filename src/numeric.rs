use num_traits::Float;
use std::{cmp::Ordering, fmt::Display};

/// Assert two float values are the same up to `eps`.
///
/// Two NaNs compare equal, as do two infinities of the same sign.
#[allow(dead_code)]
pub fn assert_float_eq<T>(left: T, right: T, eps: T)
where
    T: Float + Display,
{
    if left.is_nan() {
        assert!(right.is_nan(), "left is NaN, but right is not");
    } else if left.is_infinite() {
        assert!(left == right, "left is {}, but right is {}", left, right);
    } else {
        let diff = (left - right).abs();
        assert!(
            diff < eps,
            "values |{} - {}| ≥ {} (diff: {})",
            left,
            right,
            eps,
            diff
        );
    }
}

/// Assert two float slices are the same up to `eps`.
#[allow(dead_code)]
pub fn assert_floats_eq<T>(left: &[T], right: &[T], eps: T)
where
    T: Float + Display,
{
    assert_eq!(left.len(), right.len());
    for (l, r) in left.iter().zip(right.iter()) {
        assert_float_eq(*l, *r, eps)
    }
}

/// Whether a log-probability marks an impossible event: either the log of
/// zero, or a value that isn't a number at all.
pub fn is_log_zero<T: Float>(log_prob: T) -> bool {
    log_prob.is_nan() || log_prob == T::neg_infinity()
}

/// Natural log of a probability; only an exact zero maps to negative
/// infinity, however small a nonzero probability is.
pub fn ln_prob<T: Float>(prob: T) -> T {
    if prob == T::zero() {
        T::neg_infinity()
    } else {
        prob.ln()
    }
}

/// Integer base-2 logarithm of a power of two.
pub fn log2_exact(value: usize) -> Option<u32> {
    if value.is_power_of_two() {
        Some(value.trailing_zeros())
    } else {
        None
    }
}

#[derive(Debug, PartialEq)]
pub enum SearchResult {
    Exact(usize),
    LowerBound(usize),
    UpperBound(usize),
    LeftOf(usize),
}

/// Binary search over a sorted slice.
pub fn search_sorted<T: PartialOrd>(vec: &[T], new_val: T) -> SearchResult {
    let mut left = 0;
    let mut right = vec.len();
    while left < right {
        let mid = left + (right - left) / 2;

        match vec[mid].partial_cmp(&new_val) {
            Some(Ordering::Less) => left = mid + 1,
            Some(Ordering::Greater) | None => right = mid,
            Some(Ordering::Equal) => return SearchResult::Exact(mid),
        }
    }

    if left == 0 {
        SearchResult::LowerBound(left)
    } else if left < vec.len() {
        SearchResult::LeftOf(left)
    } else {
        SearchResult::UpperBound(left)
    }
}
