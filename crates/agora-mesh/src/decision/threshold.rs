//! Quorum arithmetic for decisions.
//!
//! A decision passes when the affirmative fraction of the expected votes
//! reaches the target consensus. The default target is 2/3: with three
//! members two yes votes pass, one does not.

/// Default fraction of affirmative votes required to act.
pub const DEFAULT_TARGET_CONSENSUS: f64 = 2.0 / 3.0;

/// Fraction of affirmative votes. Zero expected votes yield zero.
///
/// # Examples
///
/// ```
/// use agora_mesh::decision::consensus_ratio;
///
/// assert_eq!(consensus_ratio(2, 4), 0.5);
/// assert_eq!(consensus_ratio(0, 0), 0.0);
/// ```
pub fn consensus_ratio(affirmative: usize, expected: usize) -> f64 {
    if expected == 0 {
        return 0.0;
    }
    affirmative as f64 / expected as f64
}

/// Check if `affirmative` out of `expected` votes reach `target`.
pub fn meets_consensus(affirmative: usize, expected: usize, target: f64) -> bool {
    expected > 0 && consensus_ratio(affirmative, expected) >= target
}

/// Minimum number of affirmative votes out of `expected` that reach `target`.
pub fn votes_needed(expected: usize, target: f64) -> usize {
    (0..=expected)
        .find(|&yes| meets_consensus(yes, expected, target))
        .unwrap_or(expected + 1)
}
