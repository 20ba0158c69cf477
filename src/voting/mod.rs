pub mod irv;

use std::collections::HashSet;
use thiserror::Error;

pub use irv::{tabulate, tabulate_with_rng, TabulationError};

/// A ranking that does not name every candidate of the election exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid ballot (unknown: {unknown:?}, duplicate: {duplicate:?}, missing: {missing:?})")]
pub struct BallotError {
    pub unknown: Vec<String>,
    pub duplicate: Vec<String>,
    pub missing: Vec<String>,
}

/// Checks that `ranking` is a permutation of `candidates`.
pub fn validate_ranking(candidates: &[String], ranking: &[String]) -> Result<(), BallotError> {
    let known: HashSet<&str> = candidates.iter().map(String::as_str).collect();
    let mut seen: HashSet<&str> = HashSet::with_capacity(ranking.len());
    let mut unknown = Vec::new();
    let mut duplicate = Vec::new();

    for business_id in ranking {
        if !known.contains(business_id.as_str()) {
            unknown.push(business_id.clone());
        } else if !seen.insert(business_id.as_str()) {
            duplicate.push(business_id.clone());
        }
    }

    let missing: Vec<String> = candidates
        .iter()
        .filter(|business_id| !seen.contains(business_id.as_str()))
        .cloned()
        .collect();

    if unknown.is_empty() && duplicate.is_empty() && missing.is_empty() {
        Ok(())
    } else {
        Err(BallotError {
            unknown,
            duplicate,
            missing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn accepts_any_permutation() {
        let candidates = ids(&["a", "b", "c"]);
        assert_eq!(validate_ranking(&candidates, &ids(&["c", "a", "b"])), Ok(()));
    }

    #[test]
    fn names_every_offending_candidate() {
        let candidates = ids(&["a", "b", "c"]);
        let err = validate_ranking(&candidates, &ids(&["a", "a", "z"])).unwrap_err();
        assert_eq!(err.unknown, ids(&["z"]));
        assert_eq!(err.duplicate, ids(&["a"]));
        assert_eq!(err.missing, ids(&["b", "c"]));
    }

    #[test]
    fn empty_ranking_misses_everyone() {
        let candidates = ids(&["a", "b"]);
        let err = validate_ranking(&candidates, &[]).unwrap_err();
        assert_eq!(err.missing, candidates);
        assert!(err.unknown.is_empty());
    }
}
