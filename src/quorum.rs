//! Small quorum-arithmetic helpers shared by the candidate and leader roles.

/// The number of votes/acks needed for a majority of `n` members.
pub fn majority_of(n: usize) -> usize {
    (n / 2) + 1
}

/// The median of a set of per-member indices (e.g. `matchIndex`), which is the highest
/// index acknowledged by a majority of members — the standard Raft §5.4.2 commit-index
/// computation. `values` need not be sorted on entry.
pub fn median_index(mut values: Vec<u64>) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.sort_unstable();
    let mid = (values.len() - 1) / 2;
    values[mid]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majority_of_various_sizes() {
        assert_eq!(majority_of(1), 1);
        assert_eq!(majority_of(2), 2);
        assert_eq!(majority_of(3), 2);
        assert_eq!(majority_of(5), 3);
    }

    #[test]
    fn median_index_is_quorum_commit() {
        // Three members: leader implicitly at its own last index, two followers at 5 and 9.
        assert_eq!(median_index(vec![5, 9, 10]), 9);
        assert_eq!(median_index(vec![1, 1, 1, 1, 1]), 1);
        assert_eq!(median_index(vec![]), 0);
    }
}
