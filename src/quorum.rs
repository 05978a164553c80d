//! Quorum arithmetic and the commit index calculation.

/// Get the majority of a cluster of `n` voting members.
pub fn majority_of(n: usize) -> usize {
    (n / 2) + 1
}

/// The quorum position for commit: the index into the descending-sorted
/// matched indices such that `quorum_for_commit(n) + 1` voters holding an
/// index makes it committed.
pub fn quorum_for_commit(voting_members: usize) -> usize {
    voting_members / 2
}

/// Determine the cluster-wide committed index from the matched indices of all
/// voting members.
///
/// - `matched`: the highest log index known to be replicated on each voting
///   member, one element per member, **including the leader itself**.
/// - `quorum_idx`: the quorum position as returned by [`quorum_for_commit`]
///   for the same member set.
///
/// The vector is sorted in descending order and the element at `quorum_idx`
/// is the highest index already held by a majority. E.g. with matched indices
/// `100 100 99 95 92` and `quorum_idx == 2`, the committed index is `99`.
pub fn committed_index(mut matched: Vec<u64>, quorum_idx: usize) -> u64 {
    debug_assert!(quorum_idx < matched.len());
    matched.sort_unstable_by(|a, b| b.cmp(a));
    matched[quorum_idx]
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    mod majority {
        use super::*;

        #[test]
        fn test_majority_of() {
            assert_eq!(majority_of(1), 1);
            assert_eq!(majority_of(2), 2);
            assert_eq!(majority_of(3), 2);
            assert_eq!(majority_of(4), 3);
            assert_eq!(majority_of(5), 3);
        }

        #[test]
        fn test_quorum_for_commit() {
            assert_eq!(quorum_for_commit(1), 0);
            assert_eq!(quorum_for_commit(2), 1);
            assert_eq!(quorum_for_commit(3), 1);
            assert_eq!(quorum_for_commit(4), 2);
            assert_eq!(quorum_for_commit(5), 2);
        }
    }

    mod committed_index {
        use super::*;

        macro_rules! test_committed_index {
            ($name:ident, $expected:literal, $quorum_idx:literal, $matched:expr) => {
                #[test]
                fn $name() {
                    let matched: Vec<u64> = $matched;
                    let output = committed_index(matched.clone(), $quorum_idx);
                    assert_eq!(output, $expected, "matched: {:?}", matched);
                }
            };
        }

        test_committed_index!(single_member_commits_its_own_index, 7, 0, vec![7]);

        test_committed_index!(five_members_majority, 99, 2, vec![100, 100, 99, 95, 92]);

        test_committed_index!(unsorted_input_is_sorted_descending, 99, 2, vec![95, 100, 92, 99, 100]);

        test_committed_index!(three_members_one_lagging, 10, 1, vec![10, 10, 2]);

        test_committed_index!(all_members_equal, 42, 2, vec![42, 42, 42, 42, 42]);

        test_committed_index!(even_member_count_requires_strict_majority, 0, 2, vec![100, 100, 0, 0]);
    }
}
