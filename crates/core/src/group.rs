//! Run-length grouping of a sorted sequence, used by rarest-first piece ranking to turn an
//! availability-sorted candidate list into availability buckets without a second allocation pass.

use itertools::Itertools;

/// Groups consecutive equal elements of `items`, preserving input order. Each returned pair is
/// the element and how many times it repeated in that run; the counts sum to `items.len()`.
pub fn group<T: PartialEq>(items: impl IntoIterator<Item = T>) -> Vec<(T, usize)> {
    items
        .into_iter()
        .dedup_by_with_count(|a, b| a == b)
        .map(|(count, item)| (item, count))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_runs_in_input_order() {
        let input = vec![1, 1, 1, 2, 2, 3, 1, 1];
        let groups = group(input.clone());
        assert_eq!(groups, vec![(1, 3), (2, 2), (3, 1), (1, 2)]);
        assert_eq!(
            groups.iter().map(|(_, c)| c).sum::<usize>(),
            input.len()
        );
    }

    #[test]
    fn empty_input_groups_to_nothing() {
        let groups = group(Vec::<u32>::new());
        assert!(groups.is_empty());
    }

    #[test]
    fn sorted_input_groups_by_equal_runs() {
        let input = vec![0u32, 0, 0, 1, 2, 2];
        let groups = group(input.clone());
        let total: usize = groups.iter().map(|(_, c)| *c).sum();
        assert_eq!(total, input.len());
        assert_eq!(groups, vec![(0, 3), (1, 1), (2, 2)]);
    }
}
