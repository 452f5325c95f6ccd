//! Rank utilities for row ordering
//!
//! Rows are ordered by an integer rank. A drag re-ranks the whole visible
//! sequence to `0..n`, so no two rows ever share a rank after a move.

use std::collections::HashMap;

use crate::traits::Result;
use gridsync_api::{GridError, RankUpdate, RowId};

/// Move the element at `from` to `to` (both indices into the sequence
/// before the move).
pub fn move_index<T>(seq: &mut Vec<T>, from: usize, to: usize) -> Result<()> {
    if from >= seq.len() || to >= seq.len() {
        return Err(GridError::InvalidMove {
            message: format!(
                "cannot move index {} to {} in a sequence of {}",
                from,
                to,
                seq.len()
            ),
        });
    }
    let item = seq.remove(from);
    seq.insert(to, item);
    Ok(())
}

/// Assign each row its position as rank.
pub fn contiguous_ranks(order: &[RowId]) -> Vec<RankUpdate> {
    order
        .iter()
        .enumerate()
        .map(|(position, row_id)| RankUpdate {
            row_id: row_id.clone(),
            rank: position as i64,
        })
        .collect()
}

/// Keep only the updates whose rank differs from the current one.
pub fn changed_ranks(current: &HashMap<RowId, i64>, updates: Vec<RankUpdate>) -> Vec<RankUpdate> {
    updates
        .into_iter()
        .filter(|u| current.get(&u.row_id) != Some(&u.rank))
        .collect()
}

pub fn is_strictly_increasing(ranks: &[i64]) -> bool {
    ranks.windows(2).all(|w| w[0] < w[1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ids(names: &[&str]) -> Vec<RowId> {
        names.iter().map(|n| RowId::from(*n)).collect()
    }

    #[test]
    fn test_move_to_front() {
        let mut order = ids(&["b", "c", "a"]);
        move_index(&mut order, 2, 0).unwrap();
        assert_eq!(order, ids(&["a", "b", "c"]));
    }

    #[test]
    fn test_move_out_of_bounds() {
        let mut order = ids(&["a"]);
        assert!(move_index(&mut order, 0, 1).is_err());
    }

    #[test]
    fn test_changed_ranks_skips_unchanged_rows() {
        let current: HashMap<RowId, i64> =
            [(RowId::from("a"), 0), (RowId::from("b"), 5)].into_iter().collect();
        let changed = changed_ranks(&current, contiguous_ranks(&ids(&["a", "b"])));
        assert_eq!(
            changed,
            vec![RankUpdate {
                row_id: RowId::from("b"),
                rank: 1
            }]
        );
    }

    proptest! {
        #[test]
        fn prop_moves_keep_ranks_total(
            len in 1usize..12,
            moves in prop::collection::vec((0usize..12, 0usize..12), 0..20)
        ) {
            let mut order: Vec<RowId> = (0..len).map(|i| RowId::new(i.to_string())).collect();
            for (from, to) in moves {
                let (from, to) = (from % len, to % len);
                move_index(&mut order, from, to).unwrap();
            }
            let ranks: Vec<i64> = contiguous_ranks(&order).into_iter().map(|u| u.rank).collect();
            prop_assert!(is_strictly_increasing(&ranks));
            prop_assert_eq!(ranks.len(), len);
        }
    }
}
