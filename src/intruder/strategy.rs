//! How payload lists are combined into request variants.
//!
//! Every strategy is a pure function of the payload list lengths: the same
//! lengths always give the same count and the same order.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// What a position holds in one variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
  /// The position keeps its base value.
  Base,
  /// The `index`-th payload of position `list`'s set.
  Payload {
    /// Which position's set the payload comes from.
    list: usize,
    /// Index into that set.
    index: usize,
  },
}

/// Attack strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackStrategy {
  /// Sweep one position at a time, in declaration order, through its own
  /// set while the others keep their base value.
  Sniper,
  /// Put each payload of the first set into every position at once.
  BatteringRam,
  /// Variant `k` takes the `k`-th payload of every set; stops at the
  /// shortest.
  Pitchfork,
  /// Every combination, the last position varying fastest.
  ClusterBomb,
}

impl AttackStrategy {
  /// Number of variants for positions with these set lengths, or `None`
  /// when it does not fit in a `usize`.
  pub fn count(&self, lengths: &[usize]) -> Option<usize> {
    if lengths.is_empty() {
      return Some(0);
    }
    match self {
      AttackStrategy::Sniper => lengths
        .iter()
        .try_fold(0usize, |total, len| total.checked_add(*len)),
      AttackStrategy::BatteringRam => Some(lengths[0]),
      AttackStrategy::Pitchfork => lengths.iter().copied().min(),
      AttackStrategy::ClusterBomb if lengths.contains(&0) => Some(0),
      AttackStrategy::ClusterBomb => lengths
        .iter()
        .try_fold(1usize, |total, len| total.checked_mul(*len)),
    }
  }

  /// The slots of variant `index`, or `None` past the end.
  pub fn combination_at(&self, lengths: &[usize], index: usize) -> Option<Vec<Slot>> {
    if index >= self.count(lengths)? {
      return None;
    }
    let slots = match self {
      AttackStrategy::Sniper => {
        let mut remaining = index;
        let mut slots = vec![Slot::Base; lengths.len()];
        for (position, len) in lengths.iter().enumerate() {
          if remaining < *len {
            slots[position] = Slot::Payload {
              list: position,
              index: remaining,
            };
            break;
          }
          remaining -= len;
        }
        slots
      }
      AttackStrategy::BatteringRam => vec![Slot::Payload { list: 0, index }; lengths.len()],
      AttackStrategy::Pitchfork => (0..lengths.len())
        .map(|list| Slot::Payload { list, index })
        .collect(),
      AttackStrategy::ClusterBomb => {
        let mut remaining = index;
        let mut slots = vec![Slot::Base; lengths.len()];
        for (position, len) in lengths.iter().enumerate().rev() {
          slots[position] = Slot::Payload {
            list: position,
            index: remaining % len,
          };
          remaining /= len;
        }
        slots
      }
    };
    Some(slots)
  }

  /// All variants in enumeration order.
  pub fn combinations<'a>(&'a self, lengths: &'a [usize]) -> impl Iterator<Item = Vec<Slot>> + 'a {
    (0..self.count(lengths).unwrap_or(0)).filter_map(move |index| self.combination_at(lengths, index))
  }

  /// The name used in configuration and logs.
  pub fn name(&self) -> &'static str {
    match self {
      AttackStrategy::Sniper => "sniper",
      AttackStrategy::BatteringRam => "battering_ram",
      AttackStrategy::Pitchfork => "pitchfork",
      AttackStrategy::ClusterBomb => "cluster_bomb",
    }
  }
}

impl fmt::Display for AttackStrategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

impl FromStr for AttackStrategy {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
      "sniper" => Ok(AttackStrategy::Sniper),
      "battering_ram" | "batteringram" => Ok(AttackStrategy::BatteringRam),
      "pitchfork" => Ok(AttackStrategy::Pitchfork),
      "cluster_bomb" | "clusterbomb" => Ok(AttackStrategy::ClusterBomb),
      other => Err(Error::config(format!("unknown attack strategy: {}", other))),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use AttackStrategy::*;

  fn picks(strategy: AttackStrategy, lengths: &[usize]) -> Vec<Vec<Slot>> {
    strategy.combinations(lengths).collect()
  }

  fn p(list: usize, index: usize) -> Slot {
    Slot::Payload { list, index }
  }

  #[test]
  fn counts() {
    assert_eq!(Sniper.count(&[2, 3]), Some(5));
    assert_eq!(BatteringRam.count(&[4, 1, 9]), Some(4));
    assert_eq!(Pitchfork.count(&[3, 5]), Some(3));
    assert_eq!(ClusterBomb.count(&[3, 4]), Some(12));
    assert_eq!(ClusterBomb.count(&[3, 0]), Some(0));
    for strategy in [Sniper, BatteringRam, Pitchfork, ClusterBomb] {
      assert_eq!(strategy.count(&[]), Some(0));
      assert_eq!(Some(picks(strategy, &[2, 3]).len()), strategy.count(&[2, 3]));
    }
  }

  #[test]
  fn oversized_counts_do_not_wrap() {
    assert_eq!(ClusterBomb.count(&[10_000; 5]), None);
    assert_eq!(Sniper.count(&[usize::MAX, 1]), None);
    assert_eq!(ClusterBomb.count(&[usize::MAX, usize::MAX, 0]), Some(0));
    assert_eq!(ClusterBomb.combination_at(&[10_000; 5], 0), None);
    assert_eq!(ClusterBomb.combinations(&[10_000; 5]).count(), 0);
  }

  #[test]
  fn sniper_sweeps_one_position_at_a_time() {
    assert_eq!(
      picks(Sniper, &[2, 1]),
      vec![
        vec![p(0, 0), Slot::Base],
        vec![p(0, 1), Slot::Base],
        vec![Slot::Base, p(1, 0)],
      ]
    );
  }

  #[test]
  fn sniper_skips_empty_sets() {
    assert_eq!(picks(Sniper, &[0, 1]), vec![vec![Slot::Base, p(1, 0)]]);
  }

  #[test]
  fn battering_ram_shares_first_set() {
    assert_eq!(
      picks(BatteringRam, &[2, 7]),
      vec![vec![p(0, 0), p(0, 0)], vec![p(0, 1), p(0, 1)]]
    );
  }

  #[test]
  fn pitchfork_walks_in_lockstep() {
    assert_eq!(
      picks(Pitchfork, &[3, 2]),
      vec![vec![p(0, 0), p(1, 0)], vec![p(0, 1), p(1, 1)]]
    );
  }

  #[test]
  fn cluster_bomb_is_row_major() {
    assert_eq!(
      picks(ClusterBomb, &[2, 2]),
      vec![
        vec![p(0, 0), p(1, 0)],
        vec![p(0, 0), p(1, 1)],
        vec![p(0, 1), p(1, 0)],
        vec![p(0, 1), p(1, 1)],
      ]
    );
    assert_eq!(ClusterBomb.combination_at(&[3, 4], 11), Some(vec![p(0, 2), p(1, 3)]));
    assert_eq!(ClusterBomb.combination_at(&[3, 4], 12), None);
  }

  #[test]
  fn names_round_trip() {
    for strategy in [Sniper, BatteringRam, Pitchfork, ClusterBomb] {
      assert_eq!(strategy.to_string().parse::<AttackStrategy>().unwrap(), strategy);
    }
    assert_eq!("Cluster-Bomb".parse::<AttackStrategy>().unwrap(), ClusterBomb);
    assert!("shotgun".parse::<AttackStrategy>().is_err());
  }
}
