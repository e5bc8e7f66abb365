// Size accounting (spec §3 "size accounting").

use std::ops::Sub;

/// Sizes a pair contributes to the evictor-wide counters. All fields are
/// summed into `Evictor`'s running totals; `is_valid` gates whether a
/// callback's returned attr should actually be applied (flush/partial-fetch
/// callbacks may decline to report a new size).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PairAttr {
    pub size: i64,
    pub nonleaf_size: i64,
    pub leaf_size: i64,
    pub rollback_size: i64,
    /// Zeroed for any pair currently being removed, so the cleaner skips
    /// it (spec §3 invariant, spec §4.5).
    pub cache_pressure_size: i64,
    pub is_valid: bool,
}

impl PairAttr {
    pub fn new(size: i64) -> Self {
        Self {
            size,
            cache_pressure_size: size,
            is_valid: true,
            ..Default::default()
        }
    }

    /// Delta applied to evictor-wide counters when this attr replaces `old`.
    pub fn delta(&self, old: &PairAttr) -> PairAttrDelta {
        PairAttrDelta {
            size: self.size - old.size,
            cache_pressure_size: self.cache_pressure_size - old.cache_pressure_size,
        }
    }

    /// A zeroed-out attr used the instant a pair begins removal (spec §3:
    /// "`cache_pressure_size = 0` for any pair currently being removed").
    pub fn zeroed_for_removal(&self) -> Self {
        Self {
            cache_pressure_size: 0,
            ..*self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairAttrDelta {
    pub size: i64,
    pub cache_pressure_size: i64,
}

impl Sub for PairAttr {
    type Output = PairAttrDelta;
    fn sub(self, rhs: PairAttr) -> PairAttrDelta {
        self.delta(&rhs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionCost {
    Cheap,
    Expensive,
}
