use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// The number of parallel hardware units cooperating along each axis.
///
/// A [Grid] is used both for the MME-level cooperation grid and for each operand's port grid.
/// [Grid::default] is the unset grid `{0, 0, 1}`: fcd and spatial are zero and batch keeps its
/// default of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Grid {
    pub fcd: u32,
    pub spatial: u32,
    pub batch: u32,
}

impl Grid {
    pub const ONE: Grid = Grid::with_batch(1, 1, 1);

    pub const fn new(fcd: u32, spatial: u32) -> Self {
        Grid::with_batch(fcd, spatial, 1)
    }

    pub const fn with_batch(fcd: u32, spatial: u32, batch: u32) -> Self {
        Grid {
            fcd,
            spatial,
            batch,
        }
    }

    pub fn volume(&self) -> u32 {
        self.fcd * self.spatial * self.batch
    }

    pub fn is_unset(&self) -> bool {
        *self == Grid::default()
    }

    /// Returns `true` if every axis has at least one unit.
    pub fn is_populated(&self) -> bool {
        self.fcd >= 1 && self.spatial >= 1 && self.batch >= 1
    }

    /// Returns the coordinates of the `idx`-th unit of this grid.
    ///
    /// Batch varies fastest, then fcd, then spatial. Returns `None` if `idx` is not smaller than
    /// [Grid::volume].
    pub fn idx_to_grid(&self, idx: u32) -> Option<Grid> {
        if idx >= self.volume() {
            return None;
        }
        let mut cur = idx;
        let batch = cur % self.batch;
        cur /= self.batch;
        let fcd = cur % self.fcd;
        cur /= self.fcd;
        let spatial = cur % self.spatial;
        debug_assert_eq!(cur / self.spatial, 0);
        Some(Grid::with_batch(fcd, spatial, batch))
    }
}

impl Default for Grid {
    fn default() -> Self {
        Grid::with_batch(0, 0, 1)
    }
}

impl Display for Grid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.fcd, self.spatial, self.batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_default_grid_is_unset_with_unit_batch() {
        let g = Grid::default();
        assert_eq!((g.fcd, g.spatial, g.batch), (0, 0, 1));
        assert!(g.is_unset());
        assert!(!g.is_populated());
        assert!(Grid::ONE.is_populated());
    }

    #[test]
    fn test_idx_to_grid_orders_batch_fastest() {
        let g = Grid::with_batch(2, 3, 2);
        assert_eq!(g.idx_to_grid(0), Some(Grid::with_batch(0, 0, 0)));
        assert_eq!(g.idx_to_grid(1), Some(Grid::with_batch(0, 0, 1)));
        assert_eq!(g.idx_to_grid(2), Some(Grid::with_batch(1, 0, 0)));
        assert_eq!(g.idx_to_grid(4), Some(Grid::with_batch(0, 1, 0)));
        assert_eq!(g.idx_to_grid(11), Some(Grid::with_batch(1, 2, 1)));
        assert_eq!(g.idx_to_grid(12), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Grid::new(4, 2).to_string(), "4x2x1");
    }

    proptest! {
        #[test]
        fn test_idx_to_grid_is_a_bijection(fcd in 1u32..5, spatial in 1u32..5, batch in 1u32..5) {
            let g = Grid::with_batch(fcd, spatial, batch);
            let coords = (0..g.volume())
                .map(|i| g.idx_to_grid(i).unwrap())
                .collect::<Vec<_>>();
            prop_assert!(coords
                .iter()
                .all(|c| c.fcd < fcd && c.spatial < spatial && c.batch < batch));
            let unique: HashSet<_> = coords.iter().collect();
            prop_assert_eq!(unique.len(), coords.len());
            let expected = (0..spatial)
                .cartesian_product(0..fcd)
                .cartesian_product(0..batch)
                .map(|((s, f), b)| Grid::with_batch(f, s, b))
                .collect::<Vec<_>>();
            prop_assert_eq!(coords, expected);
        }
    }
}
