//! Gradient-valued grid specialization storing one energy derivative per
//! collective variable and bin.

use crate::colvar::Colvar;
use crate::error::{Error, Result};
use crate::grid::Grid;
use serde::{Deserialize, Serialize};

/// Grid accumulating the gradient of the accumulated hill energy; the bias
/// force along dimension `i` is the negated slot `i`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct GradientGrid {
    grid: Grid,
}

impl GradientGrid {
    /// Builds an empty gradient grid over the given collective variables,
    /// with one slot per variable and bin.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Grid::new`].
    pub fn new(colvars: &[Colvar]) -> Result<Self> {
        Ok(Self {
            grid: Grid::new(colvars, colvars.len())?,
        })
    }

    /// Wraps an existing grid.
    ///
    /// # Errors
    ///
    /// Returns a bug error unless the grid stores one slot per dimension.
    pub fn from_grid(grid: Grid) -> Result<Self> {
        if grid.mult() == grid.ndim() {
            Ok(Self { grid })
        } else {
            Err(Error::Bug(format!(
                "gradient grid requires mult = ndim, found mult {} over {} dimensions",
                grid.mult(),
                grid.ndim()
            )))
        }
    }

    /// The underlying grid.
    #[must_use]
    pub const fn grid(&self) -> &Grid {
        &self.grid
    }

    /// The underlying grid, mutably.
    pub fn grid_mut(&mut self) -> &mut Grid {
        &mut self.grid
    }

    /// The stored gradient vector at `ix`.
    #[must_use]
    pub fn vector_value(&self, ix: &[isize]) -> &[f64] {
        self.grid.bin_slots(ix)
    }

    /// Accumulates a gradient vector into the bin at `ix`.
    pub fn acc_force(&mut self, ix: &[isize], deltas: &[f64]) {
        debug_assert_eq!(deltas.len(), self.grid.mult());
        for (slot, &delta) in deltas.iter().enumerate() {
            self.grid.acc_value_slot(ix, slot, delta);
        }
    }
}
