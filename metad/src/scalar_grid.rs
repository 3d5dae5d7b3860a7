//! Scalar-valued grid specialization storing one energy value per bin.

use crate::colvar::Colvar;
use crate::convert;
use crate::error::{Error, Result};
use crate::grid::Grid;
use crate::parse::Tokens;
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Grid accumulating one scalar (an energy or a probability density) per
/// bin.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ScalarGrid {
    grid: Grid,
}

impl ScalarGrid {
    /// Builds an empty scalar grid over the given collective variables.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Grid::new`].
    pub fn new(colvars: &[Colvar]) -> Result<Self> {
        Ok(Self {
            grid: Grid::new(colvars, 1)?,
        })
    }

    /// Wraps an existing grid.
    ///
    /// # Errors
    ///
    /// Returns a bug error unless the grid stores exactly one scalar per
    /// bin.
    pub fn from_grid(grid: Grid) -> Result<Self> {
        if grid.mult() == 1 {
            Ok(Self { grid })
        } else {
            Err(Error::Bug(format!(
                "scalar grid requires mult = 1, found {}",
                grid.mult()
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

    /// Reads the value of the bin at `ix`.
    #[must_use]
    pub fn value(&self, ix: &[isize]) -> f64 {
        self.grid.value_slot(ix, 0)
    }

    /// Adds `delta` to the bin at `ix`.
    pub fn acc_value(&mut self, ix: &[isize], delta: f64) {
        self.grid.acc_value_slot(ix, 0, delta);
    }

    /// The largest stored value.
    #[must_use]
    pub fn maximum_value(&self) -> f64 {
        self.grid.data().iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    /// The smallest stored value.
    #[must_use]
    pub fn minimum_value(&self) -> f64 {
        self.grid.data().iter().copied().fold(f64::INFINITY, f64::min)
    }

    /// The smallest strictly positive stored value, or zero when no entry is
    /// positive.
    #[must_use]
    pub fn minimum_pos_value(&self) -> f64 {
        let minimum = self
            .grid
            .data()
            .iter()
            .copied()
            .filter(|&x| x > 0.0)
            .fold(f64::INFINITY, f64::min);
        if minimum.is_finite() {
            minimum
        } else {
            0.0
        }
    }

    fn volume_element(&self) -> f64 {
        self.grid.axes().iter().map(|axis| axis.width()).product()
    }

    /// The integral of the stored function over collective-variable space.
    #[must_use]
    pub fn integral(&self) -> f64 {
        self.volume_element() * self.grid.data().iter().sum::<f64>()
    }

    /// The differential entropy `-∫ p ln p`, restricted to strictly positive
    /// entries.
    #[must_use]
    pub fn entropy(&self) -> f64 {
        self.volume_element()
            * self
                .grid
                .data()
                .iter()
                .filter(|&&x| x > 0.0)
                .map(|&x| -x * x.ln())
                .sum::<f64>()
    }

    /// Replaces every entry below `threshold` with `threshold`.
    pub fn remove_small_values(&mut self, threshold: f64) {
        for x in self.grid.data_mut() {
            if *x < threshold {
                *x = threshold;
            }
        }
    }

    /// Multiplies every entry by `factor`.
    pub fn multiply_constant(&mut self, factor: f64) {
        self.grid.multiply_constant(factor);
    }

    /// Adds `delta` to every entry.
    pub fn add_constant(&mut self, delta: f64) {
        self.grid.add_constant(delta);
    }

    /// Accumulates `factor * other` into `self`.
    ///
    /// # Errors
    ///
    /// Returns a bug error when the shapes differ.
    pub fn add_grid(&mut self, other: &Self, factor: f64) -> Result<()> {
        self.grid.add_grid(&other.grid, factor)
    }

    /// Projects the stored entries onto the probability simplex
    /// (Wang & Carreira-Perpiñán). Zero entries stay zero; the shift is
    /// computed from and applied to the non-zero support.
    pub fn simplexproj(&mut self) {
        let mut support: Vec<f64> = self
            .grid
            .data()
            .iter()
            .copied()
            .filter(|&x| x != 0.0)
            .collect();
        if support.is_empty() {
            return;
        }
        support.sort_unstable_by(|a, b| b.total_cmp(a));
        let mut cumulative = 0.0;
        let mut shift = 0.0;
        for (i, &entry) in support.iter().enumerate() {
            cumulative += entry;
            let candidate = (1.0 - cumulative) / convert::f64_from_usize(i + 1);
            if entry + candidate > 0.0 {
                shift = candidate;
            }
        }
        for x in self.grid.data_mut() {
            if *x != 0.0 {
                *x = (*x + shift).max(0.0);
            }
        }
    }

    /// Writes the grid in multicolumn text form: commented shape headers,
    /// then one row per bin with all bin-center values and the stored
    /// scalar. A blank line separates consecutive slices of the slowest
    /// dimensions, which keeps the output plottable directly.
    ///
    /// # Errors
    ///
    /// Returns an error when writing fails.
    pub fn write_multicol(&self, mut writer: impl Write) -> Result<()> {
        writeln!(writer, "# {}", self.grid.ndim())?;
        for axis in self.grid.axes() {
            writeln!(
                writer,
                "# {:.14e} {:.14e} {} {}",
                axis.lower(),
                axis.width(),
                axis.bins(),
                u8::from(axis.periodic())
            )?;
        }
        let last = self.grid.ndim() - 1;
        let mut ix = self.grid.first_index();
        while self.grid.index_ok(&ix) {
            let mut row = String::new();
            for (dim, &i) in ix.iter().enumerate() {
                #[allow(clippy::cast_sign_loss)]
                let center = self.grid.bin_to_value(i as usize, dim);
                row.push_str(&format!("{center:.9e} "));
            }
            writeln!(writer, "{row}{:.14e}", self.value(&ix))?;
            self.grid.incr(&mut ix);
            if self.grid.ndim() > 1 && self.grid.index_ok(&ix) && ix[last] == 0 {
                writeln!(writer)?;
            }
        }
        Ok(())
    }

    /// Fills this grid from multicolumn text: each row carries the
    /// collective-variable values followed by the scalar. Rows outside the
    /// grid are ignored; comment headers are skipped.
    ///
    /// # Errors
    ///
    /// Returns a parse error on a malformed row.
    pub fn read_multicol(&mut self, src: &str) -> Result<()> {
        let mut tokens = Tokens::new(src);
        let ndim = self.grid.ndim();
        let mut values = vec![0.0; ndim];
        while tokens.peek().is_some() {
            for value in &mut values {
                *value = tokens.next_f64()?;
            }
            let scalar = tokens.next_f64()?;
            let ix = self.grid.bin_of(&values);
            if self.grid.index_ok(&ix) {
                self.grid.set_value_slot(&ix, 0, scalar);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    fn one_dim() -> ScalarGrid {
        let cv = vec![Colvar::scalar("x", 0.25, 0.0, 1.0).unwrap()];
        ScalarGrid::new(&cv).unwrap()
    }

    #[test]
    fn extrema_and_integral() {
        let mut grid = one_dim();
        grid.acc_value(&[0], 2.0);
        grid.acc_value(&[1], -1.0);
        grid.acc_value(&[2], 0.5);
        assert_approx_eq!(f64, grid.maximum_value(), 2.0, ulps = 2);
        assert_approx_eq!(f64, grid.minimum_value(), -1.0, ulps = 2);
        assert_approx_eq!(f64, grid.minimum_pos_value(), 0.5, ulps = 2);
        assert_approx_eq!(f64, grid.integral(), 0.25 * 1.5, ulps = 4);
    }

    #[test]
    fn entropy_skips_non_positive_entries() {
        let mut grid = one_dim();
        grid.acc_value(&[0], 2.0);
        grid.acc_value(&[1], -3.0);
        let expected = 0.25 * (-2.0 * 2.0_f64.ln());
        assert_approx_eq!(f64, grid.entropy(), expected, ulps = 4);
    }

    #[test]
    fn remove_small_values_clamps_from_below() {
        let mut grid = one_dim();
        grid.acc_value(&[0], 0.8);
        grid.remove_small_values(0.1);
        assert_approx_eq!(f64, grid.value(&[0]), 0.8, ulps = 2);
        assert_approx_eq!(f64, grid.value(&[1]), 0.1, ulps = 2);
    }

    #[test]
    fn simplexproj_reference_case() {
        let mut grid = one_dim();
        for (bin, value) in [0.6, 0.3, 0.2, 0.1].into_iter().enumerate() {
            grid.acc_value(&[isize::try_from(bin).unwrap()], value);
        }
        grid.simplexproj();
        let projected: Vec<f64> = grid.grid().data().to_vec();
        assert_approx_eq!(f64, projected.iter().sum::<f64>(), 1.0, ulps = 8);
        for (a, b) in [(0.55, projected[0]), (0.25, projected[1]), (0.15, projected[2]), (0.05, projected[3])] {
            assert_approx_eq!(f64, a, b, ulps = 8);
        }
        // ordering is preserved and entries stay non-negative
        assert!(projected.windows(2).all(|w| w[0] >= w[1]));
        assert!(projected.iter().all(|&x| x >= 0.0));
    }

    #[test]
    fn multicol_round_trip() {
        let mut grid = one_dim();
        grid.acc_value(&[0], 1.25);
        grid.acc_value(&[3], -0.5);
        let mut buffer = Vec::new();
        grid.write_multicol(&mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let mut read = one_dim();
        read.read_multicol(&text).unwrap();
        for (a, b) in grid.grid().data().iter().zip(read.grid().data()) {
            assert_approx_eq!(f64, *a, *b, ulps = 2);
        }
    }
}
