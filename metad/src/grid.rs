//! Regular grids over collective-variable space.
//!
//! A [`Grid`] discretizes the (scalar) collective variables into `nx[i]` bins
//! per dimension and stores `mult` values per bin in one flat, row-major
//! buffer; the last dimension varies fastest. The energy and gradient
//! specializations live in [`crate::scalar_grid`] and
//! [`crate::gradient_grid`].

use crate::colvar::{Colvar, ValueKind};
use crate::convert;
use crate::error::{Error, Result};
use crate::parse::Tokens;
use serde::{Deserialize, Serialize};
use std::io::Write;

/// One dimension of a [`Grid`].
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct GridAxis {
    lower: f64,
    width: f64,
    bins: usize,
    periodic: bool,
}

impl GridAxis {
    /// Discretizes `[lower, upper]` into `round((upper-lower)/width)` bins.
    /// The effective width is re-derived after rounding so that
    /// `width == (upper - lower) / bins` holds exactly. With `margin` set,
    /// non-periodic axes get one extra bin on each end.
    ///
    /// # Errors
    ///
    /// Returns an input error for a non-positive width or unordered
    /// boundaries.
    pub fn new(lower: f64, upper: f64, width: f64, periodic: bool, margin: bool) -> Result<Self> {
        if width <= 0.0 || upper <= lower {
            return Err(Error::Input(format!(
                "cannot discretize [{lower}, {upper}] with bin width {width}"
            )));
        }
        let bins = convert::usize_from_f64(((upper - lower) / width).round()).max(1);
        let width = (upper - lower) / convert::f64_from_usize(bins);
        let mut axis = Self {
            lower,
            width,
            bins,
            periodic,
        };
        if margin && !periodic {
            axis = axis.expanded(1, 1);
        }
        Ok(axis)
    }

    /// Returns this axis grown by whole bins on either side.
    #[must_use]
    pub fn expanded(&self, extra_lower: usize, extra_upper: usize) -> Self {
        Self {
            lower: convert::f64_from_usize(extra_lower).mul_add(-self.width, self.lower),
            width: self.width,
            bins: self.bins + extra_lower + extra_upper,
            periodic: self.periodic,
        }
    }

    /// The lower boundary.
    #[must_use]
    pub const fn lower(&self) -> f64 {
        self.lower
    }

    /// The upper boundary.
    #[must_use]
    pub fn upper(&self) -> f64 {
        convert::f64_from_usize(self.bins).mul_add(self.width, self.lower)
    }

    /// The bin spacing.
    #[must_use]
    pub const fn width(&self) -> f64 {
        self.width
    }

    /// The number of bins.
    #[must_use]
    pub const fn bins(&self) -> usize {
        self.bins
    }

    /// Whether the axis wraps around.
    #[must_use]
    pub const fn periodic(&self) -> bool {
        self.periodic
    }

    /// Signed bin index of `value`; periodic axes wrap modulo the bin count,
    /// non-periodic axes keep the out-of-range index as a sentinel.
    #[must_use]
    pub fn bin_of(&self, value: f64) -> isize {
        let bin = convert::isize_from_f64(((value - self.lower) / self.width).floor());
        if self.periodic {
            let bins = isize::try_from(self.bins).unwrap_or(isize::MAX);
            bin.rem_euclid(bins)
        } else {
            bin
        }
    }

    /// Center-of-bin convention: the value represented by bin `bin`.
    #[must_use]
    pub fn bin_center(&self, bin: usize) -> f64 {
        (convert::f64_from_usize(bin) + 0.5).mul_add(self.width, self.lower)
    }
}

/// Regular N-dimensional grid with `mult` scalars per bin.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Grid {
    axes: Vec<GridAxis>,
    mult: usize,
    data: Vec<f64>,
}

impl Grid {
    /// Builds a grid over the given collective variables. Axes inherit each
    /// variable's boundaries, width and periodicity; variables with the
    /// expand-boundaries flag get a one-bin margin on each end.
    ///
    /// # Errors
    ///
    /// Returns an input error when any collective variable is not scalar or
    /// its boundaries cannot be discretized.
    pub fn new(colvars: &[Colvar], mult: usize) -> Result<Self> {
        let axes = colvars
            .iter()
            .map(|cv| {
                if cv.kind() == ValueKind::Scalar {
                    GridAxis::new(
                        cv.lower_boundary(),
                        cv.upper_boundary(),
                        cv.width(),
                        cv.is_periodic(),
                        cv.expand_boundaries(),
                    )
                } else {
                    Err(Error::Input(format!(
                        "colvar {} is not scalar and cannot be put on a grid",
                        cv.name()
                    )))
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::from_axes(axes, mult))
    }

    /// Builds an empty grid from explicit axes.
    #[must_use]
    pub fn from_axes(axes: Vec<GridAxis>, mult: usize) -> Self {
        let len = axes.iter().map(GridAxis::bins).product::<usize>() * mult;
        Self {
            axes,
            mult,
            data: vec![0.0; len],
        }
    }

    /// The axes of this grid.
    #[must_use]
    pub fn axes(&self) -> &[GridAxis] {
        &self.axes
    }

    /// The number of dimensions.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.axes.len()
    }

    /// The number of scalars per bin.
    #[must_use]
    pub const fn mult(&self) -> usize {
        self.mult
    }

    /// The total number of bins.
    #[must_use]
    pub fn num_bins(&self) -> usize {
        self.axes.iter().map(GridAxis::bins).product()
    }

    /// The raw row-major data.
    #[must_use]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Whether `other` covers the same region with the same binning.
    #[must_use]
    pub fn same_shape(&self, other: &Self) -> bool {
        self.mult == other.mult && self.axes == other.axes
    }

    #[allow(clippy::cast_sign_loss)]
    fn flat_index(&self, ix: &[isize]) -> usize {
        debug_assert!(self.index_ok(ix));
        self.axes
            .iter()
            .zip(ix)
            .fold(0, |acc, (axis, &i)| acc * axis.bins() + i as usize)
            * self.mult
    }

    /// Per-dimension discretization of a point; periodic axes wrap,
    /// non-periodic axes keep out-of-range indices as sentinels.
    #[must_use]
    pub fn bin_of(&self, values: &[f64]) -> Vec<isize> {
        debug_assert_eq!(values.len(), self.ndim());
        self.axes
            .iter()
            .zip(values)
            .map(|(axis, &v)| axis.bin_of(v))
            .collect()
    }

    /// Whether `ix` addresses a bin inside the grid.
    #[must_use]
    pub fn index_ok(&self, ix: &[isize]) -> bool {
        ix.len() == self.ndim()
            && self
                .axes
                .iter()
                .zip(ix)
                .all(|(axis, &i)| i >= 0 && i < isize::try_from(axis.bins()).unwrap_or(isize::MAX))
    }

    /// The collective-variable value at the center of bin `bin` along
    /// dimension `dim`.
    #[must_use]
    pub fn bin_to_value(&self, bin: usize, dim: usize) -> f64 {
        self.axes[dim].bin_center(bin)
    }

    /// Starting index for a row-major sweep.
    #[must_use]
    pub fn first_index(&self) -> Vec<isize> {
        vec![0; self.ndim()]
    }

    /// Advances `ix` to the row-major successor (last dimension fastest).
    /// The end of the sweep is signaled by an index failing
    /// [`Self::index_ok`].
    pub fn incr(&self, ix: &mut [isize]) {
        for dim in (0..self.ndim()).rev() {
            ix[dim] += 1;
            if ix[dim] < isize::try_from(self.axes[dim].bins()).unwrap_or(isize::MAX) {
                return;
            }
            if dim > 0 {
                ix[dim] = 0;
            }
        }
    }

    /// Reads slot `slot` of the bin at `ix`.
    #[must_use]
    pub fn value_slot(&self, ix: &[isize], slot: usize) -> f64 {
        debug_assert!(slot < self.mult);
        self.data[self.flat_index(ix) + slot]
    }

    /// Writes slot `slot` of the bin at `ix`.
    pub fn set_value_slot(&mut self, ix: &[isize], slot: usize, value: f64) {
        debug_assert!(slot < self.mult);
        let index = self.flat_index(ix);
        self.data[index + slot] = value;
    }

    /// Adds `delta` to slot `slot` of the bin at `ix`.
    pub fn acc_value_slot(&mut self, ix: &[isize], slot: usize, delta: f64) {
        debug_assert!(slot < self.mult);
        let index = self.flat_index(ix);
        self.data[index + slot] += delta;
    }

    /// All slots of the bin at `ix`.
    #[must_use]
    pub fn bin_slots(&self, ix: &[isize]) -> &[f64] {
        let index = self.flat_index(ix);
        &self.data[index..index + self.mult]
    }

    /// Multiplies every stored value by `factor`.
    pub fn multiply_constant(&mut self, factor: f64) {
        for x in &mut self.data {
            *x *= factor;
        }
    }

    /// Adds `delta` to every stored value.
    pub fn add_constant(&mut self, delta: f64) {
        for x in &mut self.data {
            *x += delta;
        }
    }

    /// Accumulates `factor * other` into `self`.
    ///
    /// # Errors
    ///
    /// Returns a bug error when the shapes differ.
    pub fn add_grid(&mut self, other: &Self, factor: f64) -> Result<()> {
        if !self.same_shape(other) {
            return Err(Error::Bug(
                "cannot add grids of different shapes".to_owned(),
            ));
        }
        for (lhs, rhs) in self.data.iter_mut().zip(&other.data) {
            *lhs += factor * rhs;
        }
        Ok(())
    }

    /// Minimum over the non-periodic dimensions of the distance, in bins,
    /// from `values` to the nearest grid edge. The signed variant goes
    /// negative outside the grid; the unsigned variant clamps at zero.
    /// Returns infinity when every dimension is periodic.
    #[must_use]
    pub fn bin_distance_from_boundaries(&self, values: &[f64], signed: bool) -> f64 {
        debug_assert_eq!(values.len(), self.ndim());
        let mut minimum = f64::INFINITY;
        for (axis, &v) in self.axes.iter().zip(values) {
            if axis.periodic() {
                continue;
            }
            let position = (v - axis.lower()) / axis.width();
            let distance = position.min(convert::f64_from_usize(axis.bins()) - position);
            minimum = minimum.min(distance);
        }
        if signed {
            minimum
        } else {
            minimum.max(0.0)
        }
    }

    /// Copies the overlapping region of `src` into `self` by mapping bin
    /// centers; bins of `self` without a counterpart keep their value. Used
    /// when boundaries grow and after a restart with a changed
    /// configuration.
    #[allow(clippy::cast_sign_loss)]
    pub fn map_grid(&mut self, src: &Self) {
        debug_assert_eq!(self.ndim(), src.ndim());
        debug_assert_eq!(self.mult, src.mult);
        let mut ix = self.first_index();
        let mut centers = vec![0.0; self.ndim()];
        while self.index_ok(&ix) {
            for (dim, (center, &i)) in centers.iter_mut().zip(&ix).enumerate() {
                *center = self.bin_to_value(i as usize, dim);
            }
            let src_ix = src.bin_of(&centers);
            if src.index_ok(&src_ix) {
                let from = src.flat_index(&src_ix);
                let to = self.flat_index(&ix);
                self.data[to..to + self.mult].copy_from_slice(&src.data[from..from + self.mult]);
            }
            self.incr(&mut ix);
        }
    }

    /// Writes this grid as a named text block: per-axis header lines, then
    /// the row-major data.
    ///
    /// # Errors
    ///
    /// Returns an error when writing fails.
    pub fn write_block(&self, mut writer: impl Write, name: &str) -> Result<()> {
        writeln!(writer, "{name} {{")?;
        writeln!(writer, "  dimensions {}", self.ndim())?;
        writeln!(writer, "  mult {}", self.mult)?;
        for axis in &self.axes {
            writeln!(
                writer,
                "  axis {:.14e} {:.14e} {} {}",
                axis.lower(),
                axis.width(),
                axis.bins(),
                u8::from(axis.periodic())
            )?;
        }
        writeln!(writer, "  data")?;
        for chunk in self.data.chunks(5) {
            let row = chunk
                .iter()
                .map(|x| format!("{x:.14e}"))
                .collect::<Vec<_>>()
                .join(" ");
            writeln!(writer, "  {row}")?;
        }
        writeln!(writer, "}}")?;
        Ok(())
    }

    /// Reads a grid block whose name token has already been consumed.
    pub(crate) fn read_block(tokens: &mut Tokens<'_>) -> Result<Self> {
        tokens.expect("{")?;
        tokens.expect("dimensions")?;
        let ndim = tokens.next_usize()?;
        tokens.expect("mult")?;
        let mult = tokens.next_usize()?;
        let mut axes = Vec::with_capacity(ndim);
        for _ in 0..ndim {
            tokens.expect("axis")?;
            let lower = tokens.next_f64()?;
            let width = tokens.next_f64()?;
            let bins = tokens.next_usize()?;
            let periodic = tokens.next_bool()?;
            axes.push(GridAxis {
                lower,
                width,
                bins,
                periodic,
            });
        }
        tokens.expect("data")?;
        let mut grid = Self::from_axes(axes, mult);
        for slot in &mut grid.data {
            *slot = tokens.next_f64()?;
        }
        tokens.expect("}")?;
        Ok(grid)
    }
}
