//! Mirror-hill placement at user-set boundaries, and the interval limits
//! that clip bias forces outside a region of interest.

use crate::colvar::{Colvar, Value};
use crate::error::{Error, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Enumeration mode of the reflection planner.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReflectionType {
    /// Mirror each dimension independently.
    #[default]
    Mono,
    /// Mirror every combination of dimensions, corners included.
    Multi,
}

/// Optional lower/upper limits, one pair per collective variable.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Limits {
    lower: Vec<Option<f64>>,
    upper: Vec<Option<f64>>,
}

impl Limits {
    /// Creates unset limits for `ndim` dimensions.
    #[must_use]
    pub fn new(ndim: usize) -> Self {
        Self {
            lower: vec![None; ndim],
            upper: vec![None; ndim],
        }
    }

    /// Sets the lower limit of dimension `dim`.
    pub fn set_lower(&mut self, dim: usize, limit: f64) {
        self.lower[dim] = Some(limit);
    }

    /// Sets the upper limit of dimension `dim`.
    pub fn set_upper(&mut self, dim: usize, limit: f64) {
        self.upper[dim] = Some(limit);
    }

    /// The lower limit of dimension `dim`, if configured.
    #[must_use]
    pub fn lower(&self, dim: usize) -> Option<f64> {
        self.lower[dim]
    }

    /// The upper limit of dimension `dim`, if configured.
    #[must_use]
    pub fn upper(&self, dim: usize) -> Option<f64> {
        self.upper[dim]
    }

    /// The number of dimensions.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.lower.len()
    }

    /// Whether no limit is configured anywhere.
    #[must_use]
    pub fn is_unset(&self) -> bool {
        self.lower.iter().chain(&self.upper).all(Option::is_none)
    }

    fn side(&self, dim: usize, upper: bool) -> Option<f64> {
        if upper {
            self.upper[dim]
        } else {
            self.lower[dim]
        }
    }
}

/// Plans the mirror hills deposited when the current position approaches a
/// reflection limit.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ReflectionPlanner {
    limits: Limits,
    range: f64,
    kind: ReflectionType,
}

impl ReflectionPlanner {
    /// Creates a planner mirroring within `range` Gaussian widths of each
    /// configured limit.
    ///
    /// # Errors
    ///
    /// Returns an input error for a non-positive range.
    pub fn new(limits: Limits, range: f64, kind: ReflectionType) -> Result<Self> {
        if range <= 0.0 {
            return Err(Error::Input(
                "the reflection range must be positive".to_owned(),
            ));
        }
        Ok(Self {
            limits,
            range,
            kind,
        })
    }

    /// The configured limits.
    #[must_use]
    pub const fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Checks that the grid boundaries leave room for mirrored hills:
    /// `lower_boundary ≤ L − range·σ` below each lower limit, symmetrically
    /// above each upper limit.
    ///
    /// # Errors
    ///
    /// Returns an input error naming the offending collective variable.
    pub fn validate_grid_buffer(&self, colvars: &[Colvar], sigmas: &[f64]) -> Result<()> {
        for (dim, (cv, &sigma)) in colvars.iter().zip(sigmas).enumerate() {
            let buffer = self.range * sigma;
            if let Some(limit) = self.limits.lower(dim) {
                if cv.lower_boundary() > limit - buffer {
                    return Err(Error::Input(format!(
                        "colvar {}: the lower boundary must lie at least {buffer} below the \
                         reflection limit {limit}",
                        cv.name()
                    )));
                }
            }
            if let Some(limit) = self.limits.upper(dim) {
                if cv.upper_boundary() < limit + buffer {
                    return Err(Error::Input(format!(
                        "colvar {}: the upper boundary must lie at least {buffer} above the \
                         reflection limit {limit}",
                        cv.name()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Whether `x` lies beyond any configured limit; deposition is skipped
    /// there.
    #[must_use]
    pub fn outside_limits(&self, x: &[Value]) -> bool {
        (0..self.limits.ndim()).any(|dim| {
            let v = x[dim].components()[0];
            self.limits.lower(dim).is_some_and(|limit| v < limit)
                || self.limits.upper(dim).is_some_and(|limit| v > limit)
        })
    }

    /// The centers of the mirror hills to deposit alongside a hill at `x`.
    #[must_use]
    pub fn mirrors(&self, x: &[Value], sigmas: &[f64]) -> Vec<Vec<Value>> {
        match self.kind {
            ReflectionType::Mono => self.mirrors_mono(x, sigmas),
            ReflectionType::Multi => self.mirrors_multi(x, sigmas),
        }
    }

    fn in_range(&self, dim: usize, upper: bool, x: &[Value], sigmas: &[f64]) -> Option<f64> {
        let limit = self.limits.side(dim, upper)?;
        let v = x[dim].components()[0];
        ((v - limit).abs() < self.range * sigmas[dim]).then(|| 2.0 * limit - v)
    }

    fn mirrors_mono(&self, x: &[Value], sigmas: &[f64]) -> Vec<Vec<Value>> {
        let mut mirrors = Vec::new();
        for dim in 0..self.limits.ndim() {
            for upper in [false, true] {
                if let Some(mirrored) = self.in_range(dim, upper, x, sigmas) {
                    let mut centers = x.to_vec();
                    centers[dim] = Value::Scalar(mirrored);
                    mirrors.push(centers);
                }
            }
        }
        mirrors
    }

    fn mirrors_multi(&self, x: &[Value], sigmas: &[f64]) -> Vec<Vec<Value>> {
        let dims: Vec<usize> = (0..self.limits.ndim())
            .filter(|&dim| self.limits.lower(dim).is_some() || self.limits.upper(dim).is_some())
            .collect();
        let mut mirrors = Vec::new();
        for subset in dims.iter().copied().powerset() {
            if subset.is_empty() {
                continue;
            }
            for sides in subset
                .iter()
                .map(|_| [false, true])
                .multi_cartesian_product()
            {
                // every chosen limit must be configured and in range before
                // any dimension is mirrored
                let mirrored: Option<Vec<f64>> = subset
                    .iter()
                    .zip(&sides)
                    .map(|(&dim, &upper)| self.in_range(dim, upper, x, sigmas))
                    .collect();
                let Some(values) = mirrored else {
                    continue;
                };
                let mut centers = x.to_vec();
                for (&dim, value) in subset.iter().zip(values) {
                    centers[dim] = Value::Scalar(value);
                }
                mirrors.push(centers);
            }
        }
        mirrors
    }
}

/// Zeroes the bias force along dimensions whose value left the configured
/// interval.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct IntervalLimits {
    limits: Limits,
}

impl IntervalLimits {
    /// Creates the clipper from explicit limits.
    #[must_use]
    pub const fn new(limits: Limits) -> Self {
        Self { limits }
    }

    /// The configured limits.
    #[must_use]
    pub const fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Zeroes `forces[dim]` wherever `x[dim]` lies outside the interval.
    pub fn clip(&self, x: &[Value], forces: &mut [Value]) {
        for dim in 0..self.limits.ndim() {
            let v = x[dim].components()[0];
            let outside = self.limits.lower(dim).is_some_and(|limit| v < limit)
                || self.limits.upper(dim).is_some_and(|limit| v > limit);
            if outside {
                forces[dim] = forces[dim].scaled(0.0);
            }
        }
    }
}
