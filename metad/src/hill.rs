//! Gaussian hills and the ordered container they accumulate in.

use crate::colvar::{Colvar, Value};
use crate::error::{Error, Result};
use crate::parse::Tokens;
use itertools::izip;
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Hills whose squared scaled distance exceeds this contribute nothing;
/// `exp(-23/2)` is already below 1e-5 of the hill height.
const EXPONENT_CUTOFF: f64 = 23.0;

/// Immutable record of one deposited Gaussian.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Hill {
    step: u64,
    weight: f64,
    centers: Vec<Value>,
    sigmas: Vec<f64>,
    replica: String,
}

impl Hill {
    /// Creates a hill deposited at `step` with height `weight`.
    ///
    /// # Errors
    ///
    /// Returns a bug error if the center and sigma counts disagree or any
    /// sigma is not positive.
    pub fn new(
        step: u64,
        weight: f64,
        centers: Vec<Value>,
        sigmas: Vec<f64>,
        replica: &str,
    ) -> Result<Self> {
        if centers.len() != sigmas.len() {
            return Err(Error::Bug(format!(
                "hill with {} centers but {} sigmas",
                centers.len(),
                sigmas.len()
            )));
        }
        if sigmas.iter().any(|&s| s <= 0.0) {
            return Err(Error::Bug("hill sigmas must be positive".to_owned()));
        }
        Ok(Self {
            step,
            weight,
            centers,
            sigmas,
            replica: replica.to_owned(),
        })
    }

    /// The simulation step the hill was deposited at.
    #[must_use]
    pub const fn step(&self) -> u64 {
        self.step
    }

    /// The height of the hill.
    #[must_use]
    pub const fn weight(&self) -> f64 {
        self.weight
    }

    /// The deposition point, one value per collective variable.
    #[must_use]
    pub fn centers(&self) -> &[Value] {
        &self.centers
    }

    /// The Gaussian half-widths, one per collective variable.
    #[must_use]
    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    /// The id of the replica that deposited this hill; empty outside
    /// multiple-walker runs.
    #[must_use]
    pub fn replica(&self) -> &str {
        &self.replica
    }

    /// The unit-height Gaussian evaluated at `x`, using each collective
    /// variable's own metric. Returns zero beyond the exponent cutoff.
    #[must_use]
    pub fn value(&self, colvars: &[Colvar], x: &[Value]) -> f64 {
        let sq: f64 = izip!(colvars, x, &self.centers, &self.sigmas)
            .map(|(cv, xi, ci, sigma)| cv.dist2(xi, ci) / (sigma * sigma))
            .sum();
        if sq > EXPONENT_CUTOFF {
            0.0
        } else {
            (-0.5 * sq).exp()
        }
    }

    /// Writes the textual record: `hill { step … weight … centers … widths …
    /// [replicaID …] }`. The stored widths are `2σ`.
    ///
    /// # Errors
    ///
    /// Returns an error when writing fails.
    pub fn write_record(&self, mut writer: impl Write) -> Result<()> {
        write!(writer, "hill {{ step {} weight {:.14e} centers", self.step, self.weight)?;
        for center in &self.centers {
            for component in center.components() {
                write!(writer, " {component:.14e}")?;
            }
        }
        write!(writer, " widths")?;
        for sigma in &self.sigmas {
            write!(writer, " {:.14e}", 2.0 * sigma)?;
        }
        if !self.replica.is_empty() {
            write!(writer, " replicaID {}", self.replica)?;
        }
        writeln!(writer, " }}")?;
        Ok(())
    }

    /// Reads one textual record, or `None` when the stream holds no further
    /// `hill` keyword.
    ///
    /// # Errors
    ///
    /// Returns a parse error on a malformed record.
    pub(crate) fn read_record(tokens: &mut Tokens<'_>, colvars: &[Colvar]) -> Result<Option<Self>> {
        if tokens.peek() != Some("hill") {
            return Ok(None);
        }
        tokens.next();
        tokens.expect("{")?;
        tokens.expect("step")?;
        let step = tokens.next_u64()?;
        tokens.expect("weight")?;
        let weight = tokens.next_f64()?;
        tokens.expect("centers")?;
        let mut centers = Vec::with_capacity(colvars.len());
        for cv in colvars {
            let mut components = vec![0.0; cv.num_components()];
            for component in &mut components {
                *component = tokens.next_f64()?;
            }
            centers.push(Value::from_components(cv.kind(), &components)?);
        }
        tokens.expect("widths")?;
        let mut sigmas = vec![0.0; colvars.len()];
        for sigma in &mut sigmas {
            *sigma = 0.5 * tokens.next_f64()?;
        }
        let mut replica = String::new();
        if tokens.peek() == Some("replicaID") {
            tokens.next();
            replica = tokens.expect_token()?.to_owned();
        }
        tokens.expect("}")?;
        Self::new(step, weight, centers, sigmas, &replica).map(Some)
    }
}

/// Append-stable handle to a hill inside a [`HillSeries`].
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct HillId(u64);

/// Ordered, append-only sequence of hills with stable handles.
///
/// Handles survive appends and removals of other hills; bulk mutation is
/// limited to [`Self::erase_before`] and [`Self::clear`].
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct HillSeries {
    hills: Vec<(HillId, Hill)>,
    next: u64,
}

impl HillSeries {
    /// Creates an empty series.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of stored hills.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hills.len()
    }

    /// Whether the series holds no hill.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hills.is_empty()
    }

    /// Appends a hill and returns its handle.
    pub fn push(&mut self, hill: Hill) -> HillId {
        let id = HillId(self.next);
        self.next += 1;
        self.hills.push((id, hill));
        id
    }

    /// The handle one past the most recently appended hill.
    #[must_use]
    pub const fn end(&self) -> HillId {
        HillId(self.next)
    }

    /// Iterates over all stored hills in deposition order.
    pub fn iter(&self) -> impl Iterator<Item = &Hill> {
        self.hills.iter().map(|(_, hill)| hill)
    }

    /// Iterates over the hills at or after `from`.
    pub fn iter_from(&self, from: HillId) -> impl Iterator<Item = &Hill> {
        let start = self.hills.partition_point(|(id, _)| *id < from);
        self.hills[start..].iter().map(|(_, hill)| hill)
    }

    /// Removes every hill before `until`.
    pub fn erase_before(&mut self, until: HillId) {
        let count = self.hills.partition_point(|(id, _)| *id < until);
        self.hills.drain(..count);
    }

    /// Removes every hill.
    pub fn clear(&mut self) {
        self.hills.clear();
    }

    /// Removes one hill by identity (deposition step and replica id).
    pub fn remove(&mut self, step: u64, replica: &str) -> Option<Hill> {
        let position = self
            .hills
            .iter()
            .position(|(_, hill)| hill.step() == step && hill.replica() == replica)?;
        Some(self.hills.remove(position).1)
    }

    /// The most recently appended hill.
    #[must_use]
    pub fn last(&self) -> Option<&Hill> {
        self.hills.last().map(|(_, hill)| hill)
    }
}

/// Sums the energy of `hills` at `x`: `Σ W · value`.
pub fn calc_hills<'a>(
    colvars: &[Colvar],
    hills: impl Iterator<Item = &'a Hill>,
    x: &[Value],
) -> f64 {
    hills.map(|hill| hill.weight() * hill.value(colvars, x)).sum()
}

/// Accumulates the bias force of `hills` at `x` into `forces`, one term of
/// `W · value · (0.5/σ²) · dist2_lgrad(x, c)` per hill and dimension.
pub fn calc_hills_force<'a>(
    colvars: &[Colvar],
    hills: impl Iterator<Item = &'a Hill>,
    x: &[Value],
    forces: &mut [Value],
) {
    debug_assert_eq!(forces.len(), colvars.len());
    for hill in hills {
        let value = hill.value(colvars, x);
        if value == 0.0 {
            continue;
        }
        for (cv, xi, ci, sigma, force) in
            izip!(colvars, x, hill.centers(), hill.sigmas(), forces.iter_mut())
        {
            let factor = hill.weight() * value * 0.5 / (sigma * sigma);
            force.add_scaled(&cv.dist2_lgrad(xi, ci), factor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    fn single_colvar() -> Vec<Colvar> {
        vec![Colvar::scalar("d", 0.1, -2.0, 2.0).unwrap()]
    }

    fn single_hill() -> Hill {
        Hill::new(100, 1.0, vec![Value::Scalar(0.0)], vec![0.2], "").unwrap()
    }

    #[test]
    fn single_hill_energy_and_force() {
        let colvars = single_colvar();
        let hill = single_hill();
        let x = [Value::Scalar(0.2)];
        let energy = calc_hills(&colvars, std::iter::once(&hill), &x);
        assert_approx_eq!(f64, energy, (-0.5_f64).exp(), epsilon = 1e-12);
        let mut forces = [Value::Scalar(0.0)];
        calc_hills_force(&colvars, std::iter::once(&hill), &x, &mut forces);
        // W · exp(-1/2) · 2·0.2 / (2·0.2²)
        assert_approx_eq!(f64, forces[0].components()[0], 3.0326532985631671, epsilon = 1e-12);
    }

    #[test]
    fn distant_hills_are_cut_off() {
        let colvars = single_colvar();
        let hill = single_hill();
        // 10 sigmas out: sq = 100 > cutoff
        assert_eq!(hill.value(&colvars, &[Value::Scalar(2.0)]), 0.0);
    }

    #[test]
    fn hills_over_vector_colvars_use_the_variant_metric() {
        use crate::colvar::ValueKind;
        let colvars = vec![Colvar::non_scalar("v", ValueKind::Vec3, 3, 0.1).unwrap()];
        let hill = Hill::new(1, 2.0, vec![Value::Vec3([0.0; 3])], vec![0.5], "").unwrap();
        // |x - c|² = 0.25, so the scaled exponent is exactly one
        let x = [Value::Vec3([0.3, 0.0, 0.4])];
        let energy = calc_hills(&colvars, std::iter::once(&hill), &x);
        assert_approx_eq!(f64, energy, 2.0 * (-0.5_f64).exp(), epsilon = 1e-12);
        let mut forces = [Value::Vec3([0.0; 3])];
        calc_hills_force(&colvars, std::iter::once(&hill), &x, &mut forces);
        let factor = 2.0 * (-0.5_f64).exp() * 2.0;
        assert_approx_eq!(f64, forces[0].components()[0], factor * 0.6, epsilon = 1e-12);
        assert_approx_eq!(f64, forces[0].components()[1], 0.0, epsilon = 1e-12);
        assert_approx_eq!(f64, forces[0].components()[2], factor * 0.8, epsilon = 1e-12);
    }

    #[test]
    fn record_round_trip_keeps_two_sigma_widths() {
        let colvars = single_colvar();
        let hill = Hill::new(42, 0.75, vec![Value::Scalar(0.95)], vec![0.1], "w0").unwrap();
        let mut buffer = Vec::new();
        hill.write_record(&mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("widths 2.0"));
        let mut tokens = Tokens::new(&text);
        let read = Hill::read_record(&mut tokens, &colvars).unwrap().unwrap();
        assert_eq!(read, hill);
        assert!(Hill::read_record(&mut tokens, &colvars).unwrap().is_none());
    }

    #[test]
    fn series_handles_survive_appends_and_removals() {
        let mut series = HillSeries::new();
        let first = series.push(single_hill());
        let marker = series.end();
        series.push(Hill::new(200, 1.0, vec![Value::Scalar(0.5)], vec![0.2], "").unwrap());
        series.push(Hill::new(300, 1.0, vec![Value::Scalar(0.7)], vec![0.2], "").unwrap());
        assert_eq!(series.iter_from(marker).count(), 2);
        assert_eq!(series.iter_from(first).count(), 3);
        assert!(series.remove(200, "").is_some());
        assert_eq!(series.iter_from(marker).count(), 1);
        series.erase_before(marker);
        assert_eq!(series.len(), 1);
        assert_eq!(series.last().unwrap().step(), 300);
    }
}
