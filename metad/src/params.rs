//! Typed configuration keys for a metadynamics bias.

use crate::colvar::{Colvar, ValueKind};
use crate::convert;
use crate::error::{Error, Result};
use crate::reflection::{Limits, ReflectionType};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default dimensionless Gaussian width, in units of the colvar bin
/// spacing: `sqrt(2π)/2`.
pub const DEFAULT_HILL_WIDTH: f64 = 1.2533141373155003;

/// Configuration of a [`MetaBias`](crate::bias::MetaBias).
///
/// Field names follow the historical configuration keys, so any tokenizer
/// producing camelCase key/value maps (YAML, JSON) deserializes directly
/// into this struct. All keys are optional except `hillWeight`;
/// [`Self::validate`] enforces the cross-key rules.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MetaParams {
    /// Height of each deposited hill; must be positive.
    pub hill_weight: f64,
    /// Steps between hill depositions.
    pub new_hill_frequency: u64,
    /// Dimensionless Gaussian width, mutually exclusive with
    /// `gaussianSigmas`; `σ_i = width_i · hillWidth / 2`.
    pub hill_width: Option<f64>,
    /// Explicit Gaussian half-widths, one per collective variable.
    pub gaussian_sigmas: Option<Vec<f64>>,
    /// Accumulate hills on grids instead of summing them analytically.
    pub use_grids: bool,
    /// Steps between grid projections; defaults to `newHillFrequency`.
    pub grids_update_frequency: Option<u64>,
    /// Recompute the grids from the hill list on restart.
    pub rebin_grids: bool,
    /// Dump the free-energy surface at output time.
    pub write_free_energy_file: bool,
    /// Retain hills after they have been projected to the grids.
    pub keep_hills: bool,
    /// Emit step-stamped copies of the free-energy surface.
    pub keep_free_energy_files: bool,
    /// Damp future deposits by `exp(-E/kT_bias)`.
    pub well_tempered: bool,
    /// The bias temperature of the well-tempered ensemble.
    pub bias_temperature: Option<f64>,
    /// Scale deposits by the inverse of a target distribution.
    pub eb_meta: bool,
    /// Multicolumn file holding the target distribution.
    pub target_dist_file: Option<PathBuf>,
    /// Clamp for small target-distribution values, relative to its maximum.
    pub target_dist_min_val: f64,
    /// Steps over which the ensemble-biased scale is switched on.
    pub eb_meta_equil_steps: u64,
    /// Deposit mirror hills near the reflection limits.
    pub use_hills_reflection: bool,
    /// Mirror single dimensions or every dimension combination.
    pub reflection_type: ReflectionType,
    /// Mirroring range, in Gaussian widths.
    pub reflection_range: f64,
    /// Collective variables with a lower reflection limit.
    #[serde(rename = "reflectionLowLimitCVs")]
    pub reflection_low_limit_cvs: Vec<usize>,
    /// The lower reflection limits, parallel to the index list.
    pub reflection_low_limit: Vec<f64>,
    /// Collective variables with an upper reflection limit.
    #[serde(rename = "reflectionUpLimitCVs")]
    pub reflection_up_limit_cvs: Vec<usize>,
    /// The upper reflection limits, parallel to the index list.
    pub reflection_up_limit: Vec<f64>,
    /// Zero the bias force outside the interval limits.
    pub use_hills_interval: bool,
    /// Collective variables with a lower interval limit.
    #[serde(rename = "intervalLowLimitCVs")]
    pub interval_low_limit_cvs: Vec<usize>,
    /// The lower interval limits, parallel to the index list.
    pub interval_low_limit: Vec<f64>,
    /// Collective variables with an upper interval limit.
    #[serde(rename = "intervalUpLimitCVs")]
    pub interval_up_limit_cvs: Vec<usize>,
    /// The upper interval limits, parallel to the index list.
    pub interval_up_limit: Vec<f64>,
    /// Exchange hills with other walkers through the filesystem.
    pub multiple_replicas: bool,
    /// Identity of this walker in the registry.
    #[serde(rename = "replicaID")]
    pub replica_id: Option<String>,
    /// The shared registry file.
    pub replicas_registry: Option<PathBuf>,
    /// Steps between replica synchronization cycles.
    pub replica_update_frequency: Option<u64>,
    /// Append every deposited hill to a trajectory file.
    pub write_hills_trajectory: bool,
    /// Prefix of every file written by the bias.
    pub output_prefix: String,
}

impl Default for MetaParams {
    fn default() -> Self {
        Self {
            hill_weight: 0.0,
            new_hill_frequency: 1000,
            hill_width: None,
            gaussian_sigmas: None,
            use_grids: true,
            grids_update_frequency: None,
            rebin_grids: false,
            write_free_energy_file: true,
            keep_hills: false,
            keep_free_energy_files: false,
            well_tempered: false,
            bias_temperature: None,
            eb_meta: false,
            target_dist_file: None,
            target_dist_min_val: 0.0,
            eb_meta_equil_steps: 0,
            use_hills_reflection: false,
            reflection_type: ReflectionType::Mono,
            reflection_range: 6.0,
            reflection_low_limit_cvs: Vec::new(),
            reflection_low_limit: Vec::new(),
            reflection_up_limit_cvs: Vec::new(),
            reflection_up_limit: Vec::new(),
            use_hills_interval: false,
            interval_low_limit_cvs: Vec::new(),
            interval_low_limit: Vec::new(),
            interval_up_limit_cvs: Vec::new(),
            interval_up_limit: Vec::new(),
            multiple_replicas: false,
            replica_id: None,
            replicas_registry: None,
            replica_update_frequency: None,
            write_hills_trajectory: false,
            output_prefix: "output".to_owned(),
        }
    }
}

fn check_limit_list(
    what: &str,
    cvs: &[usize],
    limits: &[f64],
    colvars: &[Colvar],
) -> Result<()> {
    if cvs.len() != limits.len() {
        return Err(Error::Input(format!(
            "{what}: {} indices but {} limit values",
            cvs.len(),
            limits.len()
        )));
    }
    for &dim in cvs {
        let Some(cv) = colvars.get(dim) else {
            return Err(Error::Input(format!(
                "{what}: colvar index {dim} is out of range"
            )));
        };
        if cv.kind() != ValueKind::Scalar {
            return Err(Error::Input(format!(
                "{what}: colvar {} is not scalar",
                cv.name()
            )));
        }
    }
    Ok(())
}

impl MetaParams {
    /// Checks the cross-key rules against the collective-variable layout.
    ///
    /// # Errors
    ///
    /// Returns an input error describing the first violated rule.
    pub fn validate(&self, colvars: &[Colvar]) -> Result<()> {
        if self.hill_weight <= 0.0 {
            return Err(Error::Input(
                "hillWeight is required and must be positive".to_owned(),
            ));
        }
        if self.new_hill_frequency == 0 {
            return Err(Error::Input("newHillFrequency must be positive".to_owned()));
        }
        if self.hill_width.is_some() && self.gaussian_sigmas.is_some() {
            return Err(Error::Input(
                "hillWidth and gaussianSigmas are mutually exclusive".to_owned(),
            ));
        }
        if let Some(width) = self.hill_width {
            if width <= 0.0 {
                return Err(Error::Input("hillWidth must be positive".to_owned()));
            }
        }
        if let Some(sigmas) = &self.gaussian_sigmas {
            if sigmas.len() != colvars.len() {
                return Err(Error::Input(format!(
                    "gaussianSigmas provides {} values for {} colvars",
                    sigmas.len(),
                    colvars.len()
                )));
            }
            if sigmas.iter().any(|&s| s <= 0.0) {
                return Err(Error::Input("gaussianSigmas must be positive".to_owned()));
            }
        }
        if self.well_tempered && self.bias_temperature.is_none_or(|t| t <= 0.0) {
            return Err(Error::Input(
                "wellTempered requires a positive biasTemperature".to_owned(),
            ));
        }
        if self.eb_meta {
            if self.target_dist_file.is_none() {
                return Err(Error::Input("ebMeta requires targetDistFile".to_owned()));
            }
            if !self.use_grids {
                return Err(Error::Input(
                    "ebMeta requires useGrids, the target distribution lives on a grid"
                        .to_owned(),
                ));
            }
        }
        check_limit_list(
            "reflectionLowLimit",
            &self.reflection_low_limit_cvs,
            &self.reflection_low_limit,
            colvars,
        )?;
        check_limit_list(
            "reflectionUpLimit",
            &self.reflection_up_limit_cvs,
            &self.reflection_up_limit,
            colvars,
        )?;
        check_limit_list(
            "intervalLowLimit",
            &self.interval_low_limit_cvs,
            &self.interval_low_limit,
            colvars,
        )?;
        check_limit_list(
            "intervalUpLimit",
            &self.interval_up_limit_cvs,
            &self.interval_up_limit,
            colvars,
        )?;
        if self.use_hills_reflection && self.reflection_limits(colvars.len()).is_unset() {
            return Err(Error::Input(
                "useHillsReflection requires at least one reflection limit".to_owned(),
            ));
        }
        if self.multiple_replicas {
            if self.replica_id.as_ref().is_none_or(String::is_empty) {
                return Err(Error::Input("multipleReplicas requires replicaID".to_owned()));
            }
            if self.replicas_registry.is_none() {
                return Err(Error::Input(
                    "multipleReplicas requires replicasRegistry".to_owned(),
                ));
            }
            if self.replica_update_frequency.is_none_or(|f| f == 0) {
                return Err(Error::Input(
                    "multipleReplicas requires a positive replicaUpdateFrequency".to_owned(),
                ));
            }
        }
        Ok(())
    }

    /// The Gaussian half-widths, one per collective variable.
    ///
    /// # Errors
    ///
    /// Returns an input error on a length mismatch.
    pub fn sigmas(&self, colvars: &[Colvar]) -> Result<Vec<f64>> {
        if let Some(sigmas) = &self.gaussian_sigmas {
            if sigmas.len() != colvars.len() {
                return Err(Error::Input(format!(
                    "gaussianSigmas provides {} values for {} colvars",
                    sigmas.len(),
                    colvars.len()
                )));
            }
            return Ok(sigmas.clone());
        }
        let width = self.hill_width.unwrap_or(DEFAULT_HILL_WIDTH);
        Ok(colvars.iter().map(|cv| 0.5 * cv.width() * width).collect())
    }

    /// The dimensionless hill width: the configured value, or the widest
    /// `2σ/width` ratio when explicit sigmas are given.
    #[must_use]
    pub fn hill_width_bins(&self, colvars: &[Colvar], sigmas: &[f64]) -> f64 {
        self.hill_width.unwrap_or_else(|| {
            colvars
                .iter()
                .zip(sigmas)
                .map(|(cv, &sigma)| 2.0 * sigma / cv.width())
                .fold(DEFAULT_HILL_WIDTH, f64::max)
        })
    }

    /// Bins a hill center must keep from a grid edge before it counts as
    /// off-grid: `3·⌊hill_width⌋ + 1`.
    #[must_use]
    pub fn min_buffer(&self, colvars: &[Colvar], sigmas: &[f64]) -> usize {
        3 * convert::usize_from_f64(self.hill_width_bins(colvars, sigmas).floor()) + 1
    }

    /// The projection period, defaulting to the deposition period.
    #[must_use]
    pub fn grids_frequency(&self) -> u64 {
        self.grids_update_frequency
            .unwrap_or(self.new_hill_frequency)
    }

    /// Assembles the reflection limits from the index lists.
    #[must_use]
    pub fn reflection_limits(&self, ndim: usize) -> Limits {
        let mut limits = Limits::new(ndim);
        for (&dim, &limit) in self.reflection_low_limit_cvs.iter().zip(&self.reflection_low_limit) {
            limits.set_lower(dim, limit);
        }
        for (&dim, &limit) in self.reflection_up_limit_cvs.iter().zip(&self.reflection_up_limit) {
            limits.set_upper(dim, limit);
        }
        limits
    }

    /// Assembles the interval limits; without explicit keys they default to
    /// the reflection limits when reflection is active.
    #[must_use]
    pub fn interval_limits(&self, ndim: usize) -> Limits {
        let mut limits = Limits::new(ndim);
        for (&dim, &limit) in self.interval_low_limit_cvs.iter().zip(&self.interval_low_limit) {
            limits.set_lower(dim, limit);
        }
        for (&dim, &limit) in self.interval_up_limit_cvs.iter().zip(&self.interval_up_limit) {
            limits.set_upper(dim, limit);
        }
        if limits.is_unset() && self.use_hills_reflection {
            return self.reflection_limits(ndim);
        }
        limits
    }
}
