//! The metadynamics orchestrator: deposition, projection, boundary
//! expansion, scaling schemes and output.

use crate::colvar::{Colvar, Value};
use crate::convert;
use crate::error::{Error, Result};
use crate::gradient_grid::GradientGrid;
use crate::grid::{Grid, GridAxis};
use crate::hill::{calc_hills, calc_hills_force, Hill, HillId, HillSeries};
use crate::params::MetaParams;
use crate::proxy::EngineProxy;
use crate::reflection::{IntervalLimits, ReflectionPlanner};
use crate::replica::ReplicaCoordinator;
use crate::scalar_grid::ScalarGrid;
use crate::state::{StateData, STATE_VERSION};
use log::{debug, info, warn};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

/// Hills and grids of one bias instance.
///
/// The local bias and the shadow of every peer replica carry one store
/// each; no store writes files on its own.
#[derive(Clone, Debug)]
pub struct BiasStore {
    hills: HillSeries,
    new_hills_begin: HillId,
    off_grid: Vec<Hill>,
    energy: Option<ScalarGrid>,
    gradients: Option<GradientGrid>,
    step: u64,
}

impl BiasStore {
    /// Creates an empty store, with freshly allocated grids when grids are
    /// in use.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Grid::new`].
    pub fn new(colvars: &[Colvar], use_grids: bool) -> Result<Self> {
        let (energy, gradients) = if use_grids {
            (
                Some(ScalarGrid::new(colvars)?),
                Some(GradientGrid::new(colvars)?),
            )
        } else {
            (None, None)
        };
        Ok(Self {
            hills: HillSeries::new(),
            new_hills_begin: HillId::default(),
            off_grid: Vec::new(),
            energy,
            gradients,
            step: 0,
        })
    }

    /// The stored hills.
    #[must_use]
    pub const fn hills(&self) -> &HillSeries {
        &self.hills
    }

    /// The energy grid, when grids are in use.
    #[must_use]
    pub const fn energy_grid(&self) -> Option<&ScalarGrid> {
        self.energy.as_ref()
    }

    /// The gradient grid, when grids are in use.
    #[must_use]
    pub const fn gradient_grid(&self) -> Option<&GradientGrid> {
        self.gradients.as_ref()
    }

    /// The hills currently tracked as off-grid.
    #[must_use]
    pub fn off_grid(&self) -> &[Hill] {
        &self.off_grid
    }

    /// The step this store was last synchronized to (non-zero only after a
    /// state restore).
    #[must_use]
    pub const fn step(&self) -> u64 {
        self.step
    }

    /// Appends a hill; centers within `min_buffer` bins of a grid edge are
    /// copied to the off-grid list.
    pub fn add_hill(&mut self, hill: Hill, min_buffer: usize) -> HillId {
        if let Some(energy) = &self.energy {
            let centers: Vec<f64> = hill
                .centers()
                .iter()
                .map(|center| center.components()[0])
                .collect();
            let distance = energy.grid().bin_distance_from_boundaries(&centers, false);
            if distance < convert::f64_from_usize(min_buffer) {
                self.off_grid.push(hill.clone());
            }
        }
        self.hills.push(hill)
    }

    /// Removes a hill by identity, from the main list and the off-grid
    /// list.
    pub fn delete_hill(&mut self, step: u64, replica: &str) -> Option<Hill> {
        self.off_grid
            .retain(|hill| hill.step() != step || hill.replica() != replica);
        self.hills.remove(step, replica)
    }

    /// Projects the not-yet-projected hills into the grids and advances the
    /// projection cursor; without `keep_hills` the hill list is wiped (the
    /// off-grid copies survive).
    ///
    /// # Errors
    ///
    /// Returns a bug error when the gradient grid is missing while the
    /// energy grid exists.
    pub fn project_new(&mut self, colvars: &[Colvar], keep_hills: bool) -> Result<()> {
        let Self {
            hills,
            new_hills_begin,
            energy,
            gradients,
            ..
        } = self;
        let Some(energy) = energy.as_mut() else {
            return Ok(());
        };
        let Some(gradients) = gradients.as_mut() else {
            return Err(Error::Bug(
                "projection requires a gradient grid".to_owned(),
            ));
        };
        project_hills(colvars, hills.iter_from(*new_hills_begin), energy, gradients);
        *new_hills_begin = hills.end();
        if !keep_hills {
            hills.clear();
        }
        Ok(())
    }

    /// Rebuilds the off-grid list from the current hill list.
    pub fn rebuild_off_grid(&mut self, min_buffer: usize) {
        self.off_grid.clear();
        let Some(energy) = &self.energy else {
            return;
        };
        let buffer = convert::f64_from_usize(min_buffer);
        for hill in self.hills.iter() {
            let centers: Vec<f64> = hill
                .centers()
                .iter()
                .map(|center| center.components()[0])
                .collect();
            if energy.grid().bin_distance_from_boundaries(&centers, false) < buffer {
                self.off_grid.push(hill.clone());
            }
        }
    }

    /// Replaces the grids, e.g. after a boundary expansion.
    pub fn replace_grids(&mut self, energy: ScalarGrid, gradients: GradientGrid) {
        self.energy = Some(energy);
        self.gradients = Some(gradients);
    }

    /// The energy of this store at `x`. With grids, the grid value is the
    /// fast path, the off-grid list covers positions outside the grid, and
    /// not-yet-projected hills are always summed analytically.
    #[must_use]
    pub fn energy_at(&self, colvars: &[Colvar], x: &[Value], coords: Option<&[f64]>) -> f64 {
        if let (Some(energy), Some(coords)) = (&self.energy, coords) {
            let ix = energy.grid().bin_of(coords);
            let base = if energy.grid().index_ok(&ix) {
                energy.value(&ix)
            } else {
                calc_hills(colvars, self.off_grid.iter(), x)
            };
            base + calc_hills(colvars, self.hills.iter_from(self.new_hills_begin), x)
        } else {
            calc_hills(colvars, self.hills.iter(), x)
        }
    }

    /// Accumulates the bias force of this store at `x` into `forces`.
    pub fn forces_at(
        &self,
        colvars: &[Colvar],
        x: &[Value],
        coords: Option<&[f64]>,
        forces: &mut [Value],
    ) {
        if let (Some(gradients), Some(coords)) = (&self.gradients, coords) {
            let ix = gradients.grid().bin_of(coords);
            if gradients.grid().index_ok(&ix) {
                for (force, &gradient) in forces.iter_mut().zip(gradients.vector_value(&ix)) {
                    force.add_scaled(&Value::Scalar(gradient), -1.0);
                }
            } else {
                calc_hills_force(colvars, self.off_grid.iter(), x, forces);
            }
            calc_hills_force(
                colvars,
                self.hills.iter_from(self.new_hills_begin),
                x,
                forces,
            );
        } else {
            calc_hills_force(colvars, self.hills.iter(), x, forces);
        }
    }

    /// Restores this store from a parsed checkpoint. With `rebin_grids` and
    /// retained hills the grids are recomputed from the hill list;
    /// otherwise stored grids are mapped into the freshly-sized ones.
    /// Hills beyond the checkpoint step are pruned, and the off-grid list
    /// is rebuilt.
    ///
    /// # Errors
    ///
    /// Returns a bug error when the gradient grid is missing while grids
    /// are expected.
    pub fn restore(
        &mut self,
        colvars: &[Colvar],
        data: StateData,
        config_keep_hills: bool,
        rebin_grids: bool,
        min_buffer: usize,
    ) -> Result<()> {
        let keep_hills = data.effective_keep_hills(config_keep_hills);
        self.step = data.step;
        self.hills = HillSeries::new();
        for hill in data.hills {
            if hill.step() <= data.step {
                self.hills.push(hill);
            }
        }
        self.new_hills_begin = HillId::default();
        // track boundary hills before any branch below wipes the list
        self.rebuild_off_grid(min_buffer);
        if self.energy.is_some() {
            if rebin_grids && keep_hills {
                self.reproject_all(colvars)?;
            } else if let (Some(stored_energy), Some(stored_gradients)) =
                (data.energy, data.gradients)
            {
                if let (Some(energy), Some(gradients)) =
                    (self.energy.as_mut(), self.gradients.as_mut())
                {
                    energy.grid_mut().map_grid(&stored_energy);
                    gradients.grid_mut().map_grid(&stored_gradients);
                }
                if keep_hills {
                    // the retained hills are already part of the grids
                    self.new_hills_begin = self.hills.end();
                }
            } else {
                self.reproject_all(colvars)?;
                if !keep_hills {
                    self.hills.clear();
                }
            }
        }
        Ok(())
    }

    fn reproject_all(&mut self, colvars: &[Colvar]) -> Result<()> {
        let Self {
            hills,
            new_hills_begin,
            energy,
            gradients,
            ..
        } = self;
        let Some(energy) = energy.as_mut() else {
            return Ok(());
        };
        let Some(gradients) = gradients.as_mut() else {
            return Err(Error::Bug(
                "projection requires a gradient grid".to_owned(),
            ));
        };
        energy.grid_mut().multiply_constant(0.0);
        gradients.grid_mut().multiply_constant(0.0);
        project_hills(colvars, hills.iter(), energy, gradients);
        *new_hills_begin = hills.end();
        Ok(())
    }
}

/// Projects `hills` into the energy and gradient grids, bin by bin in
/// row-major order. Progress is logged roughly every million bin-hill
/// operations.
pub fn project_hills<'a>(
    colvars: &[Colvar],
    hills: impl Iterator<Item = &'a Hill>,
    energy: &mut ScalarGrid,
    gradients: &mut GradientGrid,
) {
    let hills: Vec<&Hill> = hills.collect();
    if hills.is_empty() {
        return;
    }
    let num_bins = energy.grid().num_bins();
    let report_bins = (1_000_000 / hills.len()).max(1);
    let ndim = colvars.len();
    let mut values = vec![Value::Scalar(0.0); ndim];
    let mut forces = vec![Value::Scalar(0.0); ndim];
    let mut gradient = vec![0.0; ndim];
    let mut ix = energy.grid().first_index();
    let mut done = 0_usize;
    while energy.grid().index_ok(&ix) {
        for (dim, (value, &i)) in values.iter_mut().zip(&ix).enumerate() {
            #[allow(clippy::cast_sign_loss)]
            let center = energy.grid().bin_to_value(i as usize, dim);
            *value = Value::Scalar(center);
        }
        energy.acc_value(&ix, calc_hills(colvars, hills.iter().copied(), &values));
        for force in &mut forces {
            *force = Value::Scalar(0.0);
        }
        calc_hills_force(colvars, hills.iter().copied(), &values, &mut forces);
        for (slot, force) in gradient.iter_mut().zip(&forces) {
            *slot = -force.components()[0];
        }
        gradients.acc_force(&ix, &gradient);
        done += 1;
        if done % report_bins == 0 {
            debug!("projected {done}/{num_bins} bins over {} hills", hills.len());
        }
        energy.grid().incr(&mut ix);
    }
}

/// A metadynamics bias over a set of collective variables.
///
/// The driver calls [`Self::update`] once per step with the current values
/// and reads back [`Self::bias_energy`] and [`Self::forces`].
pub struct MetaBias {
    name: String,
    colvars: Vec<Colvar>,
    params: MetaParams,
    sigmas: Vec<f64>,
    min_buffer: usize,
    replica_id: String,
    kb: f64,
    temperature: f64,
    proxy: Box<dyn EngineProxy>,
    store: BiasStore,
    target_dist: Option<ScalarGrid>,
    reflection: Option<ReflectionPlanner>,
    interval: Option<IntervalLimits>,
    coordinator: Option<ReplicaCoordinator>,
    traj: Option<BufWriter<File>>,
    step: u64,
    accumulate: bool,
    bias_energy: f64,
    colvar_forces: Vec<Value>,
}

impl MetaBias {
    /// Builds the bias from its configuration, validating every cross-key
    /// rule first.
    ///
    /// # Errors
    ///
    /// Returns an input error on an invalid configuration and file errors
    /// when the target distribution or the replica files cannot be set up.
    pub fn new(
        name: &str,
        colvars: Vec<Colvar>,
        params: MetaParams,
        proxy: Box<dyn EngineProxy>,
    ) -> Result<Self> {
        params.validate(&colvars)?;
        let sigmas = params.sigmas(&colvars)?;
        for (cv, &sigma) in colvars.iter().zip(&sigmas) {
            if 2.0 * sigma < cv.width() {
                warn!(
                    "{name}: the Gaussian width along {} is narrower than one grid bin",
                    cv.name()
                );
            }
        }
        let min_buffer = params.min_buffer(&colvars, &sigmas);
        let store = BiasStore::new(&colvars, params.use_grids)?;
        let reflection = if params.use_hills_reflection {
            let planner = ReflectionPlanner::new(
                params.reflection_limits(colvars.len()),
                params.reflection_range,
                params.reflection_type,
            )?;
            if params.use_grids {
                planner.validate_grid_buffer(&colvars, &sigmas)?;
            }
            Some(planner)
        } else {
            None
        };
        let interval = if params.use_hills_interval || params.use_hills_reflection {
            Some(IntervalLimits::new(params.interval_limits(colvars.len())))
        } else {
            None
        };
        let target_dist = if params.eb_meta {
            Some(load_target_dist(name, &colvars, &params)?)
        } else {
            None
        };
        let replica_id = params.replica_id.clone().unwrap_or_default();
        let coordinator = if params.multiple_replicas {
            Some(ReplicaCoordinator::new(name, &params)?)
        } else {
            None
        };
        let traj = if params.write_hills_trajectory {
            let suffix = if replica_id.is_empty() {
                String::new()
            } else {
                format!(".{replica_id}")
            };
            let path = PathBuf::from(format!(
                "{}.colvars.{name}{suffix}.hills.traj",
                params.output_prefix
            ));
            let file = File::create(&path).map_err(|source| Error::file(&path, source))?;
            Some(BufWriter::new(file))
        } else {
            None
        };
        let colvar_forces = colvars
            .iter()
            .map(|cv| Value::zero(cv.kind(), cv.num_components()))
            .collect();
        Ok(Self {
            name: name.to_owned(),
            sigmas,
            min_buffer,
            replica_id,
            kb: proxy.boltzmann(),
            temperature: proxy.target_temperature(),
            proxy,
            store,
            target_dist,
            reflection,
            interval,
            coordinator,
            traj,
            step: 0,
            accumulate: true,
            bias_energy: 0.0,
            colvar_forces,
            colvars,
            params,
        })
    }

    /// The bias name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The collective variables the bias acts on.
    #[must_use]
    pub fn colvars(&self) -> &[Colvar] {
        &self.colvars
    }

    /// The current simulation step.
    #[must_use]
    pub const fn step(&self) -> u64 {
        self.step
    }

    /// The store holding this replica's own hills and grids.
    #[must_use]
    pub const fn store(&self) -> &BiasStore {
        &self.store
    }

    /// The bias energy computed by the last [`Self::update`].
    #[must_use]
    pub const fn bias_energy(&self) -> f64 {
        self.bias_energy
    }

    /// The bias forces computed by the last [`Self::update`], one per
    /// collective variable.
    #[must_use]
    pub fn forces(&self) -> &[Value] {
        &self.colvar_forces
    }

    /// Enables or disables hill accumulation (analysis runs evaluate the
    /// bias without depositing).
    pub fn set_accumulate(&mut self, accumulate: bool) {
        self.accumulate = accumulate;
    }

    fn scalar_coords(&self, x: &[Value]) -> Option<Vec<f64>> {
        self.store.energy_grid().map(|_| {
            x.iter()
                .map(|value| value.components()[0])
                .collect()
        })
    }

    /// The total bias energy (own store plus every peer shadow) at `x`.
    #[must_use]
    pub fn energy_at(&self, x: &[Value]) -> f64 {
        let coords = self.scalar_coords(x);
        self.energy_total(x, coords.as_deref())
    }

    /// The total bias force at `x`, interval clipping applied.
    #[must_use]
    pub fn forces_at(&self, x: &[Value]) -> Vec<Value> {
        let coords = self.scalar_coords(x);
        let mut forces: Vec<Value> = self
            .colvars
            .iter()
            .map(|cv| Value::zero(cv.kind(), cv.num_components()))
            .collect();
        self.forces_total(x, coords.as_deref(), &mut forces);
        forces
    }

    fn energy_total(&self, x: &[Value], coords: Option<&[f64]>) -> f64 {
        let mut energy = self.store.energy_at(&self.colvars, x, coords);
        if let Some(coordinator) = &self.coordinator {
            for peer in coordinator.peers() {
                energy += peer.store().energy_at(&self.colvars, x, coords);
            }
        }
        energy
    }

    fn forces_total(&self, x: &[Value], coords: Option<&[f64]>, forces: &mut [Value]) {
        self.store.forces_at(&self.colvars, x, coords, forces);
        if let Some(coordinator) = &self.coordinator {
            for peer in coordinator.peers() {
                peer.store().forces_at(&self.colvars, x, coords, forces);
            }
        }
        if let Some(interval) = &self.interval {
            interval.clip(x, forces);
        }
    }

    /// Advances the bias by one simulation step: boundary expansion, hill
    /// deposition, grid projection, replica exchange, then the energy and
    /// force evaluation read back by the driver.
    ///
    /// # Errors
    ///
    /// Returns file errors from the local output paths and bug errors on
    /// violated invariants; peer-side file errors are logged and retried.
    pub fn update(&mut self, x: &[Value]) -> Result<()> {
        debug_assert_eq!(x.len(), self.colvars.len());
        self.step += 1;
        let coords = self.scalar_coords(x);
        if let Some(coords) = &coords {
            self.expand_grids(coords)?;
        }
        if self.accumulate && self.step % self.params.new_hill_frequency == 0 {
            self.deposit(x, coords.as_deref())?;
        }
        if self.store.energy_grid().is_some() && self.step % self.params.grids_frequency() == 0 {
            self.store.project_new(&self.colvars, self.params.keep_hills)?;
        }
        if self.coordinator.is_some()
            && self
                .params
                .replica_update_frequency
                .is_some_and(|freq| self.step % freq == 0)
        {
            self.replica_cycle()?;
        }
        self.bias_energy = self.energy_total(x, coords.as_deref());
        let mut forces = std::mem::take(&mut self.colvar_forces);
        for force in &mut forces {
            *force = force.scaled(0.0);
        }
        self.forces_total(x, coords.as_deref(), &mut forces);
        self.colvar_forces = forces;
        Ok(())
    }

    fn deposit(&mut self, x: &[Value], coords: Option<&[f64]>) -> Result<()> {
        if self
            .reflection
            .as_ref()
            .is_some_and(|planner| planner.outside_limits(x))
        {
            debug!("{}: position beyond a reflection limit, no hill", self.name);
            return Ok(());
        }
        let mut scale = 1.0;
        if let Some(target_dist) = &self.target_dist {
            if let Some(coords) = coords {
                let ix = target_dist.grid().bin_of(coords);
                if target_dist.grid().index_ok(&ix) {
                    let target = target_dist.value(&ix);
                    if target > 0.0 {
                        scale /= target;
                    }
                }
            }
            let equil = self.params.eb_meta_equil_steps;
            if equil > 0 && self.step < equil {
                let lambda =
                    convert::f64_from_u64(equil - self.step) / convert::f64_from_u64(equil);
                scale = (1.0 - lambda).mul_add(scale, lambda);
            }
        }
        if self.params.well_tempered {
            let energy_here = self.energy_total(x, coords);
            let kt_bias = self.params.bias_temperature.unwrap_or_default() * self.kb;
            scale *= (-energy_here / kt_bias).exp();
        }
        let weight = self.params.hill_weight * scale;
        let hill = Hill::new(
            self.step,
            weight,
            x.to_vec(),
            self.sigmas.clone(),
            &self.replica_id,
        )?;
        self.record_hill(hill)?;
        let mirrors = self
            .reflection
            .as_ref()
            .map(|planner| planner.mirrors(x, &self.sigmas))
            .unwrap_or_default();
        for centers in mirrors {
            let mirror = Hill::new(
                self.step,
                weight,
                centers,
                self.sigmas.clone(),
                &self.replica_id,
            )?;
            self.record_hill(mirror)?;
        }
        Ok(())
    }

    fn record_hill(&mut self, hill: Hill) -> Result<()> {
        if let Some(traj) = &mut self.traj {
            write!(traj, "{}", hill.step())?;
            for center in hill.centers() {
                for component in center.components() {
                    write!(traj, " {component:.9e}")?;
                }
            }
            for sigma in hill.sigmas() {
                write!(traj, " {:.9e}", 2.0 * sigma)?;
            }
            writeln!(traj, " {:.9e}", hill.weight())?;
        }
        if let Some(coordinator) = &mut self.coordinator {
            coordinator.buffer_hill(&hill)?;
        }
        self.store.add_hill(hill, self.min_buffer);
        Ok(())
    }

    /// Removes one of this replica's hills by deposition step, e.g. when a
    /// driver retracts a mis-deposited hill before the next projection.
    pub fn delete_hill(&mut self, step: u64) -> Result<Option<Hill>> {
        let removed = self.store.delete_hill(step, &self.replica_id);
        if removed.is_some() {
            if let Some(traj) = &mut self.traj {
                writeln!(traj, "# DELETED hill deposited at step {step}")?;
            }
        }
        Ok(removed)
    }

    fn expand_grids(&mut self, coords: &[f64]) -> Result<()> {
        if !self.colvars.iter().any(Colvar::expand_boundaries) {
            return Ok(());
        }
        let axes: Vec<GridAxis> = match self.store.energy_grid() {
            Some(energy) => energy.grid().axes().to_vec(),
            None => return Ok(()),
        };
        let buffer = convert::f64_from_usize(self.min_buffer);
        let mut extra = vec![(0_usize, 0_usize); axes.len()];
        let mut grow = false;
        for (dim, (axis, cv)) in axes.iter().zip(&self.colvars).enumerate() {
            if axis.periodic() || !cv.expand_boundaries() {
                continue;
            }
            let position = (coords[dim] - axis.lower()) / axis.width();
            if !cv.hard_lower_boundary() {
                let deficit = buffer - position;
                if deficit > 0.0 {
                    extra[dim].0 = convert::usize_from_f64(deficit.ceil());
                    grow = true;
                }
            }
            if !cv.hard_upper_boundary() {
                let deficit = buffer - (convert::f64_from_usize(axis.bins()) - position);
                if deficit > 0.0 {
                    extra[dim].1 = convert::usize_from_f64(deficit.ceil());
                    grow = true;
                }
            }
        }
        if !grow {
            return Ok(());
        }
        let new_axes: Vec<GridAxis> = axes
            .iter()
            .zip(&extra)
            .map(|(axis, &(lower, upper))| axis.expanded(lower, upper))
            .collect();
        for (cv, axis) in self.colvars.iter().zip(&new_axes) {
            info!(
                "{}: grid along {} expanded to [{}, {}]",
                self.name,
                cv.name(),
                axis.lower(),
                axis.upper()
            );
        }
        let mut new_energy = ScalarGrid::from_grid(Grid::from_axes(new_axes.clone(), 1))?;
        let mut new_gradients =
            GradientGrid::from_grid(Grid::from_axes(new_axes, self.colvars.len()))?;
        if let (Some(energy), Some(gradients)) =
            (self.store.energy_grid(), self.store.gradient_grid())
        {
            new_energy.grid_mut().map_grid(energy.grid());
            new_gradients.grid_mut().map_grid(gradients.grid());
        }
        self.store.replace_grids(new_energy, new_gradients);
        Ok(())
    }

    fn replica_cycle(&mut self) -> Result<()> {
        let state_text = {
            let mut buffer = Vec::new();
            self.state_data().write_text(&mut buffer)?;
            String::from_utf8(buffer).map_err(|_| Error::Bug("non-utf8 state text".to_owned()))?
        };
        let Some(coordinator) = &mut self.coordinator else {
            return Ok(());
        };
        coordinator.flush_hills()?;
        coordinator.write_state(&state_text, self.proxy.as_ref())?;
        coordinator.sync(
            &self.colvars,
            self.params.use_grids,
            self.min_buffer,
            self.params.keep_hills,
        );
        Ok(())
    }

    /// The combined free-energy estimate: the accumulated bias energy of
    /// every walker, shifted to a zero maximum, negated, and under
    /// well-tempering rescaled by `(T_bias + T)/T_bias`.
    ///
    /// # Errors
    ///
    /// Returns an input error when grids are disabled.
    pub fn write_pmf(&self, writer: impl Write) -> Result<()> {
        let Some(own) = self.store.energy_grid() else {
            return Err(Error::Input(format!(
                "{}: the free-energy surface requires useGrids",
                self.name
            )));
        };
        let mut pmf = own.clone();
        if let Some(coordinator) = &self.coordinator {
            for peer in coordinator.peers() {
                if let Some(peer_energy) = peer.store().energy_grid() {
                    if pmf.grid().same_shape(peer_energy.grid()) {
                        pmf.add_grid(peer_energy, 1.0)?;
                    } else {
                        warn!(
                            "{}: skipping replica {} in the free-energy surface, grid shapes \
                             differ",
                            self.name,
                            peer.id()
                        );
                    }
                }
            }
        }
        pmf.add_constant(-pmf.maximum_value());
        pmf.multiply_constant(-1.0);
        if self.params.well_tempered {
            let bias_temperature = self.params.bias_temperature.unwrap_or_default();
            pmf.multiply_constant((bias_temperature + self.temperature) / bias_temperature);
        }
        pmf.write_multicol(writer)
    }

    /// Writes the output files: the free-energy surface (with a
    /// step-stamped copy under `keepFreeEnergyFiles`) and, outside
    /// multiple-walker runs, the state checkpoint.
    ///
    /// # Errors
    ///
    /// Returns file errors naming the offending path.
    pub fn write_outputs(&mut self) -> Result<()> {
        if let Some(traj) = &mut self.traj {
            traj.flush()?;
        }
        if self.params.write_free_energy_file && self.store.energy_grid().is_some() {
            let path = PathBuf::from(format!("{}.{}.pmf", self.params.output_prefix, self.name));
            self.write_pmf_file(&path)?;
            if self.params.keep_free_energy_files {
                let stamped = PathBuf::from(format!(
                    "{}.{}.{}.pmf",
                    self.params.output_prefix, self.name, self.step
                ));
                self.write_pmf_file(&stamped)?;
            }
        }
        if self.coordinator.is_none() {
            self.write_state_file()?;
        }
        Ok(())
    }

    fn write_pmf_file(&self, path: &std::path::Path) -> Result<()> {
        let file = File::create(path).map_err(|source| Error::file(path, source))?;
        self.write_pmf(BufWriter::new(file))
    }

    fn write_state_file(&self) -> Result<()> {
        let path = PathBuf::from(format!(
            "{}.colvars.{}.state",
            self.params.output_prefix, self.name
        ));
        let tmp = path.with_extension("state.tmp");
        let file = File::create(&tmp).map_err(|source| Error::file(&tmp, source))?;
        let mut writer = BufWriter::new(file);
        self.state_data().write_text(&mut writer)?;
        writer.flush()?;
        drop(writer);
        self.proxy
            .rename_file(&tmp, &path)
            .map_err(|source| Error::file(&path, source))?;
        Ok(())
    }

    fn state_data(&self) -> StateData {
        StateData {
            step: self.step,
            name: self.name.clone(),
            version: STATE_VERSION,
            keep_hills: Some(self.params.keep_hills),
            energy: self.store.energy_grid().map(|grid| grid.grid().clone()),
            gradients: self.store.gradient_grid().map(|grid| grid.grid().clone()),
            hills: self.store.hills().iter().cloned().collect(),
        }
    }

    /// Writes the textual state block.
    ///
    /// # Errors
    ///
    /// Returns an error when writing fails.
    pub fn write_state(&self, writer: impl Write) -> Result<()> {
        self.state_data().write_text(writer)
    }

    /// Restores the bias from a textual state block.
    ///
    /// # Errors
    ///
    /// Returns a parse error on malformed input or a mismatched bias name.
    pub fn read_state(&mut self, src: &str) -> Result<()> {
        let data = StateData::read_text(src, &self.colvars)?;
        if data.name != self.name {
            return Err(Error::Parse(format!(
                "state block belongs to bias {}, not {}",
                data.name, self.name
            )));
        }
        self.step = data.step;
        self.store.restore(
            &self.colvars,
            data,
            self.params.keep_hills,
            self.params.rebin_grids,
            self.min_buffer,
        )
    }

    /// Serializes the bias into the binary state mirror.
    ///
    /// # Errors
    ///
    /// Returns a bug error when encoding fails or the byte cap is hit.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        self.state_data().to_bytes()
    }

    /// Restores the bias from a binary snapshot.
    ///
    /// # Errors
    ///
    /// Returns a parse error on a malformed stream or a mismatched name.
    pub fn restore_snapshot(&mut self, bytes: &[u8]) -> Result<()> {
        let data = StateData::from_bytes(bytes)?;
        if data.name != self.name {
            return Err(Error::Parse(format!(
                "snapshot belongs to bias {}, not {}",
                data.name, self.name
            )));
        }
        self.step = data.step;
        self.store.restore(
            &self.colvars,
            data,
            self.params.keep_hills,
            self.params.rebin_grids,
            self.min_buffer,
        )
    }
}

fn load_target_dist(name: &str, colvars: &[Colvar], params: &MetaParams) -> Result<ScalarGrid> {
    let path = params
        .target_dist_file
        .clone()
        .ok_or_else(|| Error::Input(format!("{name}: ebMeta requires targetDistFile")))?;
    let text = std::fs::read_to_string(&path).map_err(|source| Error::file(&path, source))?;
    let mut target_dist = ScalarGrid::new(colvars)?;
    target_dist.read_multicol(&text)?;
    if target_dist.minimum_value() < 0.0 {
        target_dist.simplexproj();
    }
    let integral = target_dist.integral();
    if integral <= 0.0 {
        return Err(Error::Input(format!(
            "{name}: the target distribution must have a positive integral"
        )));
    }
    target_dist.multiply_constant(1.0 / integral);
    // effective-volume normalization: typical values become one
    let volume = target_dist.entropy().exp();
    target_dist.multiply_constant(volume);
    if params.target_dist_min_val > 0.0 {
        let floor = params.target_dist_min_val * target_dist.maximum_value();
        target_dist.remove_small_values(floor);
    } else {
        warn!("{name}: targetDistMinVal is unset, the ebMeta scale is unbounded");
    }
    Ok(target_dist)
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    fn colvars() -> Vec<Colvar> {
        vec![Colvar::scalar("x", 0.1, -2.0, 2.0).unwrap()]
    }

    fn hill_at(step: u64, center: f64) -> Hill {
        Hill::new(step, 1.0, vec![Value::Scalar(center)], vec![0.2], "").unwrap()
    }

    #[test]
    fn projection_matches_the_analytic_sum() {
        let colvars = colvars();
        let mut store = BiasStore::new(&colvars, true).unwrap();
        store.add_hill(hill_at(1, 0.0), 4);
        store.add_hill(hill_at(2, 0.4), 4);
        let analytic_x = Value::Scalar(0.17);
        let analytic = store.energy_at(&colvars, &[analytic_x.clone()], None);
        store.project_new(&colvars, false).unwrap();
        assert!(store.hills().is_empty());
        // after projection the grid answers, up to the bin discretization
        let coords = [0.17];
        let projected = store.energy_at(&colvars, &[analytic_x], Some(&coords));
        let bin_center = 0.15;
        let expected: f64 = [0.0, 0.4]
            .iter()
            .map(|c| (-0.5 * ((bin_center - c) / 0.2_f64).powi(2)).exp())
            .sum();
        assert_approx_eq!(f64, projected, expected, epsilon = 1e-12);
        assert!((projected - analytic).abs() < 0.05);
    }

    #[test]
    fn off_grid_hills_survive_the_projection_wipe() {
        let colvars = colvars();
        let mut store = BiasStore::new(&colvars, true).unwrap();
        store.add_hill(hill_at(1, -1.95), 4);
        store.add_hill(hill_at(2, 0.0), 4);
        assert_eq!(store.off_grid().len(), 1);
        store.project_new(&colvars, false).unwrap();
        assert!(store.hills().is_empty());
        assert_eq!(store.off_grid().len(), 1);
        // outside the grid only the boundary hill contributes, analytically
        let x = Value::Scalar(-2.1);
        let outside = store.energy_at(&colvars, &[x], Some(&[-2.1]));
        let expected = (-0.5 * ((-2.1_f64 + 1.95) / 0.2).powi(2)).exp();
        assert_approx_eq!(f64, outside, expected, epsilon = 1e-12);
    }

    #[test]
    fn unprojected_hills_are_added_analytically() {
        let colvars = colvars();
        let mut store = BiasStore::new(&colvars, true).unwrap();
        store.add_hill(hill_at(1, 0.0), 4);
        store.project_new(&colvars, true).unwrap();
        store.add_hill(hill_at(2, 0.0), 4);
        let x = [Value::Scalar(0.05)];
        let with_fresh = store.energy_at(&colvars, &x, Some(&[0.05]));
        let fresh = (-0.5 * (0.05_f64 / 0.2).powi(2)).exp();
        let projected = (-0.5 * (0.05_f64 / 0.2).powi(2)).exp();
        // one hill from the grid (bin center 0.05), one analytic
        assert_approx_eq!(f64, with_fresh, fresh + projected, epsilon = 1e-12);
    }

    #[test]
    fn delete_hill_removes_the_off_grid_copy() {
        let colvars = colvars();
        let mut store = BiasStore::new(&colvars, true).unwrap();
        store.add_hill(hill_at(1, -1.95), 4);
        assert_eq!(store.off_grid().len(), 1);
        assert!(store.delete_hill(1, "").is_some());
        assert!(store.hills().is_empty());
        assert!(store.off_grid().is_empty());
        assert!(store.delete_hill(1, "").is_none());
    }

    #[test]
    fn restore_reprojects_when_rebinning() {
        let colvars = colvars();
        let mut store = BiasStore::new(&colvars, true).unwrap();
        let data = StateData {
            step: 10,
            name: "mtd".to_owned(),
            version: STATE_VERSION,
            keep_hills: Some(true),
            energy: None,
            gradients: None,
            hills: vec![hill_at(5, 0.0), hill_at(20, 1.0)],
        };
        store.restore(&colvars, data, true, true, 4).unwrap();
        // the hill from the future was pruned
        assert_eq!(store.hills().len(), 1);
        let energy = store.energy_at(&colvars, &[Value::Scalar(0.05)], Some(&[0.05]));
        assert_approx_eq!(
            f64,
            energy,
            (-0.5 * (0.05_f64 / 0.2).powi(2)).exp(),
            epsilon = 1e-12
        );
    }
}
