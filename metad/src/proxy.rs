//! The interface the biasing core consumes from the MD engine.

use std::io;
use std::path::Path;

/// Engine-side services needed by the bias: physical constants, the
/// thermostat target, and the file primitives used by the multiple-walker
/// protocol.
pub trait EngineProxy {
    /// The Boltzmann constant in the engine's unit system.
    fn boltzmann(&self) -> f64;

    /// The integration timestep.
    fn timestep(&self) -> f64;

    /// The thermostat target temperature.
    fn target_temperature(&self) -> f64;

    /// The index of this replica in a multiple-walker ensemble.
    fn replica_index(&self) -> usize {
        0
    }

    /// Atomically replaces `to` with `from`.
    ///
    /// # Errors
    ///
    /// Forwards the underlying I/O error.
    fn rename_file(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    /// Removes `path`.
    ///
    /// # Errors
    ///
    /// Forwards the underlying I/O error.
    fn remove_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }
}

/// Proxy with fixed constants, for drivers embedding the engine directly.
#[derive(Clone, Copy, Debug)]
pub struct StdProxy {
    /// The Boltzmann constant; defaults to kcal/(mol·K).
    pub boltzmann: f64,
    /// The integration timestep.
    pub timestep: f64,
    /// The thermostat target temperature.
    pub temperature: f64,
}

impl Default for StdProxy {
    fn default() -> Self {
        Self {
            boltzmann: 0.001987191,
            timestep: 1.0,
            temperature: 300.0,
        }
    }
}

impl EngineProxy for StdProxy {
    fn boltzmann(&self) -> f64 {
        self.boltzmann
    }

    fn timestep(&self) -> f64 {
        self.timestep
    }

    fn target_temperature(&self) -> f64 {
        self.temperature
    }
}
