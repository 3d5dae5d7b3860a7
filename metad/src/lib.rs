//! `metad` is a grid-accelerated metadynamics biasing engine.
//!
//! The engine deposits Gaussian hills along a set of collective variables,
//! accumulates them on regular grids together with their gradients, and
//! hands the resulting bias energy and forces back to the simulation
//! driver. Well-tempered and ensemble-biased scaling, mirror hills at
//! reflecting boundaries, and file-based multiple-walker runs are all
//! driven from the same [`bias::MetaBias`] front end.

pub mod bias;
pub mod colvar;
mod convert;
pub mod error;
pub mod gradient_grid;
pub mod grid;
pub mod hill;
pub mod params;
mod parse;
pub mod proxy;
pub mod reflection;
pub mod replica;
pub mod scalar_grid;
pub mod state;
