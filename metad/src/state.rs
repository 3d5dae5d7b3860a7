//! Checkpoint serialization: the textual state block and its binary mirror.

use crate::colvar::Colvar;
use crate::error::{Error, Result};
use crate::grid::Grid;
use crate::hill::Hill;
use crate::parse::Tokens;
use bincode::Options;
use log::warn;
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Version stamp written into new state blocks.
pub const STATE_VERSION: u32 = 20240729;

/// First version whose states always carry an explicit `keepHills` key.
pub const KEEP_HILLS_VERSION: u32 = 20210604;

/// Byte cap of the binary mirror.
const SNAPSHOT_LIMIT: u64 = 1 << 36;

/// One parsed (or to-be-written) checkpoint of a bias.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct StateData {
    /// The simulation step of the checkpoint.
    pub step: u64,
    /// The bias name.
    pub name: String,
    /// Format version stamp.
    pub version: u32,
    /// The `keepHills` flag; absent in states older than
    /// [`KEEP_HILLS_VERSION`].
    pub keep_hills: Option<bool>,
    /// The accumulated energy grid, when grids were in use.
    pub energy: Option<Grid>,
    /// The accumulated gradient grid, when grids were in use.
    pub gradients: Option<Grid>,
    /// The retained hills.
    pub hills: Vec<Hill>,
}

impl StateData {
    /// Writes the textual `metadynamics { … }` block: the key/value header,
    /// the optional embedded grids, then the hill records.
    ///
    /// # Errors
    ///
    /// Returns an error when writing fails.
    pub fn write_text(&self, mut writer: impl Write) -> Result<()> {
        writeln!(writer, "metadynamics {{")?;
        writeln!(writer, "  step {}", self.step)?;
        writeln!(writer, "  name {}", self.name)?;
        writeln!(writer, "  version {}", self.version)?;
        if let Some(keep) = self.keep_hills {
            writeln!(writer, "  keepHills {}", u8::from(keep))?;
        }
        if let Some(energy) = &self.energy {
            energy.write_block(&mut writer, "hills_energy")?;
        }
        if let Some(gradients) = &self.gradients {
            gradients.write_block(&mut writer, "hills_energy_gradients")?;
        }
        for hill in &self.hills {
            hill.write_record(&mut writer)?;
        }
        writeln!(writer, "}}")?;
        Ok(())
    }

    /// Parses a textual state block.
    ///
    /// # Errors
    ///
    /// Returns a parse error on a malformed block.
    pub fn read_text(src: &str, colvars: &[Colvar]) -> Result<Self> {
        let mut tokens = Tokens::new(src);
        tokens.expect("metadynamics")?;
        tokens.expect("{")?;
        let mut data = Self {
            step: 0,
            name: String::new(),
            version: 0,
            keep_hills: None,
            energy: None,
            gradients: None,
            hills: Vec::new(),
        };
        loop {
            match tokens.peek() {
                None => {
                    return Err(Error::Parse(
                        "unterminated metadynamics state block".to_owned(),
                    ))
                }
                Some("}") => {
                    tokens.next();
                    break;
                }
                Some("hill") => {
                    if let Some(hill) = Hill::read_record(&mut tokens, colvars)? {
                        data.hills.push(hill);
                    }
                }
                Some("step") => {
                    tokens.next();
                    data.step = tokens.next_u64()?;
                }
                Some("name") => {
                    tokens.next();
                    data.name = tokens.expect_token()?.to_owned();
                }
                Some("version") => {
                    tokens.next();
                    data.version = u32::try_from(tokens.next_u64()?)
                        .map_err(|_| Error::Parse("version out of range".to_owned()))?;
                }
                Some("keepHills") => {
                    tokens.next();
                    data.keep_hills = Some(tokens.next_bool()?);
                }
                Some("hills_energy") => {
                    tokens.next();
                    data.energy = Some(Grid::read_block(&mut tokens)?);
                }
                Some("hills_energy_gradients") => {
                    tokens.next();
                    data.gradients = Some(Grid::read_block(&mut tokens)?);
                }
                Some(key) => {
                    return Err(Error::Parse(format!(
                        "unrecognized state key `{key}`"
                    )));
                }
            }
        }
        Ok(data)
    }

    /// The `keepHills` flag under the compatibility rule: states older than
    /// [`KEEP_HILLS_VERSION`] without the key inherit an active flag from
    /// the current configuration, with a warning.
    #[must_use]
    pub fn effective_keep_hills(&self, config_keep_hills: bool) -> bool {
        self.keep_hills.unwrap_or_else(|| {
            if self.version < KEEP_HILLS_VERSION && config_keep_hills {
                warn!(
                    "{}: old state (version {}) without keepHills; assuming keepHills on",
                    self.name, self.version
                );
                true
            } else {
                false
            }
        })
    }

    fn bincode_options() -> impl Options {
        bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .allow_trailing_bytes()
            .with_limit(SNAPSHOT_LIMIT)
    }

    /// Serializes the checkpoint into the length-prefixed binary mirror.
    ///
    /// # Errors
    ///
    /// Returns a bug error when encoding fails or the byte cap is hit.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Self::bincode_options()
            .serialize(self)
            .map_err(|source| Error::Bug(format!("state snapshot failed: {source}")))
    }

    /// Restores a checkpoint from the binary mirror.
    ///
    /// # Errors
    ///
    /// Returns a parse error on a malformed or truncated stream.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::bincode_options()
            .deserialize(bytes)
            .map_err(|source| Error::Parse(format!("state snapshot rejected: {source}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::colvar::Value;
    use float_cmp::assert_approx_eq;

    fn colvars() -> Vec<Colvar> {
        vec![Colvar::scalar("x", 0.1, 0.0, 1.0).unwrap()]
    }

    fn sample() -> StateData {
        let colvars = colvars();
        let mut energy = Grid::new(&colvars, 1).unwrap();
        energy.acc_value_slot(&[4], 0, 0.25);
        let mut gradients = Grid::new(&colvars, 1).unwrap();
        gradients.acc_value_slot(&[4], 0, -0.5);
        StateData {
            step: 2000,
            name: "mtd".to_owned(),
            version: STATE_VERSION,
            keep_hills: Some(true),
            energy: Some(energy),
            gradients: Some(gradients),
            hills: vec![
                Hill::new(1000, 1.0, vec![Value::Scalar(0.45)], vec![0.05], "").unwrap(),
                Hill::new(2000, 0.5, vec![Value::Scalar(0.55)], vec![0.05], "").unwrap(),
            ],
        }
    }

    #[test]
    fn text_round_trip() {
        let data = sample();
        let mut buffer = Vec::new();
        data.write_text(&mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let read = StateData::read_text(&text, &colvars()).unwrap();
        assert_eq!(read.step, data.step);
        assert_eq!(read.name, data.name);
        assert_eq!(read.keep_hills, Some(true));
        assert_eq!(read.hills, data.hills);
        let energy = read.energy.unwrap();
        assert_approx_eq!(f64, energy.value_slot(&[4], 0), 0.25, ulps = 2);
    }

    #[test]
    fn binary_round_trip_is_exact() {
        let data = sample();
        let bytes = data.to_bytes().unwrap();
        let read = StateData::from_bytes(&bytes).unwrap();
        assert_eq!(read, data);
    }

    #[test]
    fn truncated_binary_stream_is_rejected() {
        let bytes = sample().to_bytes().unwrap();
        assert!(StateData::from_bytes(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn old_states_inherit_keep_hills_from_the_configuration() {
        let mut data = sample();
        data.keep_hills = None;
        data.version = 20200101;
        assert!(data.effective_keep_hills(true));
        assert!(!data.effective_keep_hills(false));
        data.version = STATE_VERSION;
        assert!(!data.effective_keep_hills(true));
    }
}
