//! File-based coordination between multiple walkers.
//!
//! The registry lists every walker and points at its per-replica list file;
//! each walker appends hills to its own hills file and atomically rewrites
//! its own state file. Peers are only ever read, never written, so the
//! protocol needs no locks.

use crate::bias::BiasStore;
use crate::colvar::Colvar;
use crate::error::{Error, Result};
use crate::hill::Hill;
use crate::params::MetaParams;
use crate::parse::Tokens;
use crate::proxy::EngineProxy;
use crate::state::StateData;
use log::{info, warn};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// One peer walker: its registry paths, read cursors and shadow store.
#[derive(Debug)]
pub struct PeerReplica {
    id: String,
    list_path: PathBuf,
    state_path: Option<PathBuf>,
    hills_path: Option<PathBuf>,
    hills_pos: u64,
    state_in_sync: bool,
    update_status: u32,
    stale_cycles: u32,
    warned_stale: bool,
    store: BiasStore,
}

impl PeerReplica {
    /// The peer's registry id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The shadow store fed from the peer's files.
    #[must_use]
    pub const fn store(&self) -> &BiasStore {
        &self.store
    }

    /// Whether the peer's state file has been imported successfully.
    #[must_use]
    pub const fn state_in_sync(&self) -> bool {
        self.state_in_sync
    }

    /// Consecutive failed attempts to import this peer.
    #[must_use]
    pub const fn update_status(&self) -> u32 {
        self.update_status
    }
}

/// Registers the local walker in the registry and exchanges hills with the
/// peers found there.
#[derive(Debug)]
pub struct ReplicaCoordinator {
    name: String,
    replica_id: String,
    registry_path: PathBuf,
    stale_cycle_limit: u32,
    list_path: PathBuf,
    hills_path: PathBuf,
    state_path: PathBuf,
    hills_buffer: Vec<u8>,
    peers: Vec<PeerReplica>,
}

impl ReplicaCoordinator {
    /// Sets up the local walker: derives the per-replica paths from the
    /// registry location, appends the registry entry when absent, and
    /// writes the list file.
    ///
    /// # Errors
    ///
    /// Returns an input error when the replica keys are missing and file
    /// errors when the registry or list file cannot be written.
    pub fn new(name: &str, params: &MetaParams) -> Result<Self> {
        let replica_id = params
            .replica_id
            .clone()
            .ok_or_else(|| Error::Input("multipleReplicas requires replicaID".to_owned()))?;
        let registry_path = params.replicas_registry.clone().ok_or_else(|| {
            Error::Input("multipleReplicas requires replicasRegistry".to_owned())
        })?;
        let update_frequency = params.replica_update_frequency.ok_or_else(|| {
            Error::Input("multipleReplicas requires replicaUpdateFrequency".to_owned())
        })?;
        let stale_cycle_limit =
            u32::try_from(3 * (update_frequency / params.new_hill_frequency + 1))
                .unwrap_or(u32::MAX);
        let cwd = registry_path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let prefix = &params.output_prefix;
        let list_path = cwd.join(format!("{name}.{replica_id}.files.txt"));
        let hills_path = cwd.join(format!("{prefix}.colvars.{name}.{replica_id}.hills"));
        let state_path = cwd.join(format!("{prefix}.colvars.{name}.{replica_id}.state"));

        let registry_text = match std::fs::read_to_string(&registry_path) {
            Ok(text) => text,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(source) => return Err(Error::file(&registry_path, source)),
        };
        let registered = registry_text
            .lines()
            .any(|line| line.split_whitespace().next() == Some(replica_id.as_str()));
        if !registered {
            let mut registry = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&registry_path)
                .map_err(|source| Error::file(&registry_path, source))?;
            writeln!(registry, "{replica_id} {}", list_path.display())
                .map_err(|source| Error::file(&registry_path, source))?;
        }
        std::fs::write(
            &list_path,
            format!(
                "stateFile {}\nhillsFile {}\n",
                state_path.display(),
                hills_path.display()
            ),
        )
        .map_err(|source| Error::file(&list_path, source))?;

        Ok(Self {
            name: name.to_owned(),
            replica_id,
            registry_path,
            stale_cycle_limit,
            list_path,
            hills_path,
            state_path,
            hills_buffer: Vec::new(),
            peers: Vec::new(),
        })
    }

    /// The id of the local walker.
    #[must_use]
    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    /// The peers discovered so far.
    #[must_use]
    pub fn peers(&self) -> &[PeerReplica] {
        &self.peers
    }

    /// The local hills file path.
    #[must_use]
    pub fn hills_path(&self) -> &Path {
        &self.hills_path
    }

    /// The local state file path.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Queues one deposited hill for the next flush of the local hills
    /// file.
    ///
    /// # Errors
    ///
    /// Returns an error when the record cannot be serialized.
    pub fn buffer_hill(&mut self, hill: &Hill) -> Result<()> {
        hill.write_record(&mut self.hills_buffer)
    }

    /// Appends the queued hill records to the local hills file.
    ///
    /// # Errors
    ///
    /// Returns a file error naming the hills file.
    pub fn flush_hills(&mut self) -> Result<()> {
        if self.hills_buffer.is_empty() {
            return Ok(());
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.hills_path)
            .map_err(|source| Error::file(&self.hills_path, source))?;
        file.write_all(&self.hills_buffer)
            .and_then(|()| file.flush())
            .map_err(|source| Error::file(&self.hills_path, source))?;
        self.hills_buffer.clear();
        Ok(())
    }

    /// Atomically rewrites the local state file: the text lands in a
    /// temporary file first and is renamed over the final path through the
    /// proxy.
    ///
    /// # Errors
    ///
    /// Returns a file error naming the state file.
    pub fn write_state(&self, state_text: &str, proxy: &dyn EngineProxy) -> Result<()> {
        let tmp = PathBuf::from(format!("{}.tmp", self.state_path.display()));
        std::fs::write(&tmp, state_text).map_err(|source| Error::file(&tmp, source))?;
        proxy
            .rename_file(&tmp, &self.state_path)
            .map_err(|source| Error::file(&self.state_path, source))
    }

    /// One synchronization cycle: re-read the registry, then import every
    /// peer's state and new hills. Peer-side failures are logged and
    /// retried next cycle; they never abort the run.
    pub fn sync(
        &mut self,
        colvars: &[Colvar],
        use_grids: bool,
        min_buffer: usize,
        keep_hills: bool,
    ) {
        self.read_registry(colvars, use_grids);
        for index in 0..self.peers.len() {
            self.import_peer(index, colvars, min_buffer, keep_hills);
        }
    }

    fn read_registry(&mut self, colvars: &[Colvar], use_grids: bool) {
        let text = match std::fs::read_to_string(&self.registry_path) {
            Ok(text) => text,
            Err(source) => {
                warn!(
                    "{}[{}]: cannot read registry {}: {source}",
                    self.name,
                    self.replica_id,
                    self.registry_path.display()
                );
                return;
            }
        };
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or_default();
            let mut fields = line.split_whitespace();
            let (Some(id), Some(list)) = (fields.next(), fields.next()) else {
                continue;
            };
            if id == self.replica_id || self.peers.iter().any(|peer| peer.id == id) {
                continue;
            }
            match BiasStore::new(colvars, use_grids) {
                Ok(store) => {
                    info!(
                        "{}[{}]: discovered replica {id}",
                        self.name, self.replica_id
                    );
                    self.peers.push(PeerReplica {
                        id: id.to_owned(),
                        list_path: PathBuf::from(list),
                        state_path: None,
                        hills_path: None,
                        hills_pos: 0,
                        state_in_sync: false,
                        update_status: 0,
                        stale_cycles: 0,
                        warned_stale: false,
                        store,
                    });
                }
                Err(source) => warn!(
                    "{}[{}]: cannot allocate a shadow bias for replica {id}: {source}",
                    self.name, self.replica_id
                ),
            }
        }
    }

    fn import_peer(
        &mut self,
        index: usize,
        colvars: &[Colvar],
        min_buffer: usize,
        keep_hills: bool,
    ) {
        let peer = &mut self.peers[index];
        match std::fs::read_to_string(&peer.list_path) {
            Ok(text) => {
                let mut state_path = None;
                let mut hills_path = None;
                for line in text.lines() {
                    let mut fields = line.split_whitespace();
                    match (fields.next(), fields.next()) {
                        (Some("stateFile"), Some(path)) => state_path = Some(PathBuf::from(path)),
                        (Some("hillsFile"), Some(path)) => hills_path = Some(PathBuf::from(path)),
                        _ => {}
                    }
                }
                if state_path.is_some() && peer.state_path != state_path {
                    peer.state_in_sync = false;
                    peer.hills_pos = 0;
                    peer.state_path = state_path;
                }
                if hills_path.is_some() {
                    peer.hills_path = hills_path;
                }
            }
            Err(source) => {
                peer.update_status += 1;
                warn!(
                    "{}[{}]: cannot read the list file of replica {}: {source}",
                    self.name, self.replica_id, peer.id
                );
                return;
            }
        }
        if !peer.state_in_sync {
            if let Some(state_path) = peer.state_path.clone() {
                let restored = std::fs::read_to_string(&state_path)
                    .map_err(Error::from)
                    .and_then(|text| StateData::read_text(&text, colvars))
                    .and_then(|data| {
                        peer.store
                            .restore(colvars, data, keep_hills, false, min_buffer)
                    });
                match restored {
                    Ok(()) => {
                        peer.state_in_sync = true;
                        peer.update_status = 0;
                    }
                    Err(source) => {
                        peer.update_status += 1;
                        warn!(
                            "{}[{}]: state of replica {} not importable yet: {source}",
                            self.name, self.replica_id, peer.id
                        );
                    }
                }
            }
        }
        let Some(hills_path) = peer.hills_path.clone() else {
            return;
        };
        let mut consumed_any = false;
        if let Ok(mut file) = File::open(&hills_path) {
            let length = file.metadata().map(|meta| meta.len()).unwrap_or_default();
            if length < peer.hills_pos {
                warn!(
                    "{}[{}]: the hills file of replica {} shrank, resynchronizing",
                    self.name, self.replica_id, peer.id
                );
                peer.hills_pos = 0;
                peer.state_in_sync = false;
            }
            let mut text = String::new();
            let read = file
                .seek(SeekFrom::Start(peer.hills_pos))
                .and_then(|_| file.read_to_string(&mut text));
            match read {
                Ok(_) => {
                    let mut tokens = Tokens::new(&text);
                    let mut consumed = 0_usize;
                    loop {
                        match Hill::read_record(&mut tokens, colvars) {
                            Ok(Some(hill)) => {
                                consumed = tokens.pos();
                                if hill.step() > peer.store.step() {
                                    peer.store.add_hill(hill, min_buffer);
                                }
                            }
                            // an incomplete trailing record waits for the
                            // peer to finish writing it
                            Ok(None) | Err(_) => break,
                        }
                    }
                    if consumed > 0 {
                        peer.hills_pos += consumed as u64;
                        consumed_any = true;
                        if let Err(source) = peer.store.project_new(colvars, keep_hills) {
                            warn!(
                                "{}[{}]: cannot project hills of replica {}: {source}",
                                self.name, self.replica_id, peer.id
                            );
                        }
                    }
                }
                Err(source) => {
                    peer.hills_pos = 0;
                    peer.state_in_sync = false;
                    warn!(
                        "{}[{}]: lost the hills stream of replica {}, restarting from the \
                         beginning: {source}",
                        self.name, self.replica_id, peer.id
                    );
                }
            }
        }
        if consumed_any {
            peer.stale_cycles = 0;
            peer.warned_stale = false;
        } else {
            peer.stale_cycles += 1;
            if peer.stale_cycles > self.stale_cycle_limit && !peer.warned_stale {
                warn!(
                    "{}[{}]: no new hills from replica {} for {} cycles",
                    self.name, self.replica_id, peer.id, peer.stale_cycles
                );
                peer.warned_stale = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::colvar::Value;
    use float_cmp::assert_approx_eq;

    fn colvars() -> Vec<Colvar> {
        vec![Colvar::scalar("x", 0.1, -2.0, 2.0).unwrap()]
    }

    fn params_for(id: &str, registry: &Path) -> MetaParams {
        MetaParams {
            hill_weight: 1.0,
            new_hill_frequency: 10,
            multiple_replicas: true,
            replica_id: Some(id.to_owned()),
            replicas_registry: Some(registry.to_path_buf()),
            replica_update_frequency: Some(50),
            ..MetaParams::default()
        }
    }

    #[test]
    fn setup_registers_both_walkers() {
        let dir = tempfile::tempdir().unwrap();
        let registry = dir.path().join("registry.txt");
        let a = ReplicaCoordinator::new("mtd", &params_for("a", &registry)).unwrap();
        let _b = ReplicaCoordinator::new("mtd", &params_for("b", &registry)).unwrap();
        let text = std::fs::read_to_string(&registry).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert_eq!(a.replica_id(), "a");
        assert!(a.state_path().ends_with("output.colvars.mtd.a.state"));
        assert!(std::fs::read_to_string(dir.path().join("mtd.a.files.txt"))
            .unwrap()
            .contains("hillsFile"));
    }

    #[test]
    fn hills_flow_from_one_walker_to_the_other() {
        let dir = tempfile::tempdir().unwrap();
        let registry = dir.path().join("registry.txt");
        let colvars = colvars();
        let mut a = ReplicaCoordinator::new("mtd", &params_for("a", &registry)).unwrap();
        let mut b = ReplicaCoordinator::new("mtd", &params_for("b", &registry)).unwrap();

        let hill = Hill::new(100, 1.0, vec![Value::Scalar(0.5)], vec![0.2], "a").unwrap();
        a.buffer_hill(&hill).unwrap();
        a.flush_hills().unwrap();

        b.sync(&colvars, true, 4, true);
        assert_eq!(b.peers().len(), 1);
        let peer = &b.peers()[0];
        assert_eq!(peer.id(), "a");
        assert_eq!(peer.store().hills().len(), 1);

        // a second cycle with no new data imports nothing twice
        b.sync(&colvars, true, 4, true);
        assert_eq!(b.peers()[0].store().hills().len(), 1);
    }

    #[test]
    fn partial_trailing_records_wait_for_the_next_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let registry = dir.path().join("registry.txt");
        let colvars = colvars();
        let mut a = ReplicaCoordinator::new("mtd", &params_for("a", &registry)).unwrap();
        let mut b = ReplicaCoordinator::new("mtd", &params_for("b", &registry)).unwrap();

        let hill = Hill::new(100, 1.0, vec![Value::Scalar(0.5)], vec![0.2], "a").unwrap();
        a.buffer_hill(&hill).unwrap();
        a.flush_hills().unwrap();
        // a half-written record at the end of the file
        let mut file = OpenOptions::new().append(true).open(a.hills_path()).unwrap();
        write!(file, "hill {{ step 200 weight 1.0").unwrap();
        drop(file);

        b.sync(&colvars, true, 4, true);
        assert_eq!(b.peers()[0].store().hills().len(), 1);

        // the record completes and arrives on the following cycle
        let mut file = OpenOptions::new().append(true).open(a.hills_path()).unwrap();
        writeln!(
            file,
            " centers 6.00000000000000e-1 widths 4.00000000000000e-1 replicaID a }}"
        )
        .unwrap();
        drop(file);
        b.sync(&colvars, true, 4, true);
        let peer = &b.peers()[0];
        assert_eq!(peer.store().hills().len(), 2);
        let energy = peer.store().energy_at(
            &colvars,
            &[Value::Scalar(0.55)],
            None,
        );
        assert_approx_eq!(
            f64,
            energy,
            (-0.5 * (0.05_f64 / 0.2).powi(2)).exp() + (-0.5 * (0.05_f64 / 0.2).powi(2)).exp(),
            epsilon = 1e-12
        );
    }
}
