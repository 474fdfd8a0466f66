use crate::state_machine::ReplicatedState;
use crate::types::PersistentState;
use std::fs;
use std::io;
use std::path::PathBuf;

/// Durable storage for a member's persistent state, for embedders whose
/// capability wants a ready-made writer. The whole state is written as one
/// document; there is nothing incremental to get half-right.
pub trait PersistentStore<S: ReplicatedState>: Send + Sync {
    fn save(&mut self, state: &PersistentState<S>) -> io::Result<()>;
    fn load(&self) -> io::Result<Option<PersistentState<S>>>;
}

/// In-memory store, used by the simulation harness as a member's "disk".
#[derive(Debug, Default)]
pub struct InMemoryStore<S: ReplicatedState> {
    state: Option<PersistentState<S>>,
}

impl<S: ReplicatedState> InMemoryStore<S> {
    pub fn new(state: PersistentState<S>) -> Self {
        Self { state: Some(state) }
    }

    pub fn empty() -> Self {
        Self { state: None }
    }
}

impl<S: ReplicatedState> PersistentStore<S> for InMemoryStore<S> {
    fn save(&mut self, state: &PersistentState<S>) -> io::Result<()> {
        self.state = Some(state.clone());
        Ok(())
    }

    fn load(&self) -> io::Result<Option<PersistentState<S>>> {
        Ok(self.state.clone())
    }
}

/// File-backed store keeping the state as a single JSON document,
/// written to a temp file and renamed so a crash never leaves a
/// partially-written state behind.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join("state.json")
    }
}

impl<S: ReplicatedState> PersistentStore<S> for FileStore {
    fn save(&mut self, state: &PersistentState<S>) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let temp_path = self.dir.join("state.tmp");
        fs::write(&temp_path, json)?;
        fs::rename(&temp_path, self.state_path())?;
        Ok(())
    }

    fn load(&self) -> io::Result<Option<PersistentState<S>>> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read(&path)?;
        let state = serde_json::from_slice(&contents)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(state))
    }
}
