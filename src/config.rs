use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Timing and compaction knobs for a member.
///
/// The election timeout is drawn uniformly from
/// `[election_timeout_min_ms, election_timeout_max_ms]` and should be at
/// least twice the typical one-way RPC latency; the heartbeat interval
/// must stay below the minimum election timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftOptions {
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,

    /// Retained log entries beyond which the member compacts its prefix
    /// into a snapshot.
    pub snapshot_threshold: usize,
}

impl Default for RaftOptions {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            snapshot_threshold: 64,
        }
    }
}

impl RaftOptions {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let options: Self = toml::from_str(&content)?;
        Ok(options)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// A fresh randomized election timeout.
    pub fn election_timeout(&self) -> Duration {
        let ms = rand::thread_rng()
            .gen_range(self.election_timeout_min_ms..=self.election_timeout_max_ms);
        Duration::from_millis(ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_round_trip_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raft.toml");

        let options = RaftOptions {
            election_timeout_min_ms: 100,
            election_timeout_max_ms: 200,
            heartbeat_interval_ms: 25,
            snapshot_threshold: 16,
        };
        options.save(&path).unwrap();

        let loaded = RaftOptions::load(&path).unwrap();
        assert_eq!(loaded.election_timeout_min_ms, 100);
        assert_eq!(loaded.election_timeout_max_ms, 200);
        assert_eq!(loaded.heartbeat_interval_ms, 25);
        assert_eq!(loaded.snapshot_threshold, 16);
    }

    #[test]
    fn election_timeout_stays_in_range() {
        let options = RaftOptions::default();
        for _ in 0..50 {
            let timeout = options.election_timeout();
            assert!(timeout >= Duration::from_millis(options.election_timeout_min_ms));
            assert!(timeout <= Duration::from_millis(options.election_timeout_max_ms));
        }
    }
}
