//! Per-torrent JSON state persistence (spec.md §6 Persistence).
//!
//! Each torrent's durable state lives at
//! `<data_dir>/torrents/<info-hash-hex>.json` so the engine can resume a
//! torrent across restarts without re-announcing from scratch or losing
//! completed pieces.

use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::torrent::State;
use crate::{Result, Sha1Hash};

/// The on-disk schema version. Bump and add a migration path if the shape
/// of [`PersistedTorrent`] ever changes incompatibly.
pub(crate) const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PersistedTorrent {
    pub version: u32,
    pub info_hash: String,
    pub name: String,
    pub state: PersistedState,
    pub download_dir: PathBuf,
    pub total_len: u64,
    pub piece_len: u32,
    pub piece_count: usize,
    pub downloaded: u64,
    pub uploaded: u64,
    pub added_at: i64,
    pub completed_at: Option<i64>,
    /// Hex-encoded wire-format bitfield of completed pieces.
    pub completed_pieces: String,
    /// User-assigned labels, persisted per torrent (see DESIGN.md's Open
    /// Question #3).
    pub labels: Vec<String>,
}

/// Mirrors [`crate::torrent::State`] for the parts that make sense to
/// resume into: a torrent that was `Checking` or `Error` when the engine
/// last shut down restarts into `Checking` on the next add.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum PersistedState {
    Queued,
    Downloading,
    Seeding,
    Paused,
}

impl From<State> for PersistedState {
    fn from(state: State) -> Self {
        match state {
            State::Queued | State::Checking => PersistedState::Queued,
            State::Downloading => PersistedState::Downloading,
            State::Seeding => PersistedState::Seeding,
            State::Paused | State::Error => PersistedState::Paused,
        }
    }
}

pub(crate) fn torrent_state_path(data_dir: &Path, info_hash: &Sha1Hash) -> PathBuf {
    data_dir.join("torrents").join(format!("{}.json", hex::encode(info_hash)))
}

/// Writes `torrent`'s state file, creating the `torrents` directory if
/// necessary. Uses a temp-file-then-rename so a crash mid-write can't leave
/// a half-written, unparseable state file behind.
pub(crate) fn save(data_dir: &Path, torrent: &PersistedTorrent) -> Result<()> {
    let dir = data_dir.join("torrents");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{}.json", torrent.info_hash));
    let tmp_path = dir.join(format!("{}.json.tmp", torrent.info_hash));
    let json = serde_json::to_vec_pretty(torrent)
        .map_err(|e| Error::Metadata(format!("failed to serialize torrent state: {}", e)))?;
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

pub(crate) fn load(data_dir: &Path, info_hash: &Sha1Hash) -> Result<PersistedTorrent> {
    let path = torrent_state_path(data_dir, info_hash);
    let bytes = std::fs::read(&path)?;
    let torrent: PersistedTorrent = serde_json::from_slice(&bytes)
        .map_err(|e| Error::Metadata(format!("failed to parse torrent state {:?}: {}", path, e)))?;
    if torrent.version != SCHEMA_VERSION {
        return Err(Error::Metadata(format!(
            "unsupported torrent state schema version {} in {:?}",
            torrent.version, path
        )));
    }
    Ok(torrent)
}

/// Loads every valid `*.json` state file under `<data_dir>/torrents`,
/// skipping (and logging) any that fail to parse rather than aborting
/// startup over one corrupt file.
pub(crate) fn load_all(data_dir: &Path) -> Vec<PersistedTorrent> {
    let dir = data_dir.join("torrents");
    let Ok(entries) = std::fs::read_dir(&dir) else { return Vec::new() };
    let mut out = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match std::fs::read(&path).map_err(Error::from).and_then(|bytes| {
            serde_json::from_slice::<PersistedTorrent>(&bytes)
                .map_err(|e| Error::Metadata(format!("failed to parse {:?}: {}", path, e)))
        }) {
            Ok(torrent) if torrent.version == SCHEMA_VERSION => out.push(torrent),
            Ok(torrent) => log::warn!(
                "Skipping torrent state {:?}: unsupported schema version {}",
                path,
                torrent.version
            ),
            Err(e) => log::warn!("Skipping unreadable torrent state {:?}: {}", path, e),
        }
    }
    out
}

pub(crate) fn remove(data_dir: &Path, info_hash: &Sha1Hash) -> Result<()> {
    let path = torrent_state_path(data_dir, info_hash);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(info_hash: &str) -> PersistedTorrent {
        PersistedTorrent {
            version: SCHEMA_VERSION,
            info_hash: info_hash.to_string(),
            name: "test.bin".into(),
            state: PersistedState::Downloading,
            download_dir: PathBuf::from("/tmp/downloads"),
            total_len: 1000,
            piece_len: 100,
            piece_count: 10,
            downloaded: 500,
            uploaded: 0,
            added_at: 0,
            completed_at: None,
            completed_pieces: "ff00".into(),
            labels: vec!["linux-isos".into()],
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let hash = [0xAB; 20];
        let torrent = sample(&hex::encode(hash));
        save(dir.path(), &torrent).unwrap();
        let loaded = load(dir.path(), &hash).unwrap();
        assert_eq!(loaded.name, "test.bin");
        assert_eq!(loaded.downloaded, 500);
        assert_eq!(loaded.labels, vec!["linux-isos".to_string()]);
    }

    #[test]
    fn load_all_skips_corrupt_files() {
        let dir = tempdir().unwrap();
        let torrents_dir = dir.path().join("torrents");
        std::fs::create_dir_all(&torrents_dir).unwrap();
        std::fs::write(torrents_dir.join("good.json"), serde_json::to_vec(&sample("aa")).unwrap())
            .unwrap();
        std::fs::write(torrents_dir.join("bad.json"), b"not json").unwrap();
        let loaded = load_all(dir.path());
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn remove_is_idempotent_for_missing_file() {
        let dir = tempdir().unwrap();
        assert!(remove(dir.path(), &[0u8; 20]).is_ok());
    }
}
