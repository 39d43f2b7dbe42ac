//! Checkpoint artifact persistence.
//!
//! A node keeps at most one tentative artifact at a time. Committing
//! renames it to a sequence-stamped permanent file, which is the atomic
//! step; aborting deletes it. Artifacts are two-line text files (the
//! sequence number, then the frozen clock counters) so they stay
//! readable by external tooling.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::SnapshotError;
use crate::types::{NodeId, SequenceNumber};

/// Content of one checkpoint artifact: the sequence it belongs to and
/// the clock frozen at session start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointArtifact {
    /// Checkpoint sequence number.
    pub seq: SequenceNumber,
    /// Frozen vector clock entries.
    pub clock: Vec<u64>,
}

impl CheckpointArtifact {
    /// Render the two-line text form.
    pub fn to_text(&self) -> String {
        let clock = self
            .clock
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        format!("{}\n{}\n", self.seq, clock)
    }

    /// Parse the two-line text form.
    pub fn from_text(text: &str) -> Result<Self, SnapshotError> {
        let mut lines = text.lines();
        let seq = lines
            .next()
            .ok_or_else(|| SnapshotError::Corrupt("empty artifact".into()))?
            .trim()
            .parse()
            .map_err(|e| SnapshotError::Corrupt(format!("bad sequence line: {e}")))?;
        let clock = lines
            .next()
            .ok_or_else(|| SnapshotError::Corrupt("missing clock line".into()))?
            .split_whitespace()
            .map(|tok| {
                tok.parse()
                    .map_err(|e| SnapshotError::Corrupt(format!("bad clock entry '{tok}': {e}")))
            })
            .collect::<Result<Vec<u64>, _>>()?;
        Ok(Self { seq, clock })
    }
}

/// Storage contract for checkpoint artifacts.
///
/// `NotFound` from commit or discard means no tentative artifact exists;
/// callers log it and carry on, the protocol decision is not affected.
pub trait SnapshotStore: Send + Sync {
    /// Persist a tentative artifact, replacing any previous one.
    fn write_tentative(&self, artifact: &CheckpointArtifact) -> Result<(), SnapshotError>;

    /// Promote the tentative artifact to the permanent one for `seq`.
    fn commit_tentative(&self, seq: SequenceNumber) -> Result<(), SnapshotError>;

    /// Remove the tentative artifact.
    fn discard_tentative(&self, seq: SequenceNumber) -> Result<(), SnapshotError>;
}

/// File-backed artifact store.
pub struct FileSnapshotStore {
    dir: PathBuf,
    node_id: NodeId,
}

impl FileSnapshotStore {
    /// Open a store rooted at `dir` for `node_id`.
    ///
    /// Creates the directory and removes any tentative artifact left
    /// behind by an interrupted run: a fresh process has no session, so
    /// a pre-existing tentative is always orphaned.
    pub fn new(dir: impl Into<PathBuf>, node_id: NodeId) -> Result<Self, SnapshotError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let store = Self { dir, node_id };
        let tentative = store.tentative_path();
        match fs::remove_file(&tentative) {
            Ok(()) => debug!(path = %tentative.display(), "removed orphaned tentative artifact"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(store)
    }

    /// Directory the artifacts live in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read back the permanent artifact for `seq`.
    pub fn read_permanent(&self, seq: SequenceNumber) -> Result<CheckpointArtifact, SnapshotError> {
        let path = self.permanent_path(seq);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SnapshotError::NotFound(seq))
            }
            Err(e) => return Err(e.into()),
        };
        CheckpointArtifact::from_text(&text)
    }

    /// Whether a permanent artifact exists for `seq`.
    pub fn has_permanent(&self, seq: SequenceNumber) -> bool {
        self.permanent_path(seq).exists()
    }

    fn tentative_path(&self) -> PathBuf {
        self.dir.join(format!("node{}.tentative", self.node_id))
    }

    fn permanent_path(&self, seq: SequenceNumber) -> PathBuf {
        self.dir
            .join(format!("node{}_seq{}.ckpt", self.node_id, seq))
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn write_tentative(&self, artifact: &CheckpointArtifact) -> Result<(), SnapshotError> {
        fs::write(self.tentative_path(), artifact.to_text())?;
        info!(
            node_id = self.node_id,
            seq = artifact.seq,
            "took tentative checkpoint"
        );
        Ok(())
    }

    fn commit_tentative(&self, seq: SequenceNumber) -> Result<(), SnapshotError> {
        match fs::rename(self.tentative_path(), self.permanent_path(seq)) {
            Ok(()) => {
                info!(node_id = self.node_id, seq, "committed checkpoint");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(SnapshotError::NotFound(seq)),
            Err(e) => Err(e.into()),
        }
    }

    fn discard_tentative(&self, seq: SequenceNumber) -> Result<(), SnapshotError> {
        match fs::remove_file(self.tentative_path()) {
            Ok(()) => {
                info!(node_id = self.node_id, seq, "discarded tentative checkpoint");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(SnapshotError::NotFound(seq)),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn artifact(seq: SequenceNumber, clock: &[u64]) -> CheckpointArtifact {
        CheckpointArtifact {
            seq,
            clock: clock.to_vec(),
        }
    }

    #[test]
    fn test_artifact_text_round_trip() {
        let a = artifact(3, &[4, 0, 7]);
        assert_eq!(a.to_text(), "3\n4 0 7\n");
        assert_eq!(CheckpointArtifact::from_text(&a.to_text()).unwrap(), a);
    }

    #[test]
    fn test_corrupt_artifact_rejected() {
        assert!(matches!(
            CheckpointArtifact::from_text(""),
            Err(SnapshotError::Corrupt(_))
        ));
        assert!(matches!(
            CheckpointArtifact::from_text("abc\n1 2\n"),
            Err(SnapshotError::Corrupt(_))
        ));
        assert!(matches!(
            CheckpointArtifact::from_text("1\n2 x\n"),
            Err(SnapshotError::Corrupt(_))
        ));
    }

    #[test]
    fn test_write_then_commit_produces_permanent() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path(), 0).unwrap();

        let a = artifact(1, &[2, 5]);
        store.write_tentative(&a).unwrap();
        store.commit_tentative(1).unwrap();

        assert!(store.has_permanent(1));
        assert_eq!(store.read_permanent(1).unwrap(), a);
        assert!(!store.tentative_path().exists());
    }

    #[test]
    fn test_discard_removes_tentative() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path(), 1).unwrap();

        store.write_tentative(&artifact(2, &[0, 1])).unwrap();
        store.discard_tentative(2).unwrap();

        assert!(!store.tentative_path().exists());
        assert!(!store.has_permanent(2));
    }

    #[test]
    fn test_commit_without_tentative_is_not_found() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path(), 0).unwrap();

        let err = store.commit_tentative(4).unwrap_err();
        assert!(err.is_not_found());

        let err = store.discard_tentative(4).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_rewrite_tentative_replaces_content() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path(), 0).unwrap();

        store.write_tentative(&artifact(1, &[1, 1])).unwrap();
        store.write_tentative(&artifact(2, &[3, 4])).unwrap();
        store.commit_tentative(2).unwrap();

        assert_eq!(store.read_permanent(2).unwrap().clock, vec![3, 4]);
        assert!(!store.has_permanent(1));
    }

    #[test]
    fn test_new_removes_orphaned_tentative() {
        let dir = tempdir().unwrap();
        {
            let store = FileSnapshotStore::new(dir.path(), 0).unwrap();
            store.write_tentative(&artifact(9, &[1])).unwrap();
        }

        let store = FileSnapshotStore::new(dir.path(), 0).unwrap();
        assert!(!store.tentative_path().exists());
        assert!(store.commit_tentative(9).unwrap_err().is_not_found());
    }

    #[test]
    fn test_stores_for_different_nodes_share_a_dir() {
        let dir = tempdir().unwrap();
        let a = FileSnapshotStore::new(dir.path(), 0).unwrap();
        let b = FileSnapshotStore::new(dir.path(), 1).unwrap();

        a.write_tentative(&artifact(1, &[1, 0])).unwrap();
        b.write_tentative(&artifact(1, &[0, 1])).unwrap();
        a.commit_tentative(1).unwrap();
        b.commit_tentative(1).unwrap();

        assert_eq!(a.read_permanent(1).unwrap().clock, vec![1, 0]);
        assert_eq!(b.read_permanent(1).unwrap().clock, vec![0, 1]);
    }
}
