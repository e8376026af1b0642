// src/artifact.rs — workdir snapshotting/diffing and the ArtifactSink collaborator (spec §4.4)

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::id::KernelId;

const SNAPSHOT_FILE_CAP: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileStamp {
    pub mtime_secs: i64,
    pub size: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkdirSnapshot {
    pub files: HashMap<String, FileStamp>,
}

impl WorkdirSnapshot {
    /// Scans `root`, recording name, mtime, and size for every regular file
    /// up to `SNAPSHOT_FILE_CAP` bytes each (spec §4.4 step 2).
    pub fn scan(root: &Path) -> std::io::Result<Self> {
        let mut files = HashMap::new();
        scan_dir(root, root, &mut files)?;
        Ok(Self { files })
    }

    /// Names of files that are new or modified (by mtime or size) relative to `before`.
    pub fn diff(before: &WorkdirSnapshot, after: &WorkdirSnapshot) -> Vec<String> {
        after
            .files
            .iter()
            .filter(|(name, stamp)| before.files.get(*name) != Some(*stamp))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

fn scan_dir(
    root: &Path,
    dir: &Path,
    out: &mut HashMap<String, FileStamp>,
) -> std::io::Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return Ok(()),
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        if meta.is_dir() {
            scan_dir(root, &path, out)?;
            continue;
        }
        if !meta.is_file() || meta.len() > SNAPSHOT_FILE_CAP {
            continue;
        }
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        let mtime_secs = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        out.insert(
            rel.to_string_lossy().into_owned(),
            FileStamp {
                mtime_secs,
                size: meta.len(),
            },
        );
    }
    Ok(())
}

/// Abstract consumer of files newly produced in a workdir after an execution completes.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn upload(&self, entry_id: &str, kernel_id: KernelId, workdir: &Path, relative_paths: &[String]);
}

/// No-op sink, used where no object-store is configured.
pub struct NullArtifactSink;

#[async_trait]
impl ArtifactSink for NullArtifactSink {
    async fn upload(&self, _entry_id: &str, _kernel_id: KernelId, _workdir: &Path, _relative_paths: &[String]) {}
}

pub fn workdir_path(volume_root: &Path, id: KernelId) -> PathBuf {
    volume_root.join(id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn diff_reports_new_and_modified_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let path_a = dir.path().join("a.txt");
        std::fs::write(&path_a, b"one").unwrap();

        let before = WorkdirSnapshot::scan(dir.path()).unwrap();

        // unchanged file
        std::thread::sleep(std::time::Duration::from_millis(10));
        // new file
        std::fs::write(dir.path().join("b.txt"), b"two").unwrap();
        // modified file
        let mut f = std::fs::OpenOptions::new().append(true).open(&path_a).unwrap();
        writeln!(f, "more").unwrap();

        let after = WorkdirSnapshot::scan(dir.path()).unwrap();
        let mut diff = WorkdirSnapshot::diff(&before, &after);
        diff.sort();
        assert_eq!(diff, vec!["a.txt".to_string(), "b.txt".to_string()]);
    }

    #[test]
    fn scan_skips_oversized_files() {
        let dir = tempfile::tempdir().unwrap();
        let huge = vec![0u8; (SNAPSHOT_FILE_CAP + 1) as usize];
        std::fs::write(dir.path().join("huge.bin"), &huge).unwrap();
        let snap = WorkdirSnapshot::scan(dir.path()).unwrap();
        assert!(snap.files.is_empty());
    }
}
