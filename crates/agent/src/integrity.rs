//! Agent integrity self-reporting.
//!
//! Hashes a fixed set of files and folds the per-file digests into one
//! combined hash (SHA-256 over the JSON of the sorted pairs), which
//! travels upstream with every heartbeat. The control plane compares it
//! against the blessed value for this node.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};

use nw_domain::Result;

/// A complete integrity report.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    /// Single value for the quick comparison upstream.
    pub combined_hash: String,
    /// Per-file digests for detailed inspection.
    pub file_hashes: BTreeMap<String, String>,
    pub base_path: PathBuf,
    /// Listed files that could not be hashed.
    pub missing_files: Vec<String>,
}

/// Hashes a fixed file list under one base path.
pub struct IntegrityCollector {
    base_path: PathBuf,
    files: Vec<String>,
}

impl IntegrityCollector {
    pub fn new(base_path: impl Into<PathBuf>, files: Vec<String>) -> Self {
        IntegrityCollector { base_path: base_path.into(), files }
    }

    /// Collector covering the running executable itself; the usual
    /// configuration for a compiled agent.
    pub fn for_current_exe() -> Result<Self> {
        let exe = std::env::current_exe()?;
        let base = exe.parent().map(Path::to_path_buf).unwrap_or_default();
        let name = exe
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "agent".to_string());
        Ok(IntegrityCollector::new(base, vec![name]))
    }

    pub fn report(&self) -> IntegrityReport {
        let mut file_hashes = BTreeMap::new();
        let mut missing = Vec::new();

        for relative in &self.files {
            let path = self.base_path.join(relative);
            match hash_file(&path) {
                Some(digest) => {
                    file_hashes.insert(relative.clone(), digest);
                }
                None => missing.push(relative.clone()),
            }
        }

        IntegrityReport {
            combined_hash: combined_hash(&file_hashes),
            file_hashes,
            base_path: self.base_path.clone(),
            missing_files: missing,
        }
    }

    /// Startup self-check against a locally pinned expected hash.
    pub fn verify_against(&self, expected: &str) -> bool {
        self.report().combined_hash == expected
    }
}

/// SHA-256 of one file, streamed in 8 KiB chunks. `None` when the file
/// is absent or unreadable.
fn hash_file(path: &Path) -> Option<String> {
    let mut file = std::fs::File::open(path).ok()?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buffer[..n]),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to hash file");
                return None;
            }
        }
    }
    Some(hex::encode(hasher.finalize()))
}

/// Fold the sorted per-file digests into one value. BTreeMap ordering
/// makes this deterministic regardless of listing order.
fn combined_hash(file_hashes: &BTreeMap<String, String>) -> String {
    let pairs: Vec<(&String, &String)> = file_hashes.iter().collect();
    let serialized = serde_json::to_string(&pairs).unwrap_or_default();
    hex::encode(Sha256::digest(serialized.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn report_hashes_all_listed_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "agent", "binary-bytes");
        write(dir.path(), "helper", "helper-bytes");

        let collector = IntegrityCollector::new(
            dir.path(),
            vec!["agent".to_string(), "helper".to_string()],
        );
        let report = collector.report();
        assert_eq!(report.file_hashes.len(), 2);
        assert!(report.missing_files.is_empty());
        assert_eq!(report.combined_hash.len(), 64);
    }

    #[test]
    fn combined_hash_is_independent_of_listing_order() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a", "one");
        write(dir.path(), "b", "two");

        let forward = IntegrityCollector::new(dir.path(), vec!["a".into(), "b".into()]);
        let backward = IntegrityCollector::new(dir.path(), vec!["b".into(), "a".into()]);
        assert_eq!(forward.report().combined_hash, backward.report().combined_hash);
    }

    #[test]
    fn content_change_changes_combined_hash() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "agent", "v1");
        let collector = IntegrityCollector::new(dir.path(), vec!["agent".into()]);
        let before = collector.report().combined_hash;

        write(dir.path(), "agent", "v2");
        let after = collector.report().combined_hash;
        assert_ne!(before, after);
    }

    #[test]
    fn missing_files_are_listed_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "present", "x");
        let collector = IntegrityCollector::new(
            dir.path(),
            vec!["present".into(), "ghost".into()],
        );
        let report = collector.report();
        assert_eq!(report.missing_files, vec!["ghost".to_string()]);
        assert_eq!(report.file_hashes.len(), 1);
    }

    #[test]
    fn verify_against_matches_own_report() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "agent", "bytes");
        let collector = IntegrityCollector::new(dir.path(), vec!["agent".into()]);
        let expected = collector.report().combined_hash;
        assert!(collector.verify_against(&expected));
        assert!(!collector.verify_against("0000"));
    }
}
