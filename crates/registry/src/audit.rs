//! Append-only audit log, one JSON object per line.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use nw_domain::model::AuditRecord;
use nw_domain::Result;

/// JSONL-backed audit trail. Rows are never rewritten.
pub struct AuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(state_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_path)?;
        Ok(AuditLog {
            path: state_path.join("audit.jsonl"),
            write_lock: Mutex::new(()),
        })
    }

    /// Append one audit row.
    pub fn append(&self, record: &AuditRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let _guard = self.write_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// The most recent `limit` rows, oldest first.
    ///
    /// Unparseable lines (e.g. from a partial write during a crash) are
    /// skipped.
    pub fn recent(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        let _guard = self.write_lock.lock();
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let records: Vec<AuditRecord> = raw
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        let skip = records.len().saturating_sub(limit);
        Ok(records.into_iter().skip(skip).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nw_domain::model::AuditSeverity;

    #[test]
    fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path()).unwrap();

        for i in 0..5 {
            log.append(&AuditRecord::system(
                "NODE_APPROVED",
                "node",
                i,
                format!("node {i} approved"),
            ))
            .unwrap();
        }

        let all = log.recent(100).unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].target_id, "0");
        assert_eq!(all[4].target_id, "4");

        let last_two = log.recent(2).unwrap();
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[0].target_id, "3");
    }

    #[test]
    fn severity_survives_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path()).unwrap();
        log.append(
            &AuditRecord::system("INTEGRITY_MISMATCH", "node", 7, "count=3")
                .with_severity(AuditSeverity::Critical),
        )
        .unwrap();
        let rows = log.recent(1).unwrap();
        assert_eq!(rows[0].severity, AuditSeverity::Critical);
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path()).unwrap();
        log.append(&AuditRecord::system("A", "node", 1, "ok")).unwrap();
        std::fs::write(
            dir.path().join("audit.jsonl"),
            format!(
                "{}\n{{truncated",
                std::fs::read_to_string(dir.path().join("audit.jsonl"))
                    .unwrap()
                    .trim_end()
            ),
        )
        .unwrap();
        assert_eq!(log.recent(10).unwrap().len(), 1);
    }
}
