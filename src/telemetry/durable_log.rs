//! Append-only CSV log that doubles as a sink's replay queue.
//!
//! The first record is the title row. Appends prune rows older than the
//! retention window first; rows whose timestamp cannot be parsed are kept.
//! When the title row no longer matches the output columns the old log is
//! moved aside under a dated name and a new one is started.
//! Rewrites go through a temporary file and a rename so a crash never leaves
//! a half-written log behind.

use super::sample::row_timestamp;
use crate::error::{FieldgateError, Result};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use chrono::{Duration, NaiveDateTime};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// A log shared by the appending side and the delivering side
pub type SharedLog = Arc<Mutex<DurableLog>>;

/// Title row plus data rows
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogContents {
    pub title: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

pub struct DurableLog {
    path: PathBuf,
    retention: Duration,
    logger: StructuredLogger,
}

impl DurableLog {
    pub fn new<P: Into<PathBuf>>(path: P, retention_days: u32) -> Self {
        let path = path.into();
        let logger = get_logger_with_context(
            LogContext::new("durable_log").with_field("file", path.display().to_string()),
        );
        Self {
            path,
            retention: Duration::days(i64::from(retention_days)),
            logger,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn into_shared(self) -> SharedLog {
        Arc::new(Mutex::new(self))
    }

    /// Prune expired rows, then append `row`. The title row is written first
    /// when the file is new, empty or was just moved aside.
    pub fn append(&self, titles: &[String], row: &[String], now: NaiveDateTime) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        match self.read()? {
            Some(contents) if contents.title != titles => {
                let rotated = self.rotated_path(now);
                fs::rename(&self.path, &rotated)?;
                self.logger.warn(&format!(
                    "Output columns changed; previous log moved to {}",
                    rotated.display()
                ));
            }
            Some(contents) => {
                let before = contents.rows.len();
                let kept: Vec<Vec<String>> = contents
                    .rows
                    .into_iter()
                    .filter(|r| !self.is_expired(r, now))
                    .collect();
                if kept.len() < before {
                    self.logger.info(&format!(
                        "Pruned {} rows older than {} days",
                        before - kept.len(),
                        self.retention.num_days()
                    ));
                    self.rewrite(&contents.title, &kept)?;
                }
            }
            None => {}
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let needs_title = file.metadata()?.len() == 0;
        let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(file);
        if needs_title {
            writer.write_record(titles)?;
        }
        writer.write_record(row)?;
        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| FieldgateError::io(e.to_string()))?;
        file.sync_data()?;
        Ok(())
    }

    fn is_expired(&self, row: &[String], now: NaiveDateTime) -> bool {
        row_timestamp(row).is_some_and(|ts| now - ts > self.retention)
    }

    /// Whole log, or `None` when the file is missing or empty
    pub fn read(&self) -> Result<Option<LogContents>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(&self.path)?;

        let mut records = Vec::new();
        for record in reader.records() {
            let record = record?;
            records.push(record.iter().map(str::to_string).collect::<Vec<_>>());
        }
        let mut records = records.into_iter();
        let Some(title) = records.next() else {
            return Ok(None);
        };
        Ok(Some(LogContents {
            title,
            rows: records.collect(),
        }))
    }

    /// Replace the log with `title` and `rows`
    pub fn rewrite(&self, title: &[String], rows: &[Vec<String>]) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut writer = csv::WriterBuilder::new().flexible(true).from_path(&tmp)?;
            writer.write_record(title)?;
            for row in rows {
                writer.write_record(row)?;
            }
            writer.flush()?;
        }
        fs::File::open(&tmp)?.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Drop the leading rows that appear, in order, in `delivered`.
    ///
    /// `delivered` is a prefix of an earlier [`read`](Self::read). Rows
    /// appended since then are kept, and so is anything the retention prune
    /// has already removed from the prefix. Returns the number of rows dropped.
    pub fn remove_delivered(&self, delivered: &[Vec<String>]) -> Result<usize> {
        let Some(contents) = self.read()? else {
            return Ok(0);
        };
        let mut next = 0;
        let mut dropped = 0;
        for row in &contents.rows {
            match delivered[next..].iter().position(|d| d == row) {
                Some(offset) => {
                    next += offset + 1;
                    dropped += 1;
                }
                None => break,
            }
        }
        if dropped > 0 {
            self.rewrite(&contents.title, &contents.rows[dropped..])?;
        }
        Ok(dropped)
    }

    /// Write `contents` to a side file for a whole-file upload
    pub fn snapshot(&self, contents: &LogContents) -> Result<PathBuf> {
        let path = self.path.with_extension("upload");
        let mut writer = csv::WriterBuilder::new().flexible(true).from_path(&path)?;
        writer.write_record(&contents.title)?;
        for row in &contents.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(path)
    }

    /// `<stem>_<YYYYmmdd_HHMMSS>.<ext>` next to the log
    fn rotated_path(&self, now: NaiveDateTime) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("telemetry");
        let ext = self
            .path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("csv");
        self.path
            .with_file_name(format!("{}_{}.{}", stem, now.format("%Y%m%d_%H%M%S"), ext))
    }

    /// Number of data rows waiting in the log
    pub fn pending_rows(&self) -> Result<usize> {
        Ok(self.read()?.map_or(0, |c| c.rows.len()))
    }

    #[cfg(test)]
    pub(crate) fn raw_text(&self) -> String {
        fs::read_to_string(&self.path).unwrap_or_default()
    }
}

impl std::fmt::Debug for DurableLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableLog")
            .field("path", &self.path)
            .field("retention_days", &self.retention.num_days())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn day(d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, d)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_title_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let log = DurableLog::new(dir.path().join("a.csv"), 31);
        let titles = strings(&["Timestamp", "SOC"]);
        log.append(&titles, &strings(&["2024-03-01 12:00:00", "55"]), day(1))
            .unwrap();
        log.append(&titles, &strings(&["2024-03-01 12:01:00", ""]), day(1))
            .unwrap();

        assert_eq!(
            log.raw_text(),
            "Timestamp,SOC\n2024-03-01 12:00:00,55\n2024-03-01 12:01:00,\n"
        );
        assert_eq!(log.pending_rows().unwrap(), 2);
    }

    #[test]
    fn test_retention_prunes_old_rows_only() {
        let dir = tempfile::tempdir().unwrap();
        let log = DurableLog::new(dir.path().join("b.csv"), 2);
        let titles = strings(&["Timestamp", "V"]);
        log.append(&titles, &strings(&["2024-03-01 12:00:00", "1"]), day(1))
            .unwrap();
        log.append(&titles, &strings(&["garbage", "2"]), day(1)).unwrap();
        log.append(&titles, &strings(&["2024-03-04 12:00:00", "3"]), day(4))
            .unwrap();

        let contents = log.read().unwrap().unwrap();
        assert_eq!(contents.title, titles);
        assert_eq!(
            contents.rows,
            vec![
                strings(&["garbage", "2"]),
                strings(&["2024-03-04 12:00:00", "3"]),
            ]
        );
    }

    #[test]
    fn test_remove_delivered_keeps_rows_appended_meanwhile() {
        let dir = tempfile::tempdir().unwrap();
        let log = DurableLog::new(dir.path().join("nested/c.csv"), 31);
        let titles = strings(&["DATE", "TIME", "V"]);
        log.append(&titles, &strings(&["2024-03-01", "12:00:00", "1"]), day(1))
            .unwrap();
        log.append(&titles, &strings(&["2024-03-01", "12:01:00", "2"]), day(1))
            .unwrap();
        let seen = log.read().unwrap().unwrap();

        log.append(&titles, &strings(&["2024-03-01", "12:02:00", "3"]), day(1))
            .unwrap();
        assert_eq!(log.remove_delivered(&seen.rows).unwrap(), 2);

        let contents = log.read().unwrap().unwrap();
        assert_eq!(contents.title, titles);
        assert_eq!(contents.rows, vec![strings(&["2024-03-01", "12:02:00", "3"])]);
    }

    #[test]
    fn test_remove_delivered_skips_pruned_rows() {
        let dir = tempfile::tempdir().unwrap();
        let log = DurableLog::new(dir.path().join("d.csv"), 2);
        let titles = strings(&["Timestamp", "V"]);
        log.append(&titles, &strings(&["2024-03-01 12:00:00", "1"]), day(1))
            .unwrap();
        log.append(&titles, &strings(&["2024-03-03 12:00:00", "2"]), day(3))
            .unwrap();
        let seen = log.read().unwrap().unwrap();

        // The first row expires while the snapshot is out for delivery
        log.append(&titles, &strings(&["2024-03-04 12:00:00", "3"]), day(4))
            .unwrap();
        assert_eq!(log.remove_delivered(&seen.rows).unwrap(), 1);
        assert_eq!(
            log.read().unwrap().unwrap().rows,
            vec![strings(&["2024-03-04 12:00:00", "3"])]
        );
    }

    #[test]
    fn test_title_change_moves_old_log_aside() {
        let dir = tempfile::tempdir().unwrap();
        let log = DurableLog::new(dir.path().join("e.csv"), 31);
        log.append(
            &strings(&["Timestamp", "V"]),
            &strings(&["2024-03-01 12:00:00", "1"]),
            day(1),
        )
        .unwrap();

        let titles = strings(&["Timestamp", "V", "I"]);
        log.append(&titles, &strings(&["2024-03-02 12:00:00", "1", "2"]), day(2))
            .unwrap();

        let contents = log.read().unwrap().unwrap();
        assert_eq!(contents.title, titles);
        assert_eq!(contents.rows.len(), 1);
        let rotated = dir.path().join("e_20240302_120000.csv");
        assert_eq!(
            fs::read_to_string(rotated).unwrap(),
            "Timestamp,V\n2024-03-01 12:00:00,1\n"
        );
    }

    #[test]
    fn test_snapshot_copies_contents() {
        let dir = tempfile::tempdir().unwrap();
        let log = DurableLog::new(dir.path().join("f.csv"), 31);
        let titles = strings(&["Timestamp", "V"]);
        log.append(&titles, &strings(&["2024-03-01 12:00:00", "1"]), day(1))
            .unwrap();
        let contents = log.read().unwrap().unwrap();
        let side = log.snapshot(&contents).unwrap();
        assert_ne!(side, log.path());
        assert_eq!(fs::read_to_string(side).unwrap(), log.raw_text());
    }

    #[test]
    fn test_missing_log_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let log = DurableLog::new(dir.path().join("none.csv"), 31);
        assert!(log.read().unwrap().is_none());
        assert_eq!(log.pending_rows().unwrap(), 0);
    }
}
