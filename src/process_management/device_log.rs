use crate::error_handling::types::ProcessError;
use chrono::{Local, NaiveDate};
use log::{debug, error, info, warn};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Saves one session's device output to
/// `<log_root>/<YYYY-MM-DD>/<HH-MM-SS>-<device code>-<targetId>.log`.
///
/// The device prefixes lines with `[secs.usecs][pid:tid]`; that prefix is
/// replaced by a local wall-clock timestamp.
pub struct DeviceLogRecorder {
    path: PathBuf,
    file: File,
    prefix: Regex,
}

impl DeviceLogRecorder {
    pub async fn create(
        log_root: &Path,
        device_code: &str,
        target_id: &str,
    ) -> Result<Self, ProcessError> {
        let now = Local::now();
        let day_dir = log_root.join(now.format("%Y-%m-%d").to_string());
        tokio::fs::create_dir_all(&day_dir).await.map_err(|e| {
            error!("Failed to create log dir {}: {}", day_dir.display(), e);
            ProcessError::IoError(e)
        })?;
        let path = day_dir.join(format!(
            "{}-{}-{}.log",
            now.format("%H-%M-%S"),
            device_code,
            target_id
        ));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| {
                error!("Failed to open device log {}: {}", path.display(), e);
                ProcessError::IoError(e)
            })?;
        let prefix = Regex::new(r"(?:\[\d+\.\d+\])(?:\[\d+:\d+\])?\s*(.+)")
            .map_err(|e| ProcessError::ToolFailed(e.to_string()))?;
        info!("Saving device log of {} to {}", target_id, path.display());
        Ok(Self { path, file, prefix })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Message part of a device line, without the device's own timestamp.
    pub fn strip_prefix<'a>(&self, line: &'a str) -> &'a str {
        self.prefix
            .captures(line)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .unwrap_or(line)
    }

    pub async fn record(&mut self, line: &str) {
        let entry = format!(
            "{} {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            self.strip_prefix(line)
        );
        if let Err(e) = self.file.write_all(entry.as_bytes()).await {
            warn!("Failed to append to {}: {}", self.path.display(), e);
        }
    }

    pub async fn flush(&mut self) {
        if let Err(e) = self.file.flush().await {
            warn!("Failed to flush {}: {}", self.path.display(), e);
        }
    }
}

/// Deletes the oldest day directories so that at most `keep` remain.
/// Returns how many were removed.
pub fn prune_log_days(log_root: &Path, keep: usize) -> usize {
    let Ok(entries) = fs::read_dir(log_root) else {
        return 0;
    };
    let mut days: Vec<(NaiveDate, PathBuf)> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter_map(|p| {
            let date = p
                .file_name()?
                .to_str()
                .and_then(|n| NaiveDate::parse_from_str(n, "%Y-%m-%d").ok())?;
            Some((date, p))
        })
        .collect();
    if days.len() <= keep {
        return 0;
    }
    days.sort();
    let excess = days.len() - keep;
    let mut removed = 0;
    for (_, dir) in days.into_iter().take(excess) {
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!("Removed old log dir {}", dir.display());
                removed += 1;
            }
            Err(e) => warn!("Failed to remove old log dir {}: {}", dir.display(), e),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_record_strips_device_timestamp() {
        let dir = TempDir::new().unwrap();
        let mut recorder = DeviceLogRecorder::create(dir.path(), "0x0100", "fff18014-7e5")
            .await
            .unwrap();
        assert_eq!(
            recorder.strip_prefix("[1700000000.123456][4242:4243] CHIP:SVR: SetupQRCode: [MT:Y]"),
            "CHIP:SVR: SetupQRCode: [MT:Y]"
        );
        assert_eq!(recorder.strip_prefix("plain line"), "plain line");

        recorder.record("[1.5] Device completed Rendezvous process").await;
        recorder.flush().await;
        let content = fs::read_to_string(recorder.path()).unwrap();
        assert!(content.trim_end().ends_with(" Device completed Rendezvous process"));
        assert!(recorder
            .path()
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .ends_with("-0x0100-fff18014-7e5.log"));
    }

    #[test]
    fn test_prune_keeps_newest_days() {
        let dir = TempDir::new().unwrap();
        for day in ["2026-10-17", "2026-10-18", "2026-10-19", "not-a-date"] {
            fs::create_dir_all(dir.path().join(day)).unwrap();
        }
        assert_eq!(prune_log_days(dir.path(), 2), 1);
        assert!(!dir.path().join("2026-10-17").exists());
        assert!(dir.path().join("2026-10-19").exists());
        assert!(dir.path().join("not-a-date").exists());
        assert_eq!(prune_log_days(dir.path(), 2), 0);
        assert_eq!(prune_log_days(&dir.path().join("absent"), 2), 0);
    }
}
