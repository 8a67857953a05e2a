/// Append-only CSV log of probe observations.
///
/// One row per completed probe, consumed offline by the model training
/// pipeline. A row carries the counters as they stood *before* the probe
/// together with the freshly measured latency; the trainer's
/// shifted-target feature engineering depends on that framing.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

pub const CSV_HEADER: &str = "timestamp,interface_name,latency,successes,failures,active_conns";

#[derive(Debug, Clone, PartialEq)]
pub struct ObservationRow {
    /// Unix timestamp, seconds
    pub timestamp: f64,
    pub interface_name: String,
    /// Fresh measurement (or the failure sentinel), milliseconds
    pub latency: f64,
    /// Counters as they stood before this probe
    pub successes: u64,
    pub failures: u64,
    pub active_conns: i64,
}

impl ObservationRow {
    pub fn to_csv(&self) -> String {
        format!(
            "{},{},{},{},{},{}",
            self.timestamp,
            self.interface_name,
            self.latency,
            self.successes,
            self.failures,
            self.active_conns
        )
    }
}

/// Current Unix time as fractional seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

pub struct ObservationLog {
    writer: BufWriter<File>,
}

impl ObservationLog {
    /// Open (or create) the log at `path`, writing the CSV header only
    /// when the file is new or empty. Parent directories are created as
    /// needed.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        let needs_header = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len() == 0,
            Err(_) => true,
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("failed to open observation log {}", path.display()))?;
        let mut writer = BufWriter::new(file);

        if needs_header {
            writer.write_all(CSV_HEADER.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }

        Ok(Self { writer })
    }

    /// Append one row and flush, so the trainer can tail a live file.
    pub async fn record(&mut self, row: &ObservationRow) -> anyhow::Result<()> {
        self.writer.write_all(row.to_csv().as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str, latency: f64) -> ObservationRow {
        ObservationRow {
            timestamp: 1700000000.5,
            interface_name: name.to_string(),
            latency,
            successes: 3,
            failures: 1,
            active_conns: 2,
        }
    }

    #[test]
    fn csv_row_format() {
        assert_eq!(
            row("eth0", 12.5).to_csv(),
            "1700000000.5,eth0,12.5,3,1,2"
        );
    }

    #[tokio::test]
    async fn header_written_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("observations.csv");

        let mut log = ObservationLog::open(&path).await.unwrap();
        log.record(&row("eth0", 10.0)).await.unwrap();
        drop(log);

        // Reopening an existing non-empty file must not repeat the header
        let mut log = ObservationLog::open(&path).await.unwrap();
        log.record(&row("wlan0", 9999.0)).await.unwrap();
        drop(log);

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER);
        assert!(lines[1].contains(",eth0,10,"));
        assert!(lines[2].contains(",wlan0,9999,"));
    }

    #[tokio::test]
    async fn creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("deep").join("observations.csv");
        let mut log = ObservationLog::open(&path).await.unwrap();
        log.record(&row("eth0", 42.0)).await.unwrap();
        assert!(path.exists());
    }
}
