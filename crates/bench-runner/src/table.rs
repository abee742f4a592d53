use anyhow::{Context, Result};
use csv::{Writer, WriterBuilder};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::config::RunMode;
use crate::stats::BucketSummary;

pub const TABLE_SCHEMA: &str = "result_table_v1";

pub const STAT_COLUMNS: [&str; 6] = [
    "Total Runs",
    "Successes",
    "Success Rate (%)",
    "Avg Time",
    "Std Dev Time",
    "Avg Cycles",
];

pub fn header(mode: RunMode) -> Vec<&'static str> {
    let leading = match mode {
        RunMode::Matrix => ["Type", "Clue %"],
        RunMode::Repeated => ["File", "Type"],
    };
    leading.iter().chain(STAT_COLUMNS.iter()).copied().collect()
}

pub fn format_rate(value: f64) -> String {
    format!("{:.2}", value)
}

pub fn format_time(value: f64) -> String {
    format!("{:.8}", value)
}

/// Streams one row per bucket, flushing after each so partial progress
/// survives a harness crash.
pub struct ResultTableWriter {
    path: PathBuf,
    mode: RunMode,
    writer: Writer<File>,
    rows: usize,
}

impl ResultTableWriter {
    /// Truncates any previous table at `path`.
    pub fn create(path: &Path, mode: RunMode) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        let file = File::create(path)
            .with_context(|| format!("cannot open result table {} for writing", path.display()))?;
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
        writer
            .write_record(header(mode))
            .with_context(|| format!("failed to write header to {}", path.display()))?;
        writer
            .flush()
            .with_context(|| format!("failed to flush {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            mode,
            writer,
            rows: 0,
        })
    }

    pub fn append(&mut self, summary: &BucketSummary) -> Result<()> {
        let stats = [
            summary.total_trials.to_string(),
            summary.successes.to_string(),
            format_rate(summary.success_rate),
            format_time(summary.avg_time),
            format_time(summary.stdev_time),
            format_rate(summary.avg_iterations),
        ];
        let leading = match self.mode {
            RunMode::Matrix => [summary.key.class.clone(), summary.key.parameter.clone()],
            RunMode::Repeated => [summary.key.parameter.clone(), summary.key.class.clone()],
        };
        self.writer
            .write_record(leading.iter().chain(stats.iter()))
            .with_context(|| format!("failed to append row to {}", self.path.display()))?;
        self.writer
            .flush()
            .with_context(|| format!("failed to flush {}", self.path.display()))?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::BucketKey;
    use chrono::Utc;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "bench_table_{}_{}_{}",
            name,
            std::process::id(),
            Utc::now().timestamp_micros()
        ))
    }

    fn summary(class: &str, parameter: &str) -> BucketSummary {
        BucketSummary {
            key: BucketKey::new(class, parameter),
            total_trials: 3,
            successes: 2,
            success_rate: 200.0 / 3.0,
            avg_time: 0.2,
            stdev_time: 0.02_f64.sqrt(),
            avg_iterations: 6.0,
        }
    }

    #[test]
    fn matrix_rows_use_fixed_precision() {
        let root = scratch("matrix");
        let path = root.join("nested").join("results.csv");
        let mut writer = ResultTableWriter::create(&path, RunMode::Matrix).expect("create");
        writer.append(&summary("9x9", "40")).expect("append");
        assert_eq!(writer.rows(), 1);
        let text = fs::read_to_string(&path).expect("read");
        assert_eq!(
            text,
            "Type,Clue %,Total Runs,Successes,Success Rate (%),Avg Time,Std Dev Time,Avg Cycles\n\
             9x9,40,3,2,66.67,0.20000000,0.14142136,6.00\n"
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn repeated_rows_lead_with_file_name() {
        let root = scratch("repeated");
        let path = root.join("logic.csv");
        let mut writer = ResultTableWriter::create(&path, RunMode::Repeated).expect("create");
        writer.append(&summary("6x6", "6_a.txt")).expect("append");
        let text = fs::read_to_string(&path).expect("read");
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("File,Type,Total Runs,Successes,Success Rate (%),Avg Time,Std Dev Time,Avg Cycles")
        );
        assert_eq!(
            lines.next(),
            Some("6_a.txt,6x6,3,2,66.67,0.20000000,0.14142136,6.00")
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn header_is_visible_before_any_row_and_create_truncates() {
        let root = scratch("truncate");
        let path = root.join("results.csv");
        fs::create_dir_all(&root).expect("root");
        fs::write(&path, "stale,row\n1,2\n").expect("seed");
        let writer = ResultTableWriter::create(&path, RunMode::Matrix).expect("create");
        let text = fs::read_to_string(writer.path()).expect("read");
        assert_eq!(text.lines().count(), 1);
        assert!(text.starts_with("Type,Clue %"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn unwritable_location_is_an_error() {
        let err = ResultTableWriter::create(Path::new("/proc/bench/results.csv"), RunMode::Matrix)
            .err()
            .expect("must fail");
        assert!(err.to_string().contains("/proc/bench"), "{}", err);
    }
}
