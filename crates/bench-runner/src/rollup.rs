//! Second-stage summaries over persisted result tables.
//!
//! Rows are grouped by puzzle class and each statistic column is averaged
//! without weighting, so a rollup is a mean of per-bucket means.

use anyhow::{anyhow, Context, Result};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::stats::RunningStats;
use crate::table::{format_rate, format_time};

pub const ROLLUP_HEADER: [&str; 5] = [
    "Dimension",
    "Success Rate (%)",
    "Avg Time (s)",
    "Std Dev Time (s)",
    "Cycles",
];
pub const ROLLUP_PREFIX: &str = "SUMMARY-";

const CLASS_COLUMN: &str = "Type";
const RATE_COLUMN: &str = "Success Rate (%)";
const TIME_COLUMN: &str = "Avg Time";
const STDEV_COLUMN: &str = "Std Dev Time";
const CYCLE_COLUMNS: [&str; 2] = ["Avg Cycles", "Cycles"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollupRow {
    pub dimension: String,
    pub mean_success_rate: f64,
    pub mean_avg_time: f64,
    pub mean_stdev_time: f64,
    pub mean_cycles: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollupReport {
    pub input: PathBuf,
    pub output: PathBuf,
    pub rows: Vec<RollupRow>,
}

struct Columns {
    class: usize,
    rate: usize,
    time: usize,
    stdev: usize,
    cycles: usize,
}

impl Columns {
    fn locate(headers: &StringRecord, path: &Path) -> Result<Self> {
        let find = |names: &[&str]| {
            headers
                .iter()
                .position(|h| names.contains(&h.trim()))
                .ok_or_else(|| {
                    anyhow!(
                        "result table {} has no '{}' column",
                        path.display(),
                        names.join("' or '")
                    )
                })
        };
        Ok(Self {
            class: find(&[CLASS_COLUMN])?,
            rate: find(&[RATE_COLUMN])?,
            time: find(&[TIME_COLUMN])?,
            stdev: find(&[STDEV_COLUMN])?,
            cycles: find(&CYCLE_COLUMNS)?,
        })
    }
}

#[derive(Default)]
struct ClassMeans {
    rate: RunningStats,
    time: RunningStats,
    stdev: RunningStats,
    cycles: RunningStats,
}

fn push_cell(stats: &mut RunningStats, record: &StringRecord, idx: usize) {
    if let Some(value) = record
        .get(idx)
        .and_then(|cell| cell.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
    {
        stats.push(value);
    }
}

/// Rolls a result table up by class. Only classes listed in `classes` are
/// reported, in that order; other classes in the table are skipped.
pub fn rollup_table(path: &Path, classes: &[String]) -> Result<Vec<RollupRow>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("failed to open result table {}", path.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("failed to read header of {}", path.display()))?
        .clone();
    let cols = Columns::locate(&headers, path)?;

    let mut groups: Vec<ClassMeans> = classes.iter().map(|_| ClassMeans::default()).collect();
    let mut seen = vec![false; classes.len()];
    for record in reader.records() {
        let record = record.with_context(|| format!("malformed row in {}", path.display()))?;
        let class = record.get(cols.class).unwrap_or("").trim();
        let Some(idx) = classes.iter().position(|c| c == class) else {
            tracing::debug!(table = %path.display(), class, "skipping row of unlisted class");
            continue;
        };
        seen[idx] = true;
        let group = &mut groups[idx];
        push_cell(&mut group.rate, &record, cols.rate);
        push_cell(&mut group.time, &record, cols.time);
        push_cell(&mut group.stdev, &record, cols.stdev);
        push_cell(&mut group.cycles, &record, cols.cycles);
    }

    Ok(classes
        .iter()
        .zip(groups)
        .zip(seen)
        .filter(|(_, seen)| *seen)
        .map(|((class, group), _)| RollupRow {
            dimension: class.clone(),
            mean_success_rate: group.rate.mean(),
            mean_avg_time: group.time.mean(),
            mean_stdev_time: group.stdev.mean(),
            mean_cycles: group.cycles.mean(),
        })
        .collect())
}

pub fn rollup_output_path(input: &Path, out_dir: &Path) -> PathBuf {
    let base = input
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "results.csv".to_string());
    out_dir.join(format!("{}{}", ROLLUP_PREFIX, base))
}

/// Overwrites `path` with the rollup rows.
pub fn write_rollup(path: &Path, rows: &[RollupRow]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("cannot open rollup table {} for writing", path.display()))?;
    writer.write_record(ROLLUP_HEADER)?;
    for row in rows {
        writer.write_record([
            row.dimension.clone(),
            format_rate(row.mean_success_rate),
            format_time(row.mean_avg_time),
            format_time(row.mean_stdev_time),
            format_rate(row.mean_cycles),
        ])?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    Ok(())
}

/// Rolls up each input into `<out_dir>/SUMMARY-<name>`.
pub fn summarize_tables(
    inputs: &[PathBuf],
    classes: &[String],
    out_dir: &Path,
) -> Result<Vec<RollupReport>> {
    let mut reports = Vec::with_capacity(inputs.len());
    for input in inputs {
        tracing::info!(table = %input.display(), "processing result table");
        let rows = rollup_table(input, classes)?;
        let output = rollup_output_path(input, out_dir);
        write_rollup(&output, &rows)?;
        tracing::info!(output = %output.display(), rows = rows.len(), "saved rollup");
        reports.push(RollupReport {
            input: input.clone(),
            output,
            rows,
        });
    }
    Ok(reports)
}
