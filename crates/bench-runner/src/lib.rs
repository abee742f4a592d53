use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

pub mod config;
pub mod driver;
pub mod invoke;
pub mod outcome;
pub mod plan;
pub mod rollup;
pub mod stats;
pub mod table;

pub use config::{load_experiment, ExperimentConfig, LoadedExperiment, RunMode};
pub use driver::{run_bucket, summarize_bucket, SilentObserver, TrialObserver};
pub use invoke::{Invoke, ProcessInvoker, RawResult};
pub use outcome::{parse_outcome, Outcome};
pub use plan::{build_plan, BucketKey, BucketPlan, RunPlan, TrialFiles};
pub use rollup::{rollup_table, summarize_tables, RollupReport, RollupRow};
pub use stats::{summarize, BucketSummary, Sample};
pub use table::ResultTableWriter;

pub const MANIFEST_SCHEMA: &str = "bench_manifest_v1";

pub struct RunResult {
    pub run_id: String,
    pub table_path: PathBuf,
    pub manifest_path: PathBuf,
    pub summaries: Vec<BucketSummary>,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Replaces `output.table` from the experiment file.
    pub table_override: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct BenchmarkSummary {
    pub experiment_id: String,
    pub mode: RunMode,
    pub solver_command: Vec<String>,
    pub solver_path: Option<PathBuf>,
    pub solver_exists: bool,
    pub success_exit_code: i32,
    pub classes: Vec<String>,
    pub bucket_count: usize,
    pub total_trials: usize,
    pub max_concurrency: usize,
    pub table_path: PathBuf,
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    let mut file =
        fs::File::create(&tmp).with_context(|| format!("cannot write {}", tmp.display()))?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path).with_context(|| format!("cannot write {}", path.display()))?;
    Ok(())
}

fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

pub fn manifest_path_for(table_path: &Path) -> PathBuf {
    let name = table_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "results.csv".to_string());
    table_path.with_file_name(format!("{}.manifest.json", name))
}

fn config_digest(resolved: &Value) -> String {
    let bytes = serde_json::to_vec(resolved).unwrap_or_default();
    format!("sha256:{}", hex::encode(Sha256::digest(&bytes)))
}

/// Keeps the run manifest truthful: a run that never reaches `complete`
/// is recorded as failed when the guard drops.
struct ManifestGuard {
    path: PathBuf,
    manifest: Value,
    done: bool,
}

impl ManifestGuard {
    fn start(path: &Path, manifest: Value) -> Result<Self> {
        atomic_write_json_pretty(path, &manifest)?;
        Ok(Self {
            path: path.to_path_buf(),
            manifest,
            done: false,
        })
    }

    fn write_status(&mut self, status: &str, rows: Option<usize>) -> Result<()> {
        if let Some(obj) = self.manifest.as_object_mut() {
            obj.insert("status".to_string(), json!(status));
            obj.insert("finished_at".to_string(), json!(Utc::now().to_rfc3339()));
            if let Some(rows) = rows {
                obj.insert("rows_written".to_string(), json!(rows));
            }
        }
        atomic_write_json_pretty(&self.path, &self.manifest)
    }

    fn complete(&mut self, rows: usize) -> Result<()> {
        self.write_status("completed", Some(rows))?;
        self.done = true;
        Ok(())
    }
}

impl Drop for ManifestGuard {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.write_status("failed", None);
        }
    }
}

/// An experiment loaded and planned once, so what is described is exactly
/// what runs.
pub struct PreparedBenchmark {
    pub loaded: LoadedExperiment,
    pub plan: RunPlan,
    pub summary: BenchmarkSummary,
}

pub fn prepare_benchmark(
    path: &Path,
    overrides: &BTreeMap<String, Value>,
    options: &RunOptions,
) -> Result<PreparedBenchmark> {
    let loaded = load_experiment(path, overrides)?;
    let plan = build_plan(&loaded)?;
    let summary = describe_loaded(&loaded, &plan, options.table_override.as_deref());
    Ok(PreparedBenchmark {
        loaded,
        plan,
        summary,
    })
}

pub fn describe_benchmark(
    path: &Path,
    overrides: &BTreeMap<String, Value>,
) -> Result<BenchmarkSummary> {
    Ok(prepare_benchmark(path, overrides, &RunOptions::default())?.summary)
}

fn describe_loaded(
    loaded: &LoadedExperiment,
    plan: &RunPlan,
    table_override: Option<&Path>,
) -> BenchmarkSummary {
    let config = &loaded.config;
    let solver_command = loaded.solver_command();
    let solver_path = config::resolve_solver_script(&solver_command);
    let solver_exists = solver_path.as_ref().map(|p| p.exists()).unwrap_or(true);
    let mut classes: Vec<String> = Vec::new();
    for bucket in &plan.buckets {
        if !classes.contains(&bucket.key.class) {
            classes.push(bucket.key.class.clone());
        }
    }
    let experiment_id = if config.experiment.id.is_empty() {
        loaded
            .source
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "experiment".to_string())
    } else {
        config.experiment.id.clone()
    };
    BenchmarkSummary {
        experiment_id,
        mode: plan.mode,
        solver_command,
        solver_path,
        solver_exists,
        success_exit_code: config.solver.success_exit_code,
        classes,
        bucket_count: plan.buckets.len(),
        total_trials: plan.total_trials(),
        max_concurrency: config.design.max_concurrency,
        table_path: table_override
            .map(Path::to_path_buf)
            .unwrap_or_else(|| loaded.table_path()),
    }
}

pub fn run_benchmark(
    path: &Path,
    overrides: &BTreeMap<String, Value>,
    options: &RunOptions,
    observer: &dyn TrialObserver,
) -> Result<RunResult> {
    let prepared = prepare_benchmark(path, overrides, options)?;
    run_prepared(&prepared, options, observer)
}

/// Runs a prepared benchmark against the configured solver process.
pub fn run_prepared(
    prepared: &PreparedBenchmark,
    options: &RunOptions,
    observer: &dyn TrialObserver,
) -> Result<RunResult> {
    let invoker = ProcessInvoker::from_experiment(&prepared.loaded);
    run_plan(
        &prepared.loaded,
        &prepared.plan,
        &invoker,
        options,
        observer,
    )
}

/// Executes an already-built plan with the given invoker.
pub fn run_plan(
    loaded: &LoadedExperiment,
    plan: &RunPlan,
    invoker: &dyn Invoke,
    options: &RunOptions,
    observer: &dyn TrialObserver,
) -> Result<RunResult> {
    let summary = describe_loaded(loaded, plan, options.table_override.as_deref());
    if !summary.solver_exists {
        if let Some(p) = &summary.solver_path {
            tracing::warn!(
                solver = %p.display(),
                "solver executable not found; every trial will be recorded as failed"
            );
        }
    }

    let table_path = summary.table_path.clone();
    let run_id = format!("run_{}", Utc::now().format("%Y%m%d_%H%M%S"));
    let manifest_path = manifest_path_for(&table_path);
    let mut guard = ManifestGuard::start(
        &manifest_path,
        json!({
            "schema_version": MANIFEST_SCHEMA,
            "table_schema": table::TABLE_SCHEMA,
            "run_id": run_id,
            "status": "running",
            "created_at": Utc::now().to_rfc3339(),
            "experiment": summary.experiment_id,
            "mode": plan.mode.as_str(),
            "solver": summary.solver_command,
            "success_exit_code": summary.success_exit_code,
            "planned_buckets": plan.buckets.len(),
            "planned_trials": plan.total_trials(),
            "max_concurrency": summary.max_concurrency,
            "config_digest": config_digest(&loaded.resolved),
        }),
    )?;

    let mut writer = ResultTableWriter::create(&table_path, plan.mode)?;
    tracing::info!(
        run_id = %run_id,
        buckets = plan.buckets.len(),
        trials = plan.total_trials(),
        table = %table_path.display(),
        "starting benchmark run"
    );

    let summaries = execute_plan(
        plan,
        invoker,
        loaded.config.solver.success_exit_code,
        loaded.config.design.max_concurrency,
        observer,
        &mut writer,
    )?;
    guard.complete(writer.rows())?;
    tracing::info!(table = %table_path.display(), rows = writer.rows(), "results saved");

    Ok(RunResult {
        run_id,
        table_path,
        manifest_path,
        summaries,
    })
}

/// Runs buckets on up to `max_concurrency` workers. Rows are appended in
/// plan order no matter which worker finishes first.
fn execute_plan(
    plan: &RunPlan,
    invoker: &dyn Invoke,
    success_exit_code: i32,
    max_concurrency: usize,
    observer: &dyn TrialObserver,
    writer: &mut ResultTableWriter,
) -> Result<Vec<BucketSummary>> {
    let mut summaries = Vec::with_capacity(plan.buckets.len());
    let workers = max_concurrency.min(plan.buckets.len());
    if workers <= 1 {
        for bucket in &plan.buckets {
            tracing::info!(bucket = %bucket.key, trials = bucket.files.len(), "running bucket");
            let summary = summarize_bucket(bucket, invoker, success_exit_code, observer);
            writer.append(&summary)?;
            summaries.push(summary);
        }
        return Ok(summaries);
    }

    let next = AtomicUsize::new(0);
    thread::scope(|scope| -> Result<Vec<BucketSummary>> {
        let (tx, rx) = mpsc::channel::<(usize, BucketSummary)>();
        for _ in 0..workers {
            let tx = tx.clone();
            let next = &next;
            scope.spawn(move || loop {
                let idx = next.fetch_add(1, Ordering::SeqCst);
                let Some(bucket) = plan.buckets.get(idx) else {
                    break;
                };
                tracing::info!(bucket = %bucket.key, trials = bucket.files.len(), "running bucket");
                let summary = summarize_bucket(bucket, invoker, success_exit_code, observer);
                if tx.send((idx, summary)).is_err() {
                    break;
                }
            });
        }
        drop(tx);

        let mut pending: BTreeMap<usize, BucketSummary> = BTreeMap::new();
        for (idx, summary) in rx {
            pending.insert(idx, summary);
            while let Some(summary) = pending.remove(&summaries.len()) {
                writer.append(&summary)?;
                summaries.push(summary);
            }
        }
        Ok(summaries)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExperimentConfig;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Solves odd-numbered instances; slower on low clue percentages so
    /// workers finish out of order.
    struct ParityInvoker {
        calls: Mutex<usize>,
    }

    impl Invoke for ParityInvoker {
        fn invoke(&self, puzzle: &Path, _timeout_secs: u64) -> RawResult {
            *self.calls.lock().expect("calls lock") += 1;
            let name = puzzle
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            let parts: Vec<&str> = name.split('_').collect();
            let pct: u64 = parts[1].parse().unwrap_or(0);
            let inst: u64 = parts[2].parse().unwrap_or(0);
            thread::sleep(Duration::from_millis(60u64.saturating_sub(pct)));
            let solved = inst % 2 == 1;
            RawResult {
                exit_code: if solved { 0 } else { 1 },
                stdout: format!("{}\n0.5\n{}\n", if solved { 0 } else { 1 }, pct),
                stderr: String::new(),
                timed_out: false,
                wall_time: Duration::from_millis(1),
            }
        }
    }

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "bench_lib_{}_{}_{}",
            name,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("scratch dir");
        dir
    }

    fn loaded(dir: &Path, concurrency: usize) -> LoadedExperiment {
        let doc = json!({
            "experiment": { "id": "parity" },
            "solver": { "command": ["solver-on-path"], "success_exit_code": 0 },
            "corpus": { "mode": "matrix", "base_dir": "instances" },
            "design": {
                "classes": [{ "name": "9x9" }, { "name": "16x16" }],
                "percentages": { "start": 10, "end": 50, "step": 10 },
                "instances": 4,
                "max_concurrency": concurrency
            },
            "output": { "table": "out/results.csv" }
        });
        let config: ExperimentConfig = serde_json::from_value(doc.clone()).expect("config");
        LoadedExperiment {
            source: dir.join("parity.yaml"),
            exp_dir: dir.to_path_buf(),
            resolved: doc,
            config,
        }
    }

    fn run(dir: &Path, concurrency: usize) -> (RunResult, String) {
        let loaded = loaded(dir, concurrency);
        let plan = build_plan(&loaded).expect("plan");
        let invoker = ParityInvoker {
            calls: Mutex::new(0),
        };
        let result = run_plan(
            &loaded,
            &plan,
            &invoker,
            &RunOptions::default(),
            &SilentObserver,
        )
        .expect("run");
        assert_eq!(*invoker.calls.lock().expect("calls lock"), 40);
        let text = fs::read_to_string(&result.table_path).expect("table");
        (result, text)
    }

    #[test]
    fn parallel_run_writes_rows_in_plan_order() {
        let dir = scratch("parallel");
        let (sequential, seq_text) = run(&dir.join("seq"), 1);
        let (parallel, par_text) = run(&dir.join("par"), 4);
        assert_eq!(seq_text, par_text);
        assert_eq!(sequential.summaries, parallel.summaries);
        let params: Vec<String> = par_text
            .lines()
            .skip(1)
            .map(|l| l.split(',').take(2).collect::<Vec<_>>().join("/"))
            .collect();
        assert_eq!(
            params,
            vec![
                "9x9/10", "9x9/20", "9x9/30", "9x9/40", "9x9/50", "16x16/10", "16x16/20",
                "16x16/30", "16x16/40", "16x16/50"
            ]
        );
        assert!(par_text
            .lines()
            .skip(1)
            .all(|l| l.contains(",4,2,50.00,0.50000000,0.00000000,")));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn manifest_records_completion() {
        let dir = scratch("manifest");
        let (result, _) = run(&dir, 2);
        assert_eq!(result.manifest_path, dir.join("out").join("results.csv.manifest.json"));
        let manifest: Value =
            serde_json::from_slice(&fs::read(&result.manifest_path).expect("manifest"))
                .expect("json");
        assert_eq!(manifest["schema_version"], MANIFEST_SCHEMA);
        assert_eq!(manifest["status"], "completed");
        assert_eq!(manifest["rows_written"], 10);
        assert_eq!(manifest["planned_trials"], 40);
        assert_eq!(manifest["success_exit_code"], 0);
        assert!(manifest["config_digest"]
            .as_str()
            .expect("digest")
            .starts_with("sha256:"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn prepared_run_uses_the_described_plan() {
        let dir = scratch("prepared");
        let corpus = dir.join("instances");
        fs::create_dir_all(&corpus).expect("corpus");
        fs::write(corpus.join("9_a.txt"), "puzzle\n").expect("seed");
        let experiment = dir.join("logic.yaml");
        fs::write(
            &experiment,
            "\
solver:
  command: [./not-built-yet]
  success_exit_code: 0
corpus:
  mode: repeated
  base_dir: instances
design:
  repetitions: 2
output:
  table: logic.csv
",
        )
        .expect("write experiment");

        let options = RunOptions::default();
        let prepared =
            prepare_benchmark(&experiment, &BTreeMap::new(), &options).expect("prepare");
        assert_eq!(prepared.summary.bucket_count, 1);
        fs::write(corpus.join("9_b.txt"), "puzzle\n").expect("late file");

        let result = run_prepared(&prepared, &options, &SilentObserver).expect("run");
        assert_eq!(result.summaries.len(), prepared.summary.bucket_count);
        let text = fs::read_to_string(&result.table_path).expect("table");
        assert_eq!(text.lines().count(), 2);
        assert!(!text.contains("9_b.txt"));
        let _ = fs::remove_dir_all(dir);
    }
}
