use anyhow::Result;
use bench_runner::config::DEFAULT_ROLLUP_CLASSES;
use bench_runner::{BucketKey, BucketSummary, Outcome, TrialObserver};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bench", version, about = "Puzzle solver benchmark harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every planned bucket and write the result table.
    Run {
        experiment: PathBuf,
        #[arg(long = "set")]
        set_values: Vec<String>,
        /// Write the result table here instead of `output.table`.
        #[arg(long)]
        out: Option<PathBuf>,
        /// Suppress the per-trial progress ticks.
        #[arg(long)]
        quiet: bool,
        #[arg(long)]
        json: bool,
    },
    /// Show what a run would do without launching the solver.
    Describe {
        experiment: PathBuf,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Roll result tables up by puzzle class.
    Summarize {
        #[arg(required = true)]
        tables: Vec<PathBuf>,
        /// Puzzle classes to report, in output order. Others are skipped.
        #[arg(long = "class")]
        classes: Vec<String>,
        #[arg(long, default_value = "summary")]
        out_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Write a starter experiment file.
    Init {
        #[arg(long, default_value = "experiment.yaml")]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

/// Prints `|` per solved trial and `x` per failure on stderr.
struct TickObserver;

impl TrialObserver for TickObserver {
    fn trial_finished(&self, _key: &BucketKey, _trial: usize, outcome: &Outcome) {
        let mut err = io::stderr().lock();
        let _ = err.write_all(if outcome.solved { b"|" } else { b"x" });
        let _ = err.flush();
    }

    fn bucket_finished(&self, summary: &BucketSummary) {
        eprintln!(" {} -> {:.2}%", summary.key, summary.success_rate);
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err)));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            experiment,
            set_values,
            out,
            quiet,
            json,
        } => {
            let overrides = parse_set_bindings(&set_values)?;
            let options = bench_runner::RunOptions {
                table_override: out,
            };
            let prepared = bench_runner::prepare_benchmark(&experiment, &overrides, &options)?;
            if !json {
                print_summary(&prepared.summary);
            }
            let observer: &dyn TrialObserver = if quiet || json {
                &bench_runner::SilentObserver
            } else {
                &TickObserver
            };
            let result = bench_runner::run_prepared(&prepared, &options, observer)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "summary": summary_to_json(&prepared.summary),
                    "run": {
                        "run_id": result.run_id,
                        "table": result.table_path.display().to_string(),
                        "manifest": result.manifest_path.display().to_string(),
                        "buckets": result.summaries,
                    }
                })));
            }
            println!("run_id: {}", result.run_id);
            println!("table: {}", result.table_path.display());
            println!("manifest: {}", result.manifest_path.display());
        }
        Commands::Describe {
            experiment,
            set_values,
            json,
        } => {
            let overrides = parse_set_bindings(&set_values)?;
            let summary = bench_runner::describe_benchmark(&experiment, &overrides)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary_to_json(&summary)
                })));
            }
            print_summary(&summary);
        }
        Commands::Summarize {
            tables,
            classes,
            out_dir,
            json,
        } => {
            let classes = if classes.is_empty() {
                DEFAULT_ROLLUP_CLASSES
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            } else {
                classes
            };
            let reports = bench_runner::summarize_tables(&tables, &classes, &out_dir)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "summarize",
                    "classes": classes,
                    "reports": reports,
                })));
            }
            for report in &reports {
                println!(
                    "{} -> {} ({} classes)",
                    report.input.display(),
                    report.output.display(),
                    report.rows.len()
                );
            }
        }
        Commands::Init { path, force } => {
            write_experiment_template(&path, force)?;
            println!("wrote: {}", path.display());
            println!(
                "next: edit {} and set solver.success_exit_code and corpus.base_dir",
                path.display()
            );
            println!("next: bench describe {}", path.display());
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Summarize { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}

fn parse_set_bindings(values: &[String]) -> Result<BTreeMap<String, Value>> {
    let mut out = BTreeMap::new();
    for raw in values {
        let (key, val_raw) = raw
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("invalid --set '{}': expected k=v", raw))?;
        if key.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "invalid --set '{}': key cannot be empty",
                raw
            ));
        }
        let parsed =
            serde_json::from_str::<Value>(val_raw).unwrap_or(Value::String(val_raw.to_string()));
        out.insert(key.trim().to_string(), parsed);
    }
    Ok(out)
}

fn summary_to_json(summary: &bench_runner::BenchmarkSummary) -> Value {
    json!({
        "experiment": summary.experiment_id,
        "mode": summary.mode.as_str(),
        "solver": summary.solver_command,
        "solver_path": summary.solver_path.as_ref().map(|p| p.display().to_string()),
        "solver_exists": summary.solver_exists,
        "success_exit_code": summary.success_exit_code,
        "classes": summary.classes,
        "buckets": summary.bucket_count,
        "total_trials": summary.total_trials,
        "max_concurrency": summary.max_concurrency,
        "table": summary.table_path.display().to_string(),
    })
}

fn print_summary(summary: &bench_runner::BenchmarkSummary) {
    println!("experiment: {}", summary.experiment_id);
    println!("mode: {}", summary.mode.as_str());
    println!("solver: {:?}", summary.solver_command);
    if let Some(p) = &summary.solver_path {
        println!("solver_path: {}", p.display());
        println!("solver_exists: {}", summary.solver_exists);
    }
    println!("success_exit_code: {}", summary.success_exit_code);
    println!("classes: {}", summary.classes.join(", "));
    println!("buckets: {}", summary.bucket_count);
    println!("total_trials: {}", summary.total_trials);
    println!("max_concurrency: {}", summary.max_concurrency);
    println!("table: {}", summary.table_path.display());
}

fn write_experiment_template(path: &Path, force: bool) -> Result<()> {
    if !force && path.exists() {
        return Err(anyhow::anyhow!(
            "experiment file already exists (use --force): {}",
            path.display()
        ));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let template = "\
experiment:
  id: sudoku-general
solver:
  command: [./sudokusolver]
  success_exit_code:                  # REQUIRED: exit status meaning solved (0 or 1)
  file_flag: --file
  timeout_flag: --timeout
  kill_grace_seconds: 5
corpus:
  mode: matrix                        # matrix | repeated
  base_dir: instances/general         # REQUIRED
  template: '{prefix}_{pct}_{inst}.txt'
  suffix: .txt                        # repeated mode file filter
design:
  classes:                            # matrix mode
    - { name: 9x9, prefix: inst9x9 }
    - { name: 16x16, prefix: inst16x16 }
    - { name: 25x25, prefix: inst25x25 }
  percentages: { start: 0, end: 100, step: 5 }
  instances: 100
  repetitions: 100                    # repeated mode
  class_rules:                        # repeated mode, first match wins
    - { prefix: '6', class: 6x6 }
    - { prefix: '1', class: 12x12 }
  default_class: 9x9
  max_concurrency: 1
timeouts:
  default_seconds: 3
  per_class:
    9x9: 5
    12x12: 10
    16x16: 20
    25x25: 120
output:
  table: sudoku_results.csv
";
    std::fs::write(path, template)?;
    Ok(())
}
