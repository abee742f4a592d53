use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::invoke::TIMEOUT_EXIT_CODE;

pub const DEFAULT_FILE_FLAG: &str = "--file";
pub const DEFAULT_TIMEOUT_FLAG: &str = "--timeout";
pub const DEFAULT_KILL_GRACE_SECONDS: u64 = 5;
pub const DEFAULT_TEMPLATE: &str = "{prefix}_{pct}_{inst}.txt";
pub const DEFAULT_SUFFIX: &str = ".txt";
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 3;
pub const DEFAULT_UNKNOWN_CLASS: &str = "unknown";

/// Puzzle classes the rollup reports on when none are given explicitly.
pub const DEFAULT_ROLLUP_CLASSES: &[&str] = &["6x6", "9x9", "12x12", "16x16", "25x25"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Classes x clue percentages, one trial per distinct instance file.
    Matrix,
    /// Every file in the corpus directory, repeated N times.
    Repeated,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Matrix => "matrix",
            RunMode::Repeated => "repeated",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentMeta {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverConfig {
    pub command: Vec<String>,
    /// Exit status that means "solved". Never inferred.
    pub success_exit_code: i32,
    #[serde(default = "default_file_flag")]
    pub file_flag: String,
    #[serde(default = "default_timeout_flag")]
    pub timeout_flag: String,
    #[serde(default = "default_kill_grace")]
    pub kill_grace_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusConfig {
    pub mode: RunMode,
    pub base_dir: PathBuf,
    #[serde(default = "default_template")]
    pub template: String,
    #[serde(default = "default_suffix")]
    pub suffix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassSpec {
    pub name: String,
    /// File name prefix; `inst<name>` when omitted.
    #[serde(default)]
    pub prefix: Option<String>,
}

impl ClassSpec {
    pub fn file_prefix(&self) -> String {
        self.prefix
            .clone()
            .unwrap_or_else(|| format!("inst{}", self.name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Percentages {
    List(Vec<u32>),
    /// Inclusive on both ends.
    Range { start: u32, end: u32, step: u32 },
}

impl Percentages {
    pub fn values(&self) -> Vec<u32> {
        match self {
            Percentages::List(values) => values.clone(),
            Percentages::Range { start, end, step } => {
                if *step == 0 {
                    return Vec::new();
                }
                (*start..=*end).step_by(*step as usize).collect()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassRule {
    pub prefix: String,
    pub class: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesignConfig {
    #[serde(default)]
    pub classes: Vec<ClassSpec>,
    #[serde(default)]
    pub percentages: Option<Percentages>,
    #[serde(default)]
    pub instances: Option<u32>,
    #[serde(default)]
    pub repetitions: Option<u32>,
    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub class_rules: Vec<ClassRule>,
    #[serde(default)]
    pub default_class: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutTable {
    #[serde(default = "default_timeout_seconds")]
    pub default_seconds: u64,
    #[serde(default)]
    pub per_class: BTreeMap<String, u64>,
}

impl Default for TimeoutTable {
    fn default() -> Self {
        Self {
            default_seconds: DEFAULT_TIMEOUT_SECONDS,
            per_class: BTreeMap::new(),
        }
    }
}

impl TimeoutTable {
    pub fn seconds_for(&self, class: &str) -> u64 {
        self.per_class
            .get(class)
            .copied()
            .unwrap_or(self.default_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub table: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default)]
    pub experiment: ExperimentMeta,
    pub solver: SolverConfig,
    pub corpus: CorpusConfig,
    pub design: DesignConfig,
    #[serde(default)]
    pub timeouts: TimeoutTable,
    pub output: OutputConfig,
}

fn default_file_flag() -> String {
    DEFAULT_FILE_FLAG.to_string()
}

fn default_timeout_flag() -> String {
    DEFAULT_TIMEOUT_FLAG.to_string()
}

fn default_kill_grace() -> u64 {
    DEFAULT_KILL_GRACE_SECONDS
}

fn default_template() -> String {
    DEFAULT_TEMPLATE.to_string()
}

fn default_suffix() -> String {
    DEFAULT_SUFFIX.to_string()
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

fn default_concurrency() -> usize {
    1
}

/// A configuration resolved against its source file.
#[derive(Debug, Clone)]
pub struct LoadedExperiment {
    pub source: PathBuf,
    pub exp_dir: PathBuf,
    /// Configuration after overrides, as JSON. Digested into the run manifest.
    pub resolved: Value,
    pub config: ExperimentConfig,
}

impl LoadedExperiment {
    /// Relative paths in the experiment file are anchored at its directory.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            normalize_path(&self.exp_dir.join(path))
        }
    }

    pub fn corpus_dir(&self) -> PathBuf {
        self.resolve_path(&self.config.corpus.base_dir)
    }

    pub fn table_path(&self) -> PathBuf {
        self.resolve_path(&self.config.output.table)
    }

    pub fn solver_command(&self) -> Vec<String> {
        resolve_command_local(&self.config.solver.command, &self.exp_dir)
    }
}

pub fn load_experiment(
    path: &Path,
    overrides: &BTreeMap<String, Value>,
) -> Result<LoadedExperiment> {
    let raw_yaml = fs::read_to_string(path)
        .with_context(|| format!("failed to read experiment file {}", path.display()))?;
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(&raw_yaml)
        .with_context(|| format!("failed to parse experiment file {}", path.display()))?;
    let mut json_value: Value = serde_json::to_value(yaml_value)?;
    apply_overrides(&mut json_value, overrides)?;
    validate_required_fields(&json_value)?;

    let config: ExperimentConfig = serde_json::from_value(json_value.clone())
        .with_context(|| format!("invalid experiment file {}", path.display()))?;
    validate_config(&config)?;

    let exp_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .canonicalize()
        .unwrap_or_else(|_| PathBuf::from("."));

    Ok(LoadedExperiment {
        source: path.to_path_buf(),
        exp_dir,
        resolved: json_value,
        config,
    })
}

/// Applies `key.path=value` bindings onto the raw document before typing.
pub fn apply_overrides(root: &mut Value, overrides: &BTreeMap<String, Value>) -> Result<()> {
    for (key, value) in overrides {
        if key.trim().is_empty() {
            return Err(anyhow!("override key cannot be empty"));
        }
        let pointer = format!("/{}", key.split('.').collect::<Vec<_>>().join("/"));
        set_json_pointer_value(root, &pointer, value.clone())?;
    }
    Ok(())
}

fn validate_required_fields(json_value: &Value) -> Result<()> {
    let mut required: Vec<&str> = vec![
        "/solver/command",
        "/solver/success_exit_code",
        "/corpus/mode",
        "/corpus/base_dir",
        "/output/table",
    ];
    match json_value.pointer("/corpus/mode").and_then(|v| v.as_str()) {
        Some("matrix") => {
            required.extend(["/design/classes", "/design/percentages", "/design/instances"])
        }
        Some("repeated") => required.push("/design/repetitions"),
        _ => {}
    }
    let mut missing = Vec::new();
    for pointer in required {
        let is_missing = match json_value.pointer(pointer) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(Value::Array(a)) => a.is_empty(),
            _ => false,
        };
        if is_missing {
            missing.push(pointer);
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(
            "experiment file missing required fields:\n{}",
            missing
                .iter()
                .map(|p| format!("  - {}", p))
                .collect::<Vec<_>>()
                .join("\n")
        ))
    }
}

fn validate_config(config: &ExperimentConfig) -> Result<()> {
    let mut problems = Vec::new();
    let code = config.solver.success_exit_code;
    if !(0..=255).contains(&code) || code == TIMEOUT_EXIT_CODE {
        problems.push(format!(
            "solver.success_exit_code {} is not a usable exit status (expected 0..=255, not {})",
            code, TIMEOUT_EXIT_CODE
        ));
    }
    if config.design.max_concurrency == 0 {
        problems.push("design.max_concurrency must be at least 1".to_string());
    }
    if config.timeouts.default_seconds == 0 {
        problems.push("timeouts.default_seconds must be positive".to_string());
    }
    for (class, secs) in &config.timeouts.per_class {
        if *secs == 0 {
            problems.push(format!("timeouts.per_class.{} must be positive", class));
        }
    }
    match config.corpus.mode {
        RunMode::Matrix => {
            if let Some(Percentages::Range { step: 0, .. }) = &config.design.percentages {
                problems.push("design.percentages.step must be positive".to_string());
            }
            if config
                .design
                .percentages
                .as_ref()
                .map(|p| p.values().is_empty())
                .unwrap_or(true)
            {
                problems.push("design.percentages expands to no values".to_string());
            }
            let mut seen_classes = BTreeSet::new();
            for class in &config.design.classes {
                if !seen_classes.insert(class.name.as_str()) {
                    problems.push(format!(
                        "design.classes lists '{}' more than once",
                        class.name
                    ));
                }
            }
            if let Some(percentages) = &config.design.percentages {
                let mut seen_pcts = BTreeSet::new();
                for pct in percentages.values() {
                    if !seen_pcts.insert(pct) {
                        problems.push(format!("design.percentages lists {} more than once", pct));
                    }
                }
            }
            if config.design.instances.unwrap_or(0) == 0 {
                problems.push("design.instances must be at least 1".to_string());
            }
            for placeholder in ["{pct}", "{inst}"] {
                if !config.corpus.template.contains(placeholder) {
                    problems.push(format!(
                        "corpus.template '{}' lacks {}",
                        config.corpus.template, placeholder
                    ));
                }
            }
        }
        RunMode::Repeated => {
            if config.design.repetitions.unwrap_or(0) == 0 {
                problems.push("design.repetitions must be at least 1".to_string());
            }
        }
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(
            "experiment file is invalid:\n{}",
            problems
                .iter()
                .map(|p| format!("  - {}", p))
                .collect::<Vec<_>>()
                .join("\n")
        ))
    }
}

fn decode_pointer_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

fn set_json_pointer_value(root: &mut Value, pointer: &str, new_value: Value) -> Result<()> {
    if !pointer.starts_with('/') {
        return Err(anyhow!("json_pointer must start with '/': {}", pointer));
    }
    let tokens: Vec<String> = pointer
        .split('/')
        .skip(1)
        .map(decode_pointer_token)
        .collect();
    let Some((last, parents)) = tokens.split_last() else {
        *root = new_value;
        return Ok(());
    };

    let mut cur = root;
    for token in parents {
        cur = match cur {
            Value::Object(map) => map.entry(token.clone()).or_insert_with(|| json!({})),
            Value::Array(arr) => {
                let idx = array_index(token, arr.len(), pointer)?;
                &mut arr[idx]
            }
            _ => {
                return Err(anyhow!(
                    "override traversal hit non-container at '{}' in {}",
                    token,
                    pointer
                ))
            }
        };
    }

    match cur {
        Value::Object(map) => {
            map.insert(last.clone(), new_value);
            Ok(())
        }
        Value::Array(arr) => {
            let idx = array_index(last, arr.len(), pointer)?;
            arr[idx] = new_value;
            Ok(())
        }
        _ => Err(anyhow!(
            "override target is not an object/array for {}",
            pointer
        )),
    }
}

fn array_index(token: &str, len: usize, pointer: &str) -> Result<usize> {
    let idx: usize = token.parse().map_err(|_| {
        anyhow!(
            "override token '{}' is not a valid array index in {}",
            token,
            pointer
        )
    })?;
    if idx >= len {
        return Err(anyhow!(
            "override array index {} out of bounds in {}",
            idx,
            pointer
        ));
    }
    Ok(idx)
}

fn resolve_command_local(command: &[String], exp_dir: &Path) -> Vec<String> {
    command
        .iter()
        .map(|part| {
            let p = Path::new(part);
            if p.is_relative() && command_part_looks_like_path(part) {
                normalize_path(&exp_dir.join(p))
                    .to_string_lossy()
                    .to_string()
            } else {
                part.clone()
            }
        })
        .collect()
}

fn command_part_looks_like_path(part: &str) -> bool {
    part.starts_with('.') || part.contains('/') || part.ends_with(".sh") || part.ends_with(".py")
}

/// Path of the solver executable or script when the command names one.
pub fn resolve_solver_script(command: &[String]) -> Option<PathBuf> {
    let first = command.first()?;
    if Path::new(first).is_absolute() {
        return Some(PathBuf::from(first));
    }
    None
}

pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
