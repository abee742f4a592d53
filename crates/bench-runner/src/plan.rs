use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::{ClassRule, LoadedExperiment, RunMode, DEFAULT_UNKNOWN_CLASS};

/// One (puzzle class, parameter) cell of the result table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct BucketKey {
    pub class: String,
    /// Clue percentage in matrix mode, file name in repeated mode.
    pub parameter: String,
}

impl BucketKey {
    pub fn new(class: impl Into<String>, parameter: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            parameter: parameter.into(),
        }
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.class, self.parameter)
    }
}

/// Which puzzle file each planned trial of a bucket runs against.
#[derive(Debug, Clone, PartialEq)]
pub enum TrialFiles {
    /// The same file, `repetitions` times.
    Repeated { file: PathBuf, repetitions: usize },
    /// One trial per distinct instance file.
    Distinct(Vec<PathBuf>),
}

impl TrialFiles {
    pub fn len(&self) -> usize {
        match self {
            TrialFiles::Repeated { repetitions, .. } => *repetitions,
            TrialFiles::Distinct(files) => files.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn file_for(&self, trial: usize) -> Option<&Path> {
        match self {
            TrialFiles::Repeated { file, repetitions } if trial < *repetitions => {
                Some(file.as_path())
            }
            TrialFiles::Repeated { .. } => None,
            TrialFiles::Distinct(files) => files.get(trial).map(PathBuf::as_path),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BucketPlan {
    pub key: BucketKey,
    pub files: TrialFiles,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct RunPlan {
    pub mode: RunMode,
    pub buckets: Vec<BucketPlan>,
}

impl RunPlan {
    pub fn total_trials(&self) -> usize {
        self.buckets.iter().map(|b| b.files.len()).sum()
    }
}

pub fn build_plan(loaded: &LoadedExperiment) -> Result<RunPlan> {
    let buckets = match loaded.config.corpus.mode {
        RunMode::Matrix => plan_matrix(loaded),
        RunMode::Repeated => plan_repeated(loaded)?,
    };
    Ok(RunPlan {
        mode: loaded.config.corpus.mode,
        buckets,
    })
}

/// Class, then clue percentage; each bucket covers every instance index.
fn plan_matrix(loaded: &LoadedExperiment) -> Vec<BucketPlan> {
    let config = &loaded.config;
    let base_dir = loaded.corpus_dir();
    let percentages = config
        .design
        .percentages
        .as_ref()
        .map(|p| p.values())
        .unwrap_or_default();
    let instances = config.design.instances.unwrap_or(0);

    let mut buckets = Vec::new();
    for class in &config.design.classes {
        let prefix = class.file_prefix();
        let timeout_secs = config.timeouts.seconds_for(&class.name);
        for pct in &percentages {
            let files = (0..instances)
                .map(|inst| {
                    base_dir.join(render_template(
                        &config.corpus.template,
                        &prefix,
                        &class.name,
                        *pct,
                        inst,
                    ))
                })
                .collect();
            buckets.push(BucketPlan {
                key: BucketKey::new(class.name.clone(), pct.to_string()),
                files: TrialFiles::Distinct(files),
                timeout_secs,
            });
        }
    }
    buckets
}

/// One bucket per corpus file, in file name order.
fn plan_repeated(loaded: &LoadedExperiment) -> Result<Vec<BucketPlan>> {
    let config = &loaded.config;
    let base_dir = loaded.corpus_dir();
    let repetitions = config.design.repetitions.unwrap_or(0) as usize;
    let default_class = config
        .design
        .default_class
        .as_deref()
        .unwrap_or(DEFAULT_UNKNOWN_CLASS);

    let mut buckets = Vec::new();
    for file_name in list_corpus(&base_dir, &config.corpus.suffix)? {
        let class = infer_class(&file_name, &config.design.class_rules, default_class);
        let timeout_secs = config.timeouts.seconds_for(&class);
        buckets.push(BucketPlan {
            files: TrialFiles::Repeated {
                file: base_dir.join(&file_name),
                repetitions,
            },
            key: BucketKey::new(class, file_name),
            timeout_secs,
        });
    }
    Ok(buckets)
}

pub fn render_template(template: &str, prefix: &str, class: &str, pct: u32, inst: u32) -> String {
    template
        .replace("{prefix}", prefix)
        .replace("{class}", class)
        .replace("{pct}", &pct.to_string())
        .replace("{inst}", &inst.to_string())
}

/// First matching prefix rule wins.
pub fn infer_class(file_name: &str, rules: &[ClassRule], default_class: &str) -> String {
    rules
        .iter()
        .find(|rule| file_name.starts_with(rule.prefix.as_str()))
        .map(|rule| rule.class.clone())
        .unwrap_or_else(|| default_class.to_string())
}

fn list_corpus(dir: &Path, suffix: &str) -> Result<Vec<String>> {
    if !dir.is_dir() {
        return Err(anyhow!("corpus directory not found: {}", dir.display()));
    }
    let mut names = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry =
            entry.with_context(|| format!("failed to list corpus directory {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if name.ends_with(suffix) {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExperimentConfig;
    use chrono::Utc;
    use serde_json::json;
    use std::fs;

    fn loaded(doc: serde_json::Value, exp_dir: &Path) -> LoadedExperiment {
        let config: ExperimentConfig = serde_json::from_value(doc.clone()).expect("config");
        LoadedExperiment {
            source: exp_dir.join("experiment.yaml"),
            exp_dir: exp_dir.to_path_buf(),
            resolved: doc,
            config,
        }
    }

    #[test]
    fn matrix_plan_follows_class_then_percentage_order() {
        let doc = json!({
            "solver": { "command": ["./solver"], "success_exit_code": 1 },
            "corpus": { "mode": "matrix", "base_dir": "instances/general" },
            "design": {
                "classes": [{ "name": "9x9" }, { "name": "25x25" }],
                "percentages": [50, 40],
                "instances": 3
            },
            "timeouts": { "default_seconds": 3, "per_class": { "9x9": 5, "25x25": 120 } },
            "output": { "table": "out.csv" }
        });
        let plan = build_plan(&loaded(doc, Path::new("/proj"))).expect("plan");
        let keys: Vec<String> = plan.buckets.iter().map(|b| b.key.to_string()).collect();
        assert_eq!(keys, vec!["9x9/50", "9x9/40", "25x25/50", "25x25/40"]);
        assert_eq!(plan.total_trials(), 12);
        assert_eq!(plan.buckets[0].timeout_secs, 5);
        assert_eq!(plan.buckets[3].timeout_secs, 120);
        assert_eq!(
            plan.buckets[1].files.file_for(2),
            Some(Path::new("/proj/instances/general/inst9x9_40_2.txt"))
        );
        assert_eq!(plan.buckets[1].files.file_for(3), None);
    }

    #[test]
    fn template_placeholders_render() {
        assert_eq!(
            render_template("{class}/{prefix}-{pct}-{inst}.sud", "p", "16x16", 35, 7),
            "16x16/p-35-7.sud"
        );
    }

    #[test]
    fn class_rules_apply_in_order() {
        let rules = vec![
            ClassRule {
                prefix: "6".to_string(),
                class: "6x6".to_string(),
            },
            ClassRule {
                prefix: "16".to_string(),
                class: "16x16".to_string(),
            },
            ClassRule {
                prefix: "1".to_string(),
                class: "12x12".to_string(),
            },
        ];
        assert_eq!(infer_class("6_easy.txt", &rules, "9x9"), "6x6");
        assert_eq!(infer_class("16_hard.txt", &rules, "9x9"), "16x16");
        assert_eq!(infer_class("12_a.txt", &rules, "9x9"), "12x12");
        assert_eq!(infer_class("logic_9.txt", &rules, "9x9"), "9x9");
    }

    #[test]
    fn repeated_plan_lists_matching_files_sorted() {
        let root = std::env::temp_dir().join(format!(
            "bench_plan_repeated_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let corpus = root.join("logic");
        fs::create_dir_all(corpus.join("nested")).expect("corpus");
        for name in ["b_puzzle.txt", "6_a.txt", "notes.md", "a_puzzle.txt"] {
            fs::write(corpus.join(name), "3 1\n").expect("write");
        }
        fs::write(corpus.join("nested").join("z.txt"), "").expect("write nested");

        let doc = json!({
            "solver": { "command": ["./solver"], "success_exit_code": 0 },
            "corpus": { "mode": "repeated", "base_dir": "logic" },
            "design": {
                "repetitions": 4,
                "class_rules": [{ "prefix": "6", "class": "6x6" }],
                "default_class": "9x9"
            },
            "timeouts": { "default_seconds": 3, "per_class": { "9x9": 5 } },
            "output": { "table": "out.csv" }
        });
        let plan = build_plan(&loaded(doc, &root)).expect("plan");
        let keys: Vec<String> = plan.buckets.iter().map(|b| b.key.to_string()).collect();
        assert_eq!(
            keys,
            vec!["6x6/6_a.txt", "9x9/a_puzzle.txt", "9x9/b_puzzle.txt"]
        );
        assert_eq!(plan.total_trials(), 12);
        assert_eq!(plan.buckets[0].timeout_secs, 3);
        assert_eq!(plan.buckets[1].timeout_secs, 5);
        assert_eq!(
            plan.buckets[2].files,
            TrialFiles::Repeated {
                file: corpus.join("b_puzzle.txt"),
                repetitions: 4
            }
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn repeated_plan_requires_corpus_directory() {
        let doc = json!({
            "solver": { "command": ["./solver"], "success_exit_code": 0 },
            "corpus": { "mode": "repeated", "base_dir": "/nonexistent/bench/corpus" },
            "design": { "repetitions": 1 },
            "output": { "table": "out.csv" }
        });
        let err = build_plan(&loaded(doc, Path::new("/proj"))).expect_err("missing dir");
        assert!(err.to_string().contains("corpus directory not found"));
    }
}
