use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

pub mod config;
pub mod executor;
pub mod graphwalker;
pub mod inprocess;
pub mod planner;
pub mod process;
pub mod reporter;
pub mod step;
pub mod walker;

pub use config::{build_executor, build_planner, load_config, ExecutorConfig, PlannerConfig, RunConfig};
pub use executor::{Executor, ExecutorError, HttpExecutor, ServiceExecutor, ServiceOptions};
pub use graphwalker::{EngineOptions, GraphWalkerClient, GraphWalkerService, ModelSpec};
pub use inprocess::{Arity, InProcessExecutor, ModelClass, Output, PackageRegistry, TestPackage};
pub use planner::{OfflinePlanner, OnlinePlanner, Planner, PlannerError};
pub use reporter::{
    LogReporter, NullReporter, PathReporter, Reporter, Reporting, ReportingError, SummaryReporter,
};
pub use step::{ExecutionResult, FailedStep, GraphData, Statistics, Step, StepError, WalkedStep};
pub use walker::{Walk, Walker};

pub const PATH_REPORT_KEY: &str = "path";
pub const SUMMARY_REPORT_KEY: &str = "summary";

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub status: bool,
    pub statistics: Statistics,
    pub reports: BTreeMap<String, Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub steps_walked: usize,
}

impl RunOutcome {
    pub fn path_report(&self) -> Option<&Value> {
        self.reports.get(PATH_REPORT_KEY)
    }
}

struct CollaboratorGuard<P: Planner, E: Executor> {
    walker: Walker<P, E, Reporting>,
}

impl<P: Planner, E: Executor> Drop for CollaboratorGuard<P, E> {
    fn drop(&mut self) {
        self.walker.planner_mut().kill();
        self.walker.executor_mut().kill();
    }
}

pub fn default_reporting() -> Reporting {
    let mut reporting = Reporting::new();
    let defaults: [(&str, Box<dyn Reporter>); 3] = [
        ("log", Box::new(LogReporter)),
        (PATH_REPORT_KEY, Box::new(PathReporter::new())),
        (SUMMARY_REPORT_KEY, Box::new(SummaryReporter::new())),
    ];
    for (key, reporter) in defaults {
        // Fresh registry: keys cannot collide.
        let _ = reporting.register(key, reporter);
    }
    reporting
}

/// Loads the test package, walks the path to completion and collects the
/// statistics and reporter artifacts. A package that does not load aborts
/// the run; everything after that ends up in `RunOutcome::status`.
pub fn run_walk<P, E, F>(
    planner: P,
    executor: E,
    reporting: Reporting,
    test_package: &Path,
    mut on_step: F,
) -> Result<RunOutcome>
where
    P: Planner,
    E: Executor,
    F: FnMut(&WalkedStep),
{
    let mut guard = CollaboratorGuard {
        walker: Walker::new(planner, executor, reporting),
    };
    guard
        .walker
        .executor_mut()
        .load(test_package)
        .with_context(|| format!("load_failed: test package {}", test_package.display()))?;
    info!(test_package = %test_package.display(), "test package loaded");

    let started_at = Utc::now();
    let mut steps_walked = 0usize;
    for walked in guard.walker.walk() {
        steps_walked += 1;
        on_step(&walked);
    }
    let finished_at = Utc::now();
    let status = guard.walker.status();

    let statistics = match guard.walker.planner_mut().statistics() {
        Ok(statistics) => statistics,
        Err(err) => {
            warn!(error = %err, "statistics unavailable");
            Statistics::default()
        }
    };
    let reports = guard.walker.reporter().reports();
    info!(status, steps_walked, "walk complete");

    Ok(RunOutcome {
        status,
        statistics,
        reports,
        started_at,
        finished_at,
        steps_walked,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingStep {
    pub model_name: Option<String>,
    pub name: String,
    pub model_missing: bool,
}

/// Returns every distinct step of `steps` the loaded test code cannot run,
/// in first-seen order. Fixtures are skipped: they are optional.
pub fn verify_steps<E: Executor + ?Sized>(
    executor: &mut E,
    steps: &[Step],
) -> Result<Vec<MissingStep>, ExecutorError> {
    let mut seen = BTreeSet::new();
    let mut models: BTreeMap<String, bool> = BTreeMap::new();
    let mut missing = Vec::new();
    for step in steps.iter().filter(|s| !s.is_fixture()) {
        if !seen.insert(step.qualified_name()) {
            continue;
        }
        let model_present = match step.model_name.as_deref() {
            Some(model) => match models.get(model) {
                Some(present) => *present,
                None => {
                    let present = executor.has_model(model)?;
                    models.insert(model.to_string(), present);
                    present
                }
            },
            None => true,
        };
        if !model_present || !executor.has_step(step.model_name.as_deref(), &step.name)? {
            missing.push(MissingStep {
                model_name: step.model_name.clone(),
                name: step.name.clone(),
                model_missing: !model_present,
            });
        }
    }
    Ok(missing)
}

/// Reads the named vertices and edges of a path-engine model file. Accepts
/// either `{"models": [...]}` or a single model object.
pub fn steps_from_models(path: &Path) -> Result<Vec<Step>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("model_read_failed: {}", path.display()))?;
    let doc: Value = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("model_invalid: {}: {}", path.display(), e))?;
    let models: Vec<&Value> = match doc.get("models").and_then(Value::as_array) {
        Some(models) => models.iter().collect(),
        None if doc.get("vertices").is_some() => vec![&doc],
        None => {
            return Err(anyhow!(
                "model_invalid: {}: expected a models array or a model object",
                path.display()
            ))
        }
    };

    let mut steps = Vec::new();
    for model in models {
        let model_name = model
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("model_invalid: {}: model without a name", path.display()))?;
        for key in ["vertices", "edges"] {
            let elements = model.get(key).and_then(Value::as_array);
            for element in elements.into_iter().flatten() {
                let name = match element.get("name").and_then(Value::as_str) {
                    Some(name) if !name.is_empty() => name,
                    _ => continue,
                };
                let id = element.get("id").and_then(Value::as_str).unwrap_or(name);
                steps.push(Step::new(id, name, model_name));
            }
        }
    }
    Ok(steps)
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
        .with_context(|| format!("report_write_failed: {}", path.display()))
}

pub fn write_path_report(outcome: &RunOutcome, path: &Path) -> Result<()> {
    let report = outcome
        .path_report()
        .ok_or_else(|| anyhow!("report_missing: no {} reporter registered", PATH_REPORT_KEY))?;
    atomic_write_json_pretty(path, report)?;
    info!(path = %path.display(), "path report written");
    Ok(())
}
