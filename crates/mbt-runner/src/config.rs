use crate::executor::{Executor, HttpExecutor, ServiceExecutor, ServiceOptions};
use crate::graphwalker::{EngineOptions, ModelSpec};
use crate::planner::{OfflinePlanner, OnlinePlanner, Planner};
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

fn default_executable() -> String {
    "gw".to_string()
}

fn default_readiness_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub test_package: PathBuf,
    pub planner: PlannerConfig,
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlannerConfig {
    Online {
        models: Vec<ModelSpec>,
        #[serde(default)]
        start_element: Option<String>,
        #[serde(default)]
        port: Option<u16>,
        #[serde(default = "default_executable")]
        executable: String,
        #[serde(default)]
        verbose: bool,
        #[serde(default)]
        unvisited: bool,
        #[serde(default)]
        blocked: bool,
        #[serde(default = "default_readiness_timeout_secs")]
        readiness_timeout_secs: u64,
    },
    Offline {
        steps_path: PathBuf,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutorConfig {
    Http {
        url: String,
    },
    Service {
        command: Vec<String>,
        #[serde(default)]
        port: Option<u16>,
        #[serde(default)]
        path_prefix: String,
        #[serde(default)]
        working_dir: Option<PathBuf>,
        #[serde(default = "default_readiness_timeout_secs")]
        readiness_timeout_secs: u64,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportConfig {
    #[serde(default)]
    pub path_file: Option<PathBuf>,
}

pub fn load_config(path: &Path) -> Result<RunConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("config_read_failed: {}", path.display()))?;
    let mut config: RunConfig = serde_yaml::from_str(&raw)
        .map_err(|e| anyhow!("config_invalid: {}: {}", path.display(), e))?;
    let base = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    config.resolve_paths(&base);
    config.validate()?;
    debug!(path = %path.display(), "loaded run config");
    Ok(config)
}

fn resolve(base: &Path, path: &mut PathBuf) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

impl RunConfig {
    fn resolve_paths(&mut self, base: &Path) {
        resolve(base, &mut self.test_package);
        match &mut self.planner {
            PlannerConfig::Online { models, .. } => {
                for model in models.iter_mut() {
                    resolve(base, &mut model.path);
                }
            }
            PlannerConfig::Offline { steps_path } => resolve(base, steps_path),
        }
        if let ExecutorConfig::Service {
            working_dir: Some(dir),
            ..
        } = &mut self.executor
        {
            resolve(base, dir);
        }
        if let Some(file) = &mut self.report.path_file {
            resolve(base, file);
        }
    }

    pub fn validate(&self) -> Result<()> {
        match &self.planner {
            PlannerConfig::Online {
                models, executable, ..
            } => {
                if models.is_empty() {
                    return Err(anyhow!("config_invalid: planner.models must list at least one model"));
                }
                if let Some(model) = models.iter().find(|m| m.generator.trim().is_empty()) {
                    return Err(anyhow!(
                        "config_invalid: planner.models: {} has an empty generator",
                        model.path.display()
                    ));
                }
                if executable.trim().is_empty() {
                    return Err(anyhow!("config_invalid: planner.executable cannot be empty"));
                }
            }
            PlannerConfig::Offline { .. } => {}
        }
        match &self.executor {
            ExecutorConfig::Http { url } => {
                if url.trim().is_empty() {
                    return Err(anyhow!("config_invalid: executor.url cannot be empty"));
                }
            }
            ExecutorConfig::Service { command, .. } => {
                if command.is_empty() {
                    return Err(anyhow!("config_invalid: executor.command cannot be empty"));
                }
            }
        }
        Ok(())
    }
}

impl PlannerConfig {
    pub fn engine_options(&self) -> Option<EngineOptions> {
        match self {
            PlannerConfig::Online {
                models,
                start_element,
                port,
                executable,
                verbose,
                unvisited,
                blocked,
                readiness_timeout_secs,
            } => Some(EngineOptions {
                executable: executable.clone(),
                models: models.clone(),
                port: *port,
                start_element: start_element.clone(),
                verbose: *verbose,
                unvisited: *unvisited,
                blocked: *blocked,
                readiness_timeout: Duration::from_secs(*readiness_timeout_secs),
            }),
            PlannerConfig::Offline { .. } => None,
        }
    }
}

pub fn build_planner(config: &PlannerConfig) -> Result<Box<dyn Planner>> {
    match config {
        PlannerConfig::Offline { steps_path } => {
            let planner = OfflinePlanner::from_file(steps_path)
                .with_context(|| format!("planner_build_failed: {}", steps_path.display()))?;
            Ok(Box::new(planner))
        }
        PlannerConfig::Online { .. } => {
            let options = config
                .engine_options()
                .ok_or_else(|| anyhow!("planner_build_failed: no engine options"))?;
            let planner = OnlinePlanner::start(&options)
                .context("planner_build_failed: path engine did not start")?;
            Ok(Box::new(planner))
        }
    }
}

pub fn build_executor(config: &ExecutorConfig) -> Result<Box<dyn Executor>> {
    match config {
        ExecutorConfig::Http { url } => {
            let executor =
                HttpExecutor::new(url).with_context(|| format!("executor_build_failed: {}", url))?;
            Ok(Box::new(executor))
        }
        ExecutorConfig::Service {
            command,
            port,
            path_prefix,
            working_dir,
            readiness_timeout_secs,
        } => {
            let options = ServiceOptions {
                command: command.clone(),
                port: *port,
                path_prefix: path_prefix.clone(),
                working_dir: working_dir.clone(),
                readiness_timeout: Duration::from_secs(*readiness_timeout_secs),
            };
            let executor = ServiceExecutor::start(&options)
                .with_context(|| format!("executor_build_failed: {}", command.join(" ")))?;
            Ok(Box::new(executor))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn temp_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "mbt_config_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("mkdir");
        dir
    }

    #[test]
    fn online_config_resolves_relative_paths() {
        let dir = temp_dir("online");
        let path = dir.join("run.yaml");
        fs::write(
            &path,
            r#"
test_package: tests
planner:
  kind: online
  models:
    - path: models/shop.json
      generator: random(edge_coverage(100))
  start_element: v_start
  blocked: true
executor:
  kind: http
  url: http://localhost:5000/
report:
  path_file: out/steps.json
"#,
        )
        .expect("write");

        let config = load_config(&path).expect("config");
        assert_eq!(config.test_package, dir.join("tests"));
        assert_eq!(config.report.path_file, Some(dir.join("out/steps.json")));
        let options = config.planner.engine_options().expect("online");
        assert_eq!(options.executable, "gw");
        assert_eq!(options.models[0].path, dir.join("models/shop.json"));
        assert_eq!(options.start_element.as_deref(), Some("v_start"));
        assert!(options.blocked);
        assert_eq!(options.readiness_timeout, Duration::from_secs(30));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn offline_config_with_service_executor() {
        let dir = temp_dir("offline");
        let path = dir.join("run.yaml");
        fs::write(
            &path,
            r#"
test_package: /abs/tests
planner:
  kind: offline
  steps_path: steps.json
executor:
  kind: service
  command: [python3, -m, executor, --port, "{port}"]
  port: 5123
"#,
        )
        .expect("write");

        let config = load_config(&path).expect("config");
        assert_eq!(config.test_package, PathBuf::from("/abs/tests"));
        assert!(config.planner.engine_options().is_none());
        match &config.planner {
            PlannerConfig::Offline { steps_path } => assert_eq!(steps_path, &dir.join("steps.json")),
            other => panic!("unexpected planner: {:?}", other),
        }
        match &config.executor {
            ExecutorConfig::Service {
                command,
                port,
                readiness_timeout_secs,
                ..
            } => {
                assert_eq!(command.len(), 5);
                assert_eq!(*port, Some(5123));
                assert_eq!(*readiness_timeout_secs, 30);
            }
            other => panic!("unexpected executor: {:?}", other),
        }
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_field_is_named_in_the_error() {
        let dir = temp_dir("missing");
        let path = dir.join("run.yaml");
        fs::write(
            &path,
            "test_package: tests\nplanner:\n  kind: offline\nexecutor:\n  kind: http\n  url: http://x/\n",
        )
        .expect("write");
        let err = load_config(&path).expect_err("must fail").to_string();
        assert!(err.contains("config_invalid"), "{}", err);
        assert!(err.contains("steps_path"), "{}", err);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn empty_model_list_is_rejected() {
        let dir = temp_dir("empty");
        let path = dir.join("run.yaml");
        fs::write(
            &path,
            "test_package: tests\nplanner:\n  kind: online\n  models: []\nexecutor:\n  kind: http\n  url: http://x/\n",
        )
        .expect("write");
        let err = load_config(&path).expect_err("must fail").to_string();
        assert!(err.contains("planner.models"), "{}", err);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn offline_planner_builds_from_recorded_path() {
        let dir = temp_dir("build");
        let steps = dir.join("steps.json");
        fs::write(&steps, r#"[{"id":"v0","name":"vertex_a","modelName":"A"}]"#).expect("write");
        let mut planner = build_planner(&PlannerConfig::Offline { steps_path: steps }).expect("planner");
        assert!(planner.has_next().expect("has_next"));
        assert_eq!(planner.get_next().expect("step").name, "vertex_a");

        let err = build_planner(&PlannerConfig::Offline {
            steps_path: dir.join("absent.json"),
        })
        .err()
        .expect("missing file");
        assert!(err.to_string().contains("planner_build_failed"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn http_executor_builds_without_contacting_the_backend() {
        let executor = build_executor(&ExecutorConfig::Http {
            url: "http://127.0.0.1:1/api".to_string(),
        });
        assert!(executor.is_ok());
    }
}
