use crate::graphwalker::{EngineOptions, GraphWalkerClient, GraphWalkerService};
use crate::process::ServiceError;
use crate::step::{GraphData, PathLog, Statistics, Step};
use serde_json::{json, Map, Value};
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("engine_transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("engine_error: {0}")]
    Engine(String),
    #[error("planner_exhausted: no next step")]
    Exhausted,
    #[error(transparent)]
    Process(#[from] ServiceError),
    #[error("planner_json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("planner_io: {0}")]
    Io(#[from] std::io::Error),
}

/// `get_next` may only be called after `has_next` returned `true`.
/// `kill` is idempotent and safe before anything was started.
pub trait Planner {
    fn has_next(&mut self) -> Result<bool, PlannerError>;
    fn get_next(&mut self) -> Result<Step, PlannerError>;
    fn get_data(&mut self) -> Result<GraphData, PlannerError>;
    fn set_data(&mut self, key: &str, value: &Value) -> Result<(), PlannerError>;
    fn fail(&mut self, step: &Step, message: &str) -> Result<(), PlannerError>;
    fn restart(&mut self) -> Result<(), PlannerError>;
    fn statistics(&mut self) -> Result<Statistics, PlannerError>;
    fn kill(&mut self);
}

impl<T: Planner + ?Sized> Planner for Box<T> {
    fn has_next(&mut self) -> Result<bool, PlannerError> {
        (**self).has_next()
    }
    fn get_next(&mut self) -> Result<Step, PlannerError> {
        (**self).get_next()
    }
    fn get_data(&mut self) -> Result<GraphData, PlannerError> {
        (**self).get_data()
    }
    fn set_data(&mut self, key: &str, value: &Value) -> Result<(), PlannerError> {
        (**self).set_data(key, value)
    }
    fn fail(&mut self, step: &Step, message: &str) -> Result<(), PlannerError> {
        (**self).fail(step, message)
    }
    fn restart(&mut self) -> Result<(), PlannerError> {
        (**self).restart()
    }
    fn statistics(&mut self) -> Result<Statistics, PlannerError> {
        (**self).statistics()
    }
    fn kill(&mut self) {
        (**self).kill()
    }
}

/// Fronts a live path-engine session. Failures are recorded locally and
/// forwarded so the engine's own coverage bookkeeping stays consistent.
#[derive(Debug)]
pub struct OnlinePlanner {
    client: GraphWalkerClient,
    service: Option<GraphWalkerService>,
    log: PathLog,
}

impl OnlinePlanner {
    pub fn start(options: &EngineOptions) -> Result<Self, PlannerError> {
        let service = GraphWalkerService::start(options)?;
        let client = GraphWalkerClient::new(&service.url(), options.verbose)?;
        Ok(Self {
            client,
            service: Some(service),
            log: PathLog::default(),
        })
    }

    /// Attaches to an engine that somebody else started and will stop.
    pub fn connect(url: &str, verbose: bool) -> Result<Self, PlannerError> {
        Ok(Self {
            client: GraphWalkerClient::new(url, verbose)?,
            service: None,
            log: PathLog::default(),
        })
    }

    pub fn port(&self) -> Option<u16> {
        self.service.as_ref().map(|s| s.port())
    }
}

impl Planner for OnlinePlanner {
    fn has_next(&mut self) -> Result<bool, PlannerError> {
        self.client.has_next()
    }

    fn get_next(&mut self) -> Result<Step, PlannerError> {
        let step = self.client.get_next()?;
        self.log.record_step(&step);
        Ok(step)
    }

    fn get_data(&mut self) -> Result<GraphData, PlannerError> {
        self.client.get_data()
    }

    fn set_data(&mut self, key: &str, value: &Value) -> Result<(), PlannerError> {
        self.client.set_data(key, value)
    }

    fn fail(&mut self, step: &Step, message: &str) -> Result<(), PlannerError> {
        self.log.record_failure(step, message);
        self.client.fail(message)
    }

    fn restart(&mut self) -> Result<(), PlannerError> {
        self.log.clear();
        self.client.restart()
    }

    fn statistics(&mut self) -> Result<Statistics, PlannerError> {
        let engine = self.client.get_statistics()?;
        Ok(self.log.statistics(engine))
    }

    fn kill(&mut self) {
        if let Some(mut service) = self.service.take() {
            service.kill();
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OfflinePlanner {
    steps: Vec<Step>,
    position: usize,
    log: PathLog,
}

impl OfflinePlanner {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            position: 0,
            log: PathLog::default(),
        }
    }

    /// Reads a JSON array of steps, the format written by `PathReporter`.
    pub fn from_file(path: &Path) -> Result<Self, PlannerError> {
        let raw = fs::read_to_string(path)?;
        let steps: Vec<Step> = serde_json::from_str(&raw)?;
        debug!(path = %path.display(), steps = steps.len(), "loaded offline path");
        Ok(Self::new(steps))
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Swaps the path to replay; the cursor and failures start over.
    pub fn set_steps(&mut self, steps: Vec<Step>) {
        self.steps = steps;
        self.position = 0;
        self.log.clear();
    }
}

impl Planner for OfflinePlanner {
    fn has_next(&mut self) -> Result<bool, PlannerError> {
        Ok(self.position < self.steps.len())
    }

    fn get_next(&mut self) -> Result<Step, PlannerError> {
        let step = self
            .steps
            .get(self.position)
            .cloned()
            .ok_or(PlannerError::Exhausted)?;
        self.position += 1;
        self.log.record_step(&step);
        Ok(step)
    }

    fn get_data(&mut self) -> Result<GraphData, PlannerError> {
        warn!("offline mode does not support reading graph data; returning an empty map");
        Ok(GraphData::new())
    }

    fn set_data(&mut self, key: &str, _value: &Value) -> Result<(), PlannerError> {
        warn!(key, "offline mode does not support writing graph data; value discarded");
        Ok(())
    }

    fn fail(&mut self, step: &Step, message: &str) -> Result<(), PlannerError> {
        self.log.record_failure(step, message);
        Ok(())
    }

    fn restart(&mut self) -> Result<(), PlannerError> {
        self.position = 0;
        self.log.clear();
        Ok(())
    }

    fn statistics(&mut self) -> Result<Statistics, PlannerError> {
        let mut engine = Map::new();
        engine.insert("totalSteps".to_string(), json!(self.steps.len()));
        engine.insert("stepsProduced".to_string(), json!(self.position));
        Ok(self.log.statistics(engine))
    }

    fn kill(&mut self) {}
}
