use crate::executor::{Executor, ExecutorError};
use crate::planner::{Planner, PlannerError};
use crate::reporter::Reporter;
use crate::step::{
    GraphData, Step, WalkedStep, AFTER_STEP, BEFORE_STEP, SET_UP_MODEL, SET_UP_RUN, TEAR_DOWN_MODEL,
    TEAR_DOWN_RUN,
};
use thiserror::Error;
use tracing::{debug, warn};

pub const STEP_NOT_FOUND_MESSAGE: &str =
    "Step not found in the test code. Run the check command to verify the test code against the models.";

#[derive(Debug, Error)]
enum StepFailure {
    #[error(transparent)]
    Planner(#[from] PlannerError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

impl StepFailure {
    fn trace(&self) -> String {
        let mut trace = format!("{:?}", self);
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            trace.push_str(&format!("\ncaused by: {}", err));
            source = std::error::Error::source(err);
        }
        trace
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    Stepping,
    Finished,
}

pub struct Walker<P, E, R> {
    planner: P,
    executor: E,
    reporter: R,
    models: Vec<String>,
    status: bool,
    halted: bool,
}

impl<P: Planner, E: Executor, R: Reporter> Walker<P, E, R> {
    pub fn new(planner: P, executor: E, reporter: R) -> Self {
        Self {
            planner,
            executor,
            reporter,
            models: Vec::new(),
            status: true,
            halted: false,
        }
    }

    /// Overall result of the latest walk. Once false it stays false until
    /// the next walk starts.
    pub fn status(&self) -> bool {
        self.status
    }

    pub fn planner(&self) -> &P {
        &self.planner
    }

    pub fn planner_mut(&mut self) -> &mut P {
        &mut self.planner
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn executor_mut(&mut self) -> &mut E {
        &mut self.executor
    }

    pub fn reporter(&self) -> &R {
        &self.reporter
    }

    pub fn into_parts(self) -> (P, E, R) {
        (self.planner, self.executor, self.reporter)
    }

    pub fn walk(&mut self) -> Walk<'_, P, E, R> {
        Walk {
            walker: self,
            phase: Phase::NotStarted,
        }
    }

    pub fn run(&mut self) -> bool {
        self.walk().for_each(drop);
        self.status
    }

    fn start_run(&mut self) -> bool {
        self.models.clear();
        self.status = true;
        self.halted = false;
        self.reporter.start();

        if let Err(err) = self.planner.restart() {
            self.setup_error("planner restart failed", StepFailure::from(err));
            return false;
        }
        if let Err(err) = self.executor.reset() {
            self.setup_error("executor reset failed", StepFailure::from(err));
            return false;
        }
        if !self.run_fixture(SET_UP_RUN, None) {
            self.status = false;
            return false;
        }
        true
    }

    fn setup_error(&mut self, context: &str, failure: StepFailure) {
        let message = format!("{}: {}", context, failure);
        self.reporter.error(None, &message, Some(&failure.trace()));
        self.status = false;
    }

    fn next_step(&mut self) -> Option<WalkedStep> {
        if self.halted {
            return None;
        }
        let step = match self.pull_step() {
            Ok(Some(step)) => step,
            Ok(None) => return None,
            Err(err) => {
                let failure = StepFailure::from(err);
                self.reporter.error(None, &failure.to_string(), Some(&failure.trace()));
                self.status = false;
                self.halted = true;
                return None;
            }
        };

        if let Some(model) = step.model_name.as_deref() {
            if !self.models.iter().any(|m| m == model) {
                if !self.run_fixture(SET_UP_MODEL, Some(model)) {
                    self.status = false;
                    self.halted = true;
                    return None;
                }
                self.models.push(model.to_string());
            }
        }

        let model = step.model_name.as_deref();
        let mut passed = self.run_fixture(BEFORE_STEP, None);
        if passed && model.is_some() {
            passed = self.run_fixture(BEFORE_STEP, model);
        }
        if passed {
            passed = self.execute_step(&step);
        }
        if model.is_some() {
            passed &= self.run_fixture(AFTER_STEP, model);
        }
        passed &= self.run_fixture(AFTER_STEP, None);

        self.status &= passed;
        debug!(step = %step.qualified_name(), passed, "step walked");
        Some(WalkedStep { step, status: passed })
    }

    fn pull_step(&mut self) -> Result<Option<Step>, PlannerError> {
        if !self.planner.has_next()? {
            return Ok(None);
        }
        self.planner.get_next().map(Some)
    }

    fn finish_run(&mut self) {
        let models = std::mem::take(&mut self.models);
        for model in &models {
            self.status &= self.run_fixture(TEAR_DOWN_MODEL, Some(model));
        }
        self.models = models;
        self.status &= self.run_fixture(TEAR_DOWN_RUN, None);
        self.reporter.end();
    }

    /// Runs an optional fixture; a fixture the test code lacks counts as passed.
    fn run_fixture(&mut self, name: &str, model_name: Option<&str>) -> bool {
        let step = Step::fixture(name, model_name);
        match self.executor.has_step(model_name, name) {
            Ok(true) => self.invoke(&step),
            Ok(false) => true,
            Err(err) => {
                self.bridge_failed(&step, StepFailure::from(err));
                false
            }
        }
    }

    fn execute_step(&mut self, step: &Step) -> bool {
        match self.executor.has_step(step.model_name.as_deref(), &step.name) {
            Ok(true) => self.invoke(step),
            Ok(false) => {
                self.record_failure(step, STEP_NOT_FOUND_MESSAGE);
                self.reporter.error(Some(step), STEP_NOT_FOUND_MESSAGE, None);
                self.halted = true;
                false
            }
            Err(err) => {
                self.bridge_failed(step, StepFailure::from(err));
                false
            }
        }
    }

    fn invoke(&mut self, step: &Step) -> bool {
        match self.run_step(step) {
            Ok(passed) => passed,
            Err(failure) => {
                self.bridge_failed(step, failure);
                false
            }
        }
    }

    fn run_step(&mut self, step: &Step) -> Result<bool, StepFailure> {
        let before = self.planner.get_data()?;
        self.reporter.step_start(step);
        let result = self
            .executor
            .execute_step(step.model_name.as_deref(), &step.name, Some(&before))?;
        self.reporter.step_end(step, &result);
        let passed = match &result.error {
            Some(err) => {
                self.record_failure(step, &err.message);
                false
            }
            None => true,
        };
        if let Some(after) = &result.data {
            if let Err(err) = self.sync_data(&before, after) {
                self.bridge_failed(step, StepFailure::from(err));
                return Ok(false);
            }
        }
        Ok(passed)
    }

    /// Writes back keys the test code added or changed. Removed keys stay:
    /// the engine has no delete.
    fn sync_data(&mut self, before: &GraphData, after: &GraphData) -> Result<(), PlannerError> {
        for (key, value) in after {
            if before.get(key) != Some(value) {
                self.planner.set_data(key, value)?;
            }
        }
        Ok(())
    }

    fn bridge_failed(&mut self, step: &Step, failure: StepFailure) {
        let message = failure.to_string();
        self.reporter.error(Some(step), &message, Some(&failure.trace()));
        self.record_failure(step, &message);
    }

    fn record_failure(&mut self, step: &Step, message: &str) {
        if let Err(err) = self.planner.fail(step, message) {
            warn!(step = %step.qualified_name(), error = %err, "planner did not accept the failure");
        }
    }
}

/// Iterator over one walk. Dropping it early skips teardown.
pub struct Walk<'w, P, E, R> {
    walker: &'w mut Walker<P, E, R>,
    phase: Phase,
}

impl<P: Planner, E: Executor, R: Reporter> Iterator for Walk<'_, P, E, R> {
    type Item = WalkedStep;

    fn next(&mut self) -> Option<WalkedStep> {
        loop {
            match self.phase {
                Phase::NotStarted => {
                    self.phase = Phase::Stepping;
                    if !self.walker.start_run() {
                        self.walker.halted = true;
                    }
                }
                Phase::Stepping => {
                    if let Some(walked) = self.walker.next_step() {
                        return Some(walked);
                    }
                    self.walker.finish_run();
                    self.phase = Phase::Finished;
                }
                Phase::Finished => return None,
            }
        }
    }
}
