use crate::step::{ExecutionResult, Step};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReportingError {
    #[error("reporter_exists: a reporter is already registered under {0}")]
    DuplicateKey(String),
    #[error("reporter_unknown: no reporter registered under {0}")]
    UnknownKey(String),
}

/// Observer of the walk lifecycle. Every method defaults to a no-op.
pub trait Reporter {
    fn start(&mut self) {}
    fn end(&mut self) {}
    fn step_start(&mut self, _step: &Step) {}
    fn step_end(&mut self, _step: &Step, _result: &ExecutionResult) {}
    fn error(&mut self, _step: Option<&Step>, _message: &str, _trace: Option<&str>) {}
    fn report(&self) -> Option<Value> {
        None
    }
}

impl<T: Reporter + ?Sized> Reporter for Box<T> {
    fn start(&mut self) {
        (**self).start()
    }
    fn end(&mut self) {
        (**self).end()
    }
    fn step_start(&mut self, step: &Step) {
        (**self).step_start(step)
    }
    fn step_end(&mut self, step: &Step, result: &ExecutionResult) {
        (**self).step_end(step, result)
    }
    fn error(&mut self, step: Option<&Step>, message: &str, trace: Option<&str>) {
        (**self).error(step, message, trace)
    }
    fn report(&self) -> Option<Value> {
        (**self).report()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {}

#[derive(Default)]
pub struct Reporting {
    reporters: Vec<(String, Box<dyn Reporter>)>,
}

impl Reporting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: &str, reporter: Box<dyn Reporter>) -> Result<(), ReportingError> {
        if self.reporters.iter().any(|(k, _)| k == key) {
            return Err(ReportingError::DuplicateKey(key.to_string()));
        }
        self.reporters.push((key.to_string(), reporter));
        Ok(())
    }

    pub fn unregister(&mut self, key: &str) -> Result<Box<dyn Reporter>, ReportingError> {
        let index = self
            .reporters
            .iter()
            .position(|(k, _)| k == key)
            .ok_or_else(|| ReportingError::UnknownKey(key.to_string()))?;
        Ok(self.reporters.remove(index).1)
    }

    pub fn keys(&self) -> Vec<&str> {
        self.reporters.iter().map(|(k, _)| k.as_str()).collect()
    }

    /// Each reporter's artifact by key; reporters without one are left out.
    pub fn reports(&self) -> BTreeMap<String, Value> {
        self.reporters
            .iter()
            .filter_map(|(key, reporter)| reporter.report().map(|r| (key.clone(), r)))
            .collect()
    }
}

impl Reporter for Reporting {
    fn start(&mut self) {
        for (_, reporter) in self.reporters.iter_mut() {
            reporter.start();
        }
    }

    fn end(&mut self) {
        for (_, reporter) in self.reporters.iter_mut() {
            reporter.end();
        }
    }

    fn step_start(&mut self, step: &Step) {
        for (_, reporter) in self.reporters.iter_mut() {
            reporter.step_start(step);
        }
    }

    fn step_end(&mut self, step: &Step, result: &ExecutionResult) {
        for (_, reporter) in self.reporters.iter_mut() {
            reporter.step_end(step, result);
        }
    }

    fn error(&mut self, step: Option<&Step>, message: &str, trace: Option<&str>) {
        for (_, reporter) in self.reporters.iter_mut() {
            reporter.error(step, message, trace);
        }
    }

    fn report(&self) -> Option<Value> {
        let map: Map<String, Value> = self.reports().into_iter().collect();
        Some(Value::Object(map))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn start(&mut self) {
        info!("walk started");
    }

    fn end(&mut self) {
        info!("walk finished");
    }

    fn step_start(&mut self, step: &Step) {
        debug!(step = %step.qualified_name(), id = ?step.id, "step started");
    }

    fn step_end(&mut self, step: &Step, result: &ExecutionResult) {
        match &result.error {
            None => info!(step = %step.qualified_name(), "step passed"),
            Some(err) => error!(step = %step.qualified_name(), reason = %err.message, "step failed"),
        }
        if !result.output.is_empty() {
            debug!(step = %step.qualified_name(), output = %result.output, "step output");
        }
    }

    fn error(&mut self, step: Option<&Step>, message: &str, trace: Option<&str>) {
        let step = step.map(Step::qualified_name).unwrap_or_else(|| "<none>".to_string());
        error!(%step, reason = message, trace = trace.unwrap_or(""), "walk error");
    }
}

/// Records the executed graph elements; the report is a step list that the
/// offline planner can replay.
#[derive(Debug, Default, Clone)]
pub struct PathReporter {
    path: Vec<Step>,
}

impl PathReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(&self) -> &[Step] {
        &self.path
    }
}

impl Reporter for PathReporter {
    fn start(&mut self) {
        self.path.clear();
    }

    fn step_start(&mut self, step: &Step) {
        if !step.is_fixture() {
            self.path.push(step.clone());
        }
    }

    fn report(&self) -> Option<Value> {
        serde_json::to_value(&self.path).ok()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ErrorRecord {
    step: Option<String>,
    message: String,
    trace: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct SummaryReporter {
    steps: usize,
    fixtures: usize,
    failures: Vec<String>,
    errors: Vec<ErrorRecord>,
}

impl SummaryReporter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Reporter for SummaryReporter {
    fn start(&mut self) {
        *self = Self::default();
    }

    fn step_end(&mut self, step: &Step, result: &ExecutionResult) {
        if step.is_fixture() {
            self.fixtures += 1;
        } else {
            self.steps += 1;
        }
        if let Some(err) = &result.error {
            self.failures
                .push(format!("{}: {}", step.qualified_name(), err.message));
        }
    }

    fn error(&mut self, step: Option<&Step>, message: &str, trace: Option<&str>) {
        self.errors.push(ErrorRecord {
            step: step.map(Step::qualified_name),
            message: message.to_string(),
            trace: trace.map(str::to_string),
        });
    }

    fn report(&self) -> Option<Value> {
        let errors: Vec<Value> = self
            .errors
            .iter()
            .map(|e| json!({"step": e.step, "message": e.message, "trace": e.trace}))
            .collect();
        Some(json!({
            "steps": self.steps,
            "fixtures": self.fixtures,
            "failures": self.failures,
            "errors": errors,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepError;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Recorder {
        name: &'static str,
        calls: Rc<RefCell<Vec<String>>>,
        artifact: Option<Value>,
    }

    impl Reporter for Recorder {
        fn start(&mut self) {
            self.calls.borrow_mut().push(format!("{}:start", self.name));
        }
        fn step_end(&mut self, step: &Step, _result: &ExecutionResult) {
            self.calls
                .borrow_mut()
                .push(format!("{}:step_end:{}", self.name, step.name));
        }
        fn report(&self) -> Option<Value> {
            self.artifact.clone()
        }
    }

    fn recorder(name: &'static str, calls: &Rc<RefCell<Vec<String>>>, artifact: Option<Value>) -> Box<dyn Reporter> {
        Box::new(Recorder {
            name,
            calls: calls.clone(),
            artifact,
        })
    }

    #[test]
    fn fan_out_preserves_registration_order() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut reporting = Reporting::new();
        reporting.register("zeta", recorder("zeta", &calls, None)).unwrap();
        reporting.register("alpha", recorder("alpha", &calls, None)).unwrap();

        reporting.start();
        reporting.step_end(&Step::new("v0", "vertex_a", "A"), &ExecutionResult::default());

        assert_eq!(
            *calls.borrow(),
            vec![
                "zeta:start",
                "alpha:start",
                "zeta:step_end:vertex_a",
                "alpha:step_end:vertex_a"
            ]
        );
        assert_eq!(reporting.keys(), vec!["zeta", "alpha"]);
    }

    #[test]
    fn duplicate_and_unknown_keys_are_rejected() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut reporting = Reporting::new();
        reporting.register("path", recorder("a", &calls, None)).unwrap();
        assert_eq!(
            reporting.register("path", recorder("b", &calls, None)).unwrap_err(),
            ReportingError::DuplicateKey("path".to_string())
        );
        assert!(matches!(
            reporting.unregister("missing"),
            Err(ReportingError::UnknownKey(k)) if k == "missing"
        ));
        reporting.unregister("path").unwrap();
        assert!(reporting.keys().is_empty());
    }

    #[test]
    fn reports_skip_reporters_without_artifacts() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut reporting = Reporting::new();
        reporting.register("silent", recorder("s", &calls, None)).unwrap();
        reporting
            .register("counts", recorder("c", &calls, Some(json!({"n": 1}))))
            .unwrap();
        let reports = reporting.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports.get("counts"), Some(&json!({"n": 1})));
        assert_eq!(reporting.report(), Some(json!({"counts": {"n": 1}})));
    }

    #[test]
    fn path_reporter_skips_fixtures() {
        let mut reporter = PathReporter::new();
        reporter.start();
        reporter.step_start(&Step::fixture("setUpModel", Some("A")));
        reporter.step_start(&Step::new("v0", "vertex_a", "A"));
        assert_eq!(
            reporter.report(),
            Some(json!([{"id": "v0", "name": "vertex_a", "modelName": "A"}]))
        );
    }

    #[test]
    fn summary_reporter_counts_failures_and_errors() {
        let mut reporter = SummaryReporter::new();
        reporter.start();
        reporter.step_end(&Step::fixture("setUpRun", None), &ExecutionResult::default());
        let failed = ExecutionResult {
            error: Some(StepError {
                message: "boom".to_string(),
                trace: None,
            }),
            ..ExecutionResult::default()
        };
        let step = Step::new("e0", "edge_a", "A");
        reporter.step_end(&step, &failed);
        reporter.error(Some(&step), "transport", Some("trace"));

        let report = reporter.report().expect("report");
        assert_eq!(report["steps"], json!(1));
        assert_eq!(report["fixtures"], json!(1));
        assert_eq!(report["failures"], json!(["A.edge_a: boom"]));
        assert_eq!(report["errors"][0]["trace"], json!("trace"));
    }

    #[test]
    fn null_reporter_has_no_artifact() {
        let mut reporter = NullReporter;
        reporter.start();
        reporter.error(None, "ignored", None);
        assert_eq!(reporter.report(), None);
    }
}
