use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub type GraphData = BTreeMap<String, Value>;

pub const FIXTURE_KIND: &str = "fixture";

pub const SET_UP_RUN: &str = "setUpRun";
pub const TEAR_DOWN_RUN: &str = "tearDownRun";
pub const SET_UP_MODEL: &str = "setUpModel";
pub const TEAR_DOWN_MODEL: &str = "tearDownModel";
pub const BEFORE_STEP: &str = "beforeStep";
pub const AFTER_STEP: &str = "afterStep";

/// One unit of traversal: a graph element or a fixture invocation.
///
/// Graph elements carry an `id`; fixtures never do. A step without a
/// `model_name` addresses a free function in the test code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
}

impl Step {
    pub fn new(id: &str, name: &str, model_name: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            name: name.to_string(),
            model_name: Some(model_name.to_string()),
            kind: None,
            properties: None,
        }
    }

    pub fn fixture(name: &str, model_name: Option<&str>) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            model_name: model_name.map(str::to_string),
            kind: Some(FIXTURE_KIND.to_string()),
            properties: None,
        }
    }

    pub fn is_fixture(&self) -> bool {
        self.kind.as_deref() == Some(FIXTURE_KIND)
    }

    pub fn qualified_name(&self) -> String {
        match &self.model_name {
            Some(model) => format!("{}.{}", model, self.name),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

/// What the executor hands back for one step. No `error` means success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<GraphData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

impl ExecutionResult {
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkedStep {
    #[serde(flatten)]
    pub step: Step,
    pub status: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedStep {
    pub step: Step,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    #[serde(default)]
    pub engine: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<FailedStep>,
    #[serde(default)]
    pub failed_fixtures: Vec<FailedStep>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct PathLog {
    failed_step: Option<FailedStep>,
    failed_fixtures: Vec<FailedStep>,
    steps: Vec<Step>,
}

impl PathLog {
    pub(crate) fn record_step(&mut self, step: &Step) {
        self.steps.push(step.clone());
    }

    pub(crate) fn record_failure(&mut self, step: &Step, message: &str) {
        let failed = FailedStep {
            step: step.clone(),
            message: message.to_string(),
        };
        if step.id.is_some() {
            self.failed_step = Some(failed);
        } else {
            self.failed_fixtures.push(failed);
        }
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn statistics(&self, engine: Map<String, Value>) -> Statistics {
        Statistics {
            engine,
            failed_step: self.failed_step.clone(),
            failed_fixtures: self.failed_fixtures.clone(),
            steps: self.steps.clone(),
        }
    }
}
