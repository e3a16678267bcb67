use crate::planner::PlannerError;
use crate::process::{free_port, ServiceProcess};
use crate::step::{GraphData, Step};
use reqwest::blocking::{Client, Response};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

const READY_MARKER: &str = "[HttpServer] Started";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub path: PathBuf,
    pub generator: String,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub executable: String,
    pub models: Vec<ModelSpec>,
    pub port: Option<u16>,
    pub start_element: Option<String>,
    pub verbose: bool,
    pub unvisited: bool,
    pub blocked: bool,
    pub readiness_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            executable: "gw".to_string(),
            models: Vec::new(),
            port: None,
            start_element: None,
            verbose: false,
            unvisited: false,
            blocked: false,
            readiness_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineOptions {
    pub fn command(&self, port: u16) -> Vec<String> {
        let mut command = vec![
            self.executable.clone(),
            "online".to_string(),
            "--service".to_string(),
            "RESTFUL".to_string(),
            "--port".to_string(),
            port.to_string(),
        ];
        for model in &self.models {
            command.push("--model".to_string());
            command.push(model.path.display().to_string());
            command.push(model.generator.clone());
        }
        if let Some(element) = &self.start_element {
            command.push("--start-element".to_string());
            command.push(element.clone());
        }
        if self.verbose {
            command.push("--verbose".to_string());
        }
        if self.unvisited {
            command.push("--unvisited".to_string());
        }
        if self.blocked {
            command.push("--blocked".to_string());
        }
        command
    }
}

#[derive(Debug)]
pub struct GraphWalkerService {
    process: ServiceProcess,
    port: u16,
}

impl GraphWalkerService {
    pub fn start(options: &EngineOptions) -> Result<Self, PlannerError> {
        if options.models.is_empty() {
            return Err(PlannerError::Engine(
                "at least one model is required to start the path engine".to_string(),
            ));
        }
        let port = match options.port {
            Some(port) => port,
            None => free_port()?,
        };
        let mut process = ServiceProcess::spawn(&options.command(port), None, "graphwalker")?;
        process.wait_ready(options.readiness_timeout, |p| p.read_log().contains(READY_MARKER))?;
        info!(port, "path engine ready");
        Ok(Self { process, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}/", self.port)
    }

    pub fn kill(&mut self) {
        self.process.kill();
    }
}

#[derive(Debug, Clone)]
pub struct GraphWalkerClient {
    http: Client,
    base: Url,
    verbose: bool,
}

impl GraphWalkerClient {
    pub fn new(url: &str, verbose: bool) -> Result<Self, PlannerError> {
        let mut base = Url::parse(url).map_err(|e| PlannerError::Engine(format!("invalid engine url {}: {}", url, e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let base = base
            .join("graphwalker/")
            .map_err(|e| PlannerError::Engine(format!("invalid engine url {}: {}", url, e)))?;
        Ok(Self {
            http: Client::new(),
            base,
            verbose,
        })
    }

    pub fn has_next(&self) -> Result<bool, PlannerError> {
        let body = self.get(&["hasNext"])?;
        match body.get("hasNext") {
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::String(s)) => Ok(s == "true"),
            _ => Err(unexpected("hasNext", &body)),
        }
    }

    pub fn get_next(&self) -> Result<Step, PlannerError> {
        let body = self.get(&["getNext"])?;
        let name = body
            .get("currentElementName")
            .and_then(|v| v.as_str())
            .ok_or_else(|| unexpected("getNext", &body))?;
        let text = |key: &str| body.get(key).and_then(|v| v.as_str()).map(str::to_string);
        Ok(Step {
            id: text("currentElementID"),
            name: name.to_string(),
            model_name: text("modelName"),
            kind: None,
            properties: body.get("properties").cloned(),
        })
    }

    pub fn get_data(&self) -> Result<GraphData, PlannerError> {
        let body = self.get(&["getData"])?;
        match body.get("data") {
            Some(Value::Object(map)) => Ok(map.clone().into_iter().collect()),
            None | Some(Value::Null) => Ok(GraphData::new()),
            _ => Err(unexpected("getData", &body)),
        }
    }

    pub fn set_data(&self, key: &str, value: &Value) -> Result<(), PlannerError> {
        if !is_script_identifier(key) {
            return Err(PlannerError::Engine(format!(
                "data key {:?} is not a valid script identifier",
                key
            )));
        }
        let script = format!("{}={};", key, serde_json::to_string(value)?);
        self.put(&["setData", &script])?;
        Ok(())
    }

    pub fn restart(&self) -> Result<(), PlannerError> {
        self.put(&["restart"])?;
        Ok(())
    }

    pub fn fail(&self, message: &str) -> Result<(), PlannerError> {
        self.put(&["fail", message])?;
        Ok(())
    }

    pub fn get_statistics(&self) -> Result<Map<String, Value>, PlannerError> {
        let body = self.get(&["getStatistics"])?;
        match body {
            Value::Object(mut map) => {
                map.remove("result");
                Ok(map)
            }
            other => Err(unexpected("getStatistics", &other)),
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, PlannerError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| PlannerError::Engine(format!("engine url cannot be a base: {}", self.base)))?
            .pop_if_empty()
            .extend(segments);
        if self.verbose && segments.first() == Some(&"getNext") {
            url.query_pairs_mut().append_pair("verbose", "true");
        }
        Ok(url)
    }

    fn get(&self, segments: &[&str]) -> Result<Value, PlannerError> {
        let url = self.endpoint(segments)?;
        debug!(%url, "engine GET");
        check(self.http.get(url).send()?)
    }

    fn put(&self, segments: &[&str]) -> Result<Value, PlannerError> {
        let url = self.endpoint(segments)?;
        debug!(%url, "engine PUT");
        check(self.http.put(url).send()?)
    }
}

fn check(response: Response) -> Result<Value, PlannerError> {
    let status = response.status();
    let text = response.text()?;
    let body: Value = if text.trim().is_empty() {
        Value::Object(Map::new())
    } else {
        serde_json::from_str(&text)
            .map_err(|_| PlannerError::Engine(format!("engine replied {} with non-JSON body: {}", status, text)))?
    };
    let result = body.get("result").and_then(|v| v.as_str());
    if !status.is_success() || result.map_or(false, |r| r != "ok") {
        let message = body
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("no error message")
            .to_string();
        return Err(PlannerError::Engine(format!("engine replied {}: {}", status, message)));
    }
    Ok(body)
}

/// Keys end up on the left of `key=<json>;`, so only plain identifiers pass.
fn is_script_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

fn unexpected(endpoint: &str, body: &Value) -> PlannerError {
    PlannerError::Engine(format!("unexpected {} payload: {}", endpoint, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_lists_models_and_flags_in_engine_order() {
        let options = EngineOptions {
            models: vec![
                ModelSpec {
                    path: PathBuf::from("models/login.json"),
                    generator: "random(vertex_coverage(100))".to_string(),
                },
                ModelSpec {
                    path: PathBuf::from("models/shop.json"),
                    generator: "random(edge_coverage(50))".to_string(),
                },
            ],
            start_element: Some("v_start".to_string()),
            blocked: true,
            ..EngineOptions::default()
        };
        let command = options.command(9000);
        assert_eq!(
            command,
            vec![
                "gw",
                "online",
                "--service",
                "RESTFUL",
                "--port",
                "9000",
                "--model",
                "models/login.json",
                "random(vertex_coverage(100))",
                "--model",
                "models/shop.json",
                "random(edge_coverage(50))",
                "--start-element",
                "v_start",
                "--blocked",
            ]
        );
    }

    #[test]
    fn start_without_models_is_rejected() {
        let err = GraphWalkerService::start(&EngineOptions::default()).expect_err("no models");
        assert!(err.to_string().contains("at least one model"));
    }

    #[test]
    fn endpoint_escapes_scripts_into_one_segment() {
        let client = GraphWalkerClient::new("http://127.0.0.1:8887", false).expect("client");
        let url = client.endpoint(&["setData", "name=\"a b/c\";"]).expect("url");
        assert_eq!(url.path(), "/graphwalker/setData/name=%22a%20b%2Fc%22;");
    }

    #[test]
    fn verbose_flag_only_applies_to_get_next() {
        let client = GraphWalkerClient::new("http://127.0.0.1:8887/", true).expect("client");
        let next = client.endpoint(&["getNext"]).expect("url");
        assert_eq!(next.query(), Some("verbose=true"));
        let has_next = client.endpoint(&["hasNext"]).expect("url");
        assert_eq!(has_next.query(), None);
    }

    #[test]
    fn data_keys_must_be_script_identifiers() {
        assert!(is_script_identifier("count"));
        assert!(is_script_identifier("_cart$2"));
        assert!(!is_script_identifier(""));
        assert!(!is_script_identifier("2fast"));
        assert!(!is_script_identifier("x=1;y"));
        assert!(!is_script_identifier("a b"));

        // Rejected before any request is made, so no engine is needed.
        let client = GraphWalkerClient::new("http://127.0.0.1:1/", false).expect("client");
        match client.set_data("x=1;launch", &Value::Bool(true)) {
            Err(PlannerError::Engine(message)) => assert!(message.contains("x=1;launch"), "{}", message),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
