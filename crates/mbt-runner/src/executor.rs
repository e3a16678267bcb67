use crate::process::{free_port, port_accepts, ServiceError, ServiceProcess};
use crate::step::{ExecutionResult, GraphData};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::{StatusCode, Url};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("executor_transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("executor_protocol: {0}")]
    Protocol(String),
    #[error("executor_remote: status {status}: {message}")]
    Remote {
        status: u16,
        message: String,
        trace: Option<String>,
    },
    #[error("model_not_found: {0}")]
    ModelNotFound(String),
    #[error("step_not_found: {0}")]
    StepNotFound(String),
    #[error("invalid_step_handler: {step} must take zero parameters or only the graph data")]
    InvalidHandler { step: String },
    #[error("load_failed: {path}: {message}")]
    Load { path: PathBuf, message: String },
    #[error("executor_not_loaded: no test code has been loaded")]
    NotLoaded,
    #[error(transparent)]
    Process(#[from] ServiceError),
    #[error("executor_io: {0}")]
    Io(#[from] std::io::Error),
}

/// A failure inside the test code comes back as an `ExecutionResult` with
/// an `error`; `Err` is reserved for the executor itself misbehaving.
pub trait Executor {
    fn load(&mut self, path: &Path) -> Result<(), ExecutorError>;
    fn reset(&mut self) -> Result<(), ExecutorError>;
    fn has_model(&mut self, name: &str) -> Result<bool, ExecutorError>;
    fn has_step(&mut self, model_name: Option<&str>, name: &str) -> Result<bool, ExecutorError>;
    fn execute_step(
        &mut self,
        model_name: Option<&str>,
        name: &str,
        data: Option<&GraphData>,
    ) -> Result<ExecutionResult, ExecutorError>;
    fn kill(&mut self);
}

impl<T: Executor + ?Sized> Executor for Box<T> {
    fn load(&mut self, path: &Path) -> Result<(), ExecutorError> {
        (**self).load(path)
    }
    fn reset(&mut self) -> Result<(), ExecutorError> {
        (**self).reset()
    }
    fn has_model(&mut self, name: &str) -> Result<bool, ExecutorError> {
        (**self).has_model(name)
    }
    fn has_step(&mut self, model_name: Option<&str>, name: &str) -> Result<bool, ExecutorError> {
        (**self).has_step(model_name, name)
    }
    fn execute_step(
        &mut self,
        model_name: Option<&str>,
        name: &str,
        data: Option<&GraphData>,
    ) -> Result<ExecutionResult, ExecutorError> {
        (**self).execute_step(model_name, name, data)
    }
    fn kill(&mut self) {
        (**self).kill()
    }
}

const MODEL_NOT_FOUND: u16 = 460;
const STEP_NOT_FOUND: u16 = 461;
const INVALID_HANDLER: u16 = 462;
const NOT_LOADED: u16 = 463;

/// Successful replies are `{"payload": {...}}`; failures carry
/// `{"error": {"message", "trace"}}` with a non-2xx status.
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    http: Client,
    base: Url,
}

impl HttpExecutor {
    pub fn new(url: &str) -> Result<Self, ExecutorError> {
        let mut base =
            Url::parse(url).map_err(|e| ExecutorError::Protocol(format!("invalid executor url {}: {}", url, e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            base,
        })
    }

    pub fn url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, name: &str) -> Result<Url, ExecutorError> {
        self.base
            .join(name)
            .map_err(|e| ExecutorError::Protocol(format!("invalid endpoint {}: {}", name, e)))
    }

    fn step_query(model_name: Option<&str>, name: &str) -> Vec<(&'static str, String)> {
        let mut query = vec![("name", name.to_string())];
        if let Some(model) = model_name {
            query.push(("modelName", model.to_string()));
        }
        query
    }

    fn send(&self, request: RequestBuilder, context: &str) -> Result<Value, ExecutorError> {
        let response = request.send()?;
        let status = response.status();
        let text = response.text()?;
        let body: Value = if text.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&text).map_err(|_| {
                ExecutorError::Protocol(format!("{} replied {} with non-JSON body: {}", context, status, text))
            })?
        };
        if status.is_success() {
            return Ok(body.get("payload").cloned().unwrap_or(Value::Null));
        }
        Err(remote_error(status, &body, context))
    }

    fn payload_flag(payload: &Value, key: &str) -> Result<bool, ExecutorError> {
        payload
            .get(key)
            .and_then(|v| v.as_bool())
            .ok_or_else(|| ExecutorError::Protocol(format!("payload missing boolean {}: {}", key, payload)))
    }
}

fn remote_error(status: StatusCode, body: &Value, context: &str) -> ExecutorError {
    let message = body
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .unwrap_or("no error message")
        .to_string();
    let trace = body
        .pointer("/error/trace")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    match status.as_u16() {
        MODEL_NOT_FOUND => ExecutorError::ModelNotFound(context.to_string()),
        STEP_NOT_FOUND => ExecutorError::StepNotFound(context.to_string()),
        INVALID_HANDLER => ExecutorError::InvalidHandler {
            step: context.to_string(),
        },
        NOT_LOADED => ExecutorError::NotLoaded,
        code => ExecutorError::Remote {
            status: code,
            message,
            trace,
        },
    }
}

impl Executor for HttpExecutor {
    fn load(&mut self, path: &Path) -> Result<(), ExecutorError> {
        let request = self
            .http
            .post(self.endpoint("load")?)
            .json(&json!({ "path": path.display().to_string() }));
        match self.send(request, &path.display().to_string()) {
            Ok(_) => Ok(()),
            Err(ExecutorError::Remote { message, .. }) => Err(ExecutorError::Load {
                path: path.to_path_buf(),
                message,
            }),
            Err(other) => Err(other),
        }
    }

    fn reset(&mut self) -> Result<(), ExecutorError> {
        let request = self.http.put(self.endpoint("reset")?);
        self.send(request, "reset")?;
        Ok(())
    }

    fn has_model(&mut self, name: &str) -> Result<bool, ExecutorError> {
        let request = self.http.get(self.endpoint("hasModel")?).query(&[("name", name)]);
        let payload = self.send(request, name)?;
        Self::payload_flag(&payload, "hasModel")
    }

    fn has_step(&mut self, model_name: Option<&str>, name: &str) -> Result<bool, ExecutorError> {
        let request = self
            .http
            .get(self.endpoint("hasStep")?)
            .query(&Self::step_query(model_name, name));
        let payload = self.send(request, &qualified(model_name, name))?;
        Self::payload_flag(&payload, "hasStep")
    }

    fn execute_step(
        &mut self,
        model_name: Option<&str>,
        name: &str,
        data: Option<&GraphData>,
    ) -> Result<ExecutionResult, ExecutorError> {
        let step = qualified(model_name, name);
        debug!(step = %step, "executing remote step");
        let request = self
            .http
            .post(self.endpoint("executeStep")?)
            .query(&Self::step_query(model_name, name))
            .json(&json!({ "data": data }));
        let payload = self.send(request, &step)?;
        serde_json::from_value(payload)
            .map_err(|e| ExecutorError::Protocol(format!("malformed executeStep payload for {}: {}", step, e)))
    }

    fn kill(&mut self) {}
}

fn qualified(model_name: Option<&str>, name: &str) -> String {
    match model_name {
        Some(model) => format!("{}.{}", model, name),
        None => name.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// `{port}` in any argument is replaced by the chosen port.
    pub command: Vec<String>,
    pub port: Option<u16>,
    pub path_prefix: String,
    pub working_dir: Option<PathBuf>,
    pub readiness_timeout: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            port: None,
            path_prefix: String::new(),
            working_dir: None,
            readiness_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
pub struct ServiceExecutor {
    process: Option<ServiceProcess>,
    http: HttpExecutor,
}

impl ServiceExecutor {
    pub fn start(options: &ServiceOptions) -> Result<Self, ExecutorError> {
        let port = match options.port {
            Some(port) => port,
            None => free_port()?,
        };
        let placeholder = port.to_string();
        let command: Vec<String> = options
            .command
            .iter()
            .map(|arg| arg.replace("{port}", &placeholder))
            .collect();
        let mut process = ServiceProcess::spawn(&command, options.working_dir.as_deref(), "executor")?;
        process.wait_ready(options.readiness_timeout, |_| port_accepts(port))?;
        let http = HttpExecutor::new(&format!(
            "http://127.0.0.1:{}/{}",
            port,
            options.path_prefix.trim_matches('/')
        ))?;
        info!(port, url = %http.url(), "executor service ready");
        Ok(Self {
            process: Some(process),
            http,
        })
    }
}

impl Executor for ServiceExecutor {
    fn load(&mut self, path: &Path) -> Result<(), ExecutorError> {
        self.http.load(path)
    }

    fn reset(&mut self) -> Result<(), ExecutorError> {
        self.http.reset()
    }

    fn has_model(&mut self, name: &str) -> Result<bool, ExecutorError> {
        self.http.has_model(name)
    }

    fn has_step(&mut self, model_name: Option<&str>, name: &str) -> Result<bool, ExecutorError> {
        self.http.has_step(model_name, name)
    }

    fn execute_step(
        &mut self,
        model_name: Option<&str>,
        name: &str,
        data: Option<&GraphData>,
    ) -> Result<ExecutionResult, ExecutorError> {
        self.http.execute_step(model_name, name, data)
    }

    fn kill(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.kill();
        }
    }
}
