use crate::executor::{Executor, ExecutorError};
use crate::step::{ExecutionResult, GraphData, StepError};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use tracing::debug;

pub type HandlerResult = anyhow::Result<()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Plain,
    WithData,
}

/// Text written by a handler; ends up in `ExecutionResult::output`.
#[derive(Debug, Default, Clone)]
pub struct Output {
    buffer: String,
}

impl Output {
    pub fn as_str(&self) -> &str {
        &self.buffer
    }
}

impl fmt::Write for Output {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.buffer.push_str(s);
        Ok(())
    }
}

type PlainFn<S> = Box<dyn Fn(&mut S, &mut Output) -> HandlerResult>;
type DataFn<S> = Box<dyn Fn(&mut S, &mut GraphData, &mut Output) -> HandlerResult>;

enum Handler<S> {
    Plain(PlainFn<S>),
    WithData(DataFn<S>),
}

impl<S> Handler<S> {
    fn arity(&self) -> Arity {
        match self {
            Handler::Plain(_) => Arity::Plain,
            Handler::WithData(_) => Arity::WithData,
        }
    }

    fn call(&self, state: &mut S, data: &mut GraphData, output: &mut Output) -> HandlerResult {
        match self {
            Handler::Plain(f) => f(state, output),
            Handler::WithData(f) => f(state, data, output),
        }
    }
}

pub struct ModelClass<S> {
    factory: Box<dyn Fn() -> S>,
    methods: BTreeMap<String, Handler<S>>,
}

impl<S: 'static> ModelClass<S> {
    pub fn new(factory: impl Fn() -> S + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            methods: BTreeMap::new(),
        }
    }

    pub fn method(mut self, name: &str, f: impl Fn(&mut S, &mut Output) -> HandlerResult + 'static) -> Self {
        self.methods.insert(name.to_string(), Handler::Plain(Box::new(f)));
        self
    }

    pub fn method_with_data(
        mut self,
        name: &str,
        f: impl Fn(&mut S, &mut GraphData, &mut Output) -> HandlerResult + 'static,
    ) -> Self {
        self.methods.insert(name.to_string(), Handler::WithData(Box::new(f)));
        self
    }
}

/// Type-erased view of a `ModelClass<S>` so a package can hold many models.
trait ErasedModel {
    fn instantiate(&self) -> Box<dyn Any>;
    fn arity(&self, method: &str) -> Option<Arity>;
    fn invoke(&self, instance: &mut dyn Any, method: &str, data: &mut GraphData, output: &mut Output)
        -> HandlerResult;
}

impl<S: 'static> ErasedModel for ModelClass<S> {
    fn instantiate(&self) -> Box<dyn Any> {
        Box::new((self.factory)())
    }

    fn arity(&self, method: &str) -> Option<Arity> {
        self.methods.get(method).map(Handler::arity)
    }

    fn invoke(
        &self,
        instance: &mut dyn Any,
        method: &str,
        data: &mut GraphData,
        output: &mut Output,
    ) -> HandlerResult {
        let state = instance
            .downcast_mut::<S>()
            .ok_or_else(|| anyhow::anyhow!("model instance has an unexpected type"))?;
        let handler = self
            .methods
            .get(method)
            .ok_or_else(|| anyhow::anyhow!("no method {}", method))?;
        handler.call(state, data, output)
    }
}

#[derive(Default)]
pub struct TestPackage {
    functions: BTreeMap<String, Handler<()>>,
    models: BTreeMap<String, Box<dyn ErasedModel>>,
}

impl TestPackage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn function(mut self, name: &str, f: impl Fn(&mut Output) -> HandlerResult + 'static) -> Self {
        self.functions
            .insert(name.to_string(), Handler::Plain(Box::new(move |_: &mut (), out: &mut Output| f(out))));
        self
    }

    pub fn function_with_data(
        mut self,
        name: &str,
        f: impl Fn(&mut GraphData, &mut Output) -> HandlerResult + 'static,
    ) -> Self {
        self.functions.insert(
            name.to_string(),
            Handler::WithData(Box::new(move |_: &mut (), data: &mut GraphData, out: &mut Output| {
                f(data, out)
            })),
        );
        self
    }

    pub fn model<S: 'static>(mut self, name: &str, class: ModelClass<S>) -> Self {
        self.models.insert(name.to_string(), Box::new(class));
        self
    }

    fn arity(&self, model_name: Option<&str>, name: &str) -> Option<Arity> {
        match model_name {
            None => self.functions.get(name).map(Handler::arity),
            Some(model) => self.models.get(model).and_then(|class| class.arity(name)),
        }
    }
}

impl fmt::Debug for TestPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestPackage")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .field("models", &self.models.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Default)]
pub struct PackageRegistry {
    packages: BTreeMap<PathBuf, Box<dyn Fn() -> TestPackage>>,
}

impl PackageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, path: impl Into<PathBuf>, build: impl Fn() -> TestPackage + 'static) -> Self {
        self.packages.insert(path.into(), Box::new(build));
        self
    }

    fn build(&self, path: &Path) -> Option<TestPackage> {
        self.packages.get(path).map(|build| build())
    }
}

pub struct InProcessExecutor {
    registry: PackageRegistry,
    package: Option<TestPackage>,
    instances: BTreeMap<String, Box<dyn Any>>,
}

impl InProcessExecutor {
    pub fn new(registry: PackageRegistry) -> Self {
        Self {
            registry,
            package: None,
            instances: BTreeMap::new(),
        }
    }

    pub fn with_package(package: TestPackage) -> Self {
        Self {
            registry: PackageRegistry::new(),
            package: Some(package),
            instances: BTreeMap::new(),
        }
    }

    pub fn instantiated_models(&self) -> Vec<&str> {
        self.instances.keys().map(String::as_str).collect()
    }

    fn package(&self) -> Result<&TestPackage, ExecutorError> {
        self.package.as_ref().ok_or(ExecutorError::NotLoaded)
    }
}

impl fmt::Debug for InProcessExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessExecutor")
            .field("package", &self.package)
            .field("instances", &self.instances.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Executor for InProcessExecutor {
    fn load(&mut self, path: &Path) -> Result<(), ExecutorError> {
        self.instances.clear();
        self.package = None;
        let package = self.registry.build(path).ok_or_else(|| ExecutorError::Load {
            path: path.to_path_buf(),
            message: "no test package registered for this path".to_string(),
        })?;
        debug!(path = %path.display(), package = ?package, "loaded test package");
        self.package = Some(package);
        Ok(())
    }

    fn reset(&mut self) -> Result<(), ExecutorError> {
        self.instances.clear();
        Ok(())
    }

    fn has_model(&mut self, name: &str) -> Result<bool, ExecutorError> {
        Ok(self.package()?.models.contains_key(name))
    }

    fn has_step(&mut self, model_name: Option<&str>, name: &str) -> Result<bool, ExecutorError> {
        Ok(self.package()?.arity(model_name, name).is_some())
    }

    fn execute_step(
        &mut self,
        model_name: Option<&str>,
        name: &str,
        data: Option<&GraphData>,
    ) -> Result<ExecutionResult, ExecutorError> {
        let Self {
            package, instances, ..
        } = self;
        let package = package.as_ref().ok_or(ExecutorError::NotLoaded)?;
        let step = match model_name {
            Some(model) => format!("{}.{}", model, name),
            None => name.to_string(),
        };
        let arity = package
            .arity(model_name, name)
            .ok_or_else(|| match model_name {
                Some(model) if !package.models.contains_key(model) => ExecutorError::ModelNotFound(model.to_string()),
                _ => ExecutorError::StepNotFound(step.clone()),
            })?;

        // User code works on its own copy until the walker syncs it back.
        let mut snapshot = data.cloned().unwrap_or_default();
        let mut output = Output::default();
        let outcome = match model_name {
            None => {
                let handler = package
                    .functions
                    .get(name)
                    .ok_or_else(|| ExecutorError::StepNotFound(step.clone()))?;
                guarded(|| handler.call(&mut (), &mut snapshot, &mut output))
            }
            Some(model) => {
                let class = package
                    .models
                    .get(model)
                    .ok_or_else(|| ExecutorError::ModelNotFound(model.to_string()))?;
                if !instances.contains_key(model) {
                    debug!(model, "instantiating model");
                    match instantiate(&**class) {
                        Ok(instance) => {
                            instances.insert(model.to_string(), instance);
                        }
                        Err(error) => {
                            return Ok(ExecutionResult {
                                output: output.buffer,
                                data: None,
                                error: Some(error),
                            })
                        }
                    }
                }
                let instance = instances
                    .get_mut(model)
                    .ok_or_else(|| ExecutorError::ModelNotFound(model.to_string()))?;
                guarded(|| class.invoke(instance.as_mut(), name, &mut snapshot, &mut output))
            }
        };

        Ok(ExecutionResult {
            output: output.buffer,
            data: (arity == Arity::WithData).then_some(snapshot),
            error: outcome.err(),
        })
    }

    fn kill(&mut self) {}
}

fn guarded(call: impl FnOnce() -> HandlerResult) -> Result<(), StepError> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(StepError {
            message: err.to_string(),
            trace: Some(format!("{:?}", err)),
        }),
        Err(payload) => Err(panicked(payload.as_ref(), "panicked")),
    }
}

/// Builds a model instance; a factory that panics is not cached.
fn instantiate(class: &dyn ErasedModel) -> Result<Box<dyn Any>, StepError> {
    panic::catch_unwind(AssertUnwindSafe(|| class.instantiate()))
        .map_err(|payload| panicked(payload.as_ref(), "panicked while creating the model instance"))
}

fn panicked(payload: &(dyn Any + Send), context: &str) -> StepError {
    let message = panic_message(payload);
    StepError {
        trace: Some(format!("{}: {}", context, message)),
        message,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "test code panicked".to_string()
    }
}
