use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use mbt_runner::{
    build_executor, build_planner, default_reporting, load_config, run_walk, steps_from_models,
    verify_steps, write_path_report, EngineOptions, Executor, HttpExecutor, ModelSpec,
    OfflinePlanner, OnlinePlanner, Planner, PlannerConfig, RunOutcome, Step, WalkedStep,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

const DEFAULT_EXECUTOR_URL: &str = "http://localhost:5000/";

#[derive(Parser)]
#[command(name = "mbt", version = "0.3.0", about = "Model-based test walker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Walk the path described by a run configuration.
    Run {
        config: PathBuf,
        #[arg(long)]
        json: bool,
        #[arg(long)]
        verbose: bool,
    },
    /// Walk a live path engine session without a configuration file.
    Online {
        test_package: PathBuf,
        #[arg(
            short = 'm',
            long = "model",
            num_args = 2,
            value_names = ["PATH", "GENERATOR"],
            required = true
        )]
        models: Vec<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        start_element: Option<String>,
        #[arg(long, default_value = "gw")]
        executable: String,
        #[arg(long)]
        unvisited: bool,
        #[arg(long)]
        blocked: bool,
        /// Ask the engine for element properties with every step.
        #[arg(long)]
        engine_verbose: bool,
        #[arg(long, default_value = DEFAULT_EXECUTOR_URL)]
        executor_url: String,
        #[arg(long)]
        report_path: Option<PathBuf>,
        #[arg(long)]
        json: bool,
        #[arg(long)]
        verbose: bool,
    },
    /// Replay a recorded step list.
    Walk {
        test_package: PathBuf,
        steps: PathBuf,
        #[arg(long, default_value = DEFAULT_EXECUTOR_URL)]
        executor_url: String,
        #[arg(long)]
        report_path: Option<PathBuf>,
        #[arg(long)]
        json: bool,
        #[arg(long)]
        verbose: bool,
    },
    /// Verify that the test code implements every step of the configured path.
    Check {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

struct CommandOutput {
    payload: Option<Value>,
    passed: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(command_verbose(&cli.command));
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(output) => {
            if let Some(payload) = output.payload {
                emit_json(&payload);
            }
            if !output.passed {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_command(command: Commands) -> Result<CommandOutput> {
    match command {
        Commands::Run { config, json, .. } => {
            let run_config = load_config(&config)?;
            let mut planner = build_planner(&run_config.planner)?;
            let executor = match build_executor(&run_config.executor) {
                Ok(executor) => executor,
                Err(err) => {
                    planner.kill();
                    return Err(err);
                }
            };
            walk_and_report(
                "run",
                planner,
                executor,
                &run_config.test_package,
                run_config.report.path_file.as_deref(),
                json,
            )
        }
        Commands::Online {
            test_package,
            models,
            port,
            start_element,
            executable,
            unvisited,
            blocked,
            engine_verbose,
            executor_url,
            report_path,
            json,
            ..
        } => {
            let options = EngineOptions {
                executable,
                models: parse_models(&models)?,
                port,
                start_element,
                verbose: engine_verbose,
                unvisited,
                blocked,
                ..EngineOptions::default()
            };
            let planner = OnlinePlanner::start(&options)?;
            let executor = HttpExecutor::new(&executor_url)?;
            walk_and_report(
                "online",
                planner,
                executor,
                &test_package,
                report_path.as_deref(),
                json,
            )
        }
        Commands::Walk {
            test_package,
            steps,
            executor_url,
            report_path,
            json,
            ..
        } => {
            let planner = OfflinePlanner::from_file(&steps)?;
            let executor = HttpExecutor::new(&executor_url)?;
            walk_and_report(
                "walk",
                planner,
                executor,
                &test_package,
                report_path.as_deref(),
                json,
            )
        }
        Commands::Check { config, json } => {
            let run_config = load_config(&config)?;
            let steps = configured_steps(&run_config.planner)?;
            let mut executor = build_executor(&run_config.executor)?;
            let verified = check_steps(executor.as_mut(), &run_config.test_package, &steps);
            executor.kill();
            let (missing, fixtures) = verified?;
            let passed = missing.is_empty();
            if json {
                return Ok(CommandOutput {
                    payload: Some(json!({
                        "ok": passed,
                        "command": "check",
                        "steps_checked": steps.len(),
                        "missing": missing,
                        "fixtures": fixtures,
                    })),
                    passed,
                });
            }
            println!("steps_checked: {}", steps.len());
            for fixture in &fixtures {
                println!("fixture: {}", fixture);
            }
            for step in &missing {
                let model = step.model_name.as_deref().unwrap_or("<none>");
                if step.model_missing {
                    println!("missing: {}.{} (model not found)", model, step.name);
                } else {
                    println!("missing: {}.{}", model, step.name);
                }
            }
            println!("status: {}", if passed { "ok" } else { "missing steps" });
            Ok(CommandOutput {
                payload: None,
                passed,
            })
        }
    }
}

fn walk_and_report<P: Planner, E: Executor>(
    command: &str,
    planner: P,
    executor: E,
    test_package: &Path,
    report_path: Option<&Path>,
    json: bool,
) -> Result<CommandOutput> {
    let mut walked_steps: Vec<WalkedStep> = Vec::new();
    let outcome = run_walk(planner, executor, default_reporting(), test_package, |walked| {
        if !json {
            println!("{}", progress_line(walked));
        }
        walked_steps.push(walked.clone());
    })?;
    if let Some(path) = report_path {
        write_path_report(&outcome, path)?;
    }

    if json {
        return Ok(CommandOutput {
            payload: Some(json!({
                "ok": outcome.status,
                "command": command,
                "steps": walked_steps,
                "outcome": outcome,
                "report_path": report_path.map(|p| p.display().to_string()),
            })),
            passed: outcome.status,
        });
    }
    print_outcome(&outcome, report_path);
    Ok(CommandOutput {
        payload: None,
        passed: outcome.status,
    })
}

fn progress_line(walked: &WalkedStep) -> String {
    let mark = if walked.status { "PASS" } else { "FAIL" };
    match &walked.step.id {
        Some(id) => format!("{} {} ({})", mark, walked.step.qualified_name(), id),
        None => format!("{} {}", mark, walked.step.qualified_name()),
    }
}

fn print_outcome(outcome: &RunOutcome, report_path: Option<&Path>) {
    println!("status: {}", if outcome.status { "passed" } else { "failed" });
    println!("steps: {}", outcome.steps_walked);
    println!(
        "duration_ms: {}",
        (outcome.finished_at - outcome.started_at).num_milliseconds()
    );
    if let Some(failed) = &outcome.statistics.failed_step {
        println!(
            "failed_step: {}: {}",
            failed.step.qualified_name(),
            failed.message
        );
    }
    for fixture in &outcome.statistics.failed_fixtures {
        println!(
            "failed_fixture: {}: {}",
            fixture.step.qualified_name(),
            fixture.message
        );
    }
    if let Some(path) = report_path {
        println!("path_report: {}", path.display());
    }
}

fn parse_models(raw: &[String]) -> Result<Vec<ModelSpec>> {
    if raw.len() % 2 != 0 {
        return Err(anyhow!("invalid --model: expected pairs of <path> <generator>"));
    }
    Ok(raw
        .chunks(2)
        .map(|pair| ModelSpec {
            path: PathBuf::from(&pair[0]),
            generator: pair[1].clone(),
        })
        .collect())
}

fn configured_steps(planner: &PlannerConfig) -> Result<Vec<Step>> {
    match planner {
        PlannerConfig::Offline { steps_path } => {
            Ok(OfflinePlanner::from_file(steps_path)?.steps().to_vec())
        }
        PlannerConfig::Online { models, .. } => {
            let mut steps = Vec::new();
            for model in models {
                steps.extend(steps_from_models(&model.path)?);
            }
            Ok(steps)
        }
    }
}

fn check_steps(
    executor: &mut dyn Executor,
    test_package: &Path,
    steps: &[Step],
) -> Result<(Vec<mbt_runner::MissingStep>, Vec<String>)> {
    executor
        .load(test_package)
        .map_err(|e| anyhow!("load_failed: test package {}: {}", test_package.display(), e))?;
    let missing = verify_steps(executor, steps)?;

    let mut models: Vec<Option<&str>> = vec![None];
    for step in steps {
        let model = step.model_name.as_deref();
        if !models.contains(&model) {
            models.push(model);
        }
    }
    let mut fixtures = Vec::new();
    for model in models {
        if let Some(name) = model {
            if !executor.has_model(name)? {
                continue;
            }
        }
        for fixture in fixture_names(model.is_some()) {
            if executor.has_step(model, fixture)? {
                fixtures.push(Step::fixture(fixture, model).qualified_name());
            }
        }
    }
    debug!(missing = missing.len(), fixtures = fixtures.len(), "check complete");
    Ok((missing, fixtures))
}

fn fixture_names(model_level: bool) -> &'static [&'static str] {
    use mbt_runner::step::{
        AFTER_STEP, BEFORE_STEP, SET_UP_MODEL, SET_UP_RUN, TEAR_DOWN_MODEL, TEAR_DOWN_RUN,
    };
    static RUN: [&str; 4] = [SET_UP_RUN, TEAR_DOWN_RUN, BEFORE_STEP, AFTER_STEP];
    static MODEL: [&str; 4] = [SET_UP_MODEL, TEAR_DOWN_MODEL, BEFORE_STEP, AFTER_STEP];
    if model_level {
        &MODEL
    } else {
        &RUN
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Online { json, .. }
        | Commands::Walk { json, .. }
        | Commands::Check { json, .. } => *json,
    }
}

fn command_verbose(command: &Commands) -> bool {
    match command {
        Commands::Run { verbose, .. }
        | Commands::Online { verbose, .. }
        | Commands::Walk { verbose, .. } => *verbose,
        Commands::Check { .. } => false,
    }
}
