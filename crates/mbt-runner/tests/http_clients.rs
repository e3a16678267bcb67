use mbt_runner::{
    Executor, ExecutorError, GraphData, HttpExecutor, InProcessExecutor, ModelClass,
    OnlinePlanner, Planner, PlannerError, Step, SummaryReporter, TestPackage, Walker,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;

#[derive(Debug, Clone)]
struct Recorded {
    method: String,
    url: String,
    body: String,
}

type Log = Arc<Mutex<Vec<Recorded>>>;

/// Serves requests on a background thread until the test process exits.
fn serve<H>(handler: H) -> (String, Log)
where
    H: FnMut(&str, &str, &str) -> (u16, Value) + Send + 'static,
{
    let server = tiny_http::Server::http("127.0.0.1:0").expect("bind fake server");
    let port = server
        .server_addr()
        .to_ip()
        .expect("ip listener")
        .port();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let seen = log.clone();
    let mut handler = handler;
    thread::spawn(move || {
        for mut request in server.incoming_requests() {
            let mut body = String::new();
            let _ = request.as_reader().read_to_string(&mut body);
            let method = request.method().to_string();
            let url = request.url().to_string();
            let (status, reply) = handler(&method, &url, &body);
            seen.lock().expect("log").push(Recorded { method, url, body });
            let header = tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                .expect("header");
            let response = tiny_http::Response::from_string(reply.to_string())
                .with_status_code(status)
                .with_header(header);
            let _ = request.respond(response);
        }
    });
    (format!("http://127.0.0.1:{}/", port), log)
}

fn urls(log: &Log) -> Vec<String> {
    log.lock().expect("log").iter().map(|r| r.url.clone()).collect()
}

/// Path engine double walking a fixed element list.
fn fake_engine(path: Vec<(&'static str, &'static str)>) -> (String, Log) {
    let mut remaining: VecDeque<(&str, &str)> = path.into();
    let mut data: serde_json::Map<String, Value> = serde_json::Map::new();
    serve(move |_method, url, _body| {
        let url = url.trim_start_matches("/graphwalker/");
        if url.starts_with("hasNext") {
            (200, json!({"result": "ok", "hasNext": (!remaining.is_empty()).to_string()}))
        } else if url.starts_with("getNext") {
            match remaining.pop_front() {
                Some((id, name)) => (
                    200,
                    json!({
                        "result": "ok",
                        "currentElementID": id,
                        "currentElementName": name,
                        "modelName": "Counter"
                    }),
                ),
                None => (200, json!({"result": "nok", "error": "no more steps"})),
            }
        } else if url.starts_with("getData") {
            (200, json!({"result": "ok", "data": Value::Object(data.clone())}))
        } else if let Some(script) = url.strip_prefix("setData/") {
            let (key, value) = script.trim_end_matches(';').split_once('=').unwrap_or((script, "null"));
            let value = serde_json::from_str(value).unwrap_or(Value::Null);
            data.insert(key.to_string(), value);
            (200, json!({"result": "ok"}))
        } else if url.starts_with("getStatistics") {
            (200, json!({"result": "ok", "edgeCoverage": 100, "totalNumberOfVisitedEdges": 1}))
        } else {
            (200, json!({"result": "ok"}))
        }
    })
}

fn counter_package() -> TestPackage {
    TestPackage::new().model(
        "Counter",
        ModelClass::new(|| ())
            .method_with_data("v_start", |_, data: &mut GraphData, _| {
                data.insert("count".to_string(), json!(1));
                Ok(())
            })
            .method_with_data("e_increment", |_, data: &mut GraphData, _| {
                let count = data.get("count").and_then(Value::as_i64).unwrap_or(0);
                data.insert("count".to_string(), json!(count + 1));
                Ok(())
            })
            .method("v_broken", |_, _| Err(anyhow::anyhow!("counter display is blank"))),
    )
}

#[test]
fn online_walk_syncs_data_through_the_engine() {
    let (url, log) = fake_engine(vec![("v0", "v_start"), ("e0", "e_increment")]);
    let planner = OnlinePlanner::connect(&url, false).expect("client");
    let executor = InProcessExecutor::with_package(counter_package());
    let mut walker = Walker::new(planner, executor, SummaryReporter::new());

    let walked: Vec<_> = walker.walk().collect();
    assert_eq!(walked.len(), 2);
    assert!(walked.iter().all(|w| w.status));
    assert!(walker.status());

    let urls = urls(&log);
    assert_eq!(urls[0], "/graphwalker/restart");
    let writes: Vec<&String> = urls.iter().filter(|u| u.contains("setData")).collect();
    assert_eq!(
        writes,
        vec!["/graphwalker/setData/count=1;", "/graphwalker/setData/count=2;"]
    );
    assert!(log.lock().expect("log").iter().all(|r| r.method == "GET" || r.method == "PUT"));

    let stats = walker.planner_mut().statistics().expect("stats");
    assert_eq!(stats.engine.get("edgeCoverage"), Some(&json!(100)));
    assert!(!stats.engine.contains_key("result"));
    assert_eq!(stats.steps.len(), 2);
}

#[test]
fn failing_step_is_forwarded_to_the_engine() {
    let (url, log) = fake_engine(vec![("v9", "v_broken"), ("e0", "e_increment")]);
    let planner = OnlinePlanner::connect(&url, false).expect("client");
    let executor = InProcessExecutor::with_package(counter_package());
    let mut walker = Walker::new(planner, executor, SummaryReporter::new());

    let walked: Vec<_> = walker.walk().collect();
    assert_eq!(walked.len(), 2);
    assert!(!walked[0].status);
    assert!(walked[1].status);
    assert!(!walker.status());

    let fails: Vec<String> = urls(&log)
        .into_iter()
        .filter(|u| u.starts_with("/graphwalker/fail/"))
        .collect();
    assert_eq!(fails.len(), 1);
    assert!(fails[0].contains("counter%20display%20is%20blank"), "{}", fails[0]);

    let stats = walker.planner_mut().statistics().expect("stats");
    let failed = stats.failed_step.expect("failed step");
    assert_eq!(failed.step.id.as_deref(), Some("v9"));
    assert_eq!(failed.message, "counter display is blank");
}

#[test]
fn engine_rejection_surfaces_as_engine_error() {
    let (url, _log) = serve(|_, _, _| (500, json!({"result": "nok", "error": "model not loaded"})));
    let mut planner = OnlinePlanner::connect(&url, false).expect("client");
    match planner.has_next() {
        Err(PlannerError::Engine(message)) => assert!(message.contains("model not loaded"), "{}", message),
        other => panic!("unexpected: {:?}", other),
    }
}

#[test]
fn verbose_client_asks_for_element_properties() {
    let (url, log) = serve(|_, _, _| {
        (
            200,
            json!({
                "result": "ok",
                "currentElementID": "v1",
                "currentElementName": "v_cart",
                "modelName": "Shop",
                "properties": {"x": 10}
            }),
        )
    });
    let mut planner = OnlinePlanner::connect(&url, true).expect("client");
    let step = planner.get_next().expect("step");
    assert_eq!(step, {
        let mut expected = Step::new("v1", "v_cart", "Shop");
        expected.properties = Some(json!({"x": 10}));
        expected
    });
    assert_eq!(urls(&log), vec!["/graphwalker/getNext?verbose=true"]);
}

/// Executor service double: `Shop` has `add`, nothing else exists.
fn fake_executor() -> (String, Log) {
    serve(|method, url, body| {
        let path = url.split('?').next().unwrap_or(url);
        match (method, path) {
            ("POST", "/api/load") => {
                let request: Value = serde_json::from_str(body).unwrap_or(Value::Null);
                if request["path"] == json!("/tests") {
                    (200, json!({"payload": {}}))
                } else {
                    (500, json!({"error": {"message": "no such package"}}))
                }
            }
            ("PUT", "/api/reset") => (200, json!({"payload": {}})),
            ("GET", "/api/hasModel") => (200, json!({"payload": {"hasModel": url.contains("name=Shop")}})),
            ("GET", "/api/hasStep") => (200, json!({"payload": {"hasStep": url.contains("name=add")}})),
            ("POST", "/api/executeStep") if url.contains("name=add") => {
                let request: Value = serde_json::from_str(body).unwrap_or(Value::Null);
                let items = request["data"]["items"].as_i64().unwrap_or(0);
                (
                    200,
                    json!({"payload": {"output": "added\n", "data": {"items": items + 1}}}),
                )
            }
            ("POST", "/api/executeStep") if url.contains("modelName=Ghost") => {
                (460, json!({"error": {"message": "model Ghost not found"}}))
            }
            ("POST", "/api/executeStep") => (200, json!("not a result")),
            _ => (404, json!({"error": {"message": "unknown endpoint"}})),
        }
    })
}

#[test]
fn http_executor_speaks_the_service_protocol() {
    let (url, log) = fake_executor();
    let mut executor = HttpExecutor::new(&format!("{}api", url)).expect("executor");

    executor.load(Path::new("/tests")).expect("load");
    executor.reset().expect("reset");
    assert!(executor.has_model("Shop").expect("hasModel"));
    assert!(!executor.has_model("Cart").expect("hasModel"));
    assert!(executor.has_step(Some("Shop"), "add").expect("hasStep"));
    assert!(!executor.has_step(None, "setUpRun").expect("hasStep"));

    let mut data = GraphData::new();
    data.insert("items".to_string(), json!(2));
    let result = executor
        .execute_step(Some("Shop"), "add", Some(&data))
        .expect("execute");
    assert!(result.passed());
    assert_eq!(result.output, "added\n");
    assert_eq!(result.data.expect("data").get("items"), Some(&json!(3)));

    let recorded = log.lock().expect("log").clone();
    let execute = recorded
        .iter()
        .find(|r| r.url.starts_with("/api/executeStep"))
        .expect("executeStep request");
    assert!(execute.url.contains("modelName=Shop"));
    let body: Value = serde_json::from_str(&execute.body).expect("json body");
    assert_eq!(body, json!({"data": {"items": 2}}));
}

#[test]
fn http_executor_maps_failures_to_typed_errors() {
    let (url, _log) = fake_executor();
    let mut executor = HttpExecutor::new(&format!("{}api/", url)).expect("executor");

    match executor.load(Path::new("/elsewhere")) {
        Err(ExecutorError::Load { path, message }) => {
            assert_eq!(path, Path::new("/elsewhere"));
            assert_eq!(message, "no such package");
        }
        other => panic!("unexpected: {:?}", other),
    }
    assert!(matches!(
        executor.execute_step(Some("Ghost"), "walk", None),
        Err(ExecutorError::ModelNotFound(_))
    ));
    assert!(matches!(
        executor.execute_step(Some("Shop"), "remove", None),
        Err(ExecutorError::Protocol(_))
    ));
}

#[test]
fn killing_clients_twice_is_harmless() {
    let mut executor = HttpExecutor::new("http://127.0.0.1:1/").expect("executor");
    executor.kill();
    executor.kill();
    let mut planner = OnlinePlanner::connect("http://127.0.0.1:1/", false).expect("planner");
    planner.kill();
    planner.kill();
}
