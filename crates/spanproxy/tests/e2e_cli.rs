use std::io::{BufRead, BufReader};
use std::net::TcpListener;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;
use serial_test::serial;
use testkit::CaptureServer;

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn bin() -> &'static str {
    env!("CARGO_BIN_EXE_spanproxy")
}

/// A command isolated from the caller's config file and environment.
fn command(temp: &Path) -> Command {
    let mut cmd = Command::new(bin());
    cmd.env("SPANPROXY_CONFIG", temp.join("missing.toml"))
        .env_remove("HONEYCOMB_WRITEKEY")
        .env_remove("SPANPROXY_DATASET")
        .env_remove("SPANPROXY_DEBUG")
        .env_remove("SPANPROXY_DOWNSTREAM")
        .env_remove("OTEL_EXPORTER_OTLP_ENDPOINT");
    cmd
}

fn spawn_server(temp: &Path, extra: &[String]) -> (Child, u16) {
    let port = free_port();
    let child = command(temp)
        .arg("run")
        .arg("--listen-addr")
        .arg(format!("127.0.0.1:{port}"))
        .args(extra)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    (child, port)
}

/// Forwards stdout lines from a background thread so reads can time out.
fn stdout_lines(child: &mut Child) -> mpsc::Receiver<String> {
    let stdout = child.stdout.take().unwrap();
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        for line in BufReader::new(stdout).lines().map_while(Result::ok) {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn read_spans(lines: &mpsc::Receiver<String>, count: usize) -> Vec<Value> {
    (0..count)
        .map(|_| {
            let line = lines
                .recv_timeout(Duration::from_secs(10))
                .expect("span line on stdout");
            serde_json::from_str(&line).unwrap()
        })
        .collect()
}

async fn wait_ready(port: u16, child: &mut Child) {
    let client = reqwest::Client::new();
    let mut ready = false;
    for _ in 0..100 {
        assert!(child.try_wait().unwrap().is_none(), "spanproxy exited early");
        let probe = client
            .post(format!("http://127.0.0.1:{port}/api/v2/spans"))
            .header("content-type", "application/json")
            .body("[]")
            .send()
            .await;
        if probe.is_ok() {
            ready = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(ready, "ingest endpoint not ready");
}

async fn post(port: u16, path: &str, content_type: &str, body: Vec<u8>) -> StatusCode {
    reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}{path}"))
        .header("content-type", content_type)
        .body(body)
        .send()
        .await
        .unwrap()
        .status()
}

fn stop(mut child: Child) {
    let _ = child.kill();
    let _ = child.wait();
}

#[tokio::test]
#[serial]
async fn e2e_debug_output_prints_thrift_spans() {
    let temp = tempfile::tempdir().unwrap();
    let (mut child, port) = spawn_server(temp.path(), &["--debug".to_string()]);
    let lines = stdout_lines(&mut child);
    wait_ready(port, &mut child).await;

    let status = post(
        port,
        "/api/v1/spans",
        "application/x-thrift",
        testkit::sample_thrift_payload(),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let spans = read_spans(&lines, 4);
    let names: Vec<&str> = spans.iter().map(|s| s["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["/api.RetrieverService/Fetch", "persist", "markAsDone", "executeQuery"]);
    assert_eq!(spans[0]["trace_id"], "350565b6a90d4c8c");
    assert_eq!(spans[0]["service_name"], "poodle");
    assert_eq!(spans[0]["tags"]["component"], "gRPC");
    assert!(spans[3].get("parent_span_id").is_none());

    stop(child);
}

#[tokio::test]
#[serial]
async fn e2e_json_v2_and_rejections() {
    let temp = tempfile::tempdir().unwrap();
    let (mut child, port) = spawn_server(temp.path(), &["--debug".to_string()]);
    let lines = stdout_lines(&mut child);
    wait_ready(port, &mut child).await;

    let status = post(port, "/api/v1/spans", "text/plain", b"[]".to_vec()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let status = post(port, "/api/v2/spans", "application/json", b"{nope".to_vec()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let status = post(
        port,
        "/api/v2/spans",
        "application/json",
        testkit::sample_json_v2_payload(),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let spans = read_spans(&lines, 1);
    assert_eq!(spans[0]["name"], "get /api");
    assert_eq!(spans[0]["service_name"], "frontend");
    assert_eq!(spans[0]["tags"]["kind"], "SERVER");
    assert_eq!(spans[0]["tags"]["http.status_code"], 200);

    stop(child);
}

#[tokio::test]
#[serial]
async fn e2e_honeycomb_and_mirror_receive_traffic() {
    let temp = tempfile::tempdir().unwrap();
    let honeycomb = CaptureServer::start(StatusCode::ACCEPTED).await;
    let downstream = CaptureServer::start(StatusCode::ACCEPTED).await;
    let (mut child, port) = spawn_server(
        temp.path(),
        &[
            "-k".to_string(),
            "test-key".to_string(),
            "-d".to_string(),
            "traces".to_string(),
            "--api-host".to_string(),
            honeycomb.url("/"),
            "--downstream".to_string(),
            downstream.url("/api/v1/spans"),
        ],
    );
    wait_ready(port, &mut child).await;

    let payload = testkit::sample_thrift_payload();
    let status = post(port, "/api/v1/spans", "application/x-thrift", payload.clone()).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    // The readiness probe is mirrored too.
    let mirrored = downstream.wait_for(2, Duration::from_secs(10)).await;
    assert!(mirrored.iter().any(|r| r.body == payload));

    let batches = honeycomb.wait_for(1, Duration::from_secs(10)).await;
    assert_eq!(batches[0].path, "/1/batch/traces");
    assert_eq!(batches[0].header("x-honeycomb-team"), Some("test-key"));
    let events: Vec<Value> = batches
        .iter()
        .flat_map(|b| serde_json::from_slice::<Vec<Value>>(&b.body).unwrap())
        .collect();
    assert!(events.iter().any(|e| e["data"]["name"] == "executeQuery"));

    stop(child);
}

#[test]
fn e2e_decode_prints_json_lines() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("spans.thrift");
    std::fs::write(&path, testkit::sample_thrift_payload()).unwrap();

    let output = command(temp.path())
        .arg("decode")
        .arg("--format")
        .arg("thrift")
        .arg(&path)
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let spans: Vec<Value> = stdout
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(spans.len(), 4);
    assert_eq!(spans[1]["name"], "persist");
}

#[test]
fn e2e_decode_failure_exits_non_zero() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("broken.json");
    std::fs::write(&path, b"{not json").unwrap();

    let output = command(temp.path())
        .arg("decode")
        .arg("--format")
        .arg("json-v1")
        .arg(&path)
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
}

#[test]
fn e2e_run_without_sink_is_rejected() {
    let temp = tempfile::tempdir().unwrap();
    let output = command(temp.path())
        .arg("run")
        .arg("--listen-addr")
        .arg(format!("127.0.0.1:{}", free_port()))
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no sink configured"), "stderr: {stderr}");
}
