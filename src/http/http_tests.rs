//! HTTP surface tests: request parsing, routing helpers, and the EdgeQL
//! endpoint end to end against the loopback backend.

use std::sync::Arc;

use serde_json::json;

use super::*;
use crate::app::state::ServerState;
use crate::backend::loopback::LoopbackConnector;
use crate::compiler::heuristic::HeuristicGateway;
use crate::config::{AuthMethodName, Config};

fn test_state() -> Arc<ServerState> {
    let mut config = Config::default();
    config.general.auth_method = AuthMethodName::Trust;
    ServerState::new(
        Arc::new(config),
        Arc::new(HeuristicGateway),
        Arc::new(LoopbackConnector::new()),
    )
    .unwrap()
}

fn request(method: &str, path: &str, body: &[u8]) -> Request {
    Request {
        method: method.to_string(),
        path: path.to_string(),
        headers: Default::default(),
        body: body.to_vec(),
    }
}

#[test]
fn test_parse_branch_path() {
    assert_eq!(
        parse_branch_path("/branch/main/edgeql"),
        Some(("main".to_string(), "edgeql"))
    );
    assert_eq!(
        parse_branch_path("/db/legacy/graphql"),
        Some(("legacy".to_string(), "graphql"))
    );
    assert_eq!(parse_branch_path("/branch//edgeql"), None);
    assert_eq!(parse_branch_path("/other/main/edgeql"), None);
    assert_eq!(parse_branch_path("/branch/main"), None);
}

#[test]
fn test_find_header_end() {
    assert_eq!(find_header_end(b"GET / HTTP/1.1\r\n\r\nbody"), Some(14));
    assert_eq!(find_header_end(b"partial\r\n"), None);
}

#[tokio::test]
async fn test_read_request_with_body() {
    let (client, server) = tokio::io::duplex(4096);
    let mut reader = tokio::io::BufReader::new(server);
    let payload = b"{\"query\":\"select 1\"}";
    let raw = format!(
        "POST /branch/main/edgeql HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
        payload.len()
    );
    let mut client = client;
    tokio::io::AsyncWriteExt::write_all(&mut client, raw.as_bytes())
        .await
        .unwrap();
    tokio::io::AsyncWriteExt::write_all(&mut client, payload)
        .await
        .unwrap();

    let request = read_request(&mut reader).await.unwrap().unwrap();
    assert_eq!(request.method, "POST");
    assert_eq!(request.path, "/branch/main/edgeql");
    assert_eq!(
        request.headers.get("content-type").map(String::as_str),
        Some("application/json")
    );
    assert_eq!(request.body, payload);
}

#[tokio::test]
async fn test_health_endpoints() {
    let state = test_state();
    for path in ["/server/status/alive", "/server/status/ready"] {
        let response = route(&state, &request("GET", path, b"")).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"OK");
    }
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let state = test_state();
    let response = route(&state, &request("GET", "/metrics", b"")).await;
    assert_eq!(response.status, 200);
    let text = String::from_utf8(response.body).unwrap();
    assert!(text.contains("gelway_pool_total_connections"));
}

#[tokio::test]
async fn test_edgeql_endpoint_happy_path() {
    let state = test_state();
    let body = serde_json::to_vec(&json!({"query": "select 1"})).unwrap();
    let response = route(&state, &request("POST", "/branch/main/edgeql", &body)).await;
    assert_eq!(response.status, 200);
    let value: Value = serde_json::from_slice(&response.body).unwrap();
    assert!(value.get("data").unwrap().is_array());
}

#[tokio::test]
async fn test_edgeql_rejects_ddl() {
    let state = test_state();
    let body = serde_json::to_vec(&json!({"query": "create type Foo"})).unwrap();
    let response = route(&state, &request("POST", "/branch/main/edgeql", &body)).await;
    assert_eq!(response.status, 400);
    let value: Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(
        value["error"]["type"].as_str().unwrap(),
        "DisabledCapabilityError"
    );
}

#[tokio::test]
async fn test_edgeql_rejects_transactions() {
    let state = test_state();
    let body = serde_json::to_vec(&json!({"query": "start transaction"})).unwrap();
    let response = route(&state, &request("POST", "/branch/main/edgeql", &body)).await;
    assert_eq!(response.status, 400);
}

#[tokio::test]
async fn test_edgeql_rejects_scripts() {
    let state = test_state();
    let body = serde_json::to_vec(&json!({"query": "select 1; select 2"})).unwrap();
    let response = route(&state, &request("POST", "/branch/main/edgeql", &body)).await;
    assert_eq!(response.status, 400);
}

#[tokio::test]
async fn test_graphql_without_translator() {
    let state = test_state();
    let body = serde_json::to_vec(&json!({"query": "{ posts { title } }"})).unwrap();
    let response = route(&state, &request("POST", "/branch/main/graphql", &body)).await;
    assert_eq!(response.status, 400);
    let value: Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(
        value["error"]["type"].as_str().unwrap(),
        "UnsupportedFeatureError"
    );
}

#[tokio::test]
async fn test_notebook_runs_and_rolls_back() {
    let state = test_state();
    let body = serde_json::to_vec(&json!({"queries": ["select 1", "select 2"]})).unwrap();
    let response = route(&state, &request("POST", "/branch/main/notebook", &body)).await;
    assert_eq!(response.status, 200);
    let value: Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(value["kind"].as_str().unwrap(), "results");
    let results = value["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["kind"].as_str().unwrap(), "data");
}

#[tokio::test]
async fn test_notebook_reports_cell_error_and_stops() {
    let state = test_state();
    let body =
        serde_json::to_vec(&json!({"queries": ["frobnicate", "select 1"]})).unwrap();
    let response = route(&state, &request("POST", "/branch/main/notebook", &body)).await;
    let value: Value = serde_json::from_slice(&response.body).unwrap();
    let results = value["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["kind"].as_str().unwrap(), "error");
}

#[tokio::test]
async fn test_basic_auth_required_when_scram() {
    let mut config = Config::default();
    config.general.auth_method = AuthMethodName::Scram;
    config.users.push(crate::config::User {
        username: "edgedb".into(),
        password: "secret".into(),
    });
    let state = ServerState::new(
        Arc::new(config),
        Arc::new(HeuristicGateway),
        Arc::new(LoopbackConnector::new()),
    )
    .unwrap();

    let body = serde_json::to_vec(&json!({"query": "select 1"})).unwrap();
    let response = route(&state, &request("POST", "/branch/main/edgeql", &body)).await;
    assert_eq!(response.status, 401);

    let mut authed = request("POST", "/branch/main/edgeql", &body);
    authed.headers.insert(
        "authorization".to_string(),
        format!("Basic {}", BASE64.encode("edgedb:secret")),
    );
    let response = route(&state, &authed).await;
    assert_eq!(response.status, 200);
}

#[test]
fn test_build_arguments() {
    let args = build_arguments(&[], &Value::Null).unwrap();
    assert!(args.is_empty());

    let params = vec!["n".to_string()];
    let variables = json!({"n": 5});
    let blob = build_arguments(&params, &variables).unwrap();
    let values = crate::protocol::wire::parse_argument_tuple(&blob).unwrap();
    assert_eq!(values, vec![b"5".to_vec()]);

    assert!(build_arguments(&params, &json!({})).is_err());
    assert!(build_arguments(&params, &Value::Null).is_err());
}

#[test]
fn test_decode_row() {
    assert_eq!(decode_row(b"{\"a\":1}"), json!({"a": 1}));
    assert_eq!(decode_row(b"plain text"), json!("plain text"));
}
