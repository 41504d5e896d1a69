use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bluestacks_agent::{
    AgentClient, AgentConfig, Gateway, GatewayError, GatewayRequest, HttpGateway, TaskState,
};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

// ── Minimal HTTP/1.1 mock helper ──────────────────────────────────────────────

#[derive(Debug, Clone)]
struct CapturedRequest {
    method: String,
    target: String,
    headers: HashMap<String, String>,
    body: Value,
}

#[derive(Clone)]
struct Route {
    status: u16,
    content_type: &'static str,
    body: String,
}

fn json_route(status: u16, body: Value) -> Route {
    Route {
        status,
        content_type: "application/json",
        body: body.to_string(),
    }
}

/// Serves every connection from a fixed routing table keyed by path (query
/// string ignored). Unknown paths hang until the client gives up.
async fn mock_helper(
    routes: Vec<(&'static str, Route)>,
) -> (String, Arc<Mutex<Vec<CapturedRequest>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let routes: Arc<HashMap<&'static str, Route>> = Arc::new(routes.into_iter().collect());
    let captured = Arc::new(Mutex::new(Vec::new()));

    let seen = captured.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let routes = routes.clone();
            let seen = seen.clone();
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.into_split();
                let mut reader = BufReader::new(read_half);

                let mut request_line = String::new();
                reader.read_line(&mut request_line).await.unwrap();
                let mut parts = request_line.trim().splitn(3, ' ');
                let method = parts.next().unwrap_or("").to_string();
                let target = parts.next().unwrap_or("").to_string();

                let mut headers = HashMap::new();
                let mut content_length = 0usize;
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).await.unwrap();
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        break;
                    }
                    if let Some((k, v)) = trimmed.split_once(": ") {
                        let key = k.to_lowercase();
                        if key == "content-length" {
                            content_length = v.parse().unwrap_or(0);
                        }
                        headers.insert(key, v.to_string());
                    }
                }
                let mut body_bytes = vec![0u8; content_length];
                reader.read_exact(&mut body_bytes).await.unwrap();
                let body = serde_json::from_slice(&body_bytes).unwrap_or(Value::Null);

                let path = target.split('?').next().unwrap_or("").to_string();
                seen.lock().unwrap().push(CapturedRequest {
                    method,
                    target,
                    headers,
                    body,
                });

                let Some(route) = routes.get(path.as_str()) else {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    return;
                };
                let response = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    route.status,
                    route.content_type,
                    route.body.len(),
                    route.body,
                );
                let _ = write_half.write_all(response.as_bytes()).await;
            });
        }
    });

    (base_url, captured)
}

fn gateway(base_url: &str) -> HttpGateway {
    let config = AgentConfig::new(base_url).request_timeout(Duration::from_millis(500));
    HttpGateway::new(&config).unwrap()
}

// ── Gateway classification ───────────────────────────────────────────────────

#[tokio::test]
async fn post_sends_json_body_and_returns_reply() {
    let (base_url, captured) =
        mock_helper(vec![("/v1/tools/tap", json_route(200, json!({ "status": "success" })))]).await;

    let reply = gateway(&base_url)
        .send(GatewayRequest::post("/v1/tools/tap", json!({ "x": 1, "y": 2 })))
        .await
        .unwrap();

    assert_eq!(reply, json!({ "status": "success" }));
    let requests = captured.lock().unwrap();
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[0].body, json!({ "x": 1, "y": 2 }));
    assert_eq!(requests[0].headers["content-type"], "application/json");
}

#[tokio::test]
async fn get_flattens_params_into_query() {
    let (base_url, captured) = mock_helper(vec![(
        "/v1/tools/ui_dump",
        json_route(200, json!({ "status": "success" })),
    )])
    .await;

    gateway(&base_url)
        .send(GatewayRequest::get("/v1/tools/ui_dump", json!({ "session_id": "s-9" })))
        .await
        .unwrap();

    let requests = captured.lock().unwrap();
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].target, "/v1/tools/ui_dump?session_id=s-9");
}

#[tokio::test]
async fn server_error_body_supplies_code() {
    let (base_url, _) = mock_helper(vec![(
        "/v1/task/create",
        json_route(500, json!({ "error": "llm_unavailable", "message": "model offline" })),
    )])
    .await;

    let err = gateway(&base_url)
        .send(GatewayRequest::post("/v1/task/create", json!({})))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "llm_unavailable");
    assert_eq!(err.to_string(), "model offline");
    assert!(matches!(err, GatewayError::Server { status: Some(500), .. }));
}

#[tokio::test]
async fn non_json_reply_is_invalid_response() {
    let (base_url, _) = mock_helper(vec![(
        "/v1/session/create",
        Route {
            status: 200,
            content_type: "text/html",
            body: "<html>proxy</html>".into(),
        },
    )])
    .await;

    let err = gateway(&base_url)
        .send(GatewayRequest::post("/v1/session/create", json!({})))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "invalid_response");
}

#[tokio::test]
async fn refused_connection_is_connection_failed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let err = gateway(&base_url)
        .send(GatewayRequest::post("/v1/session/create", json!({})))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "connection_failed");
}

#[tokio::test]
async fn silent_server_is_connection_timeout() {
    let (base_url, _) = mock_helper(Vec::new()).await;

    let err = gateway(&base_url)
        .send(GatewayRequest::post("/v1/session/create", json!({})))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "connection_timeout");
}

// ── Full turn over SSE ───────────────────────────────────────────────────────

#[tokio::test]
async fn run_task_over_http_and_sse() {
    let events = [
        ("task_progress", json!({ "step_index": 1, "task_state": "running" })),
        (
            "task_completed",
            json!({ "task_state": "completed", "result": { "status": "success", "output": "Wi-Fi enabled" } }),
        ),
    ];
    let sse: String = events
        .iter()
        .map(|(event, data)| format!("event: {event}\ndata: {data}\n\n"))
        .collect();
    let (base_url, captured) = mock_helper(vec![
        (
            "/v1/session/create",
            json_route(200, json!({ "status": "success", "session_id": "s-42" })),
        ),
        (
            "/v1/task/create",
            json_route(200, json!({ "status": "success", "task_id": "t-7" })),
        ),
        (
            "/v1/task/stream",
            Route {
                status: 200,
                content_type: "text/event-stream",
                body: sse,
            },
        ),
    ])
    .await;
    let client = AgentClient::new(
        AgentConfig::new(base_url)
            .request_timeout(Duration::from_secs(2))
            .use_default_callbacks(false),
    )
    .unwrap();

    let result = client.run_task("turn on wifi").await;

    assert!(result.success, "{result:?}");
    assert_eq!(result.output, "Wi-Fi enabled");
    assert_eq!(client.task_state(), TaskState::Completed);
    let requests = captured.lock().unwrap().clone();
    let stream = requests
        .iter()
        .find(|r| r.target.starts_with("/v1/task/stream"))
        .unwrap();
    assert_eq!(stream.method, "GET");
    assert_eq!(stream.target, "/v1/task/stream?session_id=s-42&task_id=t-7");
    assert!(stream.headers["accept"].contains("text/event-stream"));
}
