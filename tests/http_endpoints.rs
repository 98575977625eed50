use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use toolloop::mcp::{HttpTransport, McpClient, McpTransport, SseTransport};
use toolloop::{
    ChatCompletionClient, CompletionAssembler, LanguageModel, Message, RetryPolicy,
    ToolDescription,
};

#[derive(Debug, Clone)]
struct Recorded {
    request_line: String,
    headers: Vec<(String, String)>,
    body: String,
}

impl Recorded {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

async fn read_request(stream: &mut TcpStream) -> Recorded {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client closed before sending headers");
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default().to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();
    let length: usize = headers
        .iter()
        .find(|(key, _)| key == "content-length")
        .map(|(_, value)| value.parse().unwrap())
        .unwrap_or(0);

    while buf.len() < header_end + length {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client closed mid-body");
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buf[header_end..header_end + length]).to_string();

    Recorded {
        request_line,
        headers,
        body,
    }
}

fn http_response(status: &str, content_type: &str, extra: &[(&str, &str)], body: &str) -> String {
    let mut response = format!(
        "HTTP/1.1 {status}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n",
        body.len()
    );
    for (key, value) in extra {
        response.push_str(&format!("{key}: {value}\r\n"));
    }
    response.push_str("\r\n");
    response.push_str(body);
    response
}

/// Answers one connection per scripted response, then stops listening.
async fn serve(responses: Vec<String>) -> (String, Arc<Mutex<Vec<Recorded>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let recorded = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&recorded);

    tokio::spawn(async move {
        for response in responses {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_request(&mut stream).await;
            log.lock().unwrap().push(request);
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.ok();
        }
    });

    (base, recorded)
}

fn sse(events: &[Value]) -> String {
    let mut body = String::new();
    for event in events {
        body.push_str(&format!("data: {event}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        backoff: Duration::from_millis(10),
    }
}

async fn collect_message(
    client: &ChatCompletionClient,
    tools: &[ToolDescription],
) -> toolloop::Result<Message> {
    let mut stream = client.stream_chat(&[Message::user("hi")], tools).await?;
    let mut assembler = CompletionAssembler::default();
    while let Some(delta) = stream.next().await {
        assembler.push(&delta?);
    }
    Ok(assembler.finish())
}

#[tokio::test]
async fn chat_client_streams_text_and_tool_calls() {
    let body = sse(&[
        json!({"choices": [{"index": 0, "delta": {"role": "assistant", "content": "Let me "}}]}),
        json!({"choices": [{"index": 0, "delta": {"content": "check."}}]}),
        json!({"choices": [{"index": 0, "delta": {"tool_calls": [{
            "index": 0, "id": "call_1", "type": "function",
            "function": {"name": "get_weather", "arguments": "{\"city\":"}
        }]}}]}),
        json!({"choices": [{"index": 0, "delta": {"tool_calls": [{
            "index": 0, "function": {"arguments": "\"Rome\"}"}
        }]}, "finish_reason": "tool_calls"}]}),
    ]);
    let (base, recorded) = serve(vec![http_response("200 OK", "text/event-stream", &[], &body)]).await;
    let client = ChatCompletionClient::new(format!("{base}/v1/"), "test-model")
        .unwrap()
        .with_api_key("hf_test");
    let tools = vec![ToolDescription {
        name: "get_weather".into(),
        description: "Current weather".into(),
        parameters: Some(json!({"type": "object"})),
    }];

    let message = collect_message(&client, &tools).await.unwrap();

    assert_eq!(message.text(), "Let me check.");
    assert_eq!(message.tool_calls.len(), 1);
    assert_eq!(message.tool_calls[0].id, "call_1");
    assert_eq!(message.tool_calls[0].name, "get_weather");
    assert_eq!(message.tool_calls[0].arguments, "{\"city\":\"Rome\"}");

    let requests = recorded.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert!(requests[0]
        .request_line
        .starts_with("POST /v1/chat/completions "));
    assert_eq!(requests[0].header("authorization"), Some("Bearer hf_test"));
    let payload = requests[0].json();
    assert_eq!(payload["model"], json!("test-model"));
    assert_eq!(payload["stream"], json!(true));
    assert_eq!(payload["tool_choice"], json!("auto"));
    assert_eq!(payload["tools"][0]["function"]["name"], json!("get_weather"));
}

#[tokio::test]
async fn chat_client_retries_transient_failures() {
    let body = sse(&[json!({"choices": [{"index": 0, "delta": {"content": "ok"}, "finish_reason": "stop"}]})]);
    let (base, recorded) = serve(vec![
        http_response("503 Service Unavailable", "text/plain", &[], "busy"),
        http_response("200 OK", "text/event-stream", &[], &body),
    ])
    .await;
    let client = ChatCompletionClient::new(base, "test-model")
        .unwrap()
        .with_retry_policy(fast_retry(1));

    let message = collect_message(&client, &[]).await.unwrap();

    assert_eq!(message.text(), "ok");
    let requests = recorded.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].header("authorization").is_none());
    assert!(requests[1].json().get("tools").is_none());
}

#[tokio::test]
async fn chat_client_does_not_retry_client_errors() {
    let (base, recorded) = serve(vec![http_response(
        "400 Bad Request",
        "application/json",
        &[],
        r#"{"error":"unknown model"}"#,
    )])
    .await;
    let client = ChatCompletionClient::new(base, "missing-model")
        .unwrap()
        .with_retry_policy(fast_retry(3));

    let err = collect_message(&client, &[]).await.unwrap_err();

    assert!(err.to_string().contains("unknown model"));
    assert_eq!(recorded.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn chat_client_surfaces_provider_errors_mid_stream() {
    let body = sse(&[
        json!({"choices": [{"index": 0, "delta": {"content": "par"}}]}),
        json!({"error": {"message": "model overloaded"}}),
    ]);
    let (base, _) = serve(vec![http_response("200 OK", "text/event-stream", &[], &body)]).await;
    let client = ChatCompletionClient::new(base, "test-model").unwrap();

    let err = collect_message(&client, &[]).await.unwrap_err();

    assert!(err.to_string().contains("model overloaded"));
}

#[tokio::test]
async fn http_transport_tracks_sessions_and_reads_sse_replies() {
    let initialize = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "result": {
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {"listChanged": false}},
            "serverInfo": {"name": "remote", "version": "1.0.0"}
        }
    });
    let list = json!({
        "jsonrpc": "2.0",
        "id": 2,
        "result": {"tools": [{"name": "search", "description": "Search the docs"}]}
    });
    let sse_body = format!(
        "event: message\ndata: {}\n\nevent: message\ndata: {list}\n\n",
        json!({"jsonrpc": "2.0", "method": "notifications/progress", "params": {}})
    );
    let (base, recorded) = serve(vec![
        http_response(
            "200 OK",
            "application/json",
            &[("mcp-session-id", "sess-42")],
            &initialize.to_string(),
        ),
        http_response("202 Accepted", "application/json", &[], ""),
        http_response("200 OK", "text/event-stream", &[], &sse_body),
    ])
    .await;
    let transport = HttpTransport::new(format!("{base}/mcp")).unwrap();
    let mut client = McpClient::new(transport);

    let tools = client.list_tools().await.unwrap();

    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "search");
    assert_eq!(client.server_info().unwrap().name, "remote");
    assert!(client.capabilities().unwrap().tools.is_some());

    let requests = recorded.lock().unwrap().clone();
    assert_eq!(requests.len(), 3);
    assert!(requests[0].request_line.starts_with("POST /mcp "));
    assert!(requests[0].header("mcp-session-id").is_none());
    assert!(requests[0]
        .header("accept")
        .unwrap()
        .contains("text/event-stream"));
    assert_eq!(requests[0].json()["params"]["protocolVersion"], json!("2024-11-05"));

    let notification = requests[1].json();
    assert_eq!(notification["method"], json!("notifications/initialized"));
    assert!(notification.get("id").is_none());
    assert_eq!(requests[1].header("mcp-session-id"), Some("sess-42"));
    assert_eq!(requests[2].header("mcp-session-id"), Some("sess-42"));

    // nobody is listening any more; termination is best effort
    client.close().await.unwrap();
}

#[tokio::test]
async fn http_transport_reports_error_statuses() {
    let (base, _) = serve(vec![http_response(
        "404 Not Found",
        "text/plain",
        &[],
        "no such endpoint",
    )])
    .await;
    let transport = HttpTransport::new(format!("{base}/mcp")).unwrap();

    let err = transport
        .send(toolloop::mcp::JsonRpcRequest::new("tools/list", None))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("404"));
}

/// An MCP server speaking the two-endpoint SSE scheme. POSTs get a bare 202;
/// replies travel over the GET stream. Before answering `tools/list` it pings
/// the client.
async fn serve_legacy_sse() -> (String, Arc<Mutex<Vec<Recorded>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let recorded = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&recorded);

    tokio::spawn(async move {
        let (events_tx, events_rx) = mpsc::unbounded_channel::<String>();
        let mut events_rx = Some(events_rx);
        let push = |message: Value| {
            events_tx
                .send(format!("event: message\ndata: {message}\n\n"))
                .unwrap();
        };

        while let Ok((mut stream, _)) = listener.accept().await {
            let request = read_request(&mut stream).await;
            log.lock().unwrap().push(request.clone());

            if request.request_line.starts_with("GET ") {
                let mut rx = events_rx.take().expect("one event stream per test");
                tokio::spawn(async move {
                    stream
                        .write_all(
                            b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncache-control: no-cache\r\nconnection: close\r\n\r\n",
                        )
                        .await
                        .unwrap();
                    stream
                        .write_all(b": connected\n\nevent: endpoint\ndata: /messages/?session_id=s1\n\n")
                        .await
                        .unwrap();
                    while let Some(event) = rx.recv().await {
                        if stream.write_all(event.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
                continue;
            }

            stream
                .write_all(http_response("202 Accepted", "text/plain", &[], "").as_bytes())
                .await
                .unwrap();
            stream.shutdown().await.ok();

            let message = request.json();
            let (Some(id), Some(method)) = (message.get("id"), message["method"].as_str()) else {
                continue;
            };
            let result = match method {
                "initialize" => json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "gradio"}
                }),
                "tools/list" => {
                    push(json!({"jsonrpc": "2.0", "id": "srv-ping", "method": "ping"}));
                    json!({"tools": [{"name": "sentiment_analysis", "description": "Score text"}]})
                }
                "tools/call" => json!({
                    "content": [{"type": "text", "text": format!("positive: {}", message["params"]["arguments"]["text"])}]
                }),
                _ => json!({}),
            };
            push(json!({"jsonrpc": "2.0", "id": id, "result": result}));
        }
    });

    (base, recorded)
}

#[tokio::test]
async fn sse_transport_posts_to_the_announced_endpoint() {
    let (base, recorded) = serve_legacy_sse().await;
    let mut client = McpClient::new(SseTransport::new(format!("{base}/gradio_api/mcp/sse")).unwrap());

    let tools = client.list_tools().await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "sentiment_analysis");
    assert_eq!(client.server_info().unwrap().name, "gradio");

    let result = client
        .call_tool("sentiment_analysis", json!({"text": "great"}))
        .await
        .unwrap();
    assert_eq!(result.flatten().content, "positive: \"great\"");

    let requests = recorded.lock().unwrap().clone();
    assert!(requests[0]
        .request_line
        .starts_with("GET /gradio_api/mcp/sse "));
    assert!(requests[0]
        .header("accept")
        .unwrap()
        .contains("text/event-stream"));
    let posts: Vec<&Recorded> = requests[1..].iter().collect();
    assert!(posts
        .iter()
        .all(|r| r.request_line.starts_with("POST /messages/?session_id=s1 ")));

    let methods: Vec<Value> = posts.iter().map(|r| r.json()["method"].clone()).collect();
    assert_eq!(methods[0], json!("initialize"));
    assert_eq!(methods[1], json!("notifications/initialized"));
    assert_eq!(methods[2], json!("tools/list"));
    // the ping is answered before the listing it preceded is delivered
    let pong = posts[3].json();
    assert_eq!(pong["id"], json!("srv-ping"));
    assert_eq!(pong["result"], json!({}));
    assert_eq!(methods[4], json!("tools/call"));

    client.close().await.unwrap();
    let err = client
        .call_tool("sentiment_analysis", json!({}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("closed"));
}

#[tokio::test]
async fn sse_transport_requires_an_endpoint_announcement() {
    let (base, _) = serve(vec![http_response(
        "200 OK",
        "text/event-stream",
        &[],
        "event: message\ndata: {}\n\n",
    )])
    .await;
    let transport = SseTransport::with_headers(
        format!("{base}/sse"),
        Default::default(),
        Duration::from_secs(2),
    )
    .unwrap();

    let err = transport
        .send(toolloop::mcp::JsonRpcRequest::new("tools/list", None))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("endpoint"));
    assert!(transport.endpoint().is_none());
}
