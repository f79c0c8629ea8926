use std::{convert::Infallible, net::SocketAddr};

use anyhow::{Context, Result};
use axum::{
    debug_handler,
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::post,
    Json, Router,
};
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{net::TcpListener, signal, sync::mpsc};
use tokio_stream::{wrappers::ReceiverStream, StreamExt};

use crate::{
    cli::CliArgs,
    rag::{DEFAULT_RAG_API_VERSION, DEFAULT_TOP},
    stream::{SseFramer, SseRecord},
};

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:3001";

#[derive(Clone)]
struct ServerState {
    client: reqwest::Client,
}

type SharedState = ServerState;

/// Run the local relay the Phi and DeepSeek families are reached through.
/// Credentials arrive per request; the relay itself stores none.
pub async fn run_relay(args: &CliArgs) -> Result<()> {
    let listen = args
        .listen
        .clone()
        .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_owned());
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("parsing listen address `{listen}`"))?;

    let client = reqwest::ClientBuilder::new()
        .connect_timeout(args.timeout())
        .build()
        .context("building relay HTTP client")?;
    let state = ServerState { client };

    let listener = TcpListener::bind(addr)
        .await
        .context("binding relay listen address")?;
    println!(
        "Relay listening on http://{}",
        listener.local_addr().unwrap_or(addr)
    );

    axum::serve(listener, relay_router(state))
        .with_graceful_shutdown(async {
            if let Err(err) = signal::ctrl_c().await {
                tracing::warn!("failed to listen for shutdown signal: {err:?}");
            }
            println!("Shutdown signal received; stopping relay...");
        })
        .await
        .context("running relay server")?;

    Ok(())
}

fn relay_router(state: ServerState) -> Router {
    Router::new()
        .route("/api/phi", post(phi_relay))
        .route("/api/deepseek", post(deepseek_relay))
        .route("/api/rag/search", post(rag_search_relay))
        .with_state(state)
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Serialize)]
struct ApiErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

struct ApiError {
    status: StatusCode,
    body: ApiErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, error_type: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ApiErrorBody {
                error: ApiErrorDetail {
                    message: message.into(),
                    error_type: error_type.to_string(),
                },
            },
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request_error", message)
    }

    fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!("internal relay error: {message}");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    fn upstream(status: u16, body: String) -> Self {
        let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
        let truncated = body.chars().take(5000).collect::<String>();
        tracing::warn!(
            "upstream model error status={} body_len={} snippet={}",
            status,
            body.len(),
            truncated
        );
        Self::new(
            if status_code.is_client_error() {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::BAD_GATEWAY
            },
            "upstream_error",
            format!("Upstream model error (status {status}): {truncated}"),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Chat relay request. The envelope fields are camelCase while the model
/// parameters keep the upstream API's snake_case names.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelayChatRequest {
    api_key: String,
    endpoint: String,
    deployment_id: Option<String>,
    model: Option<String>,
    messages: Value,
    #[serde(rename = "max_tokens")]
    max_tokens: Option<u32>,
    temperature: Option<f64>,
}

fn validate_chat_request(request: &RelayChatRequest) -> ApiResult<()> {
    if request.api_key.trim().is_empty() || request.endpoint.trim().is_empty() {
        return Err(ApiError::bad_request("API key and endpoint are required"));
    }
    Ok(())
}

/// The upstream body carries only model parameters; credentials and
/// endpoint never leave the headers and URL.
fn upstream_chat_body(request: &RelayChatRequest, stream: bool) -> Value {
    let model = request
        .model
        .as_deref()
        .or(request.deployment_id.as_deref())
        .unwrap_or_default();
    json!({
        "model": model,
        "messages": request.messages,
        "max_tokens": request.max_tokens.unwrap_or(1000),
        "temperature": request.temperature.unwrap_or(0.7),
        "stream": stream,
    })
}

/// Phi deployments answer a single JSON document; status and body are
/// forwarded untouched either way.
async fn phi_relay(
    State(state): State<SharedState>,
    Json(request): Json<RelayChatRequest>,
) -> Response {
    if let Err(err) = validate_chat_request(&request) {
        return err.into_response();
    }

    let url = format!(
        "{}/v1/chat/completions",
        request.endpoint.trim_end_matches('/')
    );
    tracing::debug!(url = %url, "forwarding phi request");

    let result = state
        .client
        .post(&url)
        .header("api-key", &request.api_key)
        .bearer_auth(&request.api_key)
        .json(&upstream_chat_body(&request, false))
        .send()
        .await;
    match result {
        Ok(response) => passthrough(response).await,
        Err(err) => ApiError::internal(format!("phi upstream request failed: {err}")).into_response(),
    }
}

/// DeepSeek deployments stream; upstream records are re-framed and
/// re-emitted downstream as they arrive.
#[debug_handler]
async fn deepseek_relay(
    State(state): State<SharedState>,
    Json(request): Json<RelayChatRequest>,
) -> Response {
    if let Err(err) = validate_chat_request(&request) {
        return err.into_response();
    }

    let url = format!("{}/chat/completions", request.endpoint.trim_end_matches('/'));
    tracing::debug!(url = %url, "forwarding deepseek request");

    let result = state
        .client
        .post(&url)
        .header("api-key", &request.api_key)
        .bearer_auth(&request.api_key)
        .header(ACCEPT, "text/event-stream")
        .json(&upstream_chat_body(&request, true))
        .send()
        .await;
    let response = match result {
        Ok(response) => response,
        Err(err) => {
            return ApiError::internal(format!("deepseek upstream request failed: {err}"))
                .into_response()
        }
    };

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return ApiError::upstream(status.as_u16(), body).into_response();
    }

    let (sender, receiver) = mpsc::channel::<String>(128);
    tokio::spawn(relay_stream_worker(response, sender));

    let stream = ReceiverStream::new(receiver)
        .map(|payload| Ok::<Event, Infallible>(Event::default().data(payload)));
    Sse::new(stream).into_response()
}

/// Re-emit upstream stream records, closing with the `[DONE]` sentinel even
/// when the upstream never sent one.
async fn relay_stream_worker(response: reqwest::Response, sender: mpsc::Sender<String>) {
    let mut upstream = response.bytes_stream();
    let mut framer = SseFramer::default();

    while let Some(item) = upstream.next().await {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::warn!("deepseek upstream stream failed: {err}");
                break;
            }
        };
        for record in framer.push(&chunk) {
            let payload = match record {
                SseRecord::Done => {
                    let _ = sender.send("[DONE]".to_owned()).await;
                    return;
                }
                SseRecord::Payload(payload) => payload,
            };
            if sender.send(payload).await.is_err() {
                return;
            }
        }
    }

    if let Some(SseRecord::Payload(payload)) = framer.flush() {
        let _ = sender.send(payload).await;
    }
    let _ = sender.send("[DONE]".to_owned()).await;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelaySearchBody {
    endpoint: String,
    index_name: String,
    api_key: String,
    api_version: Option<String>,
    query: String,
    top: Option<u32>,
    query_type: Option<String>,
    semantic_configuration: Option<String>,
    filter: Option<String>,
}

async fn rag_search_relay(
    State(state): State<SharedState>,
    Json(request): Json<RelaySearchBody>,
) -> Response {
    if request.endpoint.trim().is_empty()
        || request.index_name.trim().is_empty()
        || request.api_key.trim().is_empty()
    {
        return ApiError::bad_request("search endpoint, index name, and API key are required")
            .into_response();
    }

    let api_version = request
        .api_version
        .as_deref()
        .filter(|version| !version.trim().is_empty())
        .unwrap_or(DEFAULT_RAG_API_VERSION);
    let url = format!(
        "{}/indexes/{}/docs/search?api-version={}",
        request.endpoint.trim_end_matches('/'),
        request.index_name,
        api_version
    );
    tracing::debug!(url = %url, "forwarding index search");

    let mut body = json!({
        "search": request.query,
        "top": request.top.unwrap_or(DEFAULT_TOP),
        "queryType": request.query_type.as_deref().unwrap_or("simple"),
    });
    if let Some(semantic) = &request.semantic_configuration {
        body["semanticConfiguration"] = json!(semantic);
    }
    if let Some(filter) = &request.filter {
        body["filter"] = json!(filter);
    }

    let result = state
        .client
        .post(&url)
        .header("api-key", &request.api_key)
        .json(&body)
        .send()
        .await;
    match result {
        Ok(response) => passthrough(response).await,
        Err(err) => {
            ApiError::internal(format!("index search request failed: {err}")).into_response()
        }
    }
}

/// Forward upstream status and JSON body untouched; a non-JSON body is
/// wrapped so the response stays machine-readable.
async fn passthrough(response: reqwest::Response) -> Response {
    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<Value>(&body) {
        Ok(value) => (status, Json(value)).into_response(),
        Err(_) => {
            let truncated = body.chars().take(5000).collect::<String>();
            (status, Json(json!({ "error": truncated }))).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    async fn spawn_relay() -> SocketAddr {
        let state = ServerState {
            client: reqwest::Client::new(),
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, relay_router(state)).await.unwrap();
        });
        addr
    }

    fn chat_request(endpoint: &str) -> Value {
        json!({
            "apiKey": "k-123",
            "endpoint": endpoint,
            "deploymentId": "Phi-4",
            "model": "Phi-4",
            "messages": [
                { "role": "system", "content": "You are a helpful assistant." },
                { "role": "user", "content": "hello" }
            ],
            "max_tokens": 512,
            "temperature": 0.7
        })
    }

    #[test]
    fn upstream_body_never_carries_credentials() {
        let request = RelayChatRequest {
            api_key: "secret".to_owned(),
            endpoint: "https://upstream.example.net".to_owned(),
            deployment_id: Some("Phi-4".to_owned()),
            model: None,
            messages: json!([{ "role": "user", "content": "hi" }]),
            max_tokens: None,
            temperature: None,
        };
        let body = upstream_chat_body(&request, false);
        assert!(body.get("apiKey").is_none());
        assert!(body.get("endpoint").is_none());
        assert_eq!(body["model"], "Phi-4");
        assert_eq!(body["max_tokens"], 1000);
        assert_eq!(body["temperature"], 0.7);
        assert_eq!(body["stream"], false);
    }

    #[tokio::test]
    async fn phi_route_forwards_request_and_response() {
        let upstream = MockServer::start_async().await;
        let forwarded = upstream
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .header("api-key", "k-123")
                    .header("authorization", "Bearer k-123")
                    .json_body_partial(r#"{"model": "Phi-4", "max_tokens": 512, "stream": false}"#);
                then.status(200).json_body(json!({
                    "choices": [{ "message": { "content": "phi says hi" } }]
                }));
            })
            .await;

        let relay = spawn_relay().await;
        let response = reqwest::Client::new()
            .post(format!("http://{relay}/api/phi"))
            .json(&chat_request(&upstream.base_url()))
            .send()
            .await
            .unwrap();

        forwarded.assert_async().await;
        assert_eq!(response.status().as_u16(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["choices"][0]["message"]["content"], "phi says hi");
    }

    #[tokio::test]
    async fn phi_route_passes_upstream_error_through() {
        let upstream = MockServer::start_async().await;
        upstream
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(429)
                    .json_body(json!({ "error": { "code": "RateLimit" } }));
            })
            .await;

        let relay = spawn_relay().await;
        let response = reqwest::Client::new()
            .post(format!("http://{relay}/api/phi"))
            .json(&chat_request(&upstream.base_url()))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status().as_u16(), 429);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"]["code"], "RateLimit");
    }

    #[tokio::test]
    async fn rejects_request_without_credentials() {
        let relay = spawn_relay().await;
        let mut request = chat_request("https://upstream.example.net");
        request["apiKey"] = json!("");

        let response = reqwest::Client::new()
            .post(format!("http://{relay}/api/phi"))
            .json(&request)
            .send()
            .await
            .unwrap();

        assert_eq!(response.status().as_u16(), 400);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"]["type"], "invalid_request_error");
    }

    #[tokio::test]
    async fn deepseek_route_reemits_stream_with_sentinel() {
        let upstream = MockServer::start_async().await;
        let chunk = json!({ "choices": [{ "delta": { "content": "deep" } }] });
        upstream
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat/completions")
                    .json_body_partial(r#"{"stream": true}"#);
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(format!("data: {chunk}\n\ndata: [DONE]\n\n"));
            })
            .await;

        let relay = spawn_relay().await;
        let response = reqwest::Client::new()
            .post(format!("http://{relay}/api/deepseek"))
            .json(&chat_request(&upstream.base_url()))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status().as_u16(), 200);
        let text = response.text().await.unwrap();
        let done_position = text.find("data: [DONE]").unwrap();
        let chunk_position = text.find(&format!("data: {chunk}")).unwrap();
        assert!(chunk_position < done_position);
    }

    #[tokio::test]
    async fn deepseek_route_wraps_upstream_failure() {
        let upstream = MockServer::start_async().await;
        upstream
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(500).body("upstream exploded");
            })
            .await;

        let relay = spawn_relay().await;
        let response = reqwest::Client::new()
            .post(format!("http://{relay}/api/deepseek"))
            .json(&chat_request(&upstream.base_url()))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status().as_u16(), 502);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"]["type"], "upstream_error");
    }

    #[tokio::test]
    async fn search_route_forwards_to_index_with_defaults() {
        let upstream = MockServer::start_async().await;
        let forwarded = upstream
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/indexes/kb/docs/search")
                    .query_param("api-version", DEFAULT_RAG_API_VERSION)
                    .header("api-key", "sk-1")
                    .json_body_partial(r#"{"search": "how?", "top": 3, "queryType": "simple"}"#);
                then.status(200)
                    .json_body(json!({ "value": [{ "id": "d1", "content": "text" }] }));
            })
            .await;

        let relay = spawn_relay().await;
        let response = reqwest::Client::new()
            .post(format!("http://{relay}/api/rag/search"))
            .json(&json!({
                "endpoint": upstream.base_url(),
                "indexName": "kb",
                "apiKey": "sk-1",
                "query": "how?"
            }))
            .send()
            .await
            .unwrap();

        forwarded.assert_async().await;
        assert_eq!(response.status().as_u16(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["value"][0]["id"], "d1");
    }

    #[tokio::test]
    async fn search_route_includes_semantic_options_when_present() {
        let upstream = MockServer::start_async().await;
        let forwarded = upstream
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/indexes/kb/docs/search")
                    .json_body_partial(
                        r#"{"queryType": "semantic", "semanticConfiguration": "default", "filter": "lang eq 'en'"}"#,
                    );
                then.status(200).json_body(json!({ "value": [] }));
            })
            .await;

        let relay = spawn_relay().await;
        reqwest::Client::new()
            .post(format!("http://{relay}/api/rag/search"))
            .json(&json!({
                "endpoint": upstream.base_url(),
                "indexName": "kb",
                "apiKey": "sk-1",
                "query": "how?",
                "queryType": "semantic",
                "semanticConfiguration": "default",
                "filter": "lang eq 'en'"
            }))
            .send()
            .await
            .unwrap();

        forwarded.assert_async().await;
    }
}
