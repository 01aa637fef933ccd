use std::{any::Any, convert::Infallible};

use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::{
        header::{AUTHORIZATION, CONNECTION},
        HeaderMap, StatusCode,
    },
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer, trace::TraceLayer};

use crate::{
    config::RelayConfig,
    error::RelayError,
    llm::{RelaySession, StreamEvent, UpstreamClient},
    models::{ErrorEnvelope, ModelConfig, ModelList, WireMessage},
    sse::{self, DONE_SENTINEL},
    telemetry::mask_token,
};

/** \brief `/models` 条目中的 owned_by 字段。 */
pub const OWNED_BY: &str = "siliconflow";

/**
 * \brief 路由共享状态。
 */
#[derive(Debug, Clone)]
pub struct AppState {
    upstream: UpstreamClient,
}

impl AppState {
    pub fn new(upstream: UpstreamClient) -> Self {
        Self { upstream }
    }
}

/**
 * \brief 按配置启动中继服务，收到 Ctrl-C 后优雅退出。
 */
pub async fn run(config: &RelayConfig) -> Result<()> {
    let upstream = UpstreamClient::new(&config.upstream_base, config.connect_timeout)?;
    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    tracing::info!(addr = %config.addr, upstream = %config.upstream_base, "relay listening");
    axum::serve(listener, router(AppState::new(upstream)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("relay stopped");
    Ok(())
}

/**
 * \brief 在已绑定的监听器上提供服务，测试中用于随机端口。
 */
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> Result<()> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}

/**
 * \brief 构建路由；所有接口同时挂载在根路径与 `/v1` 下。
 */
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/chat/completions", post(chat_completions))
        .route("/models", get(list_models))
        .route("/health", get(health));

    Router::new()
        .merge(api.clone())
        .nest("/v1", api)
        .fallback(not_found)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/**
 * \brief 统一的 JSON 错误响应。
 */
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", "API key is not provided")
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "server_error", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorEnvelope::new(self.kind, self.message))).into_response()
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Auth(message) => {
                Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
            }
            RelayError::Validation(message) => Self::bad_request(message),
            RelayError::Upstream { status, message } => Self::new(
                StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
                "server_error",
                message,
            ),
            other => Self::internal(other.to_string()),
        }
    }
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!(detail, "handler panicked");
    ApiError::internal("internal server error").into_response()
}

/**
 * \brief 从 Authorization 头提取凭证，兼容不带 `Bearer ` 前缀的写法；scheme 不区分大小写。
 */
fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let token = match (raw.get(..6), raw.get(6..)) {
        (Some(scheme), Some(rest))
            if scheme.eq_ignore_ascii_case("bearer") && (rest.is_empty() || rest.starts_with(' ')) =>
        {
            rest.trim()
        }
        _ => raw,
    };
    (!token.is_empty()).then(|| token.to_string())
}

/**
 * \brief 聊天请求体。
 */
#[derive(Debug, Deserialize)]
pub struct ChatCompletionBody {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    messages: Vec<WireMessage>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default, rename = "maxTokens", alias = "max_tokens")]
    max_tokens: Option<u32>,
    #[serde(default)]
    stream: bool,
}

const MISSING_PARAMS: &str = "missing required request parameters";

/**
 * \brief POST /chat/completions：按 stream 标志选择流式或一次性转发。
 */
async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ChatCompletionBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let token = bearer_token(&headers).ok_or_else(ApiError::unauthorized)?;
    let Json(body) = body.map_err(|e| {
        tracing::debug!(error = %e, "rejected chat body");
        ApiError::bad_request(MISSING_PARAMS)
    })?;
    let model = body
        .model
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request(MISSING_PARAMS))?;
    if body.messages.is_empty() {
        return Err(ApiError::bad_request(MISSING_PARAMS));
    }

    let defaults = ModelConfig::default();
    let config = ModelConfig {
        model,
        temperature: body.temperature.unwrap_or(defaults.temperature),
        max_tokens: body.max_tokens.unwrap_or(defaults.max_tokens),
    };
    tracing::info!(
        token = %mask_token(&token),
        model = %config.model,
        messages = body.messages.len(),
        stream = body.stream,
        "chat request"
    );

    if body.stream {
        let session = state
            .upstream
            .stream_chat(&token, &body.messages, &config)?;
        Ok(stream_response(session, config.model).into_response())
    } else {
        let completion = state
            .upstream
            .chat_once(&token, &body.messages, &config)
            .await?;
        Ok(Json(completion).into_response())
    }
}

/**
 * \brief 把中继会话事件重新编码为 `data: <json>` 帧，以 `data: [DONE]` 结束。
 * \details 调用方断开时响应流被 drop，会话随之取消上游连接。
 */
fn stream_response(session: RelaySession, model: String) -> impl IntoResponse {
    let events = async_stream::stream! {
        let mut session = session;
        while let Some(event) = session.next_event().await {
            match event {
                StreamEvent::Delta(text) => {
                    yield Ok::<_, Infallible>(Event::default().data(sse::delta_payload(&model, &text)));
                }
                StreamEvent::Done => break,
                StreamEvent::Error(e) => {
                    tracing::warn!(error = %e, "relaying stream error to caller");
                    yield Ok(Event::default().data(sse::error_payload(&e.to_string())));
                    break;
                }
            }
        }
        yield Ok(Event::default().data(DONE_SENTINEL));
    };
    (
        [(CONNECTION, "keep-alive")],
        Sse::new(events).keep_alive(KeepAlive::new()),
    )
}

/**
 * \brief GET /models：上游失败时返回默认列表。
 */
async fn list_models(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ModelList>, ApiError> {
    let token = bearer_token(&headers).ok_or_else(ApiError::unauthorized)?;
    let models = state.upstream.list_models_or_default(&token).await;
    Ok(Json(ModelList::from_models(&models, OWNED_BY)))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok", "message": "service is running"}))
}

async fn not_found() -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "not_found", "route not found")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::{extract_frame, LineDecoder, StreamFrame};
    use axum::{body::Body, http::Request};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn app(base: &str) -> Router {
        let upstream = UpstreamClient::new(base, Duration::from_secs(5)).expect("client");
        router(AppState::new(upstream))
    }

    fn chat_request(token: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/chat/completions")
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).expect("request")
    }

    async fn body_text(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .expect("body");
        String::from_utf8(bytes.to_vec()).expect("utf8")
    }

    async fn body_json(resp: Response) -> Value {
        serde_json::from_str(&body_text(resp).await).expect("json body")
    }

    fn frames_of(text: &str) -> Vec<StreamFrame> {
        let mut decoder = LineDecoder::new();
        decoder
            .push(text.as_bytes())
            .iter()
            .filter_map(|l| extract_frame(l))
            .collect()
    }

    fn valid_body(stream: bool) -> Value {
        json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.5,
            "maxTokens": 64,
            "stream": stream
        })
    }

    #[tokio::test]
    async fn test_health_on_both_prefixes() {
        for uri in ["/health", "/v1/health"] {
            let resp = app("http://127.0.0.1:1")
                .oneshot(Request::get(uri).body(Body::empty()).expect("request"))
                .await
                .expect("response");
            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(body_json(resp).await["status"], "ok");
        }
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let resp = app("http://127.0.0.1:1")
            .oneshot(Request::get("/nope").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["error"]["type"], "not_found");
    }

    #[tokio::test]
    async fn test_missing_token_is_401() {
        let resp = app("http://127.0.0.1:1")
            .oneshot(chat_request(None, valid_body(true)))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let v = body_json(resp).await;
        assert_eq!(v["error"]["type"], "unauthorized");
        assert!(v["error"]["message"].is_string());
    }

    #[tokio::test]
    async fn test_missing_model_or_messages_is_400() {
        let bodies = [
            json!({"messages": [{"role": "user", "content": "hi"}]}),
            json!({"model": "gpt-4", "messages": []}),
            json!({"model": "gpt-4"}),
        ];
        for body in bodies {
            let resp = app("http://127.0.0.1:1")
                .oneshot(chat_request(Some("sk"), body))
                .await
                .expect("response");
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
            assert_eq!(body_json(resp).await["error"]["type"], "bad_request");
        }

        let malformed = Request::post("/chat/completions")
            .header("content-type", "application/json")
            .header("authorization", "Bearer sk")
            .body(Body::from("{oops"))
            .expect("request");
        let resp = app("http://127.0.0.1:1")
            .oneshot(malformed)
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stream_is_resynthesized() {
        let server = MockServer::start().await;
        let upstream_body = format!(
            "data: {}\n\ndata: {}\n\ndata: {}\n\ndata: [DONE]\n\n",
            json!({"choices":[{"delta":{"role":"assistant"}}]}),
            json!({"choices":[{"delta":{"content":"He"}}]}),
            json!({"choices":[{"delta":{"content":"llo"}}]}),
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-live"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(upstream_body, "text/event-stream"))
            .mount(&server)
            .await;

        let resp = app(&server.uri())
            .oneshot(chat_request(Some("sk-live"), valid_body(true)))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "text/event-stream");
        assert_eq!(resp.headers()["cache-control"], "no-cache");
        assert_eq!(resp.headers()["connection"], "keep-alive");

        let text = body_text(resp).await;
        assert!(text.contains("\"object\":\"chat.completion.chunk\""));
        assert!(text.contains("\"model\":\"gpt-4\""));
        assert_eq!(
            frames_of(&text),
            vec![
                StreamFrame::Delta("He".into()),
                StreamFrame::Delta("llo".into()),
                StreamFrame::Done
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_error_is_framed_then_done() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(json!({"error":{"message":"invalid key"}})),
            )
            .mount(&server)
            .await;

        let resp = app(&server.uri())
            .oneshot(chat_request(Some("sk-bad"), valid_body(true)))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(text.contains("\"type\":\"server_error\""));
        assert_eq!(
            frames_of(&text),
            vec![StreamFrame::Error("invalid key".into()), StreamFrame::Done]
        );
        assert!(text.trim_end().ends_with("data: [DONE]"));
    }

    #[tokio::test]
    async fn test_non_stream_forwards_completion() {
        let server = MockServer::start().await;
        let completion = json!({
            "id": "c1",
            "object": "chat.completion",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "pong"}, "finish_reason": "stop"}]
        });
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion.clone()))
            .mount(&server)
            .await;

        let resp = app(&server.uri())
            .oneshot(chat_request(Some("sk"), valid_body(false)))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, completion);
    }

    #[tokio::test]
    async fn test_non_stream_mirrors_upstream_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(429).set_body_json(json!({"error":{"message":"rate limited"}})),
            )
            .mount(&server)
            .await;

        let resp = app(&server.uri())
            .oneshot(chat_request(Some("sk"), valid_body(false)))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        let v = body_json(resp).await;
        assert_eq!(v["error"]["type"], "server_error");
        assert_eq!(v["error"]["message"], "rate limited");
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_500() {
        let resp = app("http://127.0.0.1:1")
            .oneshot(chat_request(Some("sk"), valid_body(false)))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(resp).await["error"]["type"], "server_error");
    }

    #[tokio::test]
    async fn test_models_requires_token_and_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let resp = app(&server.uri())
            .oneshot(Request::get("/v1/models").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app(&server.uri())
            .oneshot(
                Request::get("/models")
                    .header("authorization", "Bearer sk")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["object"], "list");
        let data = v["data"].as_array().expect("data");
        assert_eq!(data.len(), 2);
        assert_eq!(data[0]["object"], "model");
        assert_eq!(data[0]["owned_by"], OWNED_BY);
    }

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(AUTHORIZATION, "Bearer   ".parse().expect("header"));
        assert_eq!(bearer_token(&headers), None);
        headers.insert(AUTHORIZATION, "Bearer sk-1".parse().expect("header"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("sk-1"));
        headers.insert(AUTHORIZATION, "sk-raw".parse().expect("header"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("sk-raw"));
        headers.insert(AUTHORIZATION, "bearer sk-2".parse().expect("header"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("sk-2"));
        headers.insert(AUTHORIZATION, "BEARER sk-3".parse().expect("header"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("sk-3"));
        headers.insert(AUTHORIZATION, "bearer".parse().expect("header"));
        assert_eq!(bearer_token(&headers), None);
    }
}
