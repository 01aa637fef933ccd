use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use anyhow::Result as AnyResult;
use futures_util::{Stream, StreamExt};
use reqwest::{header::CONTENT_TYPE, RequestBuilder, Response};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{RelayError, Result},
    models::{default_models, ModelConfig, ModelInfo, UpstreamRequest, WireMessage},
    sse::{self, StreamFrame},
};

/**
 * \brief 中继会话向调用方投递的三种事件。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Delta(String),
    Done,
    Error(RelayError),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Delta(_))
    }
}

/**
 * \brief OpenAI 兼容上游的 HTTP 客户端。
 */
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base: String,
}

impl UpstreamClient {
    /**
     * \brief 创建客户端。
     * \param base 上游基地址，如 "https://api.siliconflow.cn/v1"
     * \param connect_timeout 建连超时；流式响应本身不设总超时
     */
    pub fn new(base: &str, connect_timeout: Duration) -> AnyResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }

    fn chat_request(&self, token: &str, body: &UpstreamRequest) -> RequestBuilder {
        self.http
            .post(self.endpoint("chat/completions"))
            .header(CONTENT_TYPE, "application/json")
            .bearer_auth(token)
            .json(body)
    }

    /**
     * \brief 开启一次流式转发。
     * \details 凭证为空或消息为空时立即失败，不发起任何网络请求；
     *          其余错误均通过返回会话的事件通道送达。需在 tokio 运行时内调用。
     */
    pub fn stream_chat(
        &self,
        token: &str,
        messages: &[WireMessage],
        config: &ModelConfig,
    ) -> Result<RelaySession> {
        check_request(token, messages)?;
        let request = self.chat_request(token, &UpstreamRequest::new(messages, config, true));
        Ok(RelaySession::spawn(request))
    }

    /**
     * \brief 非流式调用，返回上游完整的 JSON 响应。
     */
    pub async fn chat_once(
        &self,
        token: &str,
        messages: &[WireMessage],
        config: &ModelConfig,
    ) -> Result<Value> {
        check_request(token, messages)?;
        let resp = self
            .chat_request(token, &UpstreamRequest::new(messages, config, false))
            .send()
            .await
            .map_err(|e| RelayError::network(&e))?;
        let resp = check_status(resp).await?;
        resp.json::<Value>().await.map_err(|e| {
            if e.is_decode() {
                RelayError::Parse(format!("invalid completion body: {e}"))
            } else {
                RelayError::network(&e)
            }
        })
    }

    /**
     * \brief 列出上游可用模型。
     */
    pub async fn list_models(&self, token: &str) -> Result<Vec<ModelInfo>> {
        if token.trim().is_empty() {
            return Err(RelayError::auth(MISSING_KEY));
        }
        let resp = self
            .http
            .get(self.endpoint("models"))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| RelayError::network(&e))?;
        let resp = check_status(resp).await?;
        let v: Value = resp
            .json()
            .await
            .map_err(|e| RelayError::Parse(format!("invalid models body: {e}")))?;
        parse_model_list(&v)
    }

    /**
     * \brief 列出模型，任何失败都退化为静态默认列表。
     */
    pub async fn list_models_or_default(&self, token: &str) -> Vec<ModelInfo> {
        match self.list_models(token).await {
            Ok(models) => models,
            Err(e) => {
                tracing::warn!(error = %e, "list models failed, using default list");
                default_models()
            }
        }
    }
}

/** \brief 未提供凭证时的提示。 */
pub const MISSING_KEY: &str = "API key is not set";

fn check_request(token: &str, messages: &[WireMessage]) -> Result<()> {
    if token.trim().is_empty() {
        return Err(RelayError::auth(MISSING_KEY));
    }
    if messages.is_empty() {
        return Err(RelayError::validation("messages must not be empty"));
    }
    Ok(())
}

async fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = upstream_error_message(&body)
        .unwrap_or_else(|| format!("request failed: {}", status.as_u16()));
    tracing::warn!(status = status.as_u16(), %message, "upstream rejected request");
    Err(RelayError::Upstream {
        status: status.as_u16(),
        message,
    })
}

/**
 * \brief 从上游错误响应体中尽力提取可读信息。
 * \details 依次尝试 `error.message`、顶层 `message`、字符串形式的 `error`。
 */
pub fn upstream_error_message(body: &str) -> Option<String> {
    let v: Value = serde_json::from_str(body).ok()?;
    v.get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .or_else(|| v.get("message").and_then(|m| m.as_str()))
        .or_else(|| v.get("error").and_then(|e| e.as_str()))
        .filter(|m| !m.trim().is_empty())
        .map(|m| m.to_string())
}

fn parse_model_list(v: &Value) -> Result<Vec<ModelInfo>> {
    let arr = v
        .get("data")
        .and_then(|x| x.as_array())
        .ok_or_else(|| RelayError::Parse(format!("unexpected models payload: {v}")))?;
    Ok(arr
        .iter()
        .filter_map(|item| item.get("id").and_then(|s| s.as_str()))
        .map(|id| ModelInfo {
            id: id.to_string(),
            name: id.to_string(),
        })
        .collect())
}

/**
 * \brief 取消句柄，可多次调用。
 */
#[derive(Debug, Clone)]
pub struct AbortHandle {
    token: CancellationToken,
}

impl AbortHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/**
 * \brief 一次端到端的流式转发。
 * \details 后台任务驱动 Decoder → Extractor，按到达顺序投递 Delta；
 *          第一个 Done/Error 之后不再产出任何事件，剩余字节被丢弃。
 *          取消后（包括会话被 drop）连接被中断，之后不会再产出任何事件。
 */
#[derive(Debug)]
pub struct RelaySession {
    events: UnboundedReceiverStream<StreamEvent>,
    cancel: CancellationToken,
    finished: bool,
}

impl RelaySession {
    fn spawn(request: RequestBuilder) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = task_cancel.cancelled() => {
                    tracing::debug!("relay session cancelled");
                }
                _ = drive(request, tx) => {}
            }
        });
        Self {
            events: UnboundedReceiverStream::new(rx),
            cancel,
            finished: false,
        }
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            token: self.cancel.clone(),
        }
    }

    /** \brief 等待下一个事件；终止或取消后返回 None。 */
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.next().await
    }
}

impl Stream for RelaySession {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished || self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        match self.events.poll_next_unpin(cx) {
            Poll::Ready(Some(_)) if self.cancel.is_cancelled() => Poll::Ready(None),
            Poll::Ready(Some(event)) => {
                self.finished = event.is_terminal();
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RelaySession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn drive(request: RequestBuilder, tx: mpsc::UnboundedSender<StreamEvent>) {
    let terminal = match relay(request, &tx).await {
        Ok(()) => StreamEvent::Done,
        Err(RelayError::Cancelled) => return,
        Err(e) => {
            tracing::warn!(error = %e, "relay stream ended with error");
            StreamEvent::Error(e)
        }
    };
    let _ = tx.send(terminal);
}

async fn relay(request: RequestBuilder, tx: &mpsc::UnboundedSender<StreamEvent>) -> Result<()> {
    let resp = request.send().await.map_err(|e| RelayError::network(&e))?;
    let resp = check_status(resp).await?;
    let status = resp.status().as_u16();

    let lines = sse::frames(resp.bytes_stream());
    futures_util::pin_mut!(lines);
    let mut deltas = 0usize;
    while let Some(line) = lines.next().await {
        let line = line.map_err(|e| RelayError::network(&e))?;
        match sse::extract_frame(&line) {
            Some(StreamFrame::Delta(text)) => {
                deltas += 1;
                if tx.send(StreamEvent::Delta(text)).is_err() {
                    return Err(RelayError::Cancelled);
                }
            }
            Some(StreamFrame::Done) => {
                tracing::debug!(deltas, "upstream stream finished");
                return Ok(());
            }
            Some(StreamFrame::Malformed(message)) => {
                return Err(RelayError::Parse(message));
            }
            Some(StreamFrame::Error(message)) => {
                return Err(RelayError::Upstream { status, message });
            }
            None => {}
        }
    }
    tracing::debug!(deltas, "upstream closed without sentinel");
    Ok(())
}
