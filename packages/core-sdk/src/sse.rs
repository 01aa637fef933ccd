use async_stream::try_stream;
use futures_util::{Stream, StreamExt};
use serde_json::Value;

use crate::models::{ChatCompletionChunk, ErrorEnvelope};

/** \brief 事件数据行前缀。 */
pub const DATA_PREFIX: &str = "data: ";
/** \brief 流结束哨兵。 */
pub const DONE_SENTINEL: &str = "[DONE]";
/** \brief 帧 JSON 解析失败时的错误消息。 */
pub const PARSE_FAILED: &str = "parse failed";
/** \brief 上游错误帧缺少 message 时的兜底文案。 */
pub const UPSTREAM_FAILED: &str = "API request failed";

/**
 * \brief 解码后在 Decoder/Extractor/Relay 之间流转的单元。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    Delta(String),
    Done,
    /** \brief 上游发送的错误帧。 */
    Error(String),
    /** \brief 帧负载不是合法 JSON。 */
    Malformed(String),
}

impl StreamFrame {
    /** \brief Done/Error 出现后不再处理后续帧。 */
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamFrame::Delta(_))
    }
}

/**
 * \brief 跨 chunk 边界累积字节并按 `\n` 切分出完整行。
 * \details 以字节为单位缓存，多字节 UTF-8 字符被拆分到两个 chunk 时也能正确还原；
 *          空行是帧分隔符，不会输出；行尾的 `\r` 会被去掉。
 */
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /** \brief 追加一个 chunk，返回其中所有完整的非空行。 */
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let Some(last_newline) = self.buf.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };
        let complete: Vec<u8> = self.buf.drain(..=last_newline).collect();
        complete
            .split(|b| *b == b'\n')
            .filter_map(|raw| {
                let text = String::from_utf8_lossy(raw);
                let text = text.strip_suffix('\r').unwrap_or(&text);
                if text.trim().is_empty() {
                    None
                } else {
                    Some(text.to_string())
                }
            })
            .collect()
    }

    /** \brief 尚未遇到换行的残留字节数；连接关闭时这部分直接丢弃。 */
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/**
 * \brief 将传输层的字节流转换为按序输出的帧文本流。
 * \details 一个连接对应一个实例，上游关闭即结束，末尾不完整的行被丢弃。
 */
pub fn frames<S, B, E>(stream: S) -> impl Stream<Item = Result<String, E>> + Send
where
    S: Stream<Item = Result<B, E>> + Send,
    B: AsRef<[u8]> + Send,
    E: Send,
{
    try_stream! {
        futures_util::pin_mut!(stream);
        let mut decoder = LineDecoder::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for line in decoder.push(chunk.as_ref()) {
                yield line;
            }
        }
        if decoder.pending() > 0 {
            tracing::debug!(bytes = decoder.pending(), "discarding partial frame at end of stream");
        }
    }
}

/**
 * \brief 解析单行帧。
 * \return 非 `data: ` 行或无可用内容时返回 None；否则返回 Delta/Done/Error。
 */
pub fn extract_frame(line: &str) -> Option<StreamFrame> {
    let payload = line.strip_prefix(DATA_PREFIX)?;
    if payload == DONE_SENTINEL {
        return Some(StreamFrame::Done);
    }
    let value: Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "stream frame is not valid json");
            return Some(StreamFrame::Malformed(PARSE_FAILED.to_string()));
        }
    };
    if let Some(err) = value.get("error").filter(|e| !e.is_null()) {
        return Some(StreamFrame::Error(error_message(err)));
    }
    value
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(|s| StreamFrame::Delta(s.to_string()))
}

fn error_message(err: &Value) -> String {
    err.get("message")
        .and_then(|m| m.as_str())
        .or_else(|| err.as_str())
        .filter(|m| !m.is_empty())
        .unwrap_or(UPSTREAM_FAILED)
        .to_string()
}

/** \brief 出站增量帧的 JSON 负载（不含 `data: ` 前缀）。 */
pub fn delta_payload(model: &str, content: &str) -> String {
    serde_json::to_string(&ChatCompletionChunk::delta(model, content))
        .unwrap_or_else(|_| String::from("{}"))
}

/** \brief 出站错误帧的 JSON 负载。 */
pub fn error_payload(message: &str) -> String {
    serde_json::to_string(&ErrorEnvelope::new("server_error", message))
        .unwrap_or_else(|_| String::from("{}"))
}

/** \brief 组装完整的一帧 `data: <payload>\n\n`。 */
pub fn encode_frame(payload: &str) -> String {
    format!("{DATA_PREFIX}{payload}\n\n")
}
