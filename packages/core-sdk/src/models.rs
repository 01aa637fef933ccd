use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{RelayError, Result};

/**
 * \brief 会话内消息角色。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/**
 * \brief 会话中的一条消息。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /** \brief 消息唯一标识 */
    pub id: String,
    /** \brief 角色：user/assistant */
    pub role: Role,
    /** \brief 正文，助手消息在流式期间持续追加 */
    pub content: String,
    /** \brief 创建时间（毫秒时间戳） */
    pub timestamp: i64,
    /** \brief 助手回复耗时（毫秒） */
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "time")]
    pub response_time_ms: Option<u64>,
    /** \brief token 数量（上游提供时） */
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "tokens")]
    pub token_count: Option<u32>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            role,
            content: content.into(),
            timestamp: now_millis(),
            response_time_ms: None,
            token_count: None,
        }
    }

    pub fn to_wire(&self) -> WireMessage {
        WireMessage {
            role: self.role.as_str().to_string(),
            content: self.content.clone(),
        }
    }
}

/**
 * \brief 聊天会话，独占其消息列表。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub title: String,
    pub messages: Vec<ChatMessage>,
    pub created_at: i64,
    pub updated_at: i64,
}

/** \brief 新会话的默认标题。 */
pub const DEFAULT_SESSION_TITLE: &str = "New chat";

impl ChatSession {
    pub fn new() -> Self {
        let now = now_millis();
        Self {
            id: new_id(),
            title: DEFAULT_SESSION_TITLE.to_string(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}

/**
 * \brief 模型参数配置，独立于会话持久化。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub model: String,
    pub temperature: f32,
    #[serde(alias = "max_tokens")]
    pub max_tokens: u32,
}

pub const TEMPERATURE_RANGE: std::ops::RangeInclusive<f32> = 0.0..=2.0;
pub const MAX_TOKENS_RANGE: std::ops::RangeInclusive<u32> = 1..=4096;

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: "gpt-3.5-turbo".to_string(),
            temperature: 0.7,
            max_tokens: 1000,
        }
    }
}

impl ModelConfig {
    /**
     * \brief 校验取值范围：temperature ∈ [0,2]，maxTokens ∈ [1,4096]，模型名非空。
     */
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(RelayError::validation("model must not be empty"));
        }
        if !TEMPERATURE_RANGE.contains(&self.temperature) {
            return Err(RelayError::validation(format!(
                "temperature must be within [0, 2], got {}",
                self.temperature
            )));
        }
        if !MAX_TOKENS_RANGE.contains(&self.max_tokens) {
            return Err(RelayError::validation(format!(
                "maxTokens must be within [1, 4096], got {}",
                self.max_tokens
            )));
        }
        Ok(())
    }
}

/**
 * \brief 与 OpenAI Chat 消息格式对齐的线上消息。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    /** \brief 角色 */
    pub role: String,
    /** \brief 内容 */
    pub content: String,
}

impl WireMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role: role.as_str().to_string(),
            content: content.into(),
        }
    }
}

/**
 * \brief 发往上游的请求体，每次调用新建，发送后不再修改。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpstreamRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
}

impl UpstreamRequest {
    pub fn new(messages: &[WireMessage], config: &ModelConfig, stream: bool) -> Self {
        Self {
            model: config.model.clone(),
            messages: messages.to_vec(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            stream,
        }
    }
}

/**
 * \brief 可选模型条目。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
}

/**
 * \brief 获取模型列表失败时使用的静态列表。
 */
pub fn default_models() -> Vec<ModelInfo> {
    vec![
        ModelInfo {
            id: "gpt-3.5-turbo".to_string(),
            name: "GPT-3.5 Turbo".to_string(),
        },
        ModelInfo {
            id: "gpt-4".to_string(),
            name: "GPT-4".to_string(),
        },
    ]
}

/**
 * \brief 中继向调用方重新合成的流式分片。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ChatCompletionChunk {
    pub fn delta(model: &str, content: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", now_millis()),
            object: "chat.completion.chunk".to_string(),
            created: now_secs(),
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    content: Some(content.to_string()),
                },
                finish_reason: None,
            }],
        }
    }
}

/**
 * \brief 统一错误信封：`{error:{message,type,param,code}}`。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub param: Option<String>,
    pub code: Option<String>,
}

impl ErrorEnvelope {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                message: message.into(),
                kind: kind.to_string(),
                param: None,
                code: None,
            },
        }
    }
}

/**
 * \brief `GET /models` 的响应体。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

impl ModelList {
    pub fn from_models(models: &[ModelInfo], owned_by: &str) -> Self {
        let created = now_secs();
        Self {
            object: "list".to_string(),
            data: models
                .iter()
                .map(|m| ModelEntry {
                    id: m.id.clone(),
                    object: "model".to_string(),
                    created,
                    owned_by: owned_by.to_string(),
                })
                .collect(),
        }
    }
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn now_secs() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
