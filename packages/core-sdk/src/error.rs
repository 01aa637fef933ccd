use thiserror::Error;

/**
 * \brief 中继与客户端共享的错误分类。
 * \details 校验类错误（Auth/Validation）在任何网络请求前同步返回；
 *          Upstream/Network/Parse 在流式过程中通过事件通道送达调用方。
 */
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /** \brief 缺失或无效的凭证。 */
    #[error("{0}")]
    Auth(String),
    /** \brief 内容为空、缺少必要字段等。 */
    #[error("{0}")]
    Validation(String),
    /** \brief 上游返回非 2xx，message 为尽力提取的可读信息。 */
    #[error("{message}")]
    Upstream { status: u16, message: String },
    /** \brief 流式帧无法解析。 */
    #[error("{0}")]
    Parse(String),
    /** \brief 连接拒绝、DNS、超时等传输层错误。 */
    #[error("{0}")]
    Network(String),
    /** \brief 调用方主动取消，不作为失败展示给用户。 */
    #[error("request cancelled")]
    Cancelled,
}

impl RelayError {
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /** \brief 传输层失败统一对外暴露通用消息，细节只写日志。 */
    pub fn network(err: &reqwest::Error) -> Self {
        tracing::warn!(error = %err, timeout = err.is_timeout(), connect = err.is_connect(), "upstream transport failure");
        Self::Network(NETWORK_FAILED.to_string())
    }
}

/** \brief 传输层失败时的通用提示。 */
pub const NETWORK_FAILED: &str = "network request failed";

pub type Result<T> = std::result::Result<T, RelayError>;
