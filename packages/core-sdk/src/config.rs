use std::{path::PathBuf, time::Duration};

pub const ENV_ADDR: &str = "CHATRELAY_ADDR";
pub const ENV_UPSTREAM_BASE: &str = "CHATRELAY_UPSTREAM_BASE";
pub const ENV_CONNECT_TIMEOUT: &str = "CHATRELAY_CONNECT_TIMEOUT";
pub const ENV_DB: &str = "CHATRELAY_DB";
pub const ENV_LOG: &str = "CHATRELAY_LOG";
pub const ENV_LOG_DIR: &str = "CHATRELAY_LOG_DIR";

pub const DEFAULT_ADDR: &str = "127.0.0.1:3001";
pub const DEFAULT_UPSTREAM_BASE: &str = "https://api.siliconflow.cn/v1";
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_DB_PATH: &str = "chatrelay.db";
pub const DEFAULT_LOG_FILTER: &str = "info";

/**
 * \brief 日志配置。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /** \brief EnvFilter 指令，`RUST_LOG` 优先 */
    pub filter: String,
    /** \brief 日志目录；为空时输出到 stderr */
    pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            dir: None,
        }
    }
}

/**
 * \brief 中继进程的运行配置。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /** \brief 监听地址 */
    pub addr: String,
    /** \brief 上游 OpenAI 兼容 API 基地址 */
    pub upstream_base: String,
    /** \brief 上游建连超时 */
    pub connect_timeout: Duration,
    /** \brief 本地数据库文件 */
    pub db_path: PathBuf,
    pub log: LogConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            upstream_base: DEFAULT_UPSTREAM_BASE.to_string(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            log: LogConfig::default(),
        }
    }
}

impl RelayConfig {
    /**
     * \brief 从环境变量读取，未设置的项使用默认值。
     */
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let connect_timeout = match var(ENV_CONNECT_TIMEOUT) {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    tracing::warn!(value = %raw, "invalid {}, using default", ENV_CONNECT_TIMEOUT);
                    defaults.connect_timeout
                }
            },
            None => defaults.connect_timeout,
        };

        Self {
            addr: var(ENV_ADDR).unwrap_or(defaults.addr),
            upstream_base: var(ENV_UPSTREAM_BASE).unwrap_or(defaults.upstream_base),
            connect_timeout,
            db_path: var(ENV_DB).map(PathBuf::from).unwrap_or(defaults.db_path),
            log: LogConfig {
                filter: var(ENV_LOG).unwrap_or(defaults.log.filter),
                dir: var(ENV_LOG_DIR).map(PathBuf::from),
            },
        }
    }
}
