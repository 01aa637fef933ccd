use std::{fs::OpenOptions, sync::Mutex};

use anyhow::Result;
use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt::time::UtcTime, EnvFilter};

use crate::config::LogConfig;

/** \brief 日志目录下的文件名。 */
pub const LOG_FILE: &str = "chatrelay.log";

static INIT: OnceCell<()> = OnceCell::new();

/**
 * \brief 安装全局 tracing 订阅者，重复调用无副作用。
 * \details `RUST_LOG` 优先于配置中的过滤指令；配置了目录时追加写入日志文件。
 */
pub fn init(config: &LogConfig) -> Result<()> {
    INIT.get_or_try_init(|| -> Result<()> {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.filter))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(UtcTime::rfc_3339());

        let installed = match &config.dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join(LOG_FILE))?;
                builder
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .try_init()
            }
            None => builder.with_writer(std::io::stderr).try_init(),
        };
        if let Err(e) = installed {
            eprintln!("tracing subscriber already installed: {}", e);
        }
        Ok(())
    })?;
    Ok(())
}

/**
 * \brief 日志中仅保留凭证末 4 位。
 */
pub fn mask_token(token: &str) -> String {
    if token.is_empty() {
        return "<empty>".to_string();
    }
    let tail: String = token
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("***{}", tail)
}
