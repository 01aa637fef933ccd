use std::{io::Write, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use chatrelay_core_sdk::{
    config::{self, RelayConfig},
    prelude::*,
    telemetry::mask_token,
};

/**
 * \brief CLI 程序入口：本地中继服务与终端聊天客户端。
 */
#[derive(Parser, Debug)]
#[command(name = "chatrelay", version, about = "ChatRelay streaming chat relay")]
struct Cli {
    /// 本地状态数据库路径
    #[arg(long, global = true, env = config::ENV_DB)]
    db: Option<PathBuf>,

    /// 上游（或中继）基地址，不含路由后缀
    #[arg(long, global = true, env = config::ENV_UPSTREAM_BASE)]
    base: Option<String>,

    /// 日志过滤指令
    #[arg(long, global = true, env = config::ENV_LOG)]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 启动中继 HTTP 服务。
     */
    Serve {
        #[arg(long, env = config::ENV_ADDR)]
        addr: Option<String>,
        /// 上游连接超时（秒）
        #[arg(long)]
        connect_timeout: Option<u64>,
    },

    /**
     * \brief 在当前会话中发送一条消息并流式显示回复，Ctrl-C 停止。
     */
    Chat {
        #[arg(long)]
        prompt: String,
        /// 在新会话中发送
        #[arg(long, default_value_t = false)]
        new_session: bool,
    },

    /** \brief 管理 API Key。 */
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },

    /**
     * \brief 查看或修改模型参数；不带参数时打印当前配置。
     */
    Model {
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        temperature: Option<f32>,
        #[arg(long)]
        max_tokens: Option<u32>,
        /// 恢复默认配置并清除 API Key
        #[arg(long, default_value_t = false)]
        reset: bool,
    },

    /** \brief 列出可用模型。 */
    Models,

    /** \brief 管理聊天会话。 */
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Subcommand, Debug)]
enum KeyAction {
    Set { key: String },
    Show,
    Clear,
}

#[derive(Subcommand, Debug)]
enum SessionAction {
    List,
    New,
    Switch { id: String },
    Delete { id: String },
    Rename { id: String, title: String },
    /// 打印当前会话的消息
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = RelayConfig::from_env();
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    if let Some(base) = cli.base {
        config.upstream_base = base;
    }
    if let Some(filter) = cli.log {
        config.log.filter = filter;
    }
    telemetry::init(&config.log).context("init logging failed")?;

    match cli.command {
        Commands::Serve {
            addr,
            connect_timeout,
        } => {
            if let Some(addr) = addr {
                config.addr = addr;
            }
            if let Some(secs) = connect_timeout {
                config.connect_timeout = Duration::from_secs(secs);
            }
            server::run(&config).await
        }
        command => run_client(&config, command).await,
    }
}

/**
 * \brief 客户端子命令：共用同一个本地数据库与上游客户端。
 */
async fn run_client(config: &RelayConfig, command: Commands) -> Result<()> {
    let storage = Storage::open(&config.db_path)
        .with_context(|| format!("open database {} failed", config.db_path.display()))?;
    let upstream = UpstreamClient::new(&config.upstream_base, config.connect_timeout)
        .context("build http client failed")?;
    let mut client = ChatClient::new(storage, upstream);

    match command {
        Commands::Chat {
            prompt,
            new_session,
        } => {
            if new_session {
                let id = client.chat.create_session();
                println!("Created session id={}", id);
            }
            tracing::info!(
                key = %mask_token(client.settings.api_key()),
                model = %client.settings.model_config().model,
                prompt_len = prompt.len(),
                "cli.chat"
            );
            let (turn, session) = client.start_turn(&prompt).context("send message failed")?;

            let stop = client.abort_handle().context("turn has no stop handle")?;
            let watcher = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    stop.cancel();
                }
            });
            let outcome = client
                .drive_turn(turn, session, |delta| {
                    print!("{}", delta);
                    std::io::stdout().flush().ok();
                })
                .await;
            watcher.abort();
            println!();

            match outcome {
                TurnOutcome::Completed => {}
                TurnOutcome::Cancelled => eprintln!("(stopped)"),
                TurnOutcome::Failed(e) => return Err(e).context("stream error"),
            }
        }
        Commands::Key { action } => match action {
            KeyAction::Set { key } => {
                client.settings.set_api_key(&key);
                println!("Saved key {}", mask_token(client.settings.api_key()));
            }
            KeyAction::Show => println!("{}", mask_token(client.settings.api_key())),
            KeyAction::Clear => {
                client.settings.set_api_key("");
                println!("Key cleared");
            }
        },
        Commands::Model {
            model,
            temperature,
            max_tokens,
            reset,
        } => {
            if reset {
                client.settings.reset();
            }
            let patch = ModelConfigPatch {
                model,
                temperature,
                max_tokens,
            };
            if patch != ModelConfigPatch::default() {
                client
                    .settings
                    .set_model_config(&patch)
                    .context("update model config failed")?;
            }
            let cfg = client.settings.model_config();
            println!(
                "model={} temperature={} max_tokens={}",
                cfg.model, cfg.temperature, cfg.max_tokens
            );
        }
        Commands::Models => {
            let upstream = client.upstream().clone();
            client.settings.fetch_available_models(&upstream).await;
            if let Some(note) = client.settings.error() {
                eprintln!("{}", note);
            }
            for m in client.settings.available_models() {
                println!("{}\t{}", m.id, m.name);
            }
        }
        Commands::Sessions { action } => run_sessions(&mut client.chat, action)?,
        Commands::Serve { .. } => {}
    }

    Ok(())
}

fn run_sessions(chat: &mut ChatStore, action: SessionAction) -> Result<()> {
    match action {
        SessionAction::List => {
            for s in chat.sessions() {
                let marker = if s.id == chat.current_session_id() { "*" } else { " " };
                println!("{} {}\t{}\t({} messages)", marker, s.id, s.title, s.messages.len());
            }
        }
        SessionAction::New => println!("Created session id={}", chat.create_session()),
        SessionAction::Switch { id } => chat.switch_session(&id).context("switch session failed")?,
        SessionAction::Delete { id } => chat.delete_session(&id),
        SessionAction::Rename { id, title } => chat.update_session_title(&id, &title),
        SessionAction::Show => {
            let session = chat.current_session().context("no current session")?;
            println!("# {}", session.title);
            for m in &session.messages {
                match m.response_time_ms {
                    Some(ms) => println!("[{}] {} ({} ms)", m.role.as_str(), m.content, ms),
                    None => println!("[{}] {}", m.role.as_str(), m.content),
                }
            }
        }
    }
    Ok(())
}
