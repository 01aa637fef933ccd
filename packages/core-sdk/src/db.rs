use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    path::Path,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

/** \brief 凭证字符串。 */
pub const KEY_API_KEY: &str = "chatrelay-api-key";
/** \brief 用户配置（含 ModelConfig）。 */
pub const KEY_USER_CONFIG: &str = "chatrelay-user-config";
/** \brief 有序会话列表。 */
pub const KEY_CHAT_SESSIONS: &str = "chatrelay-chat-sessions";
/** \brief 当前会话 ID。 */
pub const KEY_CURRENT_SESSION: &str = "chatrelay-current-session";

/**
 * \brief 打开指定路径的数据库文件。
 */
pub fn open_db(path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建键值表。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS blobs (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
        )
    })?;
    Ok(())
}

/**
 * \brief 以 JSON 序列化写入一个键。
 */
pub fn save_blob<T: Serialize + ?Sized>(conn: &Connection, key: &str, value: &T) -> Result<()> {
    let text = serde_json::to_string(value)?;
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO blobs (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, text],
        )
    })?;
    Ok(())
}

/**
 * \brief 读取原始文本，键不存在时返回 None。
 */
pub fn load_raw(conn: &Connection, key: &str) -> Result<Option<String>> {
    let val = conn
        .query_row(
            "SELECT value FROM blobs WHERE key=?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(val)
}

/**
 * \brief 读取并反序列化一个键；缺失或损坏时返回默认值。
 */
pub fn load_blob<T: DeserializeOwned>(conn: &Connection, key: &str, default: T) -> T {
    match load_raw(conn, key) {
        Ok(Some(text)) => match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key, error = %e, "stored blob is corrupt, using default");
                default
            }
        },
        Ok(None) => default,
        Err(e) => {
            tracing::warn!(key, error = %e, "reading blob failed, using default");
            default
        }
    }
}

/**
 * \brief 删除一个键，不存在时静默成功。
 */
pub fn remove_blob(conn: &Connection, key: &str) -> Result<()> {
    retry_on_locked(|| conn.execute("DELETE FROM blobs WHERE key=?1", params![key]))?;
    Ok(())
}

/**
 * \brief 两个状态模块共享的存储句柄。
 * \details 写入失败只记录日志（尽力而为的本地持久化），读取失败回退默认值。
 */
#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    /** \brief 打开文件数据库并完成迁移。 */
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = open_db(path)?;
        Self::from_connection(conn)
    }

    /** \brief 内存数据库，用于测试和临时会话。 */
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| anyhow!("storage lock poisoned"))?;
        f(&guard)
    }

    pub fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.with_conn(|conn| save_blob(conn, key, value))
    }

    /** \brief 保存失败仅告警。 */
    pub fn save_best_effort<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        if let Err(e) = self.save(key, value) {
            tracing::warn!(key, error = %e, "persisting blob failed");
        }
    }

    pub fn load_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        match self.conn.lock() {
            Ok(guard) => load_blob(&guard, key, default),
            Err(_) => {
                tracing::warn!(key, "storage lock poisoned, using default");
                default
            }
        }
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.with_conn(|conn| remove_blob(conn, key))
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并线性退避，最多尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                attempt += 1;
                thread::sleep(Duration::from_millis(200 * attempt as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
}
