use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::{path::Path, sync::Mutex, thread, time::Duration};

use crate::settings::SecretStore;

/**
 * \brief 打开 `path` 处的设置数据库。
 */
pub fn open_db(path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建设置存储所需的表。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS settings (
            scope TEXT NOT NULL,
            key   TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (scope, key)
        );
        "#,
        )
    })?;
    Ok(())
}

/**
 * \brief 读取一个设置槽位。
 */
pub fn get_setting(conn: &Connection, scope: &str, key: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM settings WHERE scope=?1 AND key=?2",
        params![scope, key],
        |row| row.get(0),
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 写入一个设置槽位，覆盖旧值。
 */
pub fn set_setting(conn: &Connection, scope: &str, key: &str, value: &str) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO settings (scope, key, value) VALUES (?1, ?2, ?3)
         ON CONFLICT(scope, key) DO UPDATE SET value=excluded.value",
            params![scope, key, value],
        )
    })?;
    Ok(())
}

/**
 * \brief 基于 SQLite 的 `SecretStore`，值以明文保存。
 */
pub struct SqliteSecretStore {
    conn: Mutex<Connection>,
}

impl SqliteSecretStore {
    /** \brief 打开并迁移 `path` 处的数据库文件。 */
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = open_db(path)?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| anyhow!("settings database lock poisoned"))?;
        f(&guard)
    }
}

impl SecretStore for SqliteSecretStore {
    fn get(&self, scope: &str, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| get_setting(conn, scope, key))
    }

    fn set(&self, scope: &str, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| set_setting(conn, scope, key, value))
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
    for attempt in 0..=MAX_RETRIES {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                let backoff = Duration::from_millis(200 * (attempt as u64 + 1));
                thread::sleep(backoff);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("retry_on_locked should have returned within the loop");
}
