use std::{
    collections::VecDeque,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context as _;
use rusqlite::{Connection, OpenFlags, params};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{config::Config, id, record::Record};

const SCHEMA_VERSION: i32 = 1;
pub const REQUESTS_DB_FILENAME: &str = "requests.db";
pub(crate) const STREAM_BATCH_SIZE: usize = 256;

/// Gateway to the durable request store.
///
/// Cloneable handle; every operation opens its own connection inside
/// `spawn_blocking`, and the number of concurrently open connections is
/// bounded by the configured maximum. Callers past the bound block until a
/// connection frees up.
#[derive(Debug, Clone)]
pub struct Storage {
    db_path: PathBuf,
    connections: Arc<Semaphore>,
}

/// One item of the ordered replay stream. Rows whose stored identifier no
/// longer parses surface as `Corrupt` so a single bad row cannot stop the
/// stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamedRequest {
    Decoded(Record),
    Corrupt { id: String, reason: String },
}

#[derive(Debug)]
struct RequestRow {
    id: String,
    method: String,
    path: String,
    headers: Vec<u8>,
    cookies: Option<Vec<u8>>,
    query_params: Vec<u8>,
    body: Option<Vec<u8>>,
    recorded_at_unix_ms: i64,
}

impl Storage {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::open(
            config.storage.path.join(REQUESTS_DB_FILENAME),
            config.storage.max_connections,
        )
    }

    /// Opens (creating if needed) the database and migrates the schema.
    /// Failure here is fatal to startup; there is no lazy reconnect.
    pub fn open(db_path: PathBuf, max_connections: usize) -> anyhow::Result<Self> {
        anyhow::ensure!(
            max_connections >= 1,
            "storage max_connections must be at least 1"
        );
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create storage dir {}", parent.display()))?;
        }

        let storage = Self {
            db_path,
            connections: Arc::new(Semaphore::new(max_connections)),
        };
        storage.init()?;
        Ok(storage)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Persists one record. A duplicate identifier surfaces the engine's
    /// uniqueness violation as an error; nothing is ever overwritten.
    pub async fn insert_request(&self, record: &Record) -> anyhow::Result<()> {
        let permit = self.acquire_connection().await?;
        let db_path = self.db_path.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            insert_request_blocking(&db_path, &record)
        })
        .await
        .context("join insert_request task")?
    }

    /// Returns a lazy, single-pass stream of all stored requests ordered
    /// ascending by `(recorded_at, id)`.
    pub fn stream_ordered(&self) -> RequestStream {
        RequestStream {
            storage: self.clone(),
            cursor: None,
            buffered: VecDeque::new(),
            exhausted: false,
        }
    }

    pub async fn count_requests(&self) -> anyhow::Result<u64> {
        let permit = self.acquire_connection().await?;
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            count_requests_blocking(&db_path)
        })
        .await
        .context("join count_requests task")?
    }

    async fn acquire_connection(&self) -> anyhow::Result<OwnedSemaphorePermit> {
        Arc::clone(&self.connections)
            .acquire_owned()
            .await
            .context("storage connection pool closed")
    }

    fn init(&self) -> anyhow::Result<()> {
        let mut conn = open_connection(&self.db_path)?;
        migrate(&mut conn)
    }
}

#[derive(Debug)]
pub struct RequestStream {
    storage: Storage,
    cursor: Option<(i64, String)>,
    buffered: VecDeque<StreamedRequest>,
    exhausted: bool,
}

impl RequestStream {
    /// Next stored request in capture order, or `None` once exhausted.
    /// An `Err` here is a store-level failure, not a bad row.
    pub async fn next(&mut self) -> anyhow::Result<Option<StreamedRequest>> {
        if self.buffered.is_empty() && !self.exhausted {
            self.fetch_batch().await?;
        }
        Ok(self.buffered.pop_front())
    }

    async fn fetch_batch(&mut self) -> anyhow::Result<()> {
        let permit = self.storage.acquire_connection().await?;
        let db_path = self.storage.db_path.clone();
        let cursor = self.cursor.clone();
        let rows = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            fetch_batch_blocking(&db_path, cursor.as_ref(), STREAM_BATCH_SIZE)
        })
        .await
        .context("join request stream fetch task")??;

        if rows.len() < STREAM_BATCH_SIZE {
            self.exhausted = true;
        }
        if let Some(last) = rows.last() {
            self.cursor = Some((last.recorded_at_unix_ms, last.id.clone()));
        }
        self.buffered.extend(rows.into_iter().map(row_to_streamed));
        Ok(())
    }
}

fn open_connection(path: &Path) -> anyhow::Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)
        .with_context(|| format!("open sqlite {}", path.display()))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .context("set PRAGMA journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("set PRAGMA synchronous=NORMAL")?;
    conn.busy_timeout(Duration::from_secs(5))
        .context("set sqlite busy_timeout")?;

    Ok(conn)
}

fn migrate(conn: &mut Connection) -> anyhow::Result<()> {
    let user_version: i32 = conn
        .query_row("PRAGMA user_version;", [], |row| row.get(0))
        .context("read PRAGMA user_version")?;

    match user_version {
        0 => {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS requests (
                  id TEXT PRIMARY KEY,
                  method TEXT NOT NULL,
                  path TEXT NOT NULL,
                  headers BLOB NOT NULL,
                  cookies BLOB,
                  query_params BLOB NOT NULL,
                  body BLOB,
                  recorded_at_unix_ms INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS requests_recorded_at_idx
                  ON requests(recorded_at_unix_ms, id);
                "#,
            )
            .context("create requests schema")?;

            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .context("set PRAGMA user_version=1")?;
            Ok(())
        }
        SCHEMA_VERSION => Ok(()),
        _ => anyhow::bail!(
            "unsupported requests.db schema version {user_version} (expected {SCHEMA_VERSION})"
        ),
    }
}

fn insert_request_blocking(path: &Path, record: &Record) -> anyhow::Result<()> {
    let conn = open_connection(path)?;
    conn.execute(
        r#"
        INSERT INTO requests (
          id,
          method,
          path,
          headers,
          cookies,
          query_params,
          body,
          recorded_at_unix_ms
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            record.id.to_string(),
            record.method,
            record.path,
            record.headers,
            record.cookies,
            record.query_params,
            record.body,
            record.recorded_at_unix_ms,
        ],
    )
    .with_context(|| format!("insert request {}", record.id))?;
    Ok(())
}

fn count_requests_blocking(path: &Path) -> anyhow::Result<u64> {
    let conn = open_connection(path)?;
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM requests", [], |row| row.get(0))
        .context("count requests")?;
    u64::try_from(count).context("negative request count")
}

fn fetch_batch_blocking(
    path: &Path,
    cursor: Option<&(i64, String)>,
    batch_size: usize,
) -> anyhow::Result<Vec<RequestRow>> {
    let conn = open_connection(path)?;
    let limit = i64::try_from(batch_size).context("stream batch size exceeds sqlite range")?;
    let mut out = Vec::new();

    match cursor {
        Some((recorded_at, last_id)) => {
            let mut stmt = conn
                .prepare(
                    r#"
                    SELECT id, method, path, headers, cookies, query_params, body,
                           recorded_at_unix_ms
                    FROM requests
                    WHERE (recorded_at_unix_ms, id) > (?1, ?2)
                    ORDER BY recorded_at_unix_ms, id
                    LIMIT ?3
                    "#,
                )
                .context("prepare request stream page")?;
            let mut rows = stmt
                .query(params![recorded_at, last_id, limit])
                .context("query request stream page")?;
            while let Some(row) = rows.next().context("iterate request stream page")? {
                out.push(deserialize_request_row(row)?);
            }
        }
        None => {
            let mut stmt = conn
                .prepare(
                    r#"
                    SELECT id, method, path, headers, cookies, query_params, body,
                           recorded_at_unix_ms
                    FROM requests
                    ORDER BY recorded_at_unix_ms, id
                    LIMIT ?1
                    "#,
                )
                .context("prepare request stream first page")?;
            let mut rows = stmt
                .query(params![limit])
                .context("query request stream first page")?;
            while let Some(row) = rows.next().context("iterate request stream first page")? {
                out.push(deserialize_request_row(row)?);
            }
        }
    }

    Ok(out)
}

fn deserialize_request_row(row: &rusqlite::Row<'_>) -> anyhow::Result<RequestRow> {
    Ok(RequestRow {
        id: row.get::<_, String>(0).context("deserialize id")?,
        method: row.get::<_, String>(1).context("deserialize method")?,
        path: row.get::<_, String>(2).context("deserialize path")?,
        headers: row.get::<_, Vec<u8>>(3).context("deserialize headers")?,
        cookies: row
            .get::<_, Option<Vec<u8>>>(4)
            .context("deserialize cookies")?,
        query_params: row
            .get::<_, Vec<u8>>(5)
            .context("deserialize query_params")?,
        body: row.get::<_, Option<Vec<u8>>>(6).context("deserialize body")?,
        recorded_at_unix_ms: row
            .get::<_, i64>(7)
            .context("deserialize recorded_at_unix_ms")?,
    })
}

fn row_to_streamed(row: RequestRow) -> StreamedRequest {
    match id::parse_id(&row.id) {
        Ok(id) => StreamedRequest::Decoded(Record {
            id,
            method: row.method,
            path: row.path,
            headers: row.headers,
            cookies: row.cookies,
            query_params: row.query_params,
            body: row.body,
            recorded_at_unix_ms: row.recorded_at_unix_ms,
        }),
        Err(err) => StreamedRequest::Corrupt {
            id: row.id,
            reason: err.to_string(),
        },
    }
}
