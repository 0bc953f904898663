use crate::content::{ContentKind, ContentRecord};
use crate::error::{ContentError, Result};
use crate::keys::{self, CacheKey};
use crate::retry::{with_retry_if, RetryConfig};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Current schema version, stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 3;

/// Partitions introduced by each schema version.
const MIGRATIONS: [(i64, &[ContentKind]); 3] = [
    (
        1,
        &[
            ContentKind::SiteContent,
            ContentKind::CommonContent,
            ContentKind::LessonContent,
            ContentKind::Interface,
        ],
    ),
    (2, &[ContentKind::Notes]),
    (3, &[ContentKind::StudyProgress]),
];

/// Backend notifications that invalidate the shared connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Close,
    VersionChange,
    Error,
}

#[derive(Debug, Clone, Copy)]
pub struct PutOptions {
    /// Store values even when they are meaningless
    pub allow_empty: bool,
    /// Delete the existing entry when a meaningless value is written
    pub delete_on_empty: bool,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            allow_empty: false,
            delete_on_empty: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GetOptions {
    /// Purge meaningless values found on read
    pub delete_if_empty: bool,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            delete_if_empty: true,
        }
    }
}

/// Per-study lesson progress, stored in the `study_progress` partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudyProgress {
    #[serde(default)]
    pub completed_lessons: Vec<u32>,
    #[serde(default)]
    pub last_completed_lesson: Option<u32>,
}

impl StudyProgress {
    pub fn mark_completed(&mut self, lesson: u32) {
        if !self.completed_lessons.contains(&lesson) {
            self.completed_lessons.push(lesson);
            self.completed_lessons.sort_unstable();
        }
        self.last_completed_lesson = Some(lesson);
    }

    pub fn is_completed(&self, lesson: u32) -> bool {
        self.completed_lessons.contains(&lesson)
    }
}

struct Inner {
    /// `None` when no persistence backend exists in this environment
    path: Option<PathBuf>,
    conn: Mutex<Option<Connection>>,
    deleting: AtomicBool,
    retry: RetryConfig,
}

/// Local persistent store: one SQLite file, one table per content kind.
///
/// Clones share a single lazily opened connection. When no backend is
/// available every operation is a no-op that reports a miss or `false`.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

impl Database {
    /// Store backed by the SQLite file at `path`. The file is opened lazily.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::build(Some(path.into()))
    }

    /// Store for environments without a persistence backend.
    pub fn unavailable() -> Self {
        Self::build(None)
    }

    fn build(path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                path,
                conn: Mutex::new(None),
                deleting: AtomicBool::new(false),
                retry: RetryConfig::store_transaction(),
            }),
        }
    }

    pub fn is_available(&self) -> bool {
        self.inner.path.is_some()
    }

    /// Open the shared connection if it is not open yet.
    ///
    /// Returns `Ok(false)` when no backend is available and
    /// `Err(StoreDeleting)` while `clear_all` is running.
    pub async fn open(&self) -> Result<bool> {
        let Some(path) = &self.inner.path else {
            warn!("Local store not available, skipping persistent caching");
            return Ok(false);
        };
        if self.inner.deleting.load(Ordering::SeqCst) {
            debug!("open blocked: delete in progress");
            return Err(ContentError::StoreDeleting);
        }

        let mut guard = self.inner.conn.lock().await;
        if self.inner.deleting.load(Ordering::SeqCst) {
            return Err(ContentError::StoreDeleting);
        }
        if guard.is_none() {
            *guard = Some(Self::connect(path)?);
            debug!("Opened local store at {}", path.display());
        }
        Ok(true)
    }

    pub async fn is_open(&self) -> bool {
        self.inner.conn.lock().await.is_some()
    }

    /// Drop the shared connection; the next operation reopens it.
    pub async fn notify(&self, event: ConnectionEvent) {
        let mut guard = self.inner.conn.lock().await;
        if guard.take().is_some() {
            debug!("Local store connection invalidated ({:?})", event);
        }
    }

    fn connect(path: &Path) -> Result<Connection> {
        let mut conn = Connection::open(path).map_err(|e| {
            ContentError::Store(format!("Failed to open database at {}: {}", path.display(), e))
        })?;

        let version = Self::schema_version(&conn)?;
        if version > SCHEMA_VERSION {
            return Err(ContentError::Store(format!(
                "database at {} has schema version {}, newer than supported {}",
                path.display(),
                version,
                SCHEMA_VERSION
            )));
        }
        if version < SCHEMA_VERSION {
            Self::run_migration(&mut conn, version)?;
        }
        Ok(conn)
    }

    fn schema_version(conn: &Connection) -> Result<i64> {
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    /// Create the partitions added after `from_version`, atomically.
    fn run_migration(conn: &mut Connection, from_version: i64) -> Result<()> {
        let tx = conn.transaction()?;

        for (version, kinds) in MIGRATIONS {
            if version <= from_version {
                continue;
            }
            for kind in kinds {
                tx.execute(
                    &format!(
                        "CREATE TABLE IF NOT EXISTS \"{}\" (
                            key TEXT PRIMARY KEY,
                            value TEXT NOT NULL
                        )",
                        kind.partition()
                    ),
                    [],
                )?;
            }
        }
        tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        tx.commit()?;

        info!(
            "Local store migrated from schema version {} to {}",
            from_version, SCHEMA_VERSION
        );
        Ok(())
    }

    /// Run `f` against the shared connection, retrying the transient
    /// "connection is closing" class with a fresh connection.
    ///
    /// Returns `Ok(None)` when the backend is unavailable or being deleted.
    async fn with_conn<T, F>(&self, operation: &str, f: F) -> Result<Option<T>>
    where
        F: Fn(&mut Connection) -> Result<T>,
    {
        let f = &f;
        let this = self;
        with_retry_if(
            &self.inner.retry,
            operation,
            move || async move { this.try_with_conn(f).await },
            ContentError::is_store_closing,
        )
        .await
    }

    async fn try_with_conn<T, F>(&self, f: &F) -> Result<Option<T>>
    where
        F: Fn(&mut Connection) -> Result<T>,
    {
        let Some(path) = &self.inner.path else {
            return Ok(None);
        };
        if self.inner.deleting.load(Ordering::SeqCst) {
            debug!("transaction skipped: delete in progress");
            return Ok(None);
        }

        let mut guard = self.inner.conn.lock().await;
        if self.inner.deleting.load(Ordering::SeqCst) {
            return Ok(None);
        }
        if guard.is_none() {
            *guard = Some(Self::connect(path)?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(ContentError::StoreClosing("connection unavailable".to_string()));
        };

        // Another process may have upgraded the file under us.
        let version = Self::schema_version(conn)?;
        if version != SCHEMA_VERSION {
            *guard = None;
            return Err(ContentError::StoreClosing(format!(
                "schema version changed to {}",
                version
            )));
        }

        match f(conn) {
            Err(e) if e.is_store_closing() => {
                *guard = None;
                Err(e)
            }
            other => other.map(Some),
        }
    }

    pub async fn get(&self, kind: ContentKind, key: &CacheKey) -> Result<Option<Value>> {
        self.get_with(kind, key, GetOptions::default()).await
    }

    /// Read a value. Meaningless values are reported as a miss and,
    /// unless disabled, purged.
    pub async fn get_with(
        &self,
        kind: ContentKind,
        key: &CacheKey,
        opts: GetOptions,
    ) -> Result<Option<Value>> {
        let table = kind.partition();
        let found = self
            .with_conn("store get", |conn| {
                let raw: Option<String> = conn
                    .query_row(
                        &format!("SELECT value FROM \"{}\" WHERE key = ?1", table),
                        params![key.as_str()],
                        |row| row.get(0),
                    )
                    .optional()?;

                let Some(raw) = raw else {
                    debug!("cache miss for {}", key);
                    return Ok(None);
                };

                let value = serde_json::from_str(&raw).unwrap_or_else(|e| {
                    warn!("Unreadable value at {} in {}: {}", key, table, e);
                    Value::Null
                });

                if !is_meaningful(&value) {
                    warn!("Meaningless value at {} in {}", key, table);
                    debug!("Purge candidate {}: {}", key, preview(&value));
                    if opts.delete_if_empty {
                        conn.execute(
                            &format!("DELETE FROM \"{}\" WHERE key = ?1", table),
                            params![key.as_str()],
                        )?;
                        warn!("Purged empty/meaningless {} from {}", key, table);
                    }
                    return Ok(None);
                }

                Ok(Some(value))
            })
            .await?;

        Ok(found.flatten())
    }

    pub async fn put(&self, kind: ContentKind, key: &CacheKey, value: &Value) -> Result<bool> {
        self.put_with(kind, key, value, PutOptions::default()).await
    }

    /// Write a value. A meaningless value becomes a delete of the key
    /// unless `allow_empty` is set; error markers are never written.
    pub async fn put_with(
        &self,
        kind: ContentKind,
        key: &CacheKey,
        value: &Value,
        opts: PutOptions,
    ) -> Result<bool> {
        if is_error_marker(value) {
            warn!("Skipping save for {} due to error payload", key);
            return Ok(false);
        }

        if !opts.allow_empty && !is_meaningful(value) {
            debug!("Empty/meaningless value for {}, not saving", key);
            if opts.delete_on_empty {
                return self.delete(kind, key).await;
            }
            return Ok(false);
        }

        let table = kind.partition();
        let text = serde_json::to_string(value)?;
        let saved = self
            .with_conn("store put", |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO \"{}\" (key, value) VALUES (?1, ?2)
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                        table
                    ),
                    params![key.as_str(), text],
                )?;
                Ok(true)
            })
            .await?;

        Ok(saved.unwrap_or(false))
    }

    pub async fn delete(&self, kind: ContentKind, key: &CacheKey) -> Result<bool> {
        let table = kind.partition();
        let deleted = self
            .with_conn("store delete", |conn| {
                conn.execute(
                    &format!("DELETE FROM \"{}\" WHERE key = ?1", table),
                    params![key.as_str()],
                )?;
                Ok(true)
            })
            .await?;

        Ok(deleted.unwrap_or(false))
    }

    pub async fn clear_partition(&self, kind: ContentKind) -> Result<bool> {
        let table = kind.partition();
        let cleared = self
            .with_conn("store clear partition", |conn| {
                conn.execute(&format!("DELETE FROM \"{}\"", table), [])?;
                Ok(true)
            })
            .await?;

        if cleared == Some(true) {
            info!("Cleared partition {}", table);
        }
        Ok(cleared.unwrap_or(false))
    }

    /// Delete the database file and recreate it empty.
    ///
    /// The open connection is closed first; operations issued meanwhile
    /// are rejected or skipped.
    pub async fn clear_all(&self) -> Result<bool> {
        let Some(path) = &self.inner.path else {
            warn!("Local store not available, nothing to clear");
            return Ok(false);
        };

        self.inner.deleting.store(true, Ordering::SeqCst);
        let removed = self.delete_files(path).await;
        self.inner.deleting.store(false, Ordering::SeqCst);
        removed?;

        info!("Local store at {} deleted", path.display());
        self.open().await
    }

    async fn delete_files(&self, path: &Path) -> Result<()> {
        let mut guard = self.inner.conn.lock().await;
        if let Some(conn) = guard.take() {
            if let Err((_, e)) = conn.close() {
                warn!("Error closing local store before delete: {}", e);
            }
        }

        for suffix in ["", "-wal", "-shm", "-journal"] {
            let mut file = path.as_os_str().to_owned();
            file.push(suffix);
            match tokio::fs::remove_file(PathBuf::from(file)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(ContentError::Store(format!(
                        "Failed to delete {}{}: {}",
                        path.display(),
                        suffix,
                        e
                    )))
                }
            }
        }
        Ok(())
    }

    // ----------------- Content records -----------------

    pub async fn get_record(&self, kind: ContentKind, key: &CacheKey) -> Result<Option<ContentRecord>> {
        Ok(self.get(kind, key).await?.map(ContentRecord::new))
    }

    pub async fn save_record(
        &self,
        kind: ContentKind,
        key: &CacheKey,
        record: &ContentRecord,
    ) -> Result<bool> {
        self.put(kind, key, record.as_value()).await
    }

    pub async fn get_interface(&self, hl: &str) -> Result<Option<ContentRecord>> {
        let key = require_key(keys::interface_key(hl), "languageCodeHL")?;
        self.get_record(ContentKind::Interface, &key).await
    }

    pub async fn save_interface(&self, hl: &str, record: &ContentRecord) -> Result<bool> {
        let key = require_key(keys::interface_key(hl), "languageCodeHL")?;
        self.save_record(ContentKind::Interface, &key, record).await
    }

    pub async fn get_site_content(&self, site: &str, hl: &str) -> Result<Option<ContentRecord>> {
        let key = require_key(keys::site_content_key(site, hl), "site, languageCodeHL")?;
        self.get_record(ContentKind::SiteContent, &key).await
    }

    pub async fn save_site_content(&self, site: &str, hl: &str, record: &ContentRecord) -> Result<bool> {
        let key = require_key(keys::site_content_key(site, hl), "site, languageCodeHL")?;
        self.save_record(ContentKind::SiteContent, &key, record).await
    }

    pub async fn get_common_content(
        &self,
        study: &str,
        hl: &str,
        variant: Option<&str>,
    ) -> Result<Option<ContentRecord>> {
        let key = require_key(keys::common_content_key(study, hl, variant), "study, languageCodeHL")?;
        self.get_record(ContentKind::CommonContent, &key).await
    }

    pub async fn save_common_content(
        &self,
        study: &str,
        hl: &str,
        variant: Option<&str>,
        record: &ContentRecord,
    ) -> Result<bool> {
        let key = require_key(keys::common_content_key(study, hl, variant), "study, languageCodeHL")?;
        self.save_record(ContentKind::CommonContent, &key, record).await
    }

    pub async fn get_lesson_content(
        &self,
        study: &str,
        hl: &str,
        jf: &str,
        lesson: &str,
    ) -> Result<Option<ContentRecord>> {
        let key = require_key(
            keys::lesson_content_key(study, hl, jf, lesson),
            "study, languageCodeHL, languageCodeJF, lesson",
        )?;
        self.get_record(ContentKind::LessonContent, &key).await
    }

    pub async fn save_lesson_content(
        &self,
        study: &str,
        hl: &str,
        jf: &str,
        lesson: &str,
        record: &ContentRecord,
    ) -> Result<bool> {
        let key = require_key(
            keys::lesson_content_key(study, hl, jf, lesson),
            "study, languageCodeHL, languageCodeJF, lesson",
        )?;
        self.save_record(ContentKind::LessonContent, &key, record).await
    }

    // ----------------- Notes -----------------

    pub async fn get_note(&self, study: &str, lesson: &str, position: Option<&str>) -> Result<Option<String>> {
        let key = require_key(keys::notes_key(study, lesson, position), "study, lesson")?;
        let value = self.get(ContentKind::Notes, &key).await?;
        Ok(value.and_then(|v| v.as_str().map(str::to_string)))
    }

    pub async fn save_note(
        &self,
        study: &str,
        lesson: &str,
        position: Option<&str>,
        text: &str,
    ) -> Result<bool> {
        let key = require_key(keys::notes_key(study, lesson, position), "study, lesson")?;
        self.put(ContentKind::Notes, &key, &Value::String(text.to_string()))
            .await
    }

    pub async fn delete_note(&self, study: &str, lesson: &str, position: Option<&str>) -> Result<bool> {
        let key = require_key(keys::notes_key(study, lesson, position), "study, lesson")?;
        self.delete(ContentKind::Notes, &key).await
    }

    // ----------------- Study progress -----------------

    pub async fn get_study_progress(&self, study: &str) -> Result<StudyProgress> {
        let key = require_key(keys::study_progress_key(study), "study")?;
        let Some(value) = self.get(ContentKind::StudyProgress, &key).await? else {
            return Ok(StudyProgress::default());
        };
        match serde_json::from_value(value) {
            Ok(progress) => Ok(progress),
            Err(e) => {
                warn!("Ignoring malformed progress for {}: {}", key, e);
                Ok(StudyProgress::default())
            }
        }
    }

    pub async fn save_study_progress(&self, study: &str, progress: &StudyProgress) -> Result<bool> {
        let key = require_key(keys::study_progress_key(study), "study")?;
        let value = serde_json::to_value(progress)?;
        self.put(ContentKind::StudyProgress, &key, &value).await
    }
}

pub(crate) fn require_key(key: Option<CacheKey>, fields: &str) -> Result<CacheKey> {
    key.ok_or_else(|| ContentError::MissingIdentity(fields.to_string()))
}

/// An object carrying an `error` field is an error marker, never content.
pub fn is_error_marker(value: &Value) -> bool {
    value.as_object().is_some_and(|obj| obj.contains_key("error"))
}

/// Null, blank strings, empty arrays, empty objects and error markers are
/// meaningless and never persisted.
pub fn is_meaningful(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(obj) => !obj.is_empty() && !obj.contains_key("error"),
        Value::Bool(_) | Value::Number(_) => true,
    }
}

fn preview(value: &Value) -> String {
    match value {
        Value::String(s) => {
            let head: String = s.chars().take(120).collect();
            if s.chars().count() > 120 {
                format!("\"{}\"…({})", head, s.chars().count())
            } else {
                format!("\"{}\"", head)
            }
        }
        Value::Array(items) => format!("Array({})", items.len()),
        Value::Object(obj) => format!("Object keys={}", obj.len()),
        other => other.to_string(),
    }
}
