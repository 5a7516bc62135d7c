//! Dead-letter storage for chunks that exhausted every redrive.
//!
//! Entries are append-only. A store never drops a record it already holds.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use tokio::sync::Mutex;
use uuid::Uuid;

use pulse_common::error::StoreError;
use pulse_common::types::DeadLetterEntry;

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Durably append one entry.
    async fn append(&self, entry: &DeadLetterEntry) -> Result<(), StoreError>;

    /// All entries, oldest first.
    async fn load(&self) -> Result<Vec<DeadLetterEntry>, StoreError>;
}

/// In-process store, lost on restart.
#[derive(Debug, Default)]
pub struct MemoryDeadLetterStore {
    entries: Mutex<Vec<DeadLetterEntry>>,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn append(&self, entry: &DeadLetterEntry) -> Result<(), StoreError> {
        self.entries.lock().await.push(entry.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Vec<DeadLetterEntry>, StoreError> {
        Ok(self.entries.lock().await.clone())
    }
}

/// JSON-array file store.
///
/// Each append reads the current array, adds the entry and replaces the file via
/// a temp file + rename. Records this version cannot parse are carried over
/// verbatim. An unreadable file is moved aside to `<name>.corrupt-<unix ts>` by
/// the next append rather than overwritten; `load` leaves it untouched.
#[derive(Debug)]
pub struct FileDeadLetterStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileDeadLetterStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse the file into raw records. Unparseable content reads as empty; with
    /// `move_aside` the file is also renamed so the next write starts fresh.
    async fn read_records(&self, move_aside: bool) -> Result<Vec<serde_json::Value>, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }

        match serde_json::from_slice::<Vec<serde_json::Value>>(&bytes) {
            Ok(records) => Ok(records),
            Err(e) if !move_aside => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Dead-letter file unreadable, returning no entries"
                );
                Ok(Vec::new())
            }
            Err(e) => {
                let aside = self.corrupt_path();
                tracing::warn!(
                    path = %self.path.display(),
                    moved_to = %aside.display(),
                    error = %e,
                    "Dead-letter file unreadable, moving it aside"
                );
                tokio::fs::rename(&self.path, &aside).await?;
                Ok(Vec::new())
            }
        }
    }

    fn corrupt_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".corrupt-{}", Utc::now().timestamp()));
        self.path.with_file_name(name)
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl DeadLetterStore for FileDeadLetterStore {
    async fn append(&self, entry: &DeadLetterEntry) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let mut records = self.read_records(true).await?;
        records.push(serde_json::to_value(entry)?);

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp = self.temp_path();
        tokio::fs::write(&temp, serde_json::to_vec_pretty(&records)?).await?;
        tokio::fs::rename(&temp, &self.path).await?;

        tracing::debug!(
            path = %self.path.display(),
            total = records.len(),
            "Appended dead-letter entry"
        );
        Ok(())
    }

    async fn load(&self) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let records = self.read_records(false).await?;
        Ok(records
            .into_iter()
            .filter_map(|r| serde_json::from_value(r).ok())
            .collect())
    }
}

/// Store backed by the `push_dead_letters` table.
#[derive(Debug, Clone)]
pub struct PgDeadLetterStore {
    pool: PgPool,
}

impl PgDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterStore for PgDeadLetterStore {
    async fn append(&self, entry: &DeadLetterEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO push_dead_letters (id, addresses, attempts, last_error, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(entry.id)
        .bind(Json(&entry.addresses))
        .bind(i32::try_from(entry.attempts).unwrap_or(i32::MAX))
        .bind(Json(&entry.last_error))
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load(&self) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let rows: Vec<(Uuid, Json<Vec<String>>, i32, Json<serde_json::Value>, DateTime<Utc>)> =
            sqlx::query_as(
                r#"
                SELECT id, addresses, attempts, last_error, created_at
                FROM push_dead_letters
                ORDER BY created_at, id
                "#,
            )
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(
                |(id, addresses, attempts, last_error, timestamp)| DeadLetterEntry {
                    id,
                    addresses: addresses.0,
                    attempts: u32::try_from(attempts).unwrap_or_default(),
                    last_error: last_error.0,
                    timestamp,
                },
            )
            .collect())
    }
}
