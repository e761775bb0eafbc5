//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{MetaRepo, RegistrationRepo, ResourceIdRepo, UserDataRepo};
use async_trait::async_trait;
use roster_core::CURRENT_SCHEMA_VERSION;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, SqliteConnection, Transaction};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    MetaRepo + RegistrationRepo + UserDataRepo + ResourceIdRepo + Send + Sync
{
    /// Open the database.
    ///
    /// Returns `NotFound` if it does not exist and `create_if_missing` is false.
    async fn lazy_open(&self, create_if_missing: bool) -> MetadataResult<()>;

    /// Bring an opened database up to the current schema version.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Irrecoverably remove all stored data. The next write starts from an empty store.
    async fn destroy_database(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// Meta keys.
pub(crate) mod keys {
    pub const DB_VERSION: &str = "db_version";
    pub const NEXT_REGISTRATION_ID: &str = "next_registration_id";
    pub const NEXT_VERSION_ID: &str = "next_version_id";
    pub const NEXT_RESOURCE_ID: &str = "next_resource_id";
    pub const BLOB_CACHE_MIGRATION_NOT_NEEDED: &str = "blob_cache_migration_not_needed";
    pub const OLD_BLOB_CACHE_DELETION_NOT_NEEDED: &str = "old_blob_cache_deletion_not_needed";
}

#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory,
}

/// SQLite-based metadata store.
///
/// The database is opened lazily. Reads against a database that does not
/// exist yet never create it.
pub struct SqliteStore {
    location: Location,
    busy_timeout: Duration,
    pool: Mutex<Option<Pool<Sqlite>>>,
    skip_migration_flags_on_init: AtomicBool,
}

impl SqliteStore {
    /// Create a store backed by the database file at `path`.
    pub fn new(path: impl AsRef<Path>, query_timeout_secs: Option<u64>) -> Self {
        Self::with_location(
            Location::File(path.as_ref().to_path_buf()),
            query_timeout_secs,
        )
    }

    /// Create a store whose database lives only as long as this value.
    pub fn in_memory() -> Self {
        Self::with_location(Location::Memory, None)
    }

    fn with_location(location: Location, query_timeout_secs: Option<u64>) -> Self {
        Self {
            location,
            busy_timeout: Duration::from_secs(query_timeout_secs.unwrap_or(5)),
            pool: Mutex::new(None),
            skip_migration_flags_on_init: AtomicBool::new(false),
        }
    }

    /// Path of the database file, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        match &self.location {
            Location::File(path) => Some(path),
            Location::Memory => None,
        }
    }

    /// Simulate a database created before blob cache migration existed.
    ///
    /// **For testing only.**
    pub fn skip_writing_migration_flags_on_init_for_testing(&self) {
        self.skip_migration_flags_on_init.store(true, Ordering::SeqCst);
    }

    /// The connection pool if the database is open.
    pub async fn pool(&self) -> Option<Pool<Sqlite>> {
        self.pool.lock().await.clone()
    }

    /// Close the database. It is reopened on the next access.
    pub async fn close(&self) {
        if let Some(pool) = self.pool.lock().await.take() {
            pool.close().await;
        }
    }

    /// Return the pool, opening the database if needed.
    ///
    /// `Ok(None)` means the database does not exist and was not created.
    pub(crate) async fn open(
        &self,
        create_if_missing: bool,
    ) -> MetadataResult<Option<Pool<Sqlite>>> {
        let mut guard = self.pool.lock().await;
        if let Some(pool) = guard.as_ref() {
            return Ok(Some(pool.clone()));
        }

        let pool = match &self.location {
            Location::File(path) => {
                if !create_if_missing && !path.exists() {
                    return Ok(None);
                }
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let opts =
                    SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
                        .create_if_missing(true)
                        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                        .busy_timeout(self.busy_timeout);
                SqlitePoolOptions::new()
                    // Every access is funneled through one sequence; one connection suffices.
                    .max_connections(1)
                    .connect_with(opts)
                    .await?
            }
            Location::Memory => {
                if !create_if_missing {
                    return Ok(None);
                }
                let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
                // An in-memory database dies with its connection, so the single
                // connection must never be recycled.
                SqlitePoolOptions::new()
                    .max_connections(1)
                    .min_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connect_with(opts)
                    .await?
            }
        };

        upgrade_schema(&pool).await?;
        tracing::debug!(location = ?self.location, "Opened registration database");
        *guard = Some(pool.clone());
        Ok(Some(pool))
    }

    /// Pool for a read. `None` when the database does not exist.
    pub(crate) async fn reader(&self) -> MetadataResult<Option<Pool<Sqlite>>> {
        self.open(false).await
    }

    /// Pool for a write, creating the database if needed.
    pub(crate) async fn writer(&self) -> MetadataResult<Pool<Sqlite>> {
        self.open(true)
            .await?
            .ok_or_else(|| MetadataError::Internal("database could not be created".to_string()))
    }

    /// Begin a write transaction. The first write records the schema version.
    pub(crate) async fn begin_write<'a>(
        &self,
        pool: &'a Pool<Sqlite>,
    ) -> MetadataResult<Transaction<'a, Sqlite>> {
        let mut tx = pool.begin().await?;
        if meta_value(&mut tx, keys::DB_VERSION).await?.is_none() {
            put_meta(&mut tx, keys::DB_VERSION, CURRENT_SCHEMA_VERSION).await?;
            if !self.skip_migration_flags_on_init.load(Ordering::SeqCst) {
                put_meta(&mut tx, keys::BLOB_CACHE_MIGRATION_NOT_NEEDED, 1).await?;
                put_meta(&mut tx, keys::OLD_BLOB_CACHE_DELETION_NOT_NEEDED, 1).await?;
            }
        }
        Ok(tx)
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn lazy_open(&self, create_if_missing: bool) -> MetadataResult<()> {
        match self.open(create_if_missing).await? {
            Some(_) => Ok(()),
            None => Err(MetadataError::NotFound("registration database".to_string())),
        }
    }

    async fn migrate(&self) -> MetadataResult<()> {
        if let Some(pool) = self.reader().await? {
            upgrade_schema(&pool).await?;
        }
        Ok(())
    }

    async fn destroy_database(&self) -> MetadataResult<()> {
        let mut guard = self.pool.lock().await;
        if let Some(pool) = guard.take() {
            pool.close().await;
        }
        if let Location::File(path) = &self.location {
            let mut targets = vec![path.clone()];
            for suffix in ["-wal", "-shm", "-journal"] {
                let mut name = path.clone().into_os_string();
                name.push(suffix);
                targets.push(PathBuf::from(name));
            }
            for target in targets {
                match tokio::fs::remove_file(&target).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        tracing::info!(location = ?self.location, "Destroyed registration database");
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        if let Some(pool) = self.reader().await? {
            sqlx::query("SELECT 1").execute(&pool).await?;
        }
        Ok(())
    }
}

/// Create missing tables and run version upgrades.
async fn upgrade_schema(pool: &Pool<Sqlite>) -> MetadataResult<()> {
    sqlx::query(SCHEMA_SQL).execute(pool).await?;

    let mut tx = pool.begin().await?;
    let version = meta_value(&mut tx, keys::DB_VERSION).await?.unwrap_or(0);
    if version > CURRENT_SCHEMA_VERSION {
        return Err(MetadataError::Corruption(format!(
            "database version {version} is newer than supported version {CURRENT_SCHEMA_VERSION}"
        )));
    }
    if version == 1 {
        // Version 2 added the registration id -> origin index.
        sqlx::query(
            "INSERT OR REPLACE INTO registration_origins (registration_id, origin) \
             SELECT registration_id, origin FROM registrations",
        )
        .execute(&mut *tx)
        .await?;
        put_meta(&mut tx, keys::DB_VERSION, 2).await?;
        tracing::info!("Upgraded registration database to version 2");
    }
    tx.commit().await?;
    Ok(())
}

pub(crate) async fn meta_value(
    conn: &mut SqliteConnection,
    key: &str,
) -> MetadataResult<Option<i64>> {
    let value = sqlx::query_scalar::<_, i64>("SELECT value FROM meta WHERE key = ?")
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(value)
}

pub(crate) async fn put_meta(
    conn: &mut SqliteConnection,
    key: &str,
    value: i64,
) -> MetadataResult<()> {
    sqlx::query("INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)")
        .bind(key)
        .bind(value)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Advance a counter to at least `next`. Never lowers it.
pub(crate) async fn bump_counter(
    conn: &mut SqliteConnection,
    key: &str,
    next: i64,
) -> MetadataResult<()> {
    sqlx::query(
        "INSERT INTO meta (key, value) VALUES (?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = MAX(value, excluded.value)",
    )
    .bind(key)
    .bind(next)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// Implement all the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use crate::repos::{DeleteOutcome, NextIds, StoredRegistration, WriteOutcome};
    use roster_core::{
        Origin, RegistrationData, RegistrationId, ResourceId, ResourceRecord, VersionId,
    };
    use std::collections::{BTreeSet, HashSet};
    use time::OffsetDateTime;

    async fn resource_rows(
        conn: &mut SqliteConnection,
        version_id: i64,
    ) -> MetadataResult<Vec<ResourceRecord>> {
        let rows = sqlx::query_as::<_, ResourceRow>(
            "SELECT * FROM resources WHERE version_id = ? ORDER BY position",
        )
        .bind(version_id)
        .fetch_all(&mut *conn)
        .await?;
        rows.into_iter().map(ResourceRow::into_record).collect()
    }

    /// Delete a version's resource list and return its ids in list order.
    async fn delete_resource_rows(
        conn: &mut SqliteConnection,
        version_id: i64,
    ) -> MetadataResult<Vec<ResourceId>> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT resource_id FROM resources WHERE version_id = ? ORDER BY position",
        )
        .bind(version_id)
        .fetch_all(&mut *conn)
        .await?;
        sqlx::query("DELETE FROM resources WHERE version_id = ?")
            .bind(version_id)
            .execute(&mut *conn)
            .await?;
        ids.into_iter().map(stored_id).collect()
    }

    /// Counter value after the largest of `ids`. Fails if any id cannot be stored.
    fn resource_counter_after(ids: &[ResourceId]) -> MetadataResult<Option<i64>> {
        ids.iter().max().map(|max| counter_after(*max)).transpose()
    }

    /// Add ids to one set and drop them from the other, so an id is never in both.
    async fn insert_ids(
        conn: &mut SqliteConnection,
        table: IdTable,
        ids: &[ResourceId],
    ) -> MetadataResult<()> {
        let Some(next) = resource_counter_after(ids)? else {
            return Ok(());
        };
        let sql = format!("INSERT OR IGNORE INTO {} (resource_id) VALUES (?)", table.name());
        for id in ids {
            sqlx::query(&sql)
                .bind(sql_id(*id)?)
                .execute(&mut *conn)
                .await?;
        }
        delete_ids(conn, table.other(), ids).await?;
        bump_counter(conn, keys::NEXT_RESOURCE_ID, next).await
    }

    async fn delete_ids(
        conn: &mut SqliteConnection,
        table: IdTable,
        ids: &[ResourceId],
    ) -> MetadataResult<()> {
        let sql = format!("DELETE FROM {} WHERE resource_id = ?", table.name());
        // Ids that do not fit a column were never stored.
        for id in ids.iter().filter_map(|id| i64::try_from(*id).ok()) {
            sqlx::query(&sql).bind(id).execute(&mut *conn).await?;
        }
        Ok(())
    }

    /// Remove the origin from the index if it has no registrations left.
    async fn drop_origin_if_empty(
        conn: &mut SqliteConnection,
        origin: &str,
    ) -> MetadataResult<bool> {
        let remaining: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM registrations WHERE origin = ?)")
                .bind(origin)
                .fetch_one(&mut *conn)
                .await?;
        if remaining {
            return Ok(false);
        }
        sqlx::query("DELETE FROM registered_origins WHERE origin = ?")
            .bind(origin)
            .execute(&mut *conn)
            .await?;
        Ok(true)
    }

    #[derive(Clone, Copy)]
    enum IdTable {
        Uncommitted,
        Purgeable,
    }

    impl IdTable {
        fn name(self) -> &'static str {
            match self {
                Self::Uncommitted => "uncommitted_resources",
                Self::Purgeable => "purgeable_resources",
            }
        }

        fn other(self) -> Self {
            match self {
                Self::Uncommitted => Self::Purgeable,
                Self::Purgeable => Self::Uncommitted,
            }
        }
    }

    impl SqliteStore {
        async fn write_ids(&self, table: IdTable, ids: &[ResourceId]) -> MetadataResult<()> {
            if resource_counter_after(ids)?.is_none() {
                return Ok(());
            }
            let pool = self.writer().await?;
            let mut tx = self.begin_write(&pool).await?;
            insert_ids(&mut tx, table, ids).await?;
            tx.commit().await?;
            Ok(())
        }

        async fn read_ids(&self, table: IdTable) -> MetadataResult<BTreeSet<ResourceId>> {
            let Some(pool) = self.reader().await? else {
                return Ok(BTreeSet::new());
            };
            let sql = format!("SELECT resource_id FROM {} ORDER BY resource_id", table.name());
            let ids = sqlx::query_scalar::<_, i64>(&sql).fetch_all(&pool).await?;
            ids.into_iter().map(stored_id).collect()
        }

        async fn clear_ids(&self, table: IdTable, ids: &[ResourceId]) -> MetadataResult<()> {
            if ids.is_empty() {
                return Ok(());
            }
            let Some(pool) = self.reader().await? else {
                return Ok(());
            };
            let mut tx = self.begin_write(&pool).await?;
            delete_ids(&mut tx, table, ids).await?;
            tx.commit().await?;
            Ok(())
        }

        /// Whether the database exists and has been written at least once.
        async fn initialized_pool(&self) -> MetadataResult<Option<Pool<Sqlite>>> {
            let Some(pool) = self.reader().await? else {
                return Ok(None);
            };
            let mut conn = pool.acquire().await?;
            let version = meta_value(&mut conn, keys::DB_VERSION).await?;
            drop(conn);
            Ok(version.map(|_| pool))
        }

        async fn flag_needed(&self, not_needed_key: &str) -> MetadataResult<bool> {
            let Some(pool) = self.initialized_pool().await? else {
                return Ok(false);
            };
            let mut conn = pool.acquire().await?;
            Ok(meta_value(&mut conn, not_needed_key).await?.is_none())
        }

        async fn set_flag(&self, not_needed_key: &str) -> MetadataResult<()> {
            let pool = self.writer().await?;
            let mut tx = self.begin_write(&pool).await?;
            put_meta(&mut tx, not_needed_key, 1).await?;
            tx.commit().await?;
            Ok(())
        }
    }

    #[async_trait]
    impl MetaRepo for SqliteStore {
        async fn read_database_version(&self) -> MetadataResult<i64> {
            let Some(pool) = self.reader().await? else {
                return Ok(0);
            };
            let mut conn = pool.acquire().await?;
            Ok(meta_value(&mut conn, keys::DB_VERSION).await?.unwrap_or(0))
        }

        async fn get_next_available_ids(&self) -> MetadataResult<NextIds> {
            let Some(pool) = self.reader().await? else {
                return Ok(NextIds::default());
            };
            let mut conn = pool.acquire().await?;
            let registration_id = meta_value(&mut conn, keys::NEXT_REGISTRATION_ID)
                .await?
                .unwrap_or(0);
            let version_id = meta_value(&mut conn, keys::NEXT_VERSION_ID)
                .await?
                .unwrap_or(0);
            let resource_id = meta_value(&mut conn, keys::NEXT_RESOURCE_ID)
                .await?
                .unwrap_or(0);
            Ok(NextIds {
                registration_id: stored_id(registration_id)?,
                version_id: stored_id(version_id)?,
                resource_id: stored_id(resource_id)?,
            })
        }

        async fn is_blob_cache_migration_needed(&self) -> MetadataResult<bool> {
            self.flag_needed(keys::BLOB_CACHE_MIGRATION_NOT_NEEDED).await
        }

        async fn set_blob_cache_migration_not_needed(&self) -> MetadataResult<()> {
            self.set_flag(keys::BLOB_CACHE_MIGRATION_NOT_NEEDED).await
        }

        async fn is_old_blob_cache_deletion_needed(&self) -> MetadataResult<bool> {
            self.flag_needed(keys::OLD_BLOB_CACHE_DELETION_NOT_NEEDED)
                .await
        }

        async fn set_old_blob_cache_deletion_not_needed(&self) -> MetadataResult<()> {
            self.set_flag(keys::OLD_BLOB_CACHE_DELETION_NOT_NEEDED)
                .await
        }
    }

    #[async_trait]
    impl RegistrationRepo for SqliteStore {
        async fn write_registration(
            &self,
            data: &RegistrationData,
            resources: &[ResourceRecord],
        ) -> MetadataResult<WriteOutcome> {
            let origin = data.origin()?;
            data.validate_for(&origin)?;
            if !data.registration_id.is_valid() || !data.version_id.is_valid() {
                return Err(MetadataError::InvalidArguments(format!(
                    "invalid ids in registration {}",
                    data.registration_id
                )));
            }
            let new_ids: HashSet<ResourceId> = resources.iter().map(|r| r.resource_id).collect();
            if new_ids.len() != resources.len() {
                return Err(MetadataError::InvalidArguments(format!(
                    "duplicate resource ids in registration {}",
                    data.registration_id
                )));
            }

            let row = RegistrationRow::from_data(origin.as_str(), data)?;
            let next_registration_id = counter_after(data.registration_id)?;
            let next_version_id = counter_after(data.version_id)?;
            let committed: Vec<ResourceId> = resources.iter().map(|r| r.resource_id).collect();
            let next_resource_id = resource_counter_after(&committed)?;
            let sizes = resources
                .iter()
                .map(|r| sql_size(r.size_bytes))
                .collect::<MetadataResult<Vec<_>>>()?;

            let pool = self.writer().await?;
            let mut tx = self.begin_write(&pool).await?;

            bump_counter(&mut tx, keys::NEXT_REGISTRATION_ID, next_registration_id).await?;
            bump_counter(&mut tx, keys::NEXT_VERSION_ID, next_version_id).await?;
            if let Some(next) = next_resource_id {
                bump_counter(&mut tx, keys::NEXT_RESOURCE_ID, next).await?;
            }

            sqlx::query("INSERT OR IGNORE INTO registered_origins (origin) VALUES (?)")
                .bind(origin.as_str())
                .execute(&mut *tx)
                .await?;

            let mut outcome = WriteOutcome::default();
            let existing = sqlx::query_as::<_, RegistrationRow>(
                "SELECT * FROM registrations WHERE registration_id = ?",
            )
            .bind(row.registration_id)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(old) = existing {
                let old_origin = old.origin.clone();
                let old_version = old.version_id;
                let old_data = old.into_data()?;

                let old_ids = delete_resource_rows(&mut tx, old_version).await?;
                sqlx::query("DELETE FROM registrations WHERE registration_id = ?")
                    .bind(row.registration_id)
                    .execute(&mut *tx)
                    .await?;
                if old_origin != origin.as_str() {
                    drop_origin_if_empty(&mut tx, &old_origin).await?;
                }

                let newly_purgeable: Vec<ResourceId> = old_ids
                    .into_iter()
                    .filter(|id| !new_ids.contains(id))
                    .collect();
                insert_ids(&mut tx, IdTable::Purgeable, &newly_purgeable).await?;

                outcome.deleted_version = Some(old_data);
                outcome.newly_purgeable = newly_purgeable;
            }

            sqlx::query(
                r#"
                INSERT INTO registrations (
                    origin, registration_id, scope, script, version_id, is_active,
                    has_fetch_handler, last_update_check_us, resources_total_size_bytes
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&row.origin)
            .bind(row.registration_id)
            .bind(&row.scope)
            .bind(&row.script)
            .bind(row.version_id)
            .bind(row.is_active)
            .bind(row.has_fetch_handler)
            .bind(row.last_update_check_us)
            .bind(row.resources_total_size_bytes)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT OR REPLACE INTO registration_origins (registration_id, origin) \
                 VALUES (?, ?)",
            )
            .bind(row.registration_id)
            .bind(&row.origin)
            .execute(&mut *tx)
            .await?;

            for (position, (resource, size)) in resources.iter().zip(sizes).enumerate() {
                sqlx::query(
                    r#"
                    INSERT INTO resources (version_id, position, resource_id, url, size_bytes)
                    VALUES (?, ?, ?, ?, ?)
                    "#,
                )
                .bind(row.version_id)
                .bind(position as i64)
                .bind(sql_id(resource.resource_id)?)
                .bind(resource.url.as_str())
                .bind(size)
                .execute(&mut *tx)
                .await?;
            }
            delete_ids(&mut tx, IdTable::Uncommitted, &committed).await?;

            tx.commit().await?;
            Ok(outcome)
        }

        async fn read_registration(
            &self,
            registration_id: RegistrationId,
            origin: &Origin,
        ) -> MetadataResult<StoredRegistration> {
            let not_found =
                || MetadataError::NotFound(format!("registration {registration_id} of {origin}"));
            let Ok(id) = i64::try_from(registration_id) else {
                return Err(not_found());
            };
            let Some(pool) = self.reader().await? else {
                return Err(not_found());
            };
            let mut conn = pool.acquire().await?;
            let row = sqlx::query_as::<_, RegistrationRow>(
                "SELECT * FROM registrations WHERE origin = ? AND registration_id = ?",
            )
            .bind(origin.as_str())
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(not_found)?;
            let resources = resource_rows(&mut conn, row.version_id).await?;
            Ok(StoredRegistration {
                data: row.into_data()?,
                resources,
            })
        }

        async fn read_registration_origin(
            &self,
            registration_id: RegistrationId,
        ) -> MetadataResult<Origin> {
            let not_found =
                || MetadataError::NotFound(format!("origin of registration {registration_id}"));
            let Ok(id) = i64::try_from(registration_id) else {
                return Err(not_found());
            };
            let Some(pool) = self.reader().await? else {
                return Err(not_found());
            };
            let origin = sqlx::query_scalar::<_, String>(
                "SELECT origin FROM registration_origins WHERE registration_id = ?",
            )
            .bind(id)
            .fetch_optional(&pool)
            .await?
            .ok_or_else(not_found)?;
            Ok(Origin::parse(&origin)?)
        }

        async fn delete_registration(
            &self,
            registration_id: RegistrationId,
            origin: &Origin,
        ) -> MetadataResult<DeleteOutcome> {
            let Ok(id) = i64::try_from(registration_id) else {
                return Ok(DeleteOutcome::default());
            };
            let Some(pool) = self.reader().await? else {
                return Ok(DeleteOutcome::default());
            };
            let mut tx = pool.begin().await?;
            let Some(row) = sqlx::query_as::<_, RegistrationRow>(
                "SELECT * FROM registrations WHERE origin = ? AND registration_id = ?",
            )
            .bind(origin.as_str())
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            else {
                return Ok(DeleteOutcome::default());
            };

            let version_id = row.version_id;
            let deleted = row.into_data()?;
            let newly_purgeable = delete_resource_rows(&mut tx, version_id).await?;

            sqlx::query("DELETE FROM registrations WHERE origin = ? AND registration_id = ?")
                .bind(origin.as_str())
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM registration_origins WHERE registration_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM user_data WHERE registration_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            insert_ids(&mut tx, IdTable::Purgeable, &newly_purgeable).await?;
            let origin_removed = drop_origin_if_empty(&mut tx, origin.as_str()).await?;

            tx.commit().await?;
            Ok(DeleteOutcome {
                deleted_version: Some(deleted),
                newly_purgeable,
                origin_removed,
            })
        }

        async fn get_registrations_for_origin(
            &self,
            origin: &Origin,
            include_resources: bool,
        ) -> MetadataResult<Vec<StoredRegistration>> {
            let Some(pool) = self.reader().await? else {
                return Ok(Vec::new());
            };
            let mut conn = pool.acquire().await?;
            let rows = sqlx::query_as::<_, RegistrationRow>(
                "SELECT * FROM registrations WHERE origin = ? ORDER BY registration_id",
            )
            .bind(origin.as_str())
            .fetch_all(&mut *conn)
            .await?;

            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                let resources = if include_resources {
                    resource_rows(&mut conn, row.version_id).await?
                } else {
                    Vec::new()
                };
                out.push(StoredRegistration {
                    data: row.into_data()?,
                    resources,
                });
            }
            Ok(out)
        }

        async fn get_all_registrations(&self) -> MetadataResult<Vec<RegistrationData>> {
            let Some(pool) = self.reader().await? else {
                return Ok(Vec::new());
            };
            let rows = sqlx::query_as::<_, RegistrationRow>(
                "SELECT * FROM registrations ORDER BY registration_id",
            )
            .fetch_all(&pool)
            .await?;
            rows.into_iter().map(RegistrationRow::into_data).collect()
        }

        async fn get_origins_with_registrations(&self) -> MetadataResult<BTreeSet<Origin>> {
            let Some(pool) = self.reader().await? else {
                return Ok(BTreeSet::new());
            };
            let origins = sqlx::query_scalar::<_, String>(
                "SELECT origin FROM registered_origins ORDER BY origin",
            )
            .fetch_all(&pool)
            .await?;
            origins
                .iter()
                .map(|o| Origin::parse(o).map_err(MetadataError::from))
                .collect()
        }

        async fn update_version_to_active(
            &self,
            registration_id: RegistrationId,
            origin: &Origin,
        ) -> MetadataResult<()> {
            let not_found =
                || MetadataError::NotFound(format!("registration {registration_id} of {origin}"));
            let Ok(id) = i64::try_from(registration_id) else {
                return Err(not_found());
            };
            let Some(pool) = self.reader().await? else {
                return Err(not_found());
            };
            let mut tx = self.begin_write(&pool).await?;
            let result = sqlx::query(
                "UPDATE registrations SET is_active = 1 WHERE origin = ? AND registration_id = ?",
            )
            .bind(origin.as_str())
            .bind(id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Err(not_found());
            }
            tx.commit().await?;
            Ok(())
        }

        async fn update_last_check_time(
            &self,
            registration_id: RegistrationId,
            origin: &Origin,
            time: OffsetDateTime,
        ) -> MetadataResult<()> {
            let not_found =
                || MetadataError::NotFound(format!("registration {registration_id} of {origin}"));
            let Ok(id) = i64::try_from(registration_id) else {
                return Err(not_found());
            };
            let Some(pool) = self.reader().await? else {
                return Err(not_found());
            };
            let mut tx = self.begin_write(&pool).await?;
            let result = sqlx::query(
                "UPDATE registrations SET last_update_check_us = ? \
                 WHERE origin = ? AND registration_id = ?",
            )
            .bind(to_micros(time))
            .bind(origin.as_str())
            .bind(id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Err(not_found());
            }
            tx.commit().await?;
            Ok(())
        }

        async fn delete_all_data_for_origins(
            &self,
            origins: &[Origin],
        ) -> MetadataResult<Vec<ResourceId>> {
            if origins.is_empty() {
                return Ok(Vec::new());
            }
            let Some(pool) = self.reader().await? else {
                return Ok(Vec::new());
            };
            let mut tx = self.begin_write(&pool).await?;
            let mut newly_purgeable = Vec::new();

            for origin in origins {
                let registrations = sqlx::query_as::<_, (i64, i64)>(
                    "SELECT registration_id, version_id FROM registrations \
                     WHERE origin = ? ORDER BY registration_id",
                )
                .bind(origin.as_str())
                .fetch_all(&mut *tx)
                .await?;

                for (registration_id, version_id) in registrations {
                    newly_purgeable.extend(delete_resource_rows(&mut tx, version_id).await?);
                    sqlx::query("DELETE FROM user_data WHERE registration_id = ?")
                        .bind(registration_id)
                        .execute(&mut *tx)
                        .await?;
                    sqlx::query("DELETE FROM registration_origins WHERE registration_id = ?")
                        .bind(registration_id)
                        .execute(&mut *tx)
                        .await?;
                }

                sqlx::query("DELETE FROM registrations WHERE origin = ?")
                    .bind(origin.as_str())
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM registered_origins WHERE origin = ?")
                    .bind(origin.as_str())
                    .execute(&mut *tx)
                    .await?;
            }

            insert_ids(&mut tx, IdTable::Purgeable, &newly_purgeable).await?;
            tx.commit().await?;
            Ok(newly_purgeable)
        }
    }

    #[async_trait]
    impl UserDataRepo for SqliteStore {
        async fn write_user_data(
            &self,
            registration_id: RegistrationId,
            origin: &Origin,
            key: &str,
            value: &[u8],
        ) -> MetadataResult<()> {
            if key.is_empty() {
                return Err(MetadataError::InvalidArguments(
                    "user data key must not be empty".to_string(),
                ));
            }
            let id = sql_id(registration_id)?;
            let not_found =
                || MetadataError::NotFound(format!("registration {registration_id} of {origin}"));
            let Some(pool) = self.reader().await? else {
                return Err(not_found());
            };
            let mut tx = self.begin_write(&pool).await?;
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM registrations \
                 WHERE origin = ? AND registration_id = ?)",
            )
            .bind(origin.as_str())
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
            if !exists {
                return Err(not_found());
            }
            sqlx::query(
                "INSERT OR REPLACE INTO user_data (registration_id, key, value) VALUES (?, ?, ?)",
            )
            .bind(id)
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(())
        }

        async fn read_user_data(
            &self,
            registration_id: RegistrationId,
            key: &str,
        ) -> MetadataResult<Vec<u8>> {
            let not_found = || {
                MetadataError::NotFound(format!(
                    "user data {key:?} of registration {registration_id}"
                ))
            };
            let Ok(id) = i64::try_from(registration_id) else {
                return Err(not_found());
            };
            let Some(pool) = self.reader().await? else {
                return Err(not_found());
            };
            sqlx::query_scalar::<_, Vec<u8>>(
                "SELECT value FROM user_data WHERE registration_id = ? AND key = ?",
            )
            .bind(id)
            .bind(key)
            .fetch_optional(&pool)
            .await?
            .ok_or_else(not_found)
        }

        async fn delete_user_data(
            &self,
            registration_id: RegistrationId,
            key: &str,
        ) -> MetadataResult<()> {
            let Ok(id) = i64::try_from(registration_id) else {
                return Ok(());
            };
            let Some(pool) = self.reader().await? else {
                return Ok(());
            };
            let mut tx = self.begin_write(&pool).await?;
            sqlx::query("DELETE FROM user_data WHERE registration_id = ? AND key = ?")
                .bind(id)
                .bind(key)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(())
        }

        async fn read_user_data_for_all_registrations(
            &self,
            key: &str,
        ) -> MetadataResult<Vec<(RegistrationId, Vec<u8>)>> {
            let Some(pool) = self.reader().await? else {
                return Ok(Vec::new());
            };
            let rows = sqlx::query_as::<_, UserDataRow>(
                "SELECT * FROM user_data WHERE key = ? ORDER BY registration_id",
            )
            .bind(key)
            .fetch_all(&pool)
            .await?;
            rows.into_iter()
                .map(|row| stored_id(row.registration_id).map(|id| (id, row.value)))
                .collect()
        }
    }

    #[async_trait]
    impl ResourceIdRepo for SqliteStore {
        async fn write_uncommitted_resource_ids(&self, ids: &[ResourceId]) -> MetadataResult<()> {
            self.write_ids(IdTable::Uncommitted, ids).await
        }

        async fn get_uncommitted_resource_ids(&self) -> MetadataResult<BTreeSet<ResourceId>> {
            self.read_ids(IdTable::Uncommitted).await
        }

        async fn clear_uncommitted_resource_ids(&self, ids: &[ResourceId]) -> MetadataResult<()> {
            self.clear_ids(IdTable::Uncommitted, ids).await
        }

        async fn write_purgeable_resource_ids(&self, ids: &[ResourceId]) -> MetadataResult<()> {
            self.write_ids(IdTable::Purgeable, ids).await
        }

        async fn get_purgeable_resource_ids(&self) -> MetadataResult<BTreeSet<ResourceId>> {
            self.read_ids(IdTable::Purgeable).await
        }

        async fn clear_purgeable_resource_ids(&self, ids: &[ResourceId]) -> MetadataResult<()> {
            self.clear_ids(IdTable::Purgeable, ids).await
        }

        async fn purge_uncommitted_resource_ids(&self, ids: &[ResourceId]) -> MetadataResult<()> {
            // Moving into the purgeable set takes the ids out of the uncommitted one.
            self.write_ids(IdTable::Purgeable, ids).await
        }
    }
}

const SCHEMA_SQL: &str = r#"
-- Store-wide values: schema version, id counters, migration flags
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);

-- Origins with at least one registration
CREATE TABLE IF NOT EXISTS registered_origins (
    origin TEXT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS registrations (
    origin TEXT NOT NULL,
    registration_id INTEGER NOT NULL,
    scope TEXT NOT NULL,
    script TEXT NOT NULL,
    version_id INTEGER NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 0,
    has_fetch_handler INTEGER NOT NULL DEFAULT 0,
    last_update_check_us INTEGER NOT NULL DEFAULT 0,
    resources_total_size_bytes INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (origin, registration_id)
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_registrations_id ON registrations(registration_id);

-- Version 2: registration id -> origin
CREATE TABLE IF NOT EXISTS registration_origins (
    registration_id INTEGER PRIMARY KEY,
    origin TEXT NOT NULL
);

-- Resource lists keyed by version, in list order
CREATE TABLE IF NOT EXISTS resources (
    version_id INTEGER NOT NULL,
    position INTEGER NOT NULL,
    resource_id INTEGER NOT NULL,
    url TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    PRIMARY KEY (version_id, position)
);

CREATE TABLE IF NOT EXISTS user_data (
    registration_id INTEGER NOT NULL,
    key TEXT NOT NULL,
    value BLOB NOT NULL,
    PRIMARY KEY (registration_id, key)
);

CREATE TABLE IF NOT EXISTS uncommitted_resources (
    resource_id INTEGER PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS purgeable_resources (
    resource_id INTEGER PRIMARY KEY
);
"#;
