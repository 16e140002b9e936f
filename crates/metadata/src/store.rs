//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{ClaimRepo, ManifestRepo, RoleRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: ManifestRepo + RoleRepo + ClaimRepo + Send + Sync {
    /// Create the schema if missing.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    query_timeout_secs: u64,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let query_timeout_secs = query_timeout_secs.unwrap_or(600);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(query_timeout_secs.min(30)));

        let pool = SqlitePoolOptions::new()
            // One writer at a time; a single connection avoids "database is locked".
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(query_timeout_secs))
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            query_timeout_secs,
        };
        store.migrate().await?;
        tracing::debug!(
            path = %path.display(),
            query_timeout_secs = store.query_timeout_secs,
            "opened metadata store"
        );
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use time::OffsetDateTime;
    use vmcatalog_core::Manifest;

    fn into_manifests(rows: Vec<ManifestRow>) -> MetadataResult<Vec<Manifest>> {
        rows.into_iter().map(ManifestRow::into_manifest).collect()
    }

    #[async_trait]
    impl ManifestRepo for SqliteStore {
        async fn create_manifest(&self, manifest: &Manifest) -> MetadataResult<()> {
            let row = ManifestRow::from_manifest(manifest)?;
            let result = sqlx::query(
                "INSERT INTO manifests (id, catalog_id, version, architecture, name, document, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&row.id)
            .bind(&row.catalog_id)
            .bind(&row.version)
            .bind(&row.architecture)
            .bind(&row.name)
            .bind(&row.document)
            .bind(row.created_at)
            .bind(row.updated_at)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => Ok(()),
                Err(e) if is_unique_violation(&e) => Err(MetadataError::AlreadyExists(format!(
                    "manifest {} ({})",
                    row.name, row.id
                ))),
                Err(e) => Err(e.into()),
            }
        }

        async fn update_manifest(&self, manifest: &Manifest) -> MetadataResult<()> {
            let row = ManifestRow::from_manifest(manifest)?;
            let result = sqlx::query(
                "UPDATE manifests SET catalog_id = ?, version = ?, architecture = ?, name = ?, document = ?, updated_at = ? WHERE id = ?",
            )
            .bind(&row.catalog_id)
            .bind(&row.version)
            .bind(&row.architecture)
            .bind(&row.name)
            .bind(&row.document)
            .bind(OffsetDateTime::now_utc())
            .bind(&row.id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("manifest {}", row.id)));
            }
            Ok(())
        }

        async fn get_manifest(&self, id: &str) -> MetadataResult<Option<Manifest>> {
            let row = sqlx::query_as::<_, ManifestRow>("SELECT * FROM manifests WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            row.map(ManifestRow::into_manifest).transpose()
        }

        async fn find_manifests(
            &self,
            catalog_id: &str,
            version: Option<&str>,
            architecture: Option<&str>,
        ) -> MetadataResult<Vec<Manifest>> {
            let rows = sqlx::query_as::<_, ManifestRow>(
                "SELECT * FROM manifests WHERE catalog_id = ? \
                 AND (? IS NULL OR version = ?) \
                 AND (? IS NULL OR architecture = ?) \
                 ORDER BY created_at",
            )
            .bind(catalog_id.to_lowercase())
            .bind(version.map(str::to_lowercase))
            .bind(version.map(str::to_lowercase))
            .bind(architecture.map(str::to_lowercase))
            .bind(architecture.map(str::to_lowercase))
            .fetch_all(&self.pool)
            .await?;
            into_manifests(rows)
        }

        async fn list_manifests(&self) -> MetadataResult<Vec<Manifest>> {
            let rows = sqlx::query_as::<_, ManifestRow>(
                "SELECT * FROM manifests ORDER BY catalog_id, created_at",
            )
            .fetch_all(&self.pool)
            .await?;
            into_manifests(rows)
        }

        async fn delete_manifest(&self, id: &str) -> MetadataResult<bool> {
            let result = sqlx::query("DELETE FROM manifests WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn record_download(
            &self,
            id: &str,
            user: &str,
            at: OffsetDateTime,
        ) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;
            let row = sqlx::query_as::<_, ManifestRow>("SELECT * FROM manifests WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| MetadataError::NotFound(format!("manifest {id}")))?;

            let mut manifest = row.into_manifest()?;
            manifest.download_count += 1;
            manifest.last_downloaded_at = Some(at);
            manifest.last_downloaded_user = user.to_string();

            sqlx::query("UPDATE manifests SET document = ?, updated_at = ? WHERE id = ?")
                .bind(serde_json::to_string(&manifest)?)
                .bind(at)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(())
        }
    }

    #[async_trait]
    impl RoleRepo for SqliteStore {
        async fn create_role(&self, role: &RoleRow) -> MetadataResult<()> {
            sqlx::query("INSERT INTO roles (id, name, created_at) VALUES (?, ?, ?)")
                .bind(role.id)
                .bind(&role.name)
                .bind(role.created_at)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        MetadataError::AlreadyExists(format!("role '{}'", role.name))
                    } else {
                        e.into()
                    }
                })?;
            Ok(())
        }

        async fn get_role_by_name(&self, name: &str) -> MetadataResult<Option<RoleRow>> {
            let row = sqlx::query_as::<_, RoleRow>(
                "SELECT * FROM roles WHERE name = ? COLLATE NOCASE",
            )
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn list_roles(&self) -> MetadataResult<Vec<RoleRow>> {
            let rows = sqlx::query_as::<_, RoleRow>("SELECT * FROM roles ORDER BY name")
                .fetch_all(&self.pool)
                .await?;
            Ok(rows)
        }
    }

    #[async_trait]
    impl ClaimRepo for SqliteStore {
        async fn create_claim(&self, claim: &ClaimRow) -> MetadataResult<()> {
            sqlx::query("INSERT INTO claims (id, name, created_at) VALUES (?, ?, ?)")
                .bind(claim.id)
                .bind(&claim.name)
                .bind(claim.created_at)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        MetadataError::AlreadyExists(format!("claim '{}'", claim.name))
                    } else {
                        e.into()
                    }
                })?;
            Ok(())
        }

        async fn get_claim_by_name(&self, name: &str) -> MetadataResult<Option<ClaimRow>> {
            let row = sqlx::query_as::<_, ClaimRow>(
                "SELECT * FROM claims WHERE name = ? COLLATE NOCASE",
            )
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn list_claims(&self) -> MetadataResult<Vec<ClaimRow>> {
            let rows = sqlx::query_as::<_, ClaimRow>("SELECT * FROM claims ORDER BY name")
                .fetch_all(&self.pool)
                .await?;
            Ok(rows)
        }
    }
}

const SCHEMA_SQL: &str = r#"
-- Catalog manifests, one row per catalog/version/architecture
CREATE TABLE IF NOT EXISTS manifests (
    id TEXT PRIMARY KEY,
    catalog_id TEXT NOT NULL,
    version TEXT NOT NULL,
    architecture TEXT NOT NULL,
    name TEXT NOT NULL,
    document TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_manifests_identity ON manifests(catalog_id, version, architecture);
CREATE INDEX IF NOT EXISTS idx_manifests_name ON manifests(name);

CREATE TABLE IF NOT EXISTS roles (
    id BLOB PRIMARY KEY,
    name TEXT NOT NULL UNIQUE COLLATE NOCASE,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS claims (
    id BLOB PRIMARY KEY,
    name TEXT NOT NULL UNIQUE COLLATE NOCASE,
    created_at TEXT NOT NULL
);
"#;
