//! Database models mapping to the metadata schema.

use crate::error::MetadataResult;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;
use vmcatalog_core::Manifest;

// =============================================================================
// Catalog manifests
// =============================================================================

/// Catalog manifest record.
///
/// Identity columns are indexed for lookups; the full manifest, provider
/// included, lives in `document` as JSON.
#[derive(Debug, Clone, FromRow)]
pub struct ManifestRow {
    pub id: String,
    pub catalog_id: String,
    pub version: String,
    pub architecture: String,
    pub name: String,
    pub document: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ManifestRow {
    pub fn from_manifest(manifest: &Manifest) -> MetadataResult<Self> {
        let now = OffsetDateTime::now_utc();
        Ok(Self {
            id: manifest.id.clone(),
            catalog_id: manifest.catalog_id.to_lowercase(),
            version: manifest.version.to_lowercase(),
            architecture: manifest.architecture.to_lowercase(),
            name: manifest.name.clone(),
            document: serde_json::to_string(manifest)?,
            created_at: manifest.created_at.unwrap_or(now),
            updated_at: manifest.updated_at.unwrap_or(now),
        })
    }

    pub fn into_manifest(self) -> MetadataResult<Manifest> {
        Ok(serde_json::from_str(&self.document)?)
    }
}

// =============================================================================
// Access control
// =============================================================================

/// Role a manifest may require of its downloaders.
#[derive(Debug, Clone, FromRow)]
pub struct RoleRow {
    pub id: Uuid,
    pub name: String,
    pub created_at: OffsetDateTime,
}

/// Claim a manifest may require of its downloaders.
#[derive(Debug, Clone, FromRow)]
pub struct ClaimRow {
    pub id: Uuid,
    pub name: String,
    pub created_at: OffsetDateTime,
}

impl RoleRow {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

impl ClaimRow {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: OffsetDateTime::now_utc(),
        }
    }
}
