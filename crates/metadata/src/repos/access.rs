//! Role and claim repositories.

use crate::error::MetadataResult;
use crate::models::{ClaimRow, RoleRow};
use async_trait::async_trait;

#[async_trait]
pub trait RoleRepo: Send + Sync {
    async fn create_role(&self, role: &RoleRow) -> MetadataResult<()>;

    /// Case-insensitive lookup.
    async fn get_role_by_name(&self, name: &str) -> MetadataResult<Option<RoleRow>>;

    async fn list_roles(&self) -> MetadataResult<Vec<RoleRow>>;
}

#[async_trait]
pub trait ClaimRepo: Send + Sync {
    async fn create_claim(&self, claim: &ClaimRow) -> MetadataResult<()>;

    /// Case-insensitive lookup.
    async fn get_claim_by_name(&self, name: &str) -> MetadataResult<Option<ClaimRow>>;

    async fn list_claims(&self) -> MetadataResult<Vec<ClaimRow>>;
}
