//! Repository traits for metadata operations.

pub mod access;
pub mod manifests;

pub use access::{ClaimRepo, RoleRepo};
pub use manifests::ManifestRepo;
