//! Core data models for the cold-storage backup engine.
//!
//! These entities map cleanly to database tables via `sqlx::FromRow` and
//! serialize naturally via `serde`. Only `MetadataStore` persists them.

pub mod archive;
pub mod retrieval_job;
pub mod upload_part;
pub mod vault;
