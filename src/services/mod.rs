pub mod backup;
pub mod metadata_store;
pub mod retention;
pub mod retrieval_coordinator;
pub mod upload_coordinator;
