//! Differential, content-addressed backup of a directory tree to a
//! vault-based cold archive.

pub mod archiver;
pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod remote;
pub mod retry;
pub mod services;
pub mod treehash;
