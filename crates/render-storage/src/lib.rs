//! Artifact storage.
//!
//! This crate provides:
//! - The [`ObjectStorage`] trait used by workers to publish finished artifacts
//! - Cloudflare R2 (S3-compatible) backend
//! - Local directory backend

pub mod client;
pub mod error;
pub mod local;
pub mod storage;

pub use client::{R2Client, R2Config};
pub use error::{StorageError, StorageResult};
pub use local::{LocalStorage, LocalStorageConfig};
pub use storage::{artifact_key, ObjectStorage};
