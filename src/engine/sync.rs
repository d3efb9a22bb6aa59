//! Batched write-through (store → sandbox) and read-back (sandbox → store)
//! of file records.
//!
//! Batches are issued strictly sequentially within one call to bound load
//! on the provider and keep a deterministic progress signal; see the
//! reports returned by `restore` and `persist`.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::config::EngineConfig;
use crate::errors::EngineError;

use super::models::{FileRecord, SandboxFile};
use super::provider::Sandbox;
use super::store::DbHandle;

/// Progress report for a restore call.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoreReport {
    pub files_written: usize,
    pub batches: usize,
}

/// Progress report for a persist call. When a batch fails the returned
/// error carries the committed-batch count instead.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistReport {
    pub records_written: usize,
    pub batches: usize,
}

/// True when any path segment is an artifact directory basename.
/// Such paths are never persisted and never restored.
pub fn is_artifact_path(config: &EngineConfig, path: &str) -> bool {
    path.split('/').any(|segment| config.is_skipped(segment))
}

/// Write the persisted file set into a sandbox's working directory.
///
/// Folder records carry no content and are skipped; directories are
/// implied by the file paths. Idempotent: re-running overwrites identical
/// content.
pub async fn restore(
    sandbox: &Arc<dyn Sandbox>,
    config: &EngineConfig,
    records: &[FileRecord],
) -> Result<RestoreReport, EngineError> {
    let working_dir = config.working_dir.trim_end_matches('/');
    let files: Vec<SandboxFile> = records
        .iter()
        .filter(|r| !r.is_folder && !is_artifact_path(config, &r.path))
        .map(|r| SandboxFile {
            path: format!("{}/{}", working_dir, r.path),
            content: r.content.clone(),
        })
        .collect();

    let mut batches = 0usize;
    for chunk in files.chunks(config.restore_batch_size.max(1)) {
        sandbox
            .write_files(chunk)
            .await
            .map_err(|e| EngineError::Sync {
                batches_committed: batches,
                source: e.context("Restore batch write failed"),
            })?;
        batches += 1;
        debug!(batch = batches, files = chunk.len(), "Restored batch to sandbox");
    }

    Ok(RestoreReport {
        files_written: files.len(),
        batches,
    })
}

/// Upsert records into the persistent store in fixed-size batches,
/// stamping the current time. A failed batch aborts the remainder; batches
/// already upserted stay committed and the error reports how many.
pub async fn persist(
    db: &DbHandle,
    config: &EngineConfig,
    project_id: &str,
    records: &[FileRecord],
) -> Result<PersistReport, EngineError> {
    let records: Vec<FileRecord> = records
        .iter()
        .filter(|r| !is_artifact_path(config, &r.path))
        .cloned()
        .collect();

    let now = Utc::now().to_rfc3339();
    let mut batches = 0usize;
    let mut written = 0usize;
    for chunk in records.chunks(config.persist_batch_size.max(1)) {
        let project_id = project_id.to_string();
        let chunk_owned = chunk.to_vec();
        let stamp = now.clone();
        db.call(move |db| db.upsert_file_batch(&project_id, &chunk_owned, &stamp))
            .await
            .map_err(|e| EngineError::Sync {
                batches_committed: batches,
                source: e.context("Persist batch upsert failed"),
            })?;
        batches += 1;
        written += chunk.len();
        debug!(batch = batches, records = chunk.len(), "Persisted batch to store");
    }

    Ok(PersistReport {
        records_written: written,
        batches,
    })
}

/// Delete a single record from the persistent store. Does not touch any
/// live sandbox.
pub async fn delete_file(
    db: &DbHandle,
    project_id: &str,
    path: &str,
) -> Result<bool, EngineError> {
    let project_id = project_id.to_string();
    let path = path.to_string();
    db.call(move |db| db.delete_file(&project_id, &path))
        .await
        .map_err(EngineError::Database)
}

/// Delete every record for a project from the persistent store.
pub async fn delete_project_files(db: &DbHandle, project_id: &str) -> Result<usize, EngineError> {
    let project_id = project_id.to_string();
    db.call(move |db| db.delete_project_files(&project_id))
        .await
        .map_err(EngineError::Database)
}

/// All records for a project, ordered by path ascending. Used both for
/// restore and for UI listing.
pub async fn get_project_files(
    db: &DbHandle,
    project_id: &str,
) -> Result<Vec<FileRecord>, EngineError> {
    let project_id = project_id.to_string();
    db.call(move |db| db.get_project_files(&project_id))
        .await
        .map_err(EngineError::Database)
}
