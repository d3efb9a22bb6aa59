//! Engine facade: wires the registry, store, and synchronizer together and
//! exposes the operations consumed by the HTTP surface.

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::errors::EngineError;

use super::models::{FileRecord, KillOutcome, Project, ProjectStatus, Provisioned};
use super::proxy::{self, PreviewResponse};
use super::registry::SandboxRegistry;
use super::runner;
use super::store::DbHandle;
use super::sync::{self, PersistReport, RestoreReport};
use super::walker;

/// Result of a provision call.
#[derive(Debug, Clone)]
pub struct ProvisionOutcome {
    pub sandbox_id: String,
    pub is_new: bool,
    /// Files restored into a freshly created sandbox; zero on reuse or
    /// reconnect.
    pub restored_files: usize,
}

/// Result of a store+sandbox write-through.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub persisted: PersistReport,
    /// Present when a live sandbox was updated as well.
    pub restored: Option<RestoreReport>,
}

pub struct Engine {
    registry: SandboxRegistry,
    db: DbHandle,
    config: EngineConfig,
    http: reqwest::Client,
}

impl Engine {
    pub fn new(registry: SandboxRegistry, db: DbHandle, config: EngineConfig) -> Self {
        Self {
            registry,
            db,
            config,
            http: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub async fn create_project(&self, name: &str) -> Result<Project, EngineError> {
        let id = Uuid::new_v4().to_string();
        let name = name.to_string();
        self.db
            .call(move |db| db.create_project(&id, &name))
            .await
            .map_err(EngineError::Database)
    }

    pub async fn get_project(&self, project_id: &str) -> Result<Option<Project>, EngineError> {
        let project_id = project_id.to_string();
        self.db
            .call(move |db| db.get_project(&project_id))
            .await
            .map_err(EngineError::Database)
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>, EngineError> {
        self.db
            .call(|db| db.list_projects())
            .await
            .map_err(EngineError::Database)
    }

    async fn require_project(&self, project_id: &str) -> Result<Project, EngineError> {
        self.get_project(project_id)
            .await?
            .ok_or_else(|| EngineError::project_not_found(project_id))
    }

    async fn set_status(&self, project_id: &str, status: ProjectStatus) -> Result<(), EngineError> {
        let project_id = project_id.to_string();
        self.db
            .call(move |db| db.update_project_status(&project_id, &status))
            .await
            .map_err(EngineError::Database)
    }

    // ── Engine operations ─────────────────────────────────────────────

    /// Bind the project to a usable sandbox: reuse the cached handle,
    /// reconnect to the stored sandbox id, or create fresh. A fresh
    /// sandbox is restored from the persisted file set before it is
    /// considered usable.
    pub async fn provision(&self, project_id: &str) -> Result<ProvisionOutcome, EngineError> {
        let project = self.require_project(project_id).await?;
        let previous_status = project.status.clone();

        let transitional = if project.sandbox_id.is_some() {
            ProjectStatus::Reconnecting
        } else {
            ProjectStatus::Provisioning
        };
        self.set_status(project_id, transitional).await?;

        let provisioned = match self
            .registry
            .get_or_create(project_id, project.sandbox_id.as_deref())
            .await
        {
            Ok(p) => p,
            Err(e) => {
                if let Err(status_err) = self.set_status(project_id, previous_status.clone()).await
                {
                    warn!(project_id, error = %status_err, "Failed to roll back project status");
                }
                return Err(e);
            }
        };

        let mut restored_files = 0;
        if provisioned.is_new {
            restored_files = match self.restore_fresh(project_id, &provisioned).await {
                Ok(n) => n,
                Err(e) => {
                    // An unrestored fresh sandbox must not stay cached as
                    // usable; evict it so the next provision re-creates and
                    // re-restores.
                    self.registry.kill(project_id, None).await;
                    if let Err(status_err) =
                        self.set_status(project_id, previous_status).await
                    {
                        warn!(project_id, error = %status_err, "Failed to roll back project status");
                    }
                    return Err(e);
                }
            };
        }

        {
            let project_id = project_id.to_string();
            let sandbox_id = provisioned.sandbox_id.clone();
            self.db
                .call(move |db| {
                    db.update_project_sandbox(&project_id, Some(&sandbox_id))?;
                    db.update_project_status(&project_id, &ProjectStatus::Running)
                })
                .await
                .map_err(EngineError::Database)?;
        }

        Ok(ProvisionOutcome {
            sandbox_id: provisioned.sandbox_id,
            is_new: provisioned.is_new,
            restored_files,
        })
    }

    async fn restore_fresh(
        &self,
        project_id: &str,
        provisioned: &Provisioned,
    ) -> Result<usize, EngineError> {
        let records = sync::get_project_files(&self.db, project_id).await?;
        if records.is_empty() {
            return Ok(0);
        }
        let report = sync::restore(&provisioned.sandbox, &self.config, &records).await?;
        info!(
            project_id,
            sandbox_id = %provisioned.sandbox_id,
            files = report.files_written,
            batches = report.batches,
            "Restored project files into fresh sandbox"
        );
        Ok(report.files_written)
    }

    /// Write files to the persistent store and, when a sandbox is live,
    /// through to its filesystem. The two writes are not atomic; a crash
    /// in between is reconciled by the next full restore or persist cycle.
    pub async fn sync_to_sandbox(
        &self,
        project_id: &str,
        files: &[FileRecord],
    ) -> Result<SyncReport, EngineError> {
        self.require_project(project_id).await?;

        let persisted = sync::persist(&self.db, &self.config, project_id, files).await?;
        let restored = match self.registry.peek(project_id) {
            Some(provisioned) => {
                Some(sync::restore(&provisioned.sandbox, &self.config, files).await?)
            }
            None => None,
        };
        Ok(SyncReport { persisted, restored })
    }

    /// Capture the sandbox's current filesystem state back into the
    /// persistent store. Returns the number of records written.
    pub async fn sync_from_sandbox(&self, project_id: &str) -> Result<usize, EngineError> {
        self.require_project(project_id).await?;
        let provisioned = self
            .registry
            .peek(project_id)
            .ok_or_else(|| EngineError::not_provisioned(project_id))?;

        let outcome = walker::walk(&provisioned.sandbox, &self.config, &self.config.working_dir).await;
        if !outcome.unreadable.is_empty() {
            warn!(
                project_id,
                count = outcome.unreadable.len(),
                "Some sandbox entries were unreadable during sync"
            );
        }

        let now = Utc::now().to_rfc3339();
        let records: Vec<FileRecord> = outcome
            .entries
            .into_iter()
            .map(|e| FileRecord {
                project_id: project_id.to_string(),
                path: e.path,
                content: e.content,
                is_folder: e.is_folder,
                updated_at: now.clone(),
            })
            .collect();

        let report = sync::persist(&self.db, &self.config, project_id, &records).await?;
        Ok(report.records_written)
    }

    pub async fn run_command(
        &self,
        project_id: &str,
        command: &str,
    ) -> Result<super::models::CommandOutput, EngineError> {
        runner::run(&self.registry, &self.config, project_id, command).await
    }

    pub async fn list_files(&self, project_id: &str) -> Result<Vec<FileRecord>, EngineError> {
        sync::get_project_files(&self.db, project_id).await
    }

    pub async fn delete_file(&self, project_id: &str, path: &str) -> Result<bool, EngineError> {
        sync::delete_file(&self.db, project_id, path).await
    }

    pub async fn delete_project_files(&self, project_id: &str) -> Result<usize, EngineError> {
        sync::delete_project_files(&self.db, project_id).await
    }

    pub async fn forward_preview(
        &self,
        project_id: &str,
        path: &str,
    ) -> Result<PreviewResponse, EngineError> {
        let mount_prefix = format!("/api/projects/{}/preview", project_id);
        proxy::forward(
            &self.registry,
            &self.config,
            &self.http,
            project_id,
            path,
            &mount_prefix,
        )
        .await
    }

    /// Stop the project's sandbox. Destroy failures are swallowed; the
    /// outcome only reports what happened.
    pub async fn pause(&self, project_id: &str) -> Result<KillOutcome, EngineError> {
        let project = self.require_project(project_id).await?;
        let outcome = self
            .registry
            .kill(project_id, project.sandbox_id.as_deref())
            .await;
        info!(project_id, ?outcome, "Paused project sandbox");
        self.set_status(project_id, ProjectStatus::Stopped).await?;
        Ok(outcome)
    }

    /// Drop cached sandbox handles. Shutdown hook; does not destroy
    /// sandboxes.
    pub fn clear_registry(&self) {
        self.registry.clear();
    }
}
