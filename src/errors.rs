//! Typed error hierarchy for the atelier engine.
//!
//! A single top-level enum covers the engine boundary. Internal plumbing
//! uses `anyhow` with context; operations exposed to the HTTP surface
//! return `EngineError` so callers can branch on the failure class.

use thiserror::Error;

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The provider could not create or reconnect a sandbox
    /// (unreachable, quota exceeded, rejected credentials).
    #[error("Sandbox provisioning failed: {reason}")]
    Provisioning { reason: String },

    /// The operation requires a running sandbox but none is cached
    /// for the project. The caller is expected to provision and retry.
    #[error("No sandbox provisioned for project {project_id}")]
    NotProvisioned { project_id: String },

    /// No project row exists for the given id.
    #[error("Project {project_id} not found")]
    ProjectNotFound { project_id: String },

    /// A restore or persist batch failed. Batches already written stay
    /// committed; `batches_committed` reports how many.
    #[error("File sync failed after {batches_committed} committed batches: {source}")]
    Sync {
        batches_committed: usize,
        #[source]
        source: anyhow::Error,
    },

    /// The preview upstream responded with an error or was unreachable.
    #[error("Preview upstream failed with status {status}")]
    ProxyUpstream { status: u16 },

    /// Missing or invalid configuration detected at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn provisioning(reason: impl Into<String>) -> Self {
        Self::Provisioning {
            reason: reason.into(),
        }
    }

    pub fn not_provisioned(project_id: impl Into<String>) -> Self {
        Self::NotProvisioned {
            project_id: project_id.into(),
        }
    }

    pub fn project_not_found(project_id: impl Into<String>) -> Self {
        Self::ProjectNotFound {
            project_id: project_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_error_carries_reason() {
        let err = EngineError::provisioning("quota exceeded");
        match &err {
            EngineError::Provisioning { reason } => assert_eq!(reason, "quota exceeded"),
            _ => panic!("Expected Provisioning variant"),
        }
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[test]
    fn not_provisioned_carries_project_id() {
        let err = EngineError::not_provisioned("p1");
        match &err {
            EngineError::NotProvisioned { project_id } => assert_eq!(project_id, "p1"),
            _ => panic!("Expected NotProvisioned variant"),
        }
        assert!(err.to_string().contains("p1"));
    }

    #[test]
    fn sync_error_reports_committed_batches() {
        let err = EngineError::Sync {
            batches_committed: 2,
            source: anyhow::anyhow!("connection reset"),
        };
        match &err {
            EngineError::Sync {
                batches_committed, ..
            } => assert_eq!(*batches_committed, 2),
            _ => panic!("Expected Sync variant"),
        }
        assert!(err.to_string().contains("2 committed batches"));
    }

    #[test]
    fn variants_are_distinct() {
        let a = EngineError::not_provisioned("p1");
        let b = EngineError::ProxyUpstream { status: 502 };
        let c = EngineError::project_not_found("p1");
        assert!(matches!(a, EngineError::NotProvisioned { .. }));
        assert!(matches!(b, EngineError::ProxyUpstream { .. }));
        assert!(matches!(c, EngineError::ProjectNotFound { .. }));
        assert!(!matches!(a, EngineError::ProxyUpstream { .. }));
    }

    #[test]
    fn all_variants_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&EngineError::Configuration("missing key".into()));
        assert_std_error(&EngineError::Database(anyhow::anyhow!("locked")));
    }
}
