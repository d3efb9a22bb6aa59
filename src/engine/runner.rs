//! Shell command execution inside a project's sandbox.

use tracing::debug;

use crate::config::EngineConfig;
use crate::errors::EngineError;

use super::models::CommandOutput;
use super::registry::SandboxRegistry;

/// Run a shell command in the project's sandbox with the fixed working
/// directory as its current directory.
///
/// Requires a currently cached sandbox for the project; callers must have
/// provisioned via the registry beforehand. Never provisions implicitly.
pub async fn run(
    registry: &SandboxRegistry,
    config: &EngineConfig,
    project_id: &str,
    command: &str,
) -> Result<CommandOutput, EngineError> {
    let provisioned = registry
        .peek(project_id)
        .ok_or_else(|| EngineError::not_provisioned(project_id))?;

    debug!(project_id, command, "Running command in sandbox");
    let output = provisioned
        .sandbox
        .run_command(command, &config.working_dir)
        .await?;
    debug!(
        project_id,
        exit_code = output.exit_code,
        "Command completed"
    );
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::local::LocalProvider;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_without_provisioned_sandbox_fails() {
        let registry = SandboxRegistry::new(
            Arc::new(LocalProvider::new()),
            Duration::from_secs(3600),
        );
        let err = run(&registry, &EngineConfig::default(), "p1", "echo hi")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotProvisioned { .. }));
    }

    #[tokio::test]
    async fn test_run_captures_output_of_cached_sandbox() {
        let registry = SandboxRegistry::new(
            Arc::new(LocalProvider::new()),
            Duration::from_secs(3600),
        );
        registry.get_or_create("p1", None).await.unwrap();

        let output = run(&registry, &EngineConfig::default(), "p1", "echo hello")
            .await
            .unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout.trim(), "hello");
    }
}
