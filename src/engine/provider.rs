//! Sandbox provider abstraction and the remote HTTP implementation.
//!
//! `SandboxProvider` is the extension point for compute backends: the
//! remote provider REST API in production (`HttpProvider`) and an
//! in-process simulation for development and tests (`super::local`).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::models::{CommandOutput, DirEntry, SandboxFile};

/// Creates and reconnects sandboxes. Implementations select the backend.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Backend name for logging and diagnostics.
    fn name(&self) -> &str;

    /// Create a fresh sandbox with the given idle timeout.
    async fn create(&self, idle_timeout: Duration) -> Result<Arc<dyn Sandbox>>;

    /// Reconnect to an existing sandbox by provider id. Fails when the
    /// sandbox is unknown, expired, or no longer running.
    async fn connect(&self, sandbox_id: &str) -> Result<Arc<dyn Sandbox>>;

    /// Destroy a sandbox by id without connecting first. Returns `false`
    /// when the provider reports it already gone.
    async fn destroy(&self, sandbox_id: &str) -> Result<bool>;
}

/// A live sandbox handle. Every method is an independent suspension point;
/// none of them block.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Provider-assigned identifier.
    fn id(&self) -> &str;

    async fn is_running(&self) -> Result<bool>;

    /// Refresh the idle timeout. Called on every reuse.
    async fn set_timeout(&self, idle_timeout: Duration) -> Result<()>;

    /// Destroy this sandbox. Returns `false` when already gone.
    async fn kill(&self) -> Result<bool>;

    /// Write one batch of files (absolute paths) into the sandbox.
    async fn write_files(&self, files: &[SandboxFile]) -> Result<()>;

    /// List one directory level.
    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>>;

    async fn read_file(&self, path: &str) -> Result<String>;

    /// Run a shell command with the given working directory.
    async fn run_command(&self, command: &str, cwd: &str) -> Result<CommandOutput>;

    /// Resolve the externally reachable host (host[:port]) for a port
    /// exposed by this sandbox.
    async fn resolve_host(&self, port: u16) -> Result<String>;
}

// ── Remote provider REST client ───────────────────────────────────────

#[derive(Debug, Serialize)]
struct CreateSandboxRequest {
    timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct SandboxInfoResponse {
    sandbox_id: String,
    state: String,
}

#[derive(Debug, Serialize)]
struct WriteFilesRequest<'a> {
    files: &'a [SandboxFile],
}

#[derive(Debug, Deserialize)]
struct ListDirResponse {
    entries: Vec<DirEntry>,
}

#[derive(Debug, Deserialize)]
struct ReadFileResponse {
    content: String,
}

#[derive(Debug, Serialize)]
struct RunCommandRequest<'a> {
    command: &'a str,
    cwd: &'a str,
}

#[derive(Debug, Deserialize)]
struct ResolveHostResponse {
    host: String,
}

#[derive(Debug, Serialize)]
struct SetTimeoutRequest {
    timeout_secs: u64,
}

/// Client for the remote sandbox provider REST API.
pub struct HttpProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/sandboxes{}", self.base_url, path)
    }

    async fn get_info(&self, sandbox_id: &str) -> Result<SandboxInfoResponse> {
        let resp = self
            .client
            .get(self.url(&format!("/{}", sandbox_id)))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("Provider unreachable")?
            .error_for_status()
            .context("Provider rejected sandbox lookup")?;
        resp.json::<SandboxInfoResponse>()
            .await
            .context("Failed to parse sandbox info response")
    }

    fn handle(&self, sandbox_id: String) -> Arc<dyn Sandbox> {
        Arc::new(HttpSandbox {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            sandbox_id,
        })
    }
}

#[async_trait]
impl SandboxProvider for HttpProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn create(&self, idle_timeout: Duration) -> Result<Arc<dyn Sandbox>> {
        let resp = self
            .client
            .post(self.url(""))
            .bearer_auth(&self.api_key)
            .json(&CreateSandboxRequest {
                timeout_secs: idle_timeout.as_secs(),
            })
            .send()
            .await
            .context("Provider unreachable")?
            .error_for_status()
            .context("Provider rejected sandbox creation")?;
        let info = resp
            .json::<SandboxInfoResponse>()
            .await
            .context("Failed to parse create response")?;
        Ok(self.handle(info.sandbox_id))
    }

    async fn connect(&self, sandbox_id: &str) -> Result<Arc<dyn Sandbox>> {
        let info = self.get_info(sandbox_id).await?;
        if info.state != "running" {
            anyhow::bail!("Sandbox {} is not running (state: {})", sandbox_id, info.state);
        }
        Ok(self.handle(info.sandbox_id))
    }

    async fn destroy(&self, sandbox_id: &str) -> Result<bool> {
        let resp = self
            .client
            .delete(self.url(&format!("/{}", sandbox_id)))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("Provider unreachable")?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        resp.error_for_status()
            .context("Provider rejected sandbox destroy")?;
        Ok(true)
    }
}

struct HttpSandbox {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    sandbox_id: String,
}

impl HttpSandbox {
    fn url(&self, suffix: &str) -> String {
        format!(
            "{}/v1/sandboxes/{}{}",
            self.base_url, self.sandbox_id, suffix
        )
    }
}

#[async_trait]
impl Sandbox for HttpSandbox {
    fn id(&self) -> &str {
        &self.sandbox_id
    }

    async fn is_running(&self) -> Result<bool> {
        let resp = self
            .client
            .get(self.url(""))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("Provider unreachable")?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let info = resp
            .error_for_status()
            .context("Provider rejected sandbox lookup")?
            .json::<SandboxInfoResponse>()
            .await
            .context("Failed to parse sandbox info response")?;
        Ok(info.state == "running")
    }

    async fn set_timeout(&self, idle_timeout: Duration) -> Result<()> {
        self.client
            .post(self.url("/timeout"))
            .bearer_auth(&self.api_key)
            .json(&SetTimeoutRequest {
                timeout_secs: idle_timeout.as_secs(),
            })
            .send()
            .await
            .context("Provider unreachable")?
            .error_for_status()
            .context("Provider rejected timeout refresh")?;
        Ok(())
    }

    async fn kill(&self) -> Result<bool> {
        let resp = self
            .client
            .delete(self.url(""))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("Provider unreachable")?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        resp.error_for_status()
            .context("Provider rejected sandbox destroy")?;
        Ok(true)
    }

    async fn write_files(&self, files: &[SandboxFile]) -> Result<()> {
        self.client
            .post(self.url("/files"))
            .bearer_auth(&self.api_key)
            .json(&WriteFilesRequest { files })
            .send()
            .await
            .context("Provider unreachable")?
            .error_for_status()
            .context("Provider rejected file write batch")?;
        Ok(())
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let resp = self
            .client
            .get(self.url("/files"))
            .query(&[("path", path)])
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("Provider unreachable")?
            .error_for_status()
            .with_context(|| format!("Provider rejected listing of {}", path))?;
        Ok(resp
            .json::<ListDirResponse>()
            .await
            .context("Failed to parse directory listing")?
            .entries)
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        let resp = self
            .client
            .get(self.url("/files/content"))
            .query(&[("path", path)])
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("Provider unreachable")?
            .error_for_status()
            .with_context(|| format!("Provider rejected read of {}", path))?;
        Ok(resp
            .json::<ReadFileResponse>()
            .await
            .context("Failed to parse file content response")?
            .content)
    }

    async fn run_command(&self, command: &str, cwd: &str) -> Result<CommandOutput> {
        let resp = self
            .client
            .post(self.url("/commands"))
            .bearer_auth(&self.api_key)
            .json(&RunCommandRequest { command, cwd })
            .send()
            .await
            .context("Provider unreachable")?
            .error_for_status()
            .context("Provider rejected command execution")?;
        resp.json::<CommandOutput>()
            .await
            .context("Failed to parse command output")
    }

    async fn resolve_host(&self, port: u16) -> Result<String> {
        let resp = self
            .client
            .get(self.url("/host"))
            .query(&[("port", port)])
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("Provider unreachable")?
            .error_for_status()
            .context("Provider rejected host resolution")?;
        Ok(resp
            .json::<ResolveHostResponse>()
            .await
            .context("Failed to parse host resolution response")?
            .host)
    }
}
