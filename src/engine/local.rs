//! In-process sandbox provider.
//!
//! Simulates the remote provider with in-memory filesystems and host-side
//! command execution under a scratch directory. Backs `--local` dev mode
//! (no provider credentials required) and the test suite.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use uuid::Uuid;

use super::models::{CommandOutput, DirEntry, SandboxFile};
use super::provider::{Sandbox, SandboxProvider};

#[derive(Debug, Clone, PartialEq)]
enum Node {
    File(String),
    Dir,
}

struct LocalSandboxState {
    id: String,
    running: Mutex<bool>,
    fs: Mutex<BTreeMap<String, Node>>,
    preview_host: Mutex<Option<String>>,
    idle_timeout: Mutex<Duration>,
    host_dir: Mutex<Option<PathBuf>>,
    poisoned: Mutex<HashSet<String>>,
    failing_write_batches: Mutex<usize>,
}

impl LocalSandboxState {
    fn new(id: String, idle_timeout: Duration, failing_write_batches: usize) -> Self {
        Self {
            id,
            running: Mutex::new(true),
            fs: Mutex::new(BTreeMap::new()),
            preview_host: Mutex::new(None),
            idle_timeout: Mutex::new(idle_timeout),
            host_dir: Mutex::new(None),
            poisoned: Mutex::new(HashSet::new()),
            failing_write_batches: Mutex::new(failing_write_batches),
        }
    }

    fn insert_with_parents(fs: &mut BTreeMap<String, Node>, path: &str, node: Node) {
        let mut parent = path;
        while let Some(idx) = parent.rfind('/') {
            parent = &parent[..idx];
            if parent.is_empty() {
                break;
            }
            fs.entry(parent.to_string()).or_insert(Node::Dir);
        }
        fs.insert(path.to_string(), node);
    }
}

/// Simulated provider holding every sandbox it has created.
pub struct LocalProvider {
    sandboxes: Mutex<HashMap<String, Arc<LocalSandboxState>>>,
    create_count: AtomicUsize,
    connect_count: AtomicUsize,
    pending_write_failures: AtomicUsize,
}

impl LocalProvider {
    pub fn new() -> Self {
        Self {
            sandboxes: Mutex::new(HashMap::new()),
            create_count: AtomicUsize::new(0),
            connect_count: AtomicUsize::new(0),
            pending_write_failures: AtomicUsize::new(0),
        }
    }

    /// How many sandboxes this provider has created.
    pub fn create_count(&self) -> usize {
        self.create_count.load(Ordering::SeqCst)
    }

    /// How many reconnect attempts this provider has seen.
    pub fn connect_count(&self) -> usize {
        self.connect_count.load(Ordering::SeqCst)
    }

    fn state(&self, sandbox_id: &str) -> Option<Arc<LocalSandboxState>> {
        self.sandboxes.lock().unwrap().get(sandbox_id).cloned()
    }

    /// Simulate idle expiry or an out-of-band stop.
    pub fn set_running(&self, sandbox_id: &str, running: bool) {
        if let Some(state) = self.state(sandbox_id) {
            *state.running.lock().unwrap() = running;
        }
    }

    /// Point preview resolution for a sandbox at a concrete host[:port].
    pub fn set_preview_host(&self, sandbox_id: &str, host: impl Into<String>) {
        if let Some(state) = self.state(sandbox_id) {
            *state.preview_host.lock().unwrap() = Some(host.into());
        }
    }

    /// Seed files directly into a sandbox filesystem (parents implied).
    pub fn seed_file(&self, sandbox_id: &str, path: &str, content: &str) {
        if let Some(state) = self.state(sandbox_id) {
            let mut fs = state.fs.lock().unwrap();
            LocalSandboxState::insert_with_parents(
                &mut fs,
                path,
                Node::File(content.to_string()),
            );
        }
    }

    /// Make reads and listings of a path fail, for exercising degraded
    /// walks.
    pub fn poison_path(&self, sandbox_id: &str, path: &str) {
        if let Some(state) = self.state(sandbox_id) {
            state.poisoned.lock().unwrap().insert(path.to_string());
        }
    }

    /// Make the first `n` write batches of the next created sandbox fail,
    /// for exercising restore failures.
    pub fn fail_next_write_batches(&self, n: usize) {
        self.pending_write_failures.store(n, Ordering::SeqCst);
    }

    /// Seed an empty directory into a sandbox filesystem.
    pub fn seed_dir(&self, sandbox_id: &str, path: &str) {
        if let Some(state) = self.state(sandbox_id) {
            let mut fs = state.fs.lock().unwrap();
            LocalSandboxState::insert_with_parents(&mut fs, path, Node::Dir);
        }
    }
}

impl Default for LocalProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn create(&self, idle_timeout: Duration) -> Result<Arc<dyn Sandbox>> {
        self.create_count.fetch_add(1, Ordering::SeqCst);
        let id = format!("local-{}", Uuid::new_v4());
        let failing = self.pending_write_failures.swap(0, Ordering::SeqCst);
        let state = Arc::new(LocalSandboxState::new(id.clone(), idle_timeout, failing));
        self.sandboxes.lock().unwrap().insert(id, state.clone());
        Ok(Arc::new(LocalSandbox { state }))
    }

    async fn connect(&self, sandbox_id: &str) -> Result<Arc<dyn Sandbox>> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        let state = self
            .state(sandbox_id)
            .with_context(|| format!("Unknown sandbox {}", sandbox_id))?;
        if !*state.running.lock().unwrap() {
            anyhow::bail!("Sandbox {} is not running", sandbox_id);
        }
        Ok(Arc::new(LocalSandbox { state }))
    }

    async fn destroy(&self, sandbox_id: &str) -> Result<bool> {
        Ok(self.sandboxes.lock().unwrap().remove(sandbox_id).is_some())
    }
}

struct LocalSandbox {
    state: Arc<LocalSandboxState>,
}

impl LocalSandbox {
    fn ensure_running(&self) -> Result<()> {
        if !*self.state.running.lock().unwrap() {
            anyhow::bail!("Sandbox {} is not running", self.state.id);
        }
        Ok(())
    }

    fn host_dir(&self) -> PathBuf {
        let mut guard = self.state.host_dir.lock().unwrap();
        guard
            .get_or_insert_with(|| {
                let dir = std::env::temp_dir().join(format!("atelier-{}", self.state.id));
                let _ = std::fs::create_dir_all(&dir);
                dir
            })
            .clone()
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn id(&self) -> &str {
        &self.state.id
    }

    async fn is_running(&self) -> Result<bool> {
        Ok(*self.state.running.lock().unwrap())
    }

    async fn set_timeout(&self, idle_timeout: Duration) -> Result<()> {
        self.ensure_running()?;
        *self.state.idle_timeout.lock().unwrap() = idle_timeout;
        Ok(())
    }

    async fn kill(&self) -> Result<bool> {
        let mut running = self.state.running.lock().unwrap();
        let was_running = *running;
        *running = false;
        Ok(was_running)
    }

    async fn write_files(&self, files: &[SandboxFile]) -> Result<()> {
        self.ensure_running()?;
        {
            let mut failing = self.state.failing_write_batches.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                anyhow::bail!("I/O error writing batch to sandbox {}", self.state.id);
            }
        }
        let mut fs = self.state.fs.lock().unwrap();
        for file in files {
            LocalSandboxState::insert_with_parents(
                &mut fs,
                &file.path,
                Node::File(file.content.clone()),
            );
        }
        Ok(())
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.ensure_running()?;
        if self.state.poisoned.lock().unwrap().contains(path) {
            anyhow::bail!("I/O error listing {}", path);
        }
        let fs = self.state.fs.lock().unwrap();
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut entries = Vec::new();
        for (key, node) in fs.iter() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') {
                    entries.push(DirEntry {
                        name: rest.to_string(),
                        is_dir: matches!(node, Node::Dir),
                    });
                }
            }
        }
        Ok(entries)
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        self.ensure_running()?;
        if self.state.poisoned.lock().unwrap().contains(path) {
            anyhow::bail!("I/O error reading {}", path);
        }
        let fs = self.state.fs.lock().unwrap();
        match fs.get(path) {
            Some(Node::File(content)) => Ok(content.clone()),
            Some(Node::Dir) => anyhow::bail!("{} is a directory", path),
            None => anyhow::bail!("No such file: {}", path),
        }
    }

    async fn run_command(&self, command: &str, _cwd: &str) -> Result<CommandOutput> {
        self.ensure_running()?;
        // Commands run on the host under a per-sandbox scratch dir; the
        // simulated cwd has no host counterpart.
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(self.host_dir())
            .output()
            .await
            .context("Failed to spawn local command")?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn resolve_host(&self, port: u16) -> Result<String> {
        self.ensure_running()?;
        let host = self.state.preview_host.lock().unwrap().clone();
        Ok(host.unwrap_or_else(|| format!("127.0.0.1:{}", port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let provider = LocalProvider::new();
        let sandbox = provider.create(Duration::from_secs(60)).await.unwrap();
        sandbox
            .write_files(&[SandboxFile {
                path: "/home/user/app/src/index.ts".into(),
                content: "export x".into(),
            }])
            .await
            .unwrap();

        let content = sandbox.read_file("/home/user/app/src/index.ts").await.unwrap();
        assert_eq!(content, "export x");

        // Parent directories are implied by the write.
        let entries = sandbox.list_dir("/home/user/app").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "src");
        assert!(entries[0].is_dir);
    }

    #[tokio::test]
    async fn test_connect_to_stopped_sandbox_fails() {
        let provider = LocalProvider::new();
        let sandbox = provider.create(Duration::from_secs(60)).await.unwrap();
        let id = sandbox.id().to_string();

        provider.set_running(&id, false);
        assert!(provider.connect(&id).await.is_err());
        assert_eq!(provider.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let provider = LocalProvider::new();
        let sandbox = provider.create(Duration::from_secs(60)).await.unwrap();
        let id = sandbox.id().to_string();

        assert!(provider.destroy(&id).await.unwrap());
        assert!(!provider.destroy(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_fail_next_write_batches_fails_then_recovers() {
        let provider = LocalProvider::new();
        provider.fail_next_write_batches(1);
        let sandbox = provider.create(Duration::from_secs(60)).await.unwrap();
        let files = [SandboxFile {
            path: "/home/user/app/a.txt".into(),
            content: "a".into(),
        }];
        assert!(sandbox.write_files(&files).await.is_err());
        assert!(sandbox.write_files(&files).await.is_ok());
    }

    #[tokio::test]
    async fn test_run_command_captures_output() {
        let provider = LocalProvider::new();
        let sandbox = provider.create(Duration::from_secs(60)).await.unwrap();
        let out = sandbox.run_command("echo hello", "/home/user/app").await.unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.trim(), "hello");
    }
}
