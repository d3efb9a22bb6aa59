use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::errors::EngineError;

/// Directory basenames never persisted, never restored, and never reported
/// by the walker. Regenerable build output, dependency caches, and
/// version-control metadata.
pub const DEFAULT_SKIP_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    ".next",
    "dist",
    "build",
    "out",
    "coverage",
    ".turbo",
    ".cache",
    ".vercel",
];

/// Fixed working directory inside every sandbox.
pub const DEFAULT_WORKING_DIR: &str = "/home/user/app";

/// Runtime configuration for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL of the remote sandbox provider API.
    pub provider_base_url: Option<String>,
    /// API key for the remote provider.
    pub provider_api_key: Option<String>,
    /// Idle timeout applied to every sandbox, refreshed on reuse.
    pub idle_timeout_secs: u64,
    /// Files per write batch during restore (store → sandbox).
    pub restore_batch_size: usize,
    /// Records per upsert batch during persist (sandbox → store).
    pub persist_batch_size: usize,
    /// Working directory inside the sandbox.
    pub working_dir: String,
    /// Port the sandboxed dev server listens on.
    pub preview_port: u16,
    /// Scheme used to reach the sandbox preview host.
    pub preview_scheme: String,
    /// Artifact directory basenames excluded from sync and walking.
    pub skip_dirs: HashSet<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider_base_url: None,
            provider_api_key: None,
            idle_timeout_secs: 3600,
            restore_batch_size: 50,
            persist_batch_size: 100,
            working_dir: DEFAULT_WORKING_DIR.to_string(),
            preview_port: 3000,
            preview_scheme: "https".to_string(),
            skip_dirs: DEFAULT_SKIP_DIRS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Raw TOML structure for `atelier.toml`.
#[derive(Debug, Deserialize)]
struct EngineToml {
    engine: Option<EngineSection>,
}

#[derive(Debug, Deserialize)]
struct EngineSection {
    provider_base_url: Option<String>,
    idle_timeout_secs: Option<u64>,
    restore_batch_size: Option<usize>,
    persist_batch_size: Option<usize>,
    working_dir: Option<String>,
    preview_port: Option<u16>,
    preview_scheme: Option<String>,
    skip_dirs: Option<Vec<String>>,
}

impl EngineConfig {
    /// Load configuration from `atelier.toml` in the given directory,
    /// overlaid with environment variables. Returns defaults when the
    /// file doesn't exist. The API key is only ever read from the
    /// environment, never from the file.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut config = Self::default();

        let config_path = dir.join("atelier.toml");
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            let toml: EngineToml = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?;
            if let Some(section) = toml.engine {
                if let Some(url) = section.provider_base_url {
                    config.provider_base_url = Some(url);
                }
                if let Some(secs) = section.idle_timeout_secs {
                    config.idle_timeout_secs = secs;
                }
                if let Some(n) = section.restore_batch_size {
                    config.restore_batch_size = n;
                }
                if let Some(n) = section.persist_batch_size {
                    config.persist_batch_size = n;
                }
                if let Some(dir) = section.working_dir {
                    config.working_dir = dir;
                }
                if let Some(port) = section.preview_port {
                    config.preview_port = port;
                }
                if let Some(scheme) = section.preview_scheme {
                    config.preview_scheme = scheme;
                }
                if let Some(dirs) = section.skip_dirs {
                    config.skip_dirs = dirs.into_iter().collect();
                }
            }
        }

        if let Ok(url) = std::env::var("ATELIER_PROVIDER_URL") {
            config.provider_base_url = Some(url);
        }
        if let Ok(key) = std::env::var("ATELIER_PROVIDER_API_KEY") {
            config.provider_api_key = Some(key);
        }

        Ok(config)
    }

    /// Exact basename match against the skip-set.
    pub fn is_skipped(&self, basename: &str) -> bool {
        self.skip_dirs.contains(basename)
    }

    /// Fail fast at startup when the remote provider is selected but
    /// credentials are missing.
    pub fn require_provider_credentials(&self) -> Result<(String, String), EngineError> {
        let url = self.provider_base_url.clone().ok_or_else(|| {
            EngineError::Configuration(
                "provider base URL not set (ATELIER_PROVIDER_URL or atelier.toml)".into(),
            )
        })?;
        let key = self.provider_api_key.clone().ok_or_else(|| {
            EngineError::Configuration("ATELIER_PROVIDER_API_KEY not set".into())
        })?;
        Ok((url, key))
    }
}

/// Configuration for the HTTP server.
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
    /// Use the in-process provider instead of the remote one.
    pub local_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4100,
            db_path: PathBuf::from(".atelier/engine.db"),
            dev_mode: false,
            local_mode: false,
        }
    }
}
