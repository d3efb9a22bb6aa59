//! Recursive enumeration of a sandbox's filesystem, pruning artifact
//! directories.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

use crate::config::EngineConfig;

use super::provider::Sandbox;

/// One entry collected by a walk, with its path relative to the walk root.
#[derive(Debug, Clone, PartialEq)]
pub struct WalkedEntry {
    pub path: String,
    pub content: String,
    pub is_folder: bool,
}

/// Best-effort walk result. Entries that could not be listed or read are
/// recorded in `unreadable` instead of aborting the walk, so call sites can
/// log them without special-casing control flow. `unreadable` holds
/// walk-relative paths; the empty string denotes the walk root itself.
#[derive(Debug, Default)]
pub struct WalkOutcome {
    pub entries: Vec<WalkedEntry>,
    pub unreadable: Vec<String>,
}

/// Walk the sandbox tree rooted at `dir`. Skip-set basenames are neither
/// emitted nor recursed into; directories emit a folder entry before their
/// children; files are read and emitted with content.
pub async fn walk(sandbox: &Arc<dyn Sandbox>, config: &EngineConfig, dir: &str) -> WalkOutcome {
    let mut outcome = WalkOutcome::default();
    walk_into(sandbox, config, dir, "", &mut outcome).await;
    outcome
}

fn walk_into<'a>(
    sandbox: &'a Arc<dyn Sandbox>,
    config: &'a EngineConfig,
    dir: &'a str,
    relative_base: &'a str,
    outcome: &'a mut WalkOutcome,
) -> BoxFuture<'a, ()> {
    async move {
        let entries = match sandbox.list_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir, error = %e, "Directory listing failed, skipping subtree");
                outcome.unreadable.push(relative_base.to_string());
                return;
            }
        };

        for entry in entries {
            if config.is_skipped(&entry.name) {
                continue;
            }
            let abs = format!("{}/{}", dir.trim_end_matches('/'), entry.name);
            let rel = if relative_base.is_empty() {
                entry.name.clone()
            } else {
                format!("{}/{}", relative_base, entry.name)
            };

            if entry.is_dir {
                outcome.entries.push(WalkedEntry {
                    path: rel.clone(),
                    content: String::new(),
                    is_folder: true,
                });
                walk_dir_owned(sandbox, config, abs, rel, outcome).await;
            } else {
                match sandbox.read_file(&abs).await {
                    Ok(content) => outcome.entries.push(WalkedEntry {
                        path: rel,
                        content,
                        is_folder: false,
                    }),
                    Err(e) => {
                        debug!(path = %abs, error = %e, "File read failed, skipping entry");
                        outcome.unreadable.push(rel);
                    }
                }
            }
        }
    }
    .boxed()
}

async fn walk_dir_owned(
    sandbox: &Arc<dyn Sandbox>,
    config: &EngineConfig,
    dir: String,
    relative_base: String,
    outcome: &mut WalkOutcome,
) {
    walk_into(sandbox, config, &dir, &relative_base, outcome).await;
}
