//! HTTP preview forwarding with root-relative asset URL rewriting.
//!
//! The proxy resolves the project's sandbox host through the registry and
//! relays the response. HTML responses get their root-relative `href`/`src`
//! targets rewritten to stay routed through the proxy's mount path. Every
//! upstream failure except "no sandbox provisioned" is masked behind a
//! fixed fallback page so a preview iframe never shows a raw network error.

use anyhow::Context;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::errors::EngineError;

use super::registry::SandboxRegistry;

const FALLBACK_HTML: &str = "<!DOCTYPE html>\n<html>\n<head><title>Preview unavailable</title></head>\n<body style=\"font-family: sans-serif; display: flex; align-items: center; justify-content: center; height: 100vh; margin: 0;\">\n<div style=\"text-align: center;\">\n<h1>Preview unavailable</h1>\n<p>The dev server is starting or not responding. Try again in a moment.</p>\n</div>\n</body>\n</html>\n";

/// A relayed preview response.
#[derive(Debug, Clone)]
pub struct PreviewResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl PreviewResponse {
    fn fallback() -> Self {
        Self {
            status: 503,
            content_type: "text/html; charset=utf-8".to_string(),
            body: FALLBACK_HTML.as_bytes().to_vec(),
        }
    }
}

/// Forward a request to the project's sandbox preview port.
///
/// `mount_prefix` is the proxy's own mount path for this project (no
/// trailing slash); rewritten asset URLs are prefixed with it. The only
/// error this returns is `NotProvisioned` — "never started" must stay
/// distinguishable from a transient upstream failure, which yields the
/// fallback page instead.
pub async fn forward(
    registry: &SandboxRegistry,
    config: &EngineConfig,
    client: &reqwest::Client,
    project_id: &str,
    path: &str,
    mount_prefix: &str,
) -> Result<PreviewResponse, EngineError> {
    let provisioned = registry
        .peek(project_id)
        .ok_or_else(|| EngineError::not_provisioned(project_id))?;

    match fetch_upstream(config, client, &provisioned, path).await {
        Ok(mut response) => {
            if response.status == 200 && response.content_type.contains("text/html") {
                let html = String::from_utf8_lossy(&response.body);
                response.body = rewrite_root_relative(&html, mount_prefix).into_bytes();
            }
            Ok(response)
        }
        Err(e) => {
            warn!(project_id, path, error = %e, "Preview upstream failed, serving fallback page");
            Ok(PreviewResponse::fallback())
        }
    }
}

async fn fetch_upstream(
    config: &EngineConfig,
    client: &reqwest::Client,
    provisioned: &super::models::Provisioned,
    path: &str,
) -> Result<PreviewResponse, EngineError> {
    let host = provisioned
        .sandbox
        .resolve_host(config.preview_port)
        .await
        .context("Failed to resolve preview host")?;
    let url = format!(
        "{}://{}/{}",
        config.preview_scheme,
        host,
        path.trim_start_matches('/')
    );

    debug!(%url, "Forwarding preview request");
    let resp = client
        .get(&url)
        .send()
        .await
        .context("Preview upstream unreachable")?;

    let status = resp.status().as_u16();
    // A crashed or mis-starting dev server answers 5xx; that is an
    // upstream failure, not content to relay.
    if resp.status().is_server_error() {
        return Err(EngineError::ProxyUpstream { status });
    }
    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let body = resp
        .bytes()
        .await
        .context("Failed to read preview upstream body")?
        .to_vec();

    Ok(PreviewResponse {
        status,
        content_type,
        body,
    })
}

/// Prefix root-relative `href`/`src` targets with the proxy mount path.
///
/// Matches both quote styles. A target starting with `//` is
/// protocol-relative, not root-relative, and is left alone.
pub fn rewrite_root_relative(html: &str, mount_prefix: &str) -> String {
    const PATTERNS: [&str; 4] = ["href=\"", "href='", "src=\"", "src='"];

    let mut out = String::with_capacity(html.len() + 64);
    let mut rest = html;
    while !rest.is_empty() {
        let matched = PATTERNS
            .iter()
            .filter_map(|p| rest.starts_with(p).then_some(p.len()))
            .next();
        if let Some(len) = matched {
            let after = &rest[len..];
            if after.starts_with('/') && !after.starts_with("//") {
                out.push_str(&rest[..len]);
                out.push_str(mount_prefix);
                rest = after;
                continue;
            }
        }
        let ch = rest.chars().next().unwrap();
        out.push(ch);
        rest = &rest[ch.len_utf8()..];
    }
    out
}
