//! Locating a usable `tahoe` executable and validating grid addresses

use crate::nodedir::NodeDir;
use crate::process::{ProcessLauncher, ProcessRunner};
use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

static FURL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^pb://[a-z2-7]+@[a-zA-Z0-9.:,-]+:\d+/[a-z2-7]+$").expect("valid regex")
});

const MIN_VERSION: (u32, u32) = (1, 12);

/// Whether `furl` looks like a Foolscap introducer reference
pub fn is_valid_furl(furl: &str) -> bool {
    FURL_RE.is_match(furl)
}

/// `>= 1.12`, or a development build reporting `unknown`
pub fn version_is_supported(version: &str) -> bool {
    let mut parts = version.split('.');
    let major = parts.next().and_then(|p| p.parse::<u32>().ok());
    let minor = parts.next().and_then(|p| p.parse::<u32>().ok());
    match (major, minor) {
        (Some(major), Some(minor)) => (major, minor) >= MIN_VERSION,
        _ => {
            if version != "unknown" {
                warn!("Could not parse/compare version of '{}'", version);
            }
            version == "unknown"
        }
    }
}

/// First `tahoe` on `PATH` with a supported version
pub async fn select_executable(launcher: Arc<dyn ProcessLauncher>) -> Option<PathBuf> {
    let candidates: Vec<PathBuf> = match which::which_all("tahoe") {
        Ok(found) => found.collect(),
        Err(e) => {
            debug!("No tahoe on PATH: {}", e);
            return None;
        }
    };
    select_from(candidates, launcher).await
}

/// Query each candidate's `--version` in parallel; keep candidate order
pub async fn select_from(candidates: Vec<PathBuf>, launcher: Arc<dyn ProcessLauncher>) -> Option<PathBuf> {
    let nodedir = NodeDir::default_location();
    let queries = candidates.into_iter().map(|executable| {
        let runner = ProcessRunner::new(nodedir.clone(), Some(executable.clone()), launcher.clone());
        async move {
            debug!("Found {}; getting version...", executable.display());
            let version = runner
                .command(&["--version"])
                .await
                .ok()
                .and_then(|output| crate::gateway::parse_version_output(&output));
            (executable, version)
        }
    });
    join_all(queries)
        .await
        .into_iter()
        .find_map(|(executable, version)| {
            let version = version?;
            debug!("{} has version '{}'", executable.display(), version);
            version_is_supported(&version).then_some(executable)
        })
}
