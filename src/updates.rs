//! Release check
//!
//! Asks GitHub for the latest release of the repository in `Cargo.toml` and
//! logs a notice when its tag differs from the running version.

use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use serde::Deserialize;
use std::thread;
use std::time::Duration;

use crate::{APP_NAME, APP_VERSION};

/// Delay before the check runs, so it does not compete with startup
pub const STARTUP_DELAY: Duration = Duration::from_millis(2500);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateNotice {
    pub current: String,
    pub latest: String,
    pub url: String,
}

/// `(owner, repo)` from a GitHub repository URL.
pub fn repo_slug(repository: &str) -> Option<(String, String)> {
    let path = repository
        .trim()
        .trim_end_matches('/')
        .strip_prefix("https://github.com/")?;
    let mut parts = path.split('/');
    let owner = parts.next().filter(|s| !s.is_empty())?;
    let repo = parts.next().filter(|s| !s.is_empty())?;
    if parts.next().is_some() {
        return None;
    }
    let repo = repo.strip_suffix(".git").unwrap_or(repo);
    Some((owner.to_string(), repo.to_string()))
}

fn strip_v(tag: &str) -> &str {
    let tag = tag.trim();
    tag.strip_prefix('v').unwrap_or(tag)
}

/// Any tag other than the running version counts, a leading `v` aside.
pub fn is_update(current: &str, latest: &str) -> bool {
    !latest.trim().is_empty() && strip_v(current) != strip_v(latest)
}

/// Fetch the latest release and compare it with `current`.
pub fn check(repository: &str, current: &str) -> Result<Option<UpdateNotice>> {
    let (owner, repo) =
        repo_slug(repository).ok_or_else(|| anyhow!("Not a GitHub repository: {repository}"))?;
    let url = format!("https://api.github.com/repos/{owner}/{repo}/releases/latest");

    let agent = ureq::Agent::config_builder()
        .timeout_global(Some(REQUEST_TIMEOUT))
        .build()
        .new_agent();

    let mut response = agent
        .get(&url)
        .header("User-Agent", APP_NAME)
        .header("Accept", "application/vnd.github+json")
        .call()
        .context("Release request failed")?;

    let body = response.body_mut().read_to_string()?;
    let release: Release = serde_json::from_str(&body).context("Unexpected release response")?;

    if !is_update(current, &release.tag_name) {
        return Ok(None);
    }

    Ok(Some(UpdateNotice {
        current: current.to_string(),
        latest: release.tag_name,
        url: format!("https://github.com/{owner}/{repo}/releases/latest"),
    }))
}

/// Run [`check`] once on its own thread after [`STARTUP_DELAY`].
pub fn check_in_background() {
    let spawned = thread::Builder::new()
        .name("update-check".to_string())
        .spawn(|| {
            thread::sleep(STARTUP_DELAY);
            match check(env!("CARGO_PKG_REPOSITORY"), APP_VERSION) {
                Ok(Some(notice)) => info!(
                    "🆕 A new version is available! Your version is {}. The latest version is currently {}: {}",
                    notice.current, notice.latest, notice.url
                ),
                Ok(None) => debug!("Running the latest release"),
                Err(e) => debug!("Update check failed: {e:#}"),
            }
        });

    if let Err(e) = spawned {
        debug!("Failed to start update check: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_slug() {
        assert_eq!(
            repo_slug("https://github.com/owner/mediaserver-presence"),
            Some(("owner".to_string(), "mediaserver-presence".to_string()))
        );
        assert_eq!(
            repo_slug("https://github.com/owner/repo.git/"),
            Some(("owner".to_string(), "repo".to_string()))
        );
        assert_eq!(repo_slug("https://gitlab.com/owner/repo"), None);
        assert_eq!(repo_slug("https://github.com/owner"), None);
        assert_eq!(repo_slug("https://github.com/owner/repo/tree/main"), None);
    }

    #[test]
    fn test_is_update() {
        assert!(!is_update("1.4.0", "1.4.0"));
        assert!(!is_update("1.4.0", "v1.4.0"));
        assert!(is_update("1.4.0", "v1.5.0"));
        // Any difference counts, including older tags
        assert!(is_update("1.4.0", "1.3.9"));
        assert!(!is_update("1.4.0", ""));
    }
}
