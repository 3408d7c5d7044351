//! Advisory check against the latest published release.
//!
//! Never fatal: an outdated build only delays startup, and a failed check is
//! logged and ignored.

use std::cmp::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

/// Startup delay applied when a newer release exists.
pub const OUTDATED_STARTUP_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct ReleaseDocument {
    tag_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseStatus {
    Latest,
    Outdated { latest: String },
}

/// Fetch the release document at `url` and compare its tag to `current`.
pub async fn check_latest_release(
    http: &reqwest::Client,
    url: &str,
    current: &str,
) -> Result<ReleaseStatus> {
    let doc: ReleaseDocument = http
        .get(url)
        .send()
        .await
        .with_context(|| format!("failed to fetch release document from {url}"))?
        .error_for_status()
        .context("release document request failed")?
        .json()
        .await
        .context("failed to decode release document")?;

    match compare_versions(current, &doc.tag_name) {
        Some(Ordering::Less) => Ok(ReleaseStatus::Outdated {
            latest: doc.tag_name,
        }),
        Some(_) => Ok(ReleaseStatus::Latest),
        None => anyhow::bail!("unparseable release tag {:?}", doc.tag_name),
    }
}

/// Run the check and apply its advisory effects.
pub async fn advise(http: &reqwest::Client, url: &str, current: &str) {
    match check_latest_release(http, url, current).await {
        Ok(ReleaseStatus::Latest) => info!(version = current, "client is up to date"),
        Ok(ReleaseStatus::Outdated { latest }) => {
            warn!(
                version = current,
                %latest,
                delay_secs = OUTDATED_STARTUP_DELAY.as_secs(),
                "client is not the latest release; starting after a short delay"
            );
            tokio::time::sleep(OUTDATED_STARTUP_DELAY).await;
        }
        Err(e) => warn!(error = %e, version = current, "failed to check client version; proceed with caution"),
    }
}

fn parse_version(raw: &str) -> Option<Vec<u64>> {
    let trimmed = raw.trim().trim_start_matches(['v', 'V']);
    let core = trimmed.split(['-', '+']).next()?;
    core.split('.').map(|part| part.parse().ok()).collect()
}

/// Compare dotted numeric versions, treating missing components as zero.
fn compare_versions(a: &str, b: &str) -> Option<Ordering> {
    let a = parse_version(a)?;
    let b = parse_version(b)?;
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return Some(other),
        }
    }
    Some(Ordering::Equal)
}
