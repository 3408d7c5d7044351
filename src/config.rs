use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Client settings
// ---------------------------------------------------------------------------

/// Node configuration persisted on disk and reloaded by the refresh loop.
///
/// Every field except the secret has a default so that a freshly written
/// sample file only needs the secret filled in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Registration secret presented to the control plane.
    #[serde(default)]
    pub client_secret: String,
    /// Root directory of the on-disk image cache.
    #[serde(default = "default_cache_directory")]
    pub cache_directory: String,
    /// TCP port the HTTPS listener binds to.
    #[serde(default = "default_client_port")]
    pub client_port: u16,
    /// Upload bandwidth advertised to the control plane, in kilobits/s.
    #[serde(default = "default_max_kilobits_per_second")]
    pub max_kilobits_per_second: u64,
    /// Hard ceiling for the local cache, in MiB.
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size_in_mebibytes: u64,
    /// Disk space advertised to the control plane, in MiB.  Falls back to
    /// `max_cache_size_in_mebibytes` when unset.
    #[serde(default)]
    pub max_reported_size_in_mebibytes: Option<u64>,
    /// Upper bound on the drain wait after a shutdown signal.
    #[serde(default = "default_graceful_shutdown")]
    pub graceful_shutdown_in_seconds: u64,
    /// How often the cache engine scans for entries to evict.
    #[serde(default = "default_cache_scan_interval")]
    pub cache_scan_interval_in_seconds: u64,
    /// Minimum age before a cache hit refreshes an entry's access time.
    #[serde(default = "default_cache_refresh_age")]
    pub cache_refresh_age_in_seconds: u64,
    /// Drain completes once no request has finished for this long.
    #[serde(default = "default_drain_idle")]
    pub drain_idle_seconds: u64,
    /// Base URL of the control plane (`/ping` and `/stop` are appended).
    #[serde(default = "default_control_plane_url")]
    pub control_plane_url: String,
    /// Embedding site allowed by CORS; also anchors referer normalization.
    #[serde(default = "default_allowed_origin")]
    pub allowed_origin: String,
    /// Release document consulted by the advisory version check.
    #[serde(default)]
    pub release_check_url: Option<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            client_secret: String::new(),
            cache_directory: default_cache_directory(),
            client_port: default_client_port(),
            max_kilobits_per_second: default_max_kilobits_per_second(),
            max_cache_size_in_mebibytes: default_max_cache_size(),
            max_reported_size_in_mebibytes: None,
            graceful_shutdown_in_seconds: default_graceful_shutdown(),
            cache_scan_interval_in_seconds: default_cache_scan_interval(),
            cache_refresh_age_in_seconds: default_cache_refresh_age(),
            drain_idle_seconds: default_drain_idle(),
            control_plane_url: default_control_plane_url(),
            allowed_origin: default_allowed_origin(),
            release_check_url: None,
        }
    }
}

impl ClientSettings {
    /// Cache size limit in bytes.
    pub fn cache_limit_bytes(&self) -> u64 {
        self.max_cache_size_in_mebibytes.saturating_mul(1024 * 1024)
    }

    /// Disk space advertised to the control plane, in bytes.
    pub fn reported_disk_space_bytes(&self) -> u64 {
        self.max_reported_size_in_mebibytes
            .unwrap_or(self.max_cache_size_in_mebibytes)
            .saturating_mul(1024 * 1024)
    }

    /// Advertised network speed in bytes per second.
    pub fn network_speed_bytes_per_second(&self) -> u64 {
        self.max_kilobits_per_second.saturating_mul(1000) / 8
    }
}

fn default_cache_directory() -> String {
    "cache/".to_string()
}

fn default_client_port() -> u16 {
    44300
}

fn default_max_kilobits_per_second() -> u64 {
    10_000
}

fn default_max_cache_size() -> u64 {
    1024
}

fn default_graceful_shutdown() -> u64 {
    60
}

fn default_cache_scan_interval() -> u64 {
    60
}

fn default_cache_refresh_age() -> u64 {
    3600
}

fn default_drain_idle() -> u64 {
    30
}

fn default_control_plane_url() -> String {
    "https://api.mangadex.network".to_string()
}

fn default_allowed_origin() -> String {
    "https://mangadex.org".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate [`ClientSettings`] from a YAML file at `path`.
pub fn load_settings<P: AsRef<Path>>(path: P) -> Result<ClientSettings> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file: {}", path.display()))?;
    let settings: ClientSettings = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse settings file: {}", path.display()))?;
    validate_settings(&settings)?;
    Ok(settings)
}

/// Write a sample settings file with every default filled in.
pub fn write_sample_settings<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    let sample = serde_yaml::to_string(&ClientSettings::default())
        .context("failed to serialize sample settings")?;
    std::fs::write(path, sample)
        .with_context(|| format!("failed to write sample settings: {}", path.display()))?;
    Ok(())
}

/// Checks that cannot be expressed purely with serde.
fn validate_settings(settings: &ClientSettings) -> Result<()> {
    anyhow::ensure!(
        !settings.client_secret.trim().is_empty(),
        "client_secret is empty; cannot register with the control plane"
    );
    anyhow::ensure!(
        !settings.cache_directory.trim().is_empty(),
        "cache_directory is empty"
    );
    anyhow::ensure!(
        !settings.control_plane_url.trim().is_empty(),
        "control_plane_url is empty"
    );
    anyhow::ensure!(
        settings.cache_scan_interval_in_seconds > 0,
        "cache_scan_interval_in_seconds must be positive"
    );
    Ok(())
}
