use std::fmt;

use serde::Deserialize;

/// Operating assignment returned by the control plane's `/ping`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerAssignment {
    /// Base URL of the origin image server.
    #[serde(alias = "image_server")]
    pub image_server: String,
    /// TLS identity.  Required on the first ping, optional afterwards.
    #[serde(default)]
    pub tls: Option<TlsCredentials>,
    /// Public URL the control plane advertises for this node.
    #[serde(default)]
    pub url: Option<String>,
    /// Most recent build number known to the control plane.
    #[serde(default, alias = "latest_build")]
    pub latest_build: Option<u64>,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub compromised: bool,
}

impl ServerAssignment {
    /// Origin URL for a sanitized cache key (`/type/hash/file`).
    pub fn origin_url(&self, key: &str) -> String {
        format!("{}{}", self.image_server.trim_end_matches('/'), key)
    }

    /// Keep the previously held TLS identity when a re-ping omits it.
    pub fn inherit_tls(mut self, previous: &ServerAssignment) -> Self {
        if self.tls.is_none() {
            self.tls = previous.tls.clone();
        }
        self
    }
}

/// PEM-encoded certificate chain and private key.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsCredentials {
    #[serde(default, alias = "created_at")]
    pub created_at: Option<String>,
    pub certificate: String,
    #[serde(alias = "private_key")]
    pub private_key: String,
}

// The private key must never end up in logs.
impl fmt::Debug for TlsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsCredentials")
            .field("created_at", &self.created_at)
            .field("certificate_len", &self.certificate.len())
            .field("private_key", &"<redacted>")
            .finish()
    }
}
