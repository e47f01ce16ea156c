use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Sonarr,
    Radarr,
    Lidarr,
    Readarr,
    Prowlarr,
    Overseerr,
    Tautulli,
    Sabnzbd,
    Nzbget,
    Qbittorrent,
    Deluge,
    Jackett,
    Unraid,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 13] = [
        ServiceKind::Sonarr,
        ServiceKind::Radarr,
        ServiceKind::Lidarr,
        ServiceKind::Readarr,
        ServiceKind::Prowlarr,
        ServiceKind::Overseerr,
        ServiceKind::Tautulli,
        ServiceKind::Sabnzbd,
        ServiceKind::Nzbget,
        ServiceKind::Qbittorrent,
        ServiceKind::Deluge,
        ServiceKind::Jackett,
        ServiceKind::Unraid,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sonarr => "sonarr",
            Self::Radarr => "radarr",
            Self::Lidarr => "lidarr",
            Self::Readarr => "readarr",
            Self::Prowlarr => "prowlarr",
            Self::Overseerr => "overseerr",
            Self::Tautulli => "tautulli",
            Self::Sabnzbd => "sabnzbd",
            Self::Nzbget => "nzbget",
            Self::Qbittorrent => "qbittorrent",
            Self::Deluge => "deluge",
            Self::Jackett => "jackett",
            Self::Unraid => "unraid",
        }
    }

    /// Allowlist key used for connection tests and `check-service`.
    pub fn status_endpoint(self) -> &'static str {
        match self {
            Self::Sonarr | Self::Radarr => "v3/system/status",
            Self::Lidarr | Self::Readarr | Self::Prowlarr => "v1/system/status",
            Self::Overseerr => "v1/status",
            Self::Tautulli => "tautulli/activity",
            Self::Sabnzbd => "sabnzbd/version",
            Self::Nzbget => "nzbget/version",
            Self::Qbittorrent => "v2/app/version",
            Self::Deluge => "deluge/check-session",
            Self::Jackett => "jackett/indexers",
            Self::Unraid => "unraid/system-stats",
        }
    }

    pub fn supports_subscriptions(self) -> bool {
        matches!(self, Self::Unraid)
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownServiceKind(pub String);

impl fmt::Display for UnknownServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown service kind '{}'", self.0)
    }
}

impl std::error::Error for UnknownServiceKind {}

impl FromStr for ServiceKind {
    type Err = UnknownServiceKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownServiceKind(s.to_string()))
    }
}

/// Connection material for one instance. `base_url` is untrusted until validated.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ServiceEndpointConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for ServiceEndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceEndpointConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Service listing as returned to dashboard clients, with credentials stripped.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServiceSummary {
    pub id: String,
    pub kind: ServiceKind,
    pub name: String,
    pub url: String,
    pub enabled: bool,
    pub has_api_key: bool,
    pub has_basic_auth: bool,
}
