//! Upstream proxy configuration.
//!
//! The configuration is read once when a server/client pair is constructed.
//! Changing it means building a new pair; nothing here is reloaded while
//! connections are running.

use std::{
    collections::BTreeSet,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use n0_error::e;
use serde::Deserialize;

use crate::error::ConfigError;

/// Default upstream port when the config omits one.
pub const DEFAULT_UPSTREAM_PORT: u16 = 1080;

/// File name the config loader looks for in each candidate directory.
pub const CONFIG_FILE_NAME: &str = "chain-proxy.json";

/// Protocol spoken by the upstream proxy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum UpstreamKind {
    /// HTTP proxy using CONNECT tunnels.
    #[default]
    Http,
    /// SOCKS5 proxy.
    Socks5,
}

impl fmt::Display for UpstreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => f.write_str("http"),
            Self::Socks5 => f.write_str("socks5"),
        }
    }
}

impl FromStr for UpstreamKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "socks5" | "socks" => Ok(Self::Socks5),
            other => Err(format!("unknown upstream type {other:?}")),
        }
    }
}

impl TryFrom<String> for UpstreamKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Upstream proxy the local server tunnels through.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    #[serde(rename = "type")]
    pub kind: UpstreamKind,
    pub host: String,
    pub port: u16,
    /// May be empty.
    pub username: String,
    /// May be empty.
    pub password: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            kind: UpstreamKind::Http,
            host: String::new(),
            port: DEFAULT_UPSTREAM_PORT,
            username: String::new(),
            password: String::new(),
        }
    }
}

impl fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .finish()
    }
}

impl UpstreamConfig {
    pub fn new(kind: UpstreamKind, host: impl Into<String>, port: u16) -> Self {
        Self {
            kind,
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Sets username and password for the upstream.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Returns `host:port` of the upstream proxy for dialing.
    pub fn addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Returns true if the config has the minimum needed to start a tunnel.
    pub fn is_complete(&self) -> bool {
        !self.host.trim().is_empty() && self.port != 0
    }

    /// Checks that host and port are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(e!(ConfigError::Invalid {
                message: "upstream host is empty".to_string()
            }));
        }
        if self.port == 0 {
            return Err(e!(ConfigError::Invalid {
                message: "upstream port must be in 1..=65535".to_string()
            }));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfigFile {
    #[serde(default)]
    proxy: Option<UpstreamConfig>,
    #[serde(default)]
    default_packages: Vec<String>,
}

/// On-disk configuration document.
///
/// ```json
/// {
///   "proxy": { "type": "socks5", "host": "10.0.0.1", "port": 1080, "username": "", "password": "" },
///   "defaultPackages": ["com.android.chrome"]
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfigFile {
    /// Upstream proxy, if the file defines one.
    pub proxy: Option<UpstreamConfig>,
    /// Application identifiers for the host tunnel subsystem to route.
    pub default_packages: BTreeSet<String>,
}

impl ProxyConfigFile {
    /// Parses a config document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let raw: RawConfigFile =
            serde_json::from_str(json).map_err(|source| e!(ConfigError::Parse { source }))?;
        let default_packages = raw
            .default_packages
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .map(ToOwned::to_owned)
            .collect();
        Ok(Self {
            proxy: raw.proxy,
            default_packages,
        })
    }

    /// Reads and parses a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| {
            e!(ConfigError::Read {
                path: path.to_path_buf(),
                source
            })
        })?;
        Self::from_json(&json)
    }

    /// Loads [`CONFIG_FILE_NAME`] from the first candidate directory that has one.
    ///
    /// Returns `Ok(None)` if no candidate contains the file.
    pub fn load_first(
        dirs: impl IntoIterator<Item = impl AsRef<Path>>,
    ) -> Result<Option<(PathBuf, Self)>, ConfigError> {
        for dir in dirs {
            let path = dir.as_ref().join(CONFIG_FILE_NAME);
            if path.is_file() {
                let config = Self::load(&path)?;
                return Ok(Some((path, config)));
            }
        }
        Ok(None)
    }
}
