use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

/// Top-level `config.toml`.
///
/// There is intentionally no setting that relaxes host-key checking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub known_hosts: KnownHostsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Set to `false` to never consult an SSH agent.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Agent socket.  Falls back to `$SSH_AUTH_SOCK` when unset.
    #[serde(default)]
    pub socket: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            socket: None,
        }
    }
}

impl AgentConfig {
    /// The socket to connect to, if any.
    pub fn resolve_socket(&self) -> Option<PathBuf> {
        if !self.enabled {
            return None;
        }
        self.socket
            .clone()
            .or_else(|| std::env::var_os("SSH_AUTH_SOCK").map(PathBuf::from))
            .filter(|p| !p.as_os_str().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownHostsConfig {
    /// Defaults to `~/.ssh/known_hosts`.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Ask the user about hosts with no recorded key instead of rejecting
    /// them outright.  Changed keys are always rejected.
    #[serde(default = "default_true")]
    pub prompt_unknown: bool,
}

impl Default for KnownHostsConfig {
    fn default() -> Self {
        Self {
            path: None,
            prompt_unknown: true,
        }
    }
}

impl KnownHostsConfig {
    pub fn resolve_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| home_dir().join(".ssh").join("known_hosts"))
    }
}

fn default_true() -> bool {
    true
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// `$XDG_CONFIG_HOME/agit/config.toml`, falling back to `~/.config`.
pub fn default_config_path() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| {
            tracing::warn!("neither XDG_CONFIG_HOME nor HOME are set; using current directory for config");
            PathBuf::from(".")
        });
    base.join("agit").join("config.toml")
}

/// Load `path`.  No file means the defaults.
///
/// The file picks which agent signs and which known_hosts file is trusted,
/// so one that group or others can write to is reported.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Config::default());
        }
        Err(e) => {
            return Err(anyhow::Error::new(e).context(format!("read {}", path.display())));
        }
    };

    if let Some(mode) = shared_write_mode(path) {
        tracing::warn!(
            path = %path.display(),
            mode = format!("{mode:o}"),
            "config is writable by group or others; it selects the agent socket and known_hosts file"
        );
    }

    toml::from_str(&content).with_context(|| format!("parse {}", path.display()))
}

/// The file's permission bits when group or others may write it.
#[cfg(unix)]
fn shared_write_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::MetadataExt;
    let mode = std::fs::metadata(path).ok()?.mode() & 0o777;
    (mode & 0o022 != 0).then_some(mode)
}

#[cfg(not(unix))]
fn shared_write_mode(_path: &Path) -> Option<u32> {
    None
}
