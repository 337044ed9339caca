//! SSH client and per-attempt session configuration.
//!
//! [`SshClient`] is what a session factory builds for each connection
//! attempt: a host key repository plus a list of identities.  Sessions opened
//! from it take a snapshot of both.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use agit_core::{HostKeyError, HostKeyRepository, HostKeyStatus, SourceError, UserInfo};
use tracing::{debug, info, warn};

use crate::identity::Identity;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("identity {name} could not be unlocked")]
    Locked { name: String },
    #[error("no identity matches the requested public key")]
    NoSuchIdentity,
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    HostKey(#[from] HostKeyError),
}

/// Where the transport looks for per-user SSH files.
#[derive(Debug, Clone)]
pub struct FsLayout {
    home: PathBuf,
}

impl FsLayout {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// Layout rooted at `$HOME` (or the current directory).
    pub fn from_env() -> Self {
        Self::new(
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        )
    }

    pub fn ssh_dir(&self) -> PathBuf {
        self.home.join(".ssh")
    }
}

/// A resolved connection target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDescriptor {
    /// Name the user typed (may be an ssh_config alias).
    pub alias: String,
    pub hostname: String,
    pub port: u16,
    pub user: Option<String>,
}

impl HostDescriptor {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        let hostname = hostname.into();
        Self {
            alias: hostname.clone(),
            hostname,
            port,
            user: None,
        }
    }

    /// The name under which this host's key is recorded in known_hosts.
    pub fn host_key_name(&self) -> String {
        if self.port == 22 {
            self.hostname.clone()
        } else {
            format!("[{}]:{}", self.hostname, self.port)
        }
    }
}

/// Host-key checking mode.
///
/// There is no permissive mode: an unknown host is either rejected (`Yes`)
/// or put to the user (`Ask`).  A changed key is rejected in both modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrictHostKeyChecking {
    Yes,
    #[default]
    Ask,
}

// ---------------------------------------------------------------------------
// SshClient
// ---------------------------------------------------------------------------

pub struct SshClient {
    ssh_dir: PathBuf,
    host_key_repository: Option<Arc<dyn HostKeyRepository>>,
    identities: Vec<Arc<dyn Identity>>,
}

impl fmt::Debug for SshClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshClient")
            .field("ssh_dir", &self.ssh_dir)
            .field(
                "host_key_repository",
                &self.host_key_repository.as_ref().map(|r| r.id().to_string()),
            )
            .field("identities", &self.identity_names())
            .finish()
    }
}

impl SshClient {
    pub fn new(fs: &FsLayout) -> Self {
        Self {
            ssh_dir: fs.ssh_dir(),
            host_key_repository: None,
            identities: Vec::new(),
        }
    }

    pub fn ssh_dir(&self) -> &Path {
        &self.ssh_dir
    }

    pub fn set_host_key_repository(&mut self, repository: Arc<dyn HostKeyRepository>) {
        self.host_key_repository = Some(repository);
    }

    pub fn host_key_repository(&self) -> Option<&Arc<dyn HostKeyRepository>> {
        self.host_key_repository.as_ref()
    }

    /// Register an identity, unlocking it with `passphrase` if given.
    ///
    /// An encrypted identity added without a passphrase is kept; it is
    /// unlocked (or skipped) when the session tries it.
    pub fn add_identity(
        &mut self,
        identity: Arc<dyn Identity>,
        passphrase: Option<&[u8]>,
    ) -> Result<(), ClientError> {
        if let Some(passphrase) = passphrase
            && identity.is_encrypted()
            && !identity.set_passphrase(passphrase)?
        {
            return Err(ClientError::Locked {
                name: identity.name().to_string(),
            });
        }
        debug!(
            identity = %identity.name(),
            algorithm = identity.algorithm().unwrap_or("unknown"),
            "client: adding identity"
        );
        self.identities.push(identity);
        Ok(())
    }

    pub fn identities(&self) -> &[Arc<dyn Identity>] {
        &self.identities
    }

    pub fn identity_names(&self) -> Vec<&str> {
        self.identities.iter().map(|i| i.name()).collect()
    }

    /// Open a not-yet-connected session for `host`.
    pub fn session(&self, user: impl Into<String>, host: HostDescriptor) -> Session {
        Session {
            user: user.into(),
            host,
            strict_host_key_checking: StrictHostKeyChecking::default(),
            user_info: None,
            host_key_repository: self.host_key_repository.clone(),
            identities: self.identities.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Configuration for a single connection attempt.
pub struct Session {
    user: String,
    host: HostDescriptor,
    strict_host_key_checking: StrictHostKeyChecking,
    user_info: Option<Arc<dyn UserInfo>>,
    host_key_repository: Option<Arc<dyn HostKeyRepository>>,
    identities: Vec<Arc<dyn Identity>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user", &self.user)
            .field("host", &self.host)
            .field("strict_host_key_checking", &self.strict_host_key_checking)
            .field("user_info", &self.user_info.is_some())
            .field("identities", &self.identities.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn strict_host_key_checking(&self) -> StrictHostKeyChecking {
        self.strict_host_key_checking
    }

    pub fn set_strict_host_key_checking(&mut self, mode: StrictHostKeyChecking) {
        self.strict_host_key_checking = mode;
    }

    pub fn user_info(&self) -> Option<&Arc<dyn UserInfo>> {
        self.user_info.as_ref()
    }

    pub fn set_user_info(&mut self, user_info: Arc<dyn UserInfo>) {
        self.user_info = Some(user_info);
    }

    pub fn identities(&self) -> &[Arc<dyn Identity>] {
        &self.identities
    }

    /// Decide whether the key the server presented is acceptable.
    pub fn verify_host_key(&self, key: &[u8]) -> Result<(), HostKeyError> {
        let repository = self
            .host_key_repository
            .as_ref()
            .ok_or(HostKeyError::NoRepository)?;
        let host = self.host.host_key_name();
        let fingerprint =
            agit_core::fingerprint(key).unwrap_or_else(|| "(unparseable key)".to_string());

        match repository.check(&host, key) {
            HostKeyStatus::Trusted => {
                debug!(%host, %fingerprint, "host key trusted");
                Ok(())
            }
            HostKeyStatus::Changed => {
                warn!(%host, %fingerprint, repository = repository.id(), "host key mismatch");
                if let Some(ui) = &self.user_info {
                    ui.show_message(&format!(
                        "WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!\n\
                         The {} host key for {host} has fingerprint {fingerprint},\n\
                         which does not match the key recorded in {}.",
                        agit_core::key_algorithm(key).unwrap_or("unknown"),
                        repository.id()
                    ));
                }
                Err(HostKeyError::Changed { host, fingerprint })
            }
            HostKeyStatus::Unknown => match self.strict_host_key_checking {
                StrictHostKeyChecking::Yes => {
                    warn!(%host, %fingerprint, "unknown host rejected (strict checking)");
                    Err(HostKeyError::Unknown { host })
                }
                StrictHostKeyChecking::Ask => {
                    let accepted = self.user_info.as_ref().is_some_and(|ui| {
                        ui.prompt_yes_no(&format!(
                            "The authenticity of host '{host}' can't be established.\n\
                             Key fingerprint is {fingerprint}.\n\
                             Are you sure you want to continue connecting?"
                        ))
                    });
                    if !accepted {
                        return Err(HostKeyError::Rejected { host });
                    }
                    repository.add(&host, key)?;
                    info!(%host, %fingerprint, "host key added");
                    Ok(())
                }
            },
        }
    }

    /// Sign `data` with the identity whose public key is `public_key`.
    pub async fn sign_with(&self, public_key: &[u8], data: &[u8]) -> Result<Vec<u8>, ClientError> {
        let identity = self
            .identities
            .iter()
            .find(|i| i.public_key_blob() == public_key)
            .ok_or(ClientError::NoSuchIdentity)?;

        if identity.is_encrypted() {
            let prompt = format!("Passphrase for {}", identity.name());
            let passphrase = self
                .user_info
                .as_ref()
                .and_then(|ui| ui.prompt_passphrase(&prompt));
            let unlocked = match passphrase {
                Some(p) => identity.set_passphrase(p.as_bytes())?,
                None => false,
            };
            if !unlocked {
                return Err(ClientError::Locked {
                    name: identity.name().to_string(),
                });
            }
        }

        Ok(identity.sign(data).await?)
    }
}
