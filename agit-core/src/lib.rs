//! Shared types for agit's agent-backed SSH transport.
//!
//! The traits here are the seams between the SSH session factory in
//! `agit-ssh` and the collaborators the embedding application supplies:
//!
//! - [`CredentialSource`]: an external process (normally an SSH agent) that
//!   holds private keys and signs on request.
//! - [`CredentialSourceProvider`]: resolves a handle to that process, which
//!   may legitimately be absent.
//! - [`HostKeyRepository`]: decides whether a host's key is trusted.
//! - [`UserInfo`]: interactive prompts (passphrases, yes/no questions).

use std::collections::BTreeMap;
use std::sync::Arc;

use ssh_key::{HashAlg, PublicKey};
use zeroize::Zeroizing;

pub mod config;

/// Identity name → SSH wire-format public key blob.
///
/// A `BTreeMap` keeps installation order stable across calls.
pub type IdentityMap = BTreeMap<String, Vec<u8>>;

#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    #[error("credential source unavailable: {0}")]
    Unavailable(String),
    #[error("identity not held by credential source")]
    UnknownIdentity,
    #[error("credential source refused the request")]
    Refused,
    #[error("malformed public key: {0}")]
    MalformedKey(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum HostKeyError {
    #[error("host key for {host} is not known")]
    Unknown { host: String },
    #[error("host key for {host} has changed (offered {fingerprint})")]
    Changed { host: String, fingerprint: String },
    #[error("host key for {host} rejected by user")]
    Rejected { host: String },
    #[error("no host key repository configured")]
    NoRepository,
    #[error("malformed host key: {0}")]
    MalformedKey(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Credential source
// ---------------------------------------------------------------------------

/// An IPC-reachable holder of private keys.
///
/// Implementations never hand out private key material: callers see public
/// key blobs and ask for signatures.
#[async_trait::async_trait]
pub trait CredentialSource: std::fmt::Debug + Send + Sync {
    /// Short human-readable name used in logs and error messages.
    fn name(&self) -> String;

    /// Snapshot of the identities currently held by the source.
    async fn get_identities(&self) -> Result<IdentityMap, SourceError>;

    /// Sign `data` with the private key matching `public_key`.
    ///
    /// Returns the SSH wire-format signature blob.
    async fn sign(&self, public_key: &[u8], data: &[u8]) -> Result<Vec<u8>, SourceError>;
}

/// Resolves a [`CredentialSource`] handle.
///
/// `None` means no source is installed or running.  That is a normal state,
/// not an error.  Implementations must be safe to call concurrently.
#[async_trait::async_trait]
pub trait CredentialSourceProvider: Send + Sync {
    async fn get(&self) -> Option<Arc<dyn CredentialSource>>;
}

/// A provider that always hands out the same handle (or none).
#[derive(Debug, Clone, Default)]
pub struct StaticProvider(Option<Arc<dyn CredentialSource>>);

impl StaticProvider {
    pub fn new(source: Arc<dyn CredentialSource>) -> Self {
        Self(Some(source))
    }

    pub fn absent() -> Self {
        Self(None)
    }
}

#[async_trait::async_trait]
impl CredentialSourceProvider for StaticProvider {
    async fn get(&self) -> Option<Arc<dyn CredentialSource>> {
        self.0.clone()
    }
}

// ---------------------------------------------------------------------------
// Host key policy
// ---------------------------------------------------------------------------

/// Outcome of checking a host key against a [`HostKeyRepository`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// The key is recorded for this host.
    Trusted,
    /// Nothing is recorded for this host.
    Unknown,
    /// Other keys are recorded for this host, or the key is revoked.
    Changed,
}

/// Trust decisions for remote host keys.
///
/// `host` is the known_hosts-style name: `example.com` for port 22,
/// `[example.com]:2222` otherwise.
pub trait HostKeyRepository: std::fmt::Debug + Send + Sync {
    /// Identifier for logs (e.g. the known_hosts path).
    fn id(&self) -> &str;

    fn check(&self, host: &str, key: &[u8]) -> HostKeyStatus;

    /// Record `key` as trusted for `host`.
    fn add(&self, host: &str, key: &[u8]) -> Result<(), HostKeyError>;

    /// All key blobs recorded for `host`.
    fn keys_for(&self, host: &str) -> Vec<Vec<u8>>;
}

// ---------------------------------------------------------------------------
// User interaction
// ---------------------------------------------------------------------------

/// Interactive prompts raised during session setup.
///
/// Calls may block on user input.
pub trait UserInfo: std::fmt::Debug + Send + Sync {
    fn prompt_passphrase(&self, message: &str) -> Option<Zeroizing<String>>;
    fn prompt_password(&self, message: &str) -> Option<Zeroizing<String>>;
    fn prompt_yes_no(&self, message: &str) -> bool;
    fn show_message(&self, message: &str);
}

/// A [`UserInfo`] that declines every prompt.
///
/// Suitable for batch runs where nobody can answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonInteractive;

impl UserInfo for NonInteractive {
    fn prompt_passphrase(&self, _message: &str) -> Option<Zeroizing<String>> {
        None
    }

    fn prompt_password(&self, _message: &str) -> Option<Zeroizing<String>> {
        None
    }

    fn prompt_yes_no(&self, message: &str) -> bool {
        tracing::debug!(%message, "declining prompt (non-interactive)");
        false
    }

    fn show_message(&self, message: &str) {
        tracing::info!("{message}");
    }
}

/// SHA-256 fingerprint (`SHA256:…`) of a wire-format public key blob.
///
/// `None` if the blob is not a key type `ssh-key` understands.
pub fn fingerprint(blob: &[u8]) -> Option<String> {
    PublicKey::from_bytes(blob)
        .ok()
        .map(|k| k.fingerprint(HashAlg::Sha256).to_string())
}

/// Algorithm name (`ssh-ed25519`, `ssh-rsa`, …) of a wire-format key blob.
///
/// Read straight from the leading length-prefixed string, so it works for
/// key types `ssh-key` cannot fully decode.
pub fn key_algorithm(blob: &[u8]) -> Option<&str> {
    let len_bytes: [u8; 4] = blob.get(..4)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let name = blob.get(4..4usize.checked_add(len)?)?;
    std::str::from_utf8(name).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssh_key::public::{Ed25519PublicKey, KeyData};

    fn ed25519_blob(seed: u8) -> Vec<u8> {
        PublicKey::from(KeyData::Ed25519(Ed25519PublicKey([seed; 32])))
            .to_bytes()
            .unwrap()
    }

    #[test]
    fn fingerprint_of_valid_blob() {
        let fp = fingerprint(&ed25519_blob(1)).unwrap();
        assert!(fp.starts_with("SHA256:"));
    }

    #[test]
    fn fingerprint_of_garbage_is_none() {
        assert!(fingerprint(&[0xab, 0xcd]).is_none());
    }

    #[test]
    fn key_algorithm_reads_prefix() {
        assert_eq!(key_algorithm(&ed25519_blob(2)), Some("ssh-ed25519"));
    }

    #[test]
    fn key_algorithm_rejects_truncated_blob() {
        assert_eq!(key_algorithm(&[0, 0, 0, 9, b's', b's']), None);
        assert_eq!(key_algorithm(&[]), None);
    }

    #[test]
    fn non_interactive_declines() {
        let ui = NonInteractive;
        assert!(!ui.prompt_yes_no("continue?"));
        assert!(ui.prompt_passphrase("passphrase").is_none());
        assert!(ui.prompt_password("password").is_none());
    }

    #[derive(Debug)]
    struct Dummy;

    #[async_trait::async_trait]
    impl CredentialSource for Dummy {
        fn name(&self) -> String {
            "dummy".to_string()
        }

        async fn get_identities(&self) -> Result<IdentityMap, SourceError> {
            Ok(IdentityMap::new())
        }

        async fn sign(&self, _public_key: &[u8], _data: &[u8]) -> Result<Vec<u8>, SourceError> {
            Err(SourceError::Refused)
        }
    }

    #[tokio::test]
    async fn static_provider_returns_handle() {
        let provider = StaticProvider::new(Arc::new(Dummy));
        let source = provider.get().await.unwrap();
        assert_eq!(source.name(), "dummy");
    }

    #[tokio::test]
    async fn absent_provider_returns_none() {
        assert!(StaticProvider::absent().get().await.is_none());
    }
}
