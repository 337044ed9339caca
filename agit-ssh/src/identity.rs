//! Identities registered with an [`SshClient`](crate::client::SshClient).

use std::sync::Arc;

use agit_core::{CredentialSource, SourceError};
use tracing::debug;

/// A public-key credential usable for SSH authentication.
#[async_trait::async_trait]
pub trait Identity: std::fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    /// SSH wire-format public key blob.
    fn public_key_blob(&self) -> &[u8];

    /// Whether a passphrase must be supplied before [`sign`](Self::sign) works.
    fn is_encrypted(&self) -> bool;

    /// Unlock the identity.  Returns `true` once it is usable.
    fn set_passphrase(&self, passphrase: &[u8]) -> Result<bool, SourceError>;

    /// Produce an SSH wire-format signature over `data`.
    async fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SourceError>;

    fn algorithm(&self) -> Option<&str> {
        agit_core::key_algorithm(self.public_key_blob())
    }
}

/// An identity whose private half lives in a [`CredentialSource`].
///
/// Holds only the name, the public key blob and the source handle.  Signing
/// is a round trip to the source.
#[derive(Clone)]
pub struct AgentIdentity {
    source: Arc<dyn CredentialSource>,
    public_key: Vec<u8>,
    name: String,
}

impl std::fmt::Debug for AgentIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentIdentity")
            .field("name", &self.name)
            .field("source", &self.source.name())
            .field("fingerprint", &agit_core::fingerprint(&self.public_key))
            .finish()
    }
}

impl AgentIdentity {
    pub fn new(source: Arc<dyn CredentialSource>, public_key: Vec<u8>, name: String) -> Self {
        Self {
            source,
            public_key,
            name,
        }
    }
}

#[async_trait::async_trait]
impl Identity for AgentIdentity {
    fn name(&self) -> &str {
        &self.name
    }

    fn public_key_blob(&self) -> &[u8] {
        &self.public_key
    }

    /// The source unlocks keys on its own terms.
    fn is_encrypted(&self) -> bool {
        false
    }

    fn set_passphrase(&self, _passphrase: &[u8]) -> Result<bool, SourceError> {
        Ok(true)
    }

    async fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SourceError> {
        debug!(
            identity = %self.name,
            source = %self.source.name(),
            data_len = data.len(),
            "forwarding sign request"
        );
        self.source.sign(&self.public_key, data).await
    }
}
