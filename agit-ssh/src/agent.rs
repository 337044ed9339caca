//! Credential source backed by an OpenSSH-protocol agent on a Unix socket.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use agit_core::config::AgentConfig;
use agit_core::{CredentialSource, CredentialSourceProvider, IdentityMap, SourceError};
use anyhow::Context as _;
use ssh_agent_lib::agent::Session as _;
use ssh_agent_lib::client::Client;
use ssh_agent_lib::error::AgentError;
use ssh_agent_lib::proto::{ProtoError, SignRequest};
use ssh_encoding::Encode as _;
use ssh_key::{Algorithm, HashAlg, PublicKey};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// `SSH_AGENT_RSA_SHA2_512` sign-request flag.
const RSA_SHA2_512: u32 = 0x04;

type AgentClient = Client<UnixStream>;

/// A connected agent.
///
/// The agent protocol is one request at a time per stream, so the client is
/// behind an async mutex.  A request checks the client out of its slot and
/// only puts it back once the reply has been read: a request dropped midway
/// takes the stream with it, and the next request reconnects.
pub struct AgentSource {
    socket: PathBuf,
    client: Mutex<Option<AgentClient>>,
}

impl std::fmt::Debug for AgentSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSource")
            .field("socket", &self.socket)
            .finish_non_exhaustive()
    }
}

async fn open(socket: &Path) -> Result<AgentClient, SourceError> {
    let stream = UnixStream::connect(socket)
        .await
        .map_err(|e| SourceError::Unavailable(format!("connect {}: {e}", socket.display())))?;
    Ok(Client::new(stream))
}

impl AgentSource {
    pub async fn connect(socket: &Path) -> Result<Self, SourceError> {
        let client = open(socket).await?;
        debug!(socket = %socket.display(), "connected to SSH agent");
        Ok(Self {
            socket: socket.to_path_buf(),
            client: Mutex::new(Some(client)),
        })
    }

    /// Take the connected client, reconnecting if the last request never
    /// finished.
    async fn checkout(&self, slot: &mut Option<AgentClient>) -> Result<AgentClient, SourceError> {
        if let Some(client) = slot.take() {
            return Ok(client);
        }
        debug!(socket = %self.socket.display(), "reconnecting to SSH agent");
        open(&self.socket).await
    }
}

/// Put the client back unless the stream may hold an unread reply.
fn checkin<T>(
    slot: &mut Option<AgentClient>,
    client: AgentClient,
    result: Result<T, AgentError>,
    what: &'static str,
) -> Result<T, SourceError> {
    match result {
        Ok(value) => {
            *slot = Some(client);
            Ok(value)
        }
        Err(e) => {
            let e = agent_err(e, what);
            if matches!(e, SourceError::Refused) {
                *slot = Some(client);
            }
            Err(e)
        }
    }
}

/// The client reports an `SSH_AGENT_FAILURE` reply as an unexpected response.
fn agent_err(e: AgentError, what: &'static str) -> SourceError {
    match e {
        AgentError::Failure | AgentError::Proto(ProtoError::UnexpectedResponse) => {
            SourceError::Refused
        }
        other => SourceError::Other(anyhow::Error::new(other).context(what)),
    }
}

/// Pick a map key for an agent identity.
///
/// Agents allow empty and duplicate comments; the map needs unique names.
fn unique_name(identities: &IdentityMap, comment: &str, fingerprint: &str) -> String {
    let base = if comment.is_empty() || identities.contains_key(comment) {
        fingerprint
    } else {
        return comment.to_string();
    };
    if !identities.contains_key(base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{base}#{n}"))
        .find(|candidate| !identities.contains_key(candidate))
        .unwrap_or_else(|| base.to_string())
}

#[async_trait::async_trait]
impl CredentialSource for AgentSource {
    fn name(&self) -> String {
        format!("ssh-agent at {}", self.socket.display())
    }

    async fn get_identities(&self) -> Result<IdentityMap, SourceError> {
        let mut slot = self.client.lock().await;
        let mut client = self.checkout(&mut slot).await?;
        let result = client.request_identities().await;
        let listed = checkin(&mut slot, client, result, "request_identities")?;
        drop(slot);

        let mut identities = IdentityMap::new();
        for identity in listed {
            let fingerprint = identity.pubkey.fingerprint(HashAlg::Sha256).to_string();
            let blob = PublicKey::from(identity.pubkey)
                .to_bytes()
                .context("encode agent public key")?;
            let name = unique_name(&identities, &identity.comment, &fingerprint);
            if name != identity.comment {
                debug!(comment = %identity.comment, %name, "renamed agent identity");
            }
            identities.insert(name, blob);
        }

        debug!(count = identities.len(), "request_identities");
        Ok(identities)
    }

    async fn sign(&self, public_key: &[u8], data: &[u8]) -> Result<Vec<u8>, SourceError> {
        let key = PublicKey::from_bytes(public_key)
            .map_err(|e| SourceError::MalformedKey(e.to_string()))?;
        let flags = match key.algorithm() {
            Algorithm::Rsa { .. } => RSA_SHA2_512,
            _ => 0,
        };
        let request = SignRequest {
            pubkey: key.key_data().clone(),
            data: data.to_vec(),
            flags,
        };

        let mut slot = self.client.lock().await;
        let mut client = self.checkout(&mut slot).await?;
        let result = client.sign(request).await;
        let signature = checkin(&mut slot, client, result, "sign")?;
        drop(slot);

        debug!(
            algorithm = %signature.algorithm(),
            data_len = data.len(),
            "agent signed"
        );
        let mut blob = Vec::new();
        signature
            .encode(&mut blob)
            .map_err(|e| anyhow::anyhow!("encode agent signature: {e}"))?;
        Ok(blob)
    }
}

/// Connects to the agent socket named in config or `$SSH_AUTH_SOCK`.
///
/// Each call opens a new connection.  No socket, or a socket nobody is
/// listening on, resolves to `None`.
#[derive(Debug, Clone)]
pub struct SocketAgentProvider {
    socket: Option<PathBuf>,
}

impl SocketAgentProvider {
    pub fn new(socket: Option<PathBuf>) -> Self {
        Self { socket }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.resolve_socket())
    }
}

#[async_trait::async_trait]
impl CredentialSourceProvider for SocketAgentProvider {
    async fn get(&self) -> Option<Arc<dyn CredentialSource>> {
        let Some(socket) = &self.socket else {
            debug!("no agent socket configured and SSH_AUTH_SOCK unset");
            return None;
        };
        match AgentSource::connect(socket).await {
            Ok(source) => Some(Arc::new(source)),
            Err(e) => {
                warn!(socket = %socket.display(), "SSH agent unreachable: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssh_agent_lib::agent::{Session, listen};
    use ssh_agent_lib::proto::Identity;
    use ssh_key::Signature;
    use ssh_key::public::{Ed25519PublicKey, KeyData};
    use ssh_encoding::Encode as _;
    use tokio::sync::Notify;

    fn key(seed: u8) -> KeyData {
        KeyData::Ed25519(Ed25519PublicKey([seed; 32]))
    }

    /// Holds every sign request until released.
    #[derive(Clone, Debug, Default)]
    struct Gate {
        received: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[derive(Clone, Debug)]
    struct FakeAgent {
        comments: Vec<(u8, String)>,
        gate: Option<Gate>,
    }

    #[ssh_agent_lib::async_trait]
    impl Session for FakeAgent {
        async fn request_identities(&mut self) -> Result<Vec<Identity>, AgentError> {
            Ok(self
                .comments
                .iter()
                .map(|(seed, comment)| Identity {
                    pubkey: key(*seed),
                    comment: comment.clone(),
                })
                .collect())
        }

        async fn sign(&mut self, request: SignRequest) -> Result<Signature, AgentError> {
            if let Some(gate) = &self.gate {
                gate.received.notify_one();
                gate.release.notified().await;
            }
            if request.pubkey != key(1) {
                return Err(AgentError::Failure);
            }
            Signature::new(Algorithm::Ed25519, vec![7u8; 64]).map_err(AgentError::other)
        }
    }

    async fn spawn_agent(comments: &[(u8, &str)]) -> (tempfile::TempDir, PathBuf) {
        spawn_gated_agent(comments, None).await
    }

    async fn spawn_gated_agent(
        comments: &[(u8, &str)],
        gate: Option<Gate>,
    ) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        let agent = FakeAgent {
            comments: comments.iter().map(|(s, c)| (*s, c.to_string())).collect(),
            gate,
        };
        tokio::spawn(async move {
            let _ = listen(listener, agent).await;
        });
        (dir, path)
    }

    #[tokio::test]
    async fn lists_identities_by_comment() {
        let (_dir, path) = spawn_agent(&[(1, "alice@laptop"), (2, "deploy")]).await;
        let source = AgentSource::connect(&path).await.unwrap();

        let identities = source.get_identities().await.unwrap();

        assert_eq!(identities.len(), 2);
        assert_eq!(
            identities["alice@laptop"],
            PublicKey::from(key(1)).to_bytes().unwrap()
        );
        assert!(identities.contains_key("deploy"));
    }

    #[tokio::test]
    async fn empty_and_duplicate_comments_get_fingerprints() {
        let (_dir, path) = spawn_agent(&[(1, ""), (2, "dup"), (3, "dup")]).await;
        let source = AgentSource::connect(&path).await.unwrap();

        let identities = source.get_identities().await.unwrap();

        assert_eq!(identities.len(), 3);
        assert!(identities.contains_key("dup"));
        let fingerprinted = identities
            .keys()
            .filter(|k| k.starts_with("SHA256:"))
            .count();
        assert_eq!(fingerprinted, 2);
    }

    #[tokio::test]
    async fn sign_round_trips_through_agent() {
        let (_dir, path) = spawn_agent(&[(1, "k")]).await;
        let source = AgentSource::connect(&path).await.unwrap();
        let blob = PublicKey::from(key(1)).to_bytes().unwrap();

        let sig = source.sign(&blob, b"session-id").await.unwrap();

        let mut expected = Vec::new();
        Signature::new(Algorithm::Ed25519, vec![7u8; 64])
            .unwrap()
            .encode(&mut expected)
            .unwrap();
        assert_eq!(sig, expected);
    }

    #[tokio::test]
    async fn agent_failure_maps_to_refused() {
        let (_dir, path) = spawn_agent(&[(1, "k")]).await;
        let source = AgentSource::connect(&path).await.unwrap();
        let blob = PublicKey::from(key(9)).to_bytes().unwrap();

        let err = source.sign(&blob, b"data").await.unwrap_err();
        assert!(matches!(err, SourceError::Refused));
    }

    #[tokio::test]
    async fn refusal_keeps_the_connection_usable() {
        let (_dir, path) = spawn_agent(&[(1, "k")]).await;
        let source = AgentSource::connect(&path).await.unwrap();
        let blob = PublicKey::from(key(9)).to_bytes().unwrap();

        assert!(source.sign(&blob, b"data").await.is_err());
        assert!(source.get_identities().await.unwrap().contains_key("k"));
    }

    #[tokio::test]
    async fn abandoned_sign_does_not_leak_its_reply() {
        let gate = Gate::default();
        let (_dir, path) = spawn_gated_agent(&[(1, "k")], Some(gate.clone())).await;
        let source = AgentSource::connect(&path).await.unwrap();
        let blob = PublicKey::from(key(1)).to_bytes().unwrap();

        tokio::select! {
            _ = source.sign(&blob, b"data") => panic!("agent answered before release"),
            _ = gate.received.notified() => {}
        }
        gate.release.notify_one();

        let identities = source.get_identities().await.unwrap();
        assert_eq!(identities.len(), 1);
        assert_eq!(identities["k"], blob);
    }

    #[tokio::test]
    async fn sign_rejects_garbage_key() {
        let (_dir, path) = spawn_agent(&[]).await;
        let source = AgentSource::connect(&path).await.unwrap();
        let err = source.sign(&[0xab, 0xcd], b"data").await.unwrap_err();
        assert!(matches!(err, SourceError::MalformedKey(_)));
    }

    #[tokio::test]
    async fn provider_without_socket_is_absent() {
        assert!(SocketAgentProvider::new(None).get().await.is_none());
    }

    #[tokio::test]
    async fn provider_with_dead_socket_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let provider = SocketAgentProvider::new(Some(dir.path().join("gone.sock")));
        assert!(provider.get().await.is_none());
    }

    #[tokio::test]
    async fn provider_connects_to_live_socket() {
        let (_dir, path) = spawn_agent(&[(1, "k")]).await;
        let source = SocketAgentProvider::new(Some(path)).get().await.unwrap();
        assert!(source.name().starts_with("ssh-agent at "));
    }

    #[test]
    fn unique_name_prefers_comment() {
        let map = IdentityMap::new();
        assert_eq!(unique_name(&map, "me", "SHA256:x"), "me");
        assert_eq!(unique_name(&map, "", "SHA256:x"), "SHA256:x");
    }

    #[test]
    fn unique_name_suffixes_repeated_fingerprints() {
        let mut map = IdentityMap::new();
        map.insert("SHA256:x".to_string(), vec![1]);
        map.insert("SHA256:x#2".to_string(), vec![1]);
        assert_eq!(unique_name(&map, "", "SHA256:x"), "SHA256:x#3");
    }
}
