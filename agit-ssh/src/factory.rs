//! Session factory hooks called by the Git transport for each connection
//! attempt.
//!
//! ## Per-attempt flow
//!
//! ```text
//! transport ──► create_default_client(fs)
//!                 ├── SshClient::new + host key repository
//!                 └── install_identities
//!                       provider.get() ── None ──► warn, zero identities
//!                           │
//!                       get_identities() ── Err ──► IdentitySourceError
//!                           │
//!                       AgentIdentity per entry ──► client.add_identity
//!           ──► client.session(user, host)
//!           ──► configure(host, session)   strict checking + user info
//! ```

use std::sync::Arc;

use agit_core::config::Config;
use agit_core::{
    CredentialSource, CredentialSourceProvider, HostKeyError, HostKeyRepository, SourceError,
    UserInfo,
};
use tracing::{debug, info, warn};

use crate::agent::SocketAgentProvider;
use crate::client::{ClientError, FsLayout, HostDescriptor, Session, SshClient, StrictHostKeyChecking};
use crate::identity::AgentIdentity;
use crate::known_hosts::KnownHostsRepository;

/// Fetching identities from a resolved credential source failed.
#[derive(thiserror::Error, Debug)]
#[error("couldn't get identities from credential source {source_name}")]
pub struct IdentitySourceError {
    pub source_name: String,
    #[source]
    pub cause: SourceError,
}

#[derive(thiserror::Error, Debug)]
pub enum FactoryError {
    #[error(transparent)]
    IdentitySource(#[from] IdentitySourceError),
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// The two extension points a transport calls per connection attempt.
#[async_trait::async_trait]
pub trait SessionFactory: Send + Sync {
    /// Apply policy to a session before it connects.
    fn configure(&self, host: &HostDescriptor, session: &mut Session);

    /// Build a fresh client for one connection attempt.
    async fn create_default_client(&self, fs: &FsLayout) -> Result<SshClient, FactoryError>;

    /// Client, session and configuration in the order a transport uses them.
    async fn get_session(
        &self,
        user: &str,
        host: HostDescriptor,
        fs: &FsLayout,
    ) -> Result<Session, FactoryError> {
        let client = self.create_default_client(fs).await?;
        let mut session = client.session(user, host.clone());
        self.configure(&host, &mut session);
        Ok(session)
    }
}

/// Session factory that sources identities from an SSH agent.
pub struct AgentSessionFactory {
    agent_provider: Arc<dyn CredentialSourceProvider>,
    user_info: Arc<dyn UserInfo>,
    host_key_repository: Arc<dyn HostKeyRepository>,
}

impl std::fmt::Debug for AgentSessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSessionFactory")
            .field("user_info", &self.user_info)
            .field("host_key_repository", &self.host_key_repository.id())
            .finish_non_exhaustive()
    }
}

impl AgentSessionFactory {
    pub fn new(
        agent_provider: Arc<dyn CredentialSourceProvider>,
        user_info: Arc<dyn UserInfo>,
        host_key_repository: Arc<dyn HostKeyRepository>,
    ) -> Self {
        Self {
            agent_provider,
            user_info,
            host_key_repository,
        }
    }

    /// Wire up the agent socket and known_hosts file named in `config`.
    ///
    /// `user_info` answers session prompts and, when
    /// `known_hosts.prompt_unknown` is set, questions about unknown hosts.
    pub fn from_config(config: &Config, user_info: Arc<dyn UserInfo>) -> Result<Self, HostKeyError> {
        let mut known_hosts = KnownHostsRepository::open(config.known_hosts.resolve_path())?;
        if config.known_hosts.prompt_unknown {
            known_hosts = known_hosts.with_prompt(Arc::clone(&user_info));
        }
        Ok(Self::new(
            Arc::new(SocketAgentProvider::from_config(&config.agent)),
            user_info,
            Arc::new(known_hosts),
        ))
    }

    /// Register every identity the agent currently holds with `client`.
    ///
    /// Returns the number installed.  A missing agent installs nothing and is
    /// not an error.
    pub async fn install_identities(&self, client: &mut SshClient) -> Result<usize, FactoryError> {
        let Some(agent) = self.agent_provider.get().await else {
            warn!("no SSH agent available, continuing without agent identities");
            return Ok(0);
        };
        debug!(agent = %agent.name(), "resolved SSH agent");
        self.install_from(agent, client).await
    }

    async fn install_from(
        &self,
        agent: Arc<dyn CredentialSource>,
        client: &mut SshClient,
    ) -> Result<usize, FactoryError> {
        let identities = agent
            .get_identities()
            .await
            .map_err(|cause| IdentitySourceError {
                source_name: agent.name(),
                cause,
            })?;
        debug!(
            agent = %agent.name(),
            names = ?identities.keys().collect::<Vec<_>>(),
            "fetched identities"
        );

        let mut installed = 0;
        for (name, public_key) in identities {
            if public_key.is_empty() {
                warn!(identity = %name, "agent returned an empty public key, skipping");
                continue;
            }
            let identity = AgentIdentity::new(Arc::clone(&agent), public_key, name);
            client.add_identity(Arc::new(identity), None)?;
            installed += 1;
        }

        info!(agent = %agent.name(), count = installed, "installed agent identities");
        Ok(installed)
    }
}

#[async_trait::async_trait]
impl SessionFactory for AgentSessionFactory {
    fn configure(&self, host: &HostDescriptor, session: &mut Session) {
        debug!(host = %host.alias, "configuring session: strict host key checking");
        // Unknown hosts are the repository's call, not the session's.
        session.set_strict_host_key_checking(StrictHostKeyChecking::Yes);
        session.set_user_info(Arc::clone(&self.user_info));
    }

    async fn create_default_client(&self, fs: &FsLayout) -> Result<SshClient, FactoryError> {
        let mut client = SshClient::new(fs);
        client.set_host_key_repository(Arc::clone(&self.host_key_repository));
        self.install_identities(&mut client).await?;
        Ok(client)
    }
}
