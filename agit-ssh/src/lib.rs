//! SSH session factory for agit's Git transport.
//!
//! Installs identities from an SSH agent into every client the transport
//! builds, and forces strict host-key checking on every session.  Private
//! keys never leave the agent: each installed identity forwards signing back
//! to it.
//!
//! # Architecture
//!
//! ```text
//! transport ──► AgentSessionFactory ──────────────► SshClient ──► Session
//!                 │         │                          ▲             │
//!                 │   KnownHostsRepository ────────────┘      verify_host_key
//!                 │                                                  │
//!          SocketAgentProvider ──► AgentSource ◄──── AgentIdentity::sign
//!                                  (UnixStream)
//! ```

pub mod agent;
pub mod client;
pub mod factory;
pub mod identity;
pub mod known_hosts;
pub mod tty;

pub use agent::{AgentSource, SocketAgentProvider};
pub use client::{FsLayout, HostDescriptor, Session, SshClient, StrictHostKeyChecking};
pub use factory::{AgentSessionFactory, FactoryError, IdentitySourceError, SessionFactory};
pub use identity::{AgentIdentity, Identity};
pub use known_hosts::KnownHostsRepository;
pub use tty::TtyUserInfo;
