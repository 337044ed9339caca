use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use tracing_subscriber::EnvFilter;

use agit_core::config::{Config, default_config_path, load_config};
use agit_core::{HostKeyRepository, NonInteractive, UserInfo};
use agit_ssh::{
    AgentSessionFactory, FsLayout, HostDescriptor, Identity as _, KnownHostsRepository,
    SessionFactory, TtyUserInfo,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Piping into `head` should end quietly, not panic on EPIPE.
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (config_path, rest) = split_config_flag(&args)?;
    let cmd = rest.first().map(String::as_str).unwrap_or("help");

    match cmd {
        "identities" | "ids" => {
            let config = load(&config_path)?;
            cmd_identities(&config, rest.iter().any(|a| a == "--batch")).await
        }
        "known-hosts" => {
            let config = load(&config_path)?;
            cmd_known_hosts(&config, &rest[1..])
        }
        "config" => {
            let config = load(&config_path)?;
            cmd_config(&config_path, &config);
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other => {
            eprintln!("unknown command: {other}");
            print_help();
            std::process::exit(1);
        }
    }
}

fn print_help() {
    println!(
        "\
agit - inspect the SSH identities and host keys agit's Git transport uses

USAGE:
    agit [--config <path>] <command> [args...]

COMMANDS:
    identities [--batch]        List the agent identities a new connection would install
                                (alias: ids). --batch disables terminal prompts.
    known-hosts <host> [port]   Show the host keys recorded for a host (default port 22)
    config                      Show the effective configuration
    help                        Show this help

ENVIRONMENT:
    SSH_AUTH_SOCK               Agent socket, unless [agent].socket is set
    RUST_LOG                    Log filter (default: warn)

EXAMPLES:
    agit identities
    agit known-hosts github.com
    agit known-hosts git.example.com 2222
    agit --config ./agit.toml config"
    );
}

/// Pull `--config <path>` / `--config=<path>` out of the argument list.
fn split_config_flag(args: &[String]) -> Result<(PathBuf, Vec<String>)> {
    let mut path = None;
    let mut rest = Vec::with_capacity(args.len());
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" || arg == "-c" {
            let Some(value) = iter.next() else {
                bail!("{arg} requires a path");
            };
            path = Some(PathBuf::from(value));
        } else if let Some(value) = arg.strip_prefix("--config=") {
            path = Some(PathBuf::from(value));
        } else {
            rest.push(arg.clone());
        }
    }
    Ok((path.unwrap_or_else(default_config_path), rest))
}

fn load(path: &PathBuf) -> Result<Config> {
    let config = load_config(path).with_context(|| format!("load config {}", path.display()))?;
    tracing::debug!(path = %path.display(), "loaded config");
    Ok(config)
}

async fn cmd_identities(config: &Config, batch: bool) -> Result<()> {
    let user_info: Arc<dyn UserInfo> = if batch {
        Arc::new(NonInteractive)
    } else {
        Arc::new(TtyUserInfo::default())
    };
    let factory = AgentSessionFactory::from_config(config, user_info)?;
    let client = factory.create_default_client(&FsLayout::from_env()).await?;

    if client.identities().is_empty() {
        println!("No agent identities available.");
        return Ok(());
    }
    for identity in client.identities() {
        let fingerprint = agit_core::fingerprint(identity.public_key_blob())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<16} {:<48} {}",
            identity.algorithm().unwrap_or("unknown"),
            fingerprint,
            identity.name()
        );
    }
    Ok(())
}

fn cmd_known_hosts(config: &Config, args: &[String]) -> Result<()> {
    let Some(hostname) = args.first() else {
        bail!("usage: agit known-hosts <host> [port]");
    };
    let port = match args.get(1) {
        Some(p) => p.parse::<u16>().with_context(|| format!("invalid port: {p}"))?,
        None => 22,
    };

    let repository = KnownHostsRepository::open(config.known_hosts.resolve_path())?;
    let host = HostDescriptor::new(hostname.clone(), port).host_key_name();
    let keys = repository.keys_for(&host);

    if keys.is_empty() {
        println!("{host}: no keys recorded in {}", repository.id());
        return Ok(());
    }
    for key in keys {
        println!(
            "{host} {} {}",
            agit_core::key_algorithm(&key).unwrap_or("unknown"),
            agit_core::fingerprint(&key).unwrap_or_else(|| "-".to_string())
        );
    }
    Ok(())
}

fn cmd_config(path: &PathBuf, config: &Config) {
    let socket = config
        .agent
        .resolve_socket()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(none)".to_string());
    println!("Config file:      {}", path.display());
    println!("Agent enabled:    {}", config.agent.enabled);
    println!("Agent socket:     {socket}");
    println!("known_hosts:      {}", config.known_hosts.resolve_path().display());
    println!("Prompt unknown:   {}", config.known_hosts.prompt_unknown);
    println!("Host key policy:  strict");
}
