use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use veredarii_protocol::invitation::DEFAULT_VALIDITY_HOURS;
use veredarii_protocol::{Invitation, NetworkConfig, NodeConfig, PolicyEngine, PolicyTable};
use veredarii_transport::Keypair;

/// File extension of invitation tokens handed to guests.
const INVITE_EXTENSION: &str = "vni";

#[derive(Parser)]
#[command(name = "veredarii", version, about = "Operator tooling for Veredarii networks")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load (or create) an identity key and print its peer id.
    Identity {
        /// Key file; generated with mode 0600 when missing.
        #[arg(long)]
        key: PathBuf,
    },

    /// Mint an invitation token for a guest entity.
    Invite {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        network: String,
        /// Entity name the guest will join as.
        #[arg(long)]
        guest: String,
        /// Validity window.
        #[arg(long, default_value_t = DEFAULT_VALIDITY_HOURS)]
        hours: i64,
        /// Directory receiving `<network>.<guest>.vni`.
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },

    /// Decrypt a token and show what it grants.
    InspectInvite {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        network: String,
        /// Entity that minted the token.
        #[arg(long)]
        inviter: String,
        /// Hex token, or `@path` to read it from a file.
        #[arg(long)]
        token: String,
    },

    /// Evaluate a policy file offline.
    CheckPolicy {
        #[arg(long)]
        policy: PathBuf,
        #[arg(long)]
        entity: String,
        #[arg(long)]
        network: String,
        /// Protocol id, e.g. /veredarii/query/1.0.0.
        #[arg(long)]
        protocol: String,
        /// Service name; without it any grant on the protocol counts.
        #[arg(long)]
        service: Option<String>,
    },

    /// Load a node config and check every key, address and policy it names.
    Validate {
        #[arg(long)]
        config: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Identity { key } => identity(&key),
        Command::Invite {
            config,
            network,
            guest,
            hours,
            out,
        } => invite(&config, &network, &guest, hours, &out),
        Command::InspectInvite {
            config,
            network,
            inviter,
            token,
        } => inspect_invite(&config, &network, &inviter, &token),
        Command::CheckPolicy {
            policy,
            entity,
            network,
            protocol,
            service,
        } => check_policy(&policy, &entity, &network, &protocol, service.as_deref()),
        Command::Validate { config } => validate(&config),
    }
}

fn identity(path: &Path) -> anyhow::Result<()> {
    let keypair = Keypair::load_or_generate(path)
        .with_context(|| format!("loading identity from {}", path.display()))?;
    println!("peer id:    {}", keypair.peer_id());
    println!("public key: {}", keypair.public().to_base64());
    Ok(())
}

/// Load the node config and pick out one network.
fn load_network(path: &Path, network: &str) -> anyhow::Result<(NodeConfig, NetworkConfig)> {
    let config = NodeConfig::load(path).with_context(|| format!("loading {}", path.display()))?;
    let selected = config
        .network(network)
        .cloned()
        .ok_or_else(|| anyhow!("network {network} is not declared in {}", path.display()))?;
    Ok((config, selected))
}

fn invite(config: &Path, network: &str, guest: &str, hours: i64, out: &Path) -> anyhow::Result<()> {
    if hours <= 0 {
        bail!("--hours must be positive");
    }
    let (node, net) = load_network(config, network)?;
    let key = net
        .invitation
        .derive_key()?
        .ok_or_else(|| anyhow!("network {network} has no invitation passphrase"))?;

    let expires_at = Utc::now() + chrono::Duration::hours(hours);
    let token = Invitation::new(node.identity.entity.as_str(), guest, network, expires_at).seal(&key)?;

    let path = out.join(invite_file_name(network, guest));
    std::fs::write(&path, format!("{token}\n"))
        .with_context(|| format!("writing {}", path.display()))?;
    tracing::info!(%guest, %network, path = %path.display(), "invitation minted");
    println!("{}", path.display());
    println!("expires {}", expires_at.to_rfc3339());
    Ok(())
}

fn invite_file_name(network: &str, guest: &str) -> String {
    format!("{network}.{guest}.{INVITE_EXTENSION}")
}

/// `@path` reads the token from a file; anything else is the token itself.
fn read_token(arg: &str) -> anyhow::Result<String> {
    match arg.strip_prefix('@') {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
            Ok(text.trim().to_string())
        }
        None => Ok(arg.trim().to_string()),
    }
}

fn inspect_invite(config: &Path, network: &str, inviter: &str, token: &str) -> anyhow::Result<()> {
    let (_, net) = load_network(config, network)?;
    let key = net
        .invitation
        .derive_key()?
        .ok_or_else(|| anyhow!("network {network} has no invitation passphrase"))?;
    let invitation = Invitation::open(&read_token(token)?, inviter, &key)
        .context("token does not open under this network and inviter")?;

    println!("inviter: {}", invitation.inviter);
    println!("guest:   {}", invitation.guest);
    println!("network: {}", invitation.network);
    println!("expires: {}", invitation.expires_at.to_rfc3339());
    if invitation.network != network {
        println!("warning: token was minted for network {}", invitation.network);
    }
    match invitation.check_expiry(Utc::now()) {
        Ok(()) => println!("status:  valid"),
        Err(_) => println!("status:  expired"),
    }
    Ok(())
}

fn check_policy(
    policy: &Path,
    entity: &str,
    network: &str,
    protocol: &str,
    service: Option<&str>,
) -> anyhow::Result<()> {
    let table = PolicyTable::load(policy)?;
    let allowed = match service {
        Some(service) => table.is_allowed(entity, network, protocol, service),
        None => table.has_any(entity, network, protocol),
    };
    println!("{}", if allowed { "allow" } else { "deny" });
    if !allowed {
        std::process::exit(1);
    }
    Ok(())
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let config = NodeConfig::load(path).with_context(|| format!("loading {}", path.display()))?;
    println!("entity: {}", config.identity.entity);
    if config.identity.private_key_file.exists() {
        let keypair = Keypair::load(&config.identity.private_key_file).with_context(|| {
            format!("reading {}", config.identity.private_key_file.display())
        })?;
        println!("peer id: {}", keypair.peer_id());
    } else {
        println!(
            "peer id: (key {} will be created on first start)",
            config.identity.private_key_file.display()
        );
    }
    if let Some(path) = &config.identity.entity_key_file {
        Keypair::load(path).with_context(|| format!("reading entity key {}", path.display()))?;
    }

    for network in &config.networks {
        let policies = match &network.policy_file {
            Some(file) => PolicyTable::load(file)?.len().to_string(),
            None => "none (deny all)".to_string(),
        };
        let onboarding = network.invitation.derive_key()?.is_some();
        println!(
            "network {}: {} pivots, {} entities, {} resources, policies {}, onboarding {}",
            network.name,
            network.pivots.len(),
            network.entities.len(),
            network.resources.names().len(),
            policies,
            if onboarding { "on" } else { "off" },
        );
    }
    match &config.gateway {
        Some(gateway) => println!("gateway: {}", gateway.socket_addr()?),
        None => println!("gateway: off"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invite_file_is_named_after_network_and_guest() {
        assert_eq!(invite_file_name("health-net", "Clinic-G"), "health-net.Clinic-G.vni");
    }

    #[test]
    fn token_can_come_from_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.vni");
        std::fs::write(&path, "abcd\n").unwrap();
        assert_eq!(read_token(&format!("@{}", path.display())).unwrap(), "abcd");
        assert_eq!(read_token(" ef01 ").unwrap(), "ef01");
        assert!(read_token("@/nonexistent/token").is_err());
    }

    #[test]
    fn cli_parses_invite_defaults() {
        let cli = Cli::try_parse_from([
            "veredarii", "invite", "--config", "node.json", "--network", "health-net", "--guest", "Clinic-G",
        ])
        .unwrap();
        match cli.command {
            Command::Invite { hours, out, .. } => {
                assert_eq!(hours, 24);
                assert_eq!(out, PathBuf::from("."));
            }
            _ => panic!("wrong subcommand"),
        }
    }
}
