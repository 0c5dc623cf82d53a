//! `agentctl`: host-side control tool for the in-guest agent. Parses an
//! `ENDPOINT command [args]` invocation, dials the matching transport, and
//! drives one RPC (or a short sequence of them) against it.

mod commands;
mod endpoint;

use std::path::PathBuf;

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};

use endpoint::Endpoint;

const DEFAULT_CERT_DIR: &str = "/etc/guest-agent/certs";

#[derive(Parser, Debug)]
#[command(name = "agentctl", version, about = "Host-side control tool for the guest agent")]
struct Cli {
    /// Increase log verbosity; repeatable.
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Certificate directory holding CA.crt, client.crt, client.key.
    #[arg(long, env = "CERTDIR", default_value = DEFAULT_CERT_DIR, global = true)]
    cert_dir: PathBuf,

    /// Target endpoint: `cid:<u32>`, `tcp:<ip>`, or `/path/to/socket`.
    endpoint: Endpoint,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the agent's build/feature info.
    AgentInfo,
    /// Ask the agent to exit.
    AgentShutdown,
    /// Print the latest telemetry snapshot.
    GuestInfo,
    /// Interface and routing table operations.
    Ip {
        #[command(subcommand)]
        action: IpCommand,
    },
    /// Stat a remote path (and list its contents, if a directory).
    Ls {
        #[arg(short = 'l', long = "long")]
        long: bool,
        #[arg(short = 'd')]
        dir_only: bool,
        path: String,
    },
    /// Print a remote file's contents to stdout.
    Cat { path: String },
    /// Create a remote directory.
    Mkdir {
        #[arg(short = 'm', long, default_value = "755")]
        mode: String,
        #[arg(short = 'p', long)]
        parents: bool,
        path: String,
    },
    /// Change a remote path's permission bits (octal).
    Chmod { mode: String, path: String },
    /// Change a remote path's owner and/or group (`owner[:group]`).
    Chown { owner: String, path: String },
    /// Print a remote file's MD5 digest.
    Md5sum { path: String },
    /// Copy a file in or out of the guest; exactly one side carries `guest:`.
    Rcp { src: String, dst: String },
    /// Freeze every mounted filesystem.
    FsFreeze,
    /// Thaw every frozen filesystem.
    FsUnfreeze,
    /// Fetch the session key and exec into an interactive SSH session.
    SecureShell {
        #[arg(short = 'u', long, default_value = "root")]
        user: String,
        #[arg(long)]
        shell: Option<String>,
        #[arg(last = true)]
        command: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum IpCommand {
    /// Show configured interfaces and their addresses.
    Addr {
        #[command(subcommand)]
        action: IpAddrCommand,
    },
    /// Bring a link up or down.
    Link {
        #[command(subcommand)]
        action: IpLinkCommand,
    },
    /// List or modify the routing table.
    Route {
        #[command(subcommand)]
        action: IpRouteCommand,
    },
}

/// `ip addr add|del ADDR dev IFNAME` — `dev` is a literal keyword, matching
/// the `iproute2` grammar, not a clap flag.
#[derive(Subcommand, Debug)]
enum IpAddrCommand {
    Show,
    Add {
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    Del {
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
}

/// `ip link set up|down dev IFNAME`.
#[derive(Subcommand, Debug)]
enum IpLinkCommand {
    Set {
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
}

/// `ip route add|del PREFIX [via ADDR] dev IFNAME`.
#[derive(Subcommand, Debug)]
enum IpRouteCommand {
    List,
    Add {
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    Del {
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
}

fn parse_addr_dev(args: &[String]) -> Result<(String, String)> {
    match args {
        [addr, dev_kw, ifname] if dev_kw == "dev" => Ok((addr.clone(), ifname.clone())),
        _ => bail!("expected: ADDR dev IFNAME"),
    }
}

fn parse_link_set(args: &[String]) -> Result<(bool, String)> {
    match args {
        [state, dev_kw, ifname] if dev_kw == "dev" => {
            let up = match state.as_str() {
                "up" => true,
                "down" => false,
                other => bail!("expected up or down, got {other}"),
            };
            Ok((up, ifname.clone()))
        }
        _ => bail!("expected: up|down dev IFNAME"),
    }
}

fn parse_route(args: &[String]) -> Result<(String, Option<String>, String)> {
    let mut iter = args.iter();
    let prefix = iter.next().ok_or_else(|| anyhow!("missing route prefix"))?.clone();
    let mut via = None;
    let mut dev = None;
    while let Some(tok) = iter.next() {
        match tok.as_str() {
            "via" => via = Some(iter.next().ok_or_else(|| anyhow!("'via' requires an address"))?.clone()),
            "dev" => dev = Some(iter.next().ok_or_else(|| anyhow!("'dev' requires an interface name"))?.clone()),
            other => bail!("unexpected token in route spec: {other}"),
        }
    }
    let dev = dev.ok_or_else(|| anyhow!("missing 'dev IFNAME'"))?;
    Ok((prefix, via, dev))
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;
    let default_level = if verbose == 0 { "warn" } else { "debug" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let channel = cli.endpoint.connect(&cli.cert_dir).await?;

    match cli.command {
        Command::AgentInfo => commands::agent_info(channel).await,
        Command::AgentShutdown => commands::agent_shutdown(channel).await,
        Command::GuestInfo => commands::guest_info(channel).await,
        Command::Ip { action } => run_ip(channel, action).await,
        Command::Ls { long, dir_only, path } => commands::fs_ls(channel, &path, long, dir_only).await,
        Command::Cat { path } => commands::fs_cat(channel, &path).await,
        Command::Mkdir { mode, parents, path } => {
            let mode = u32::from_str_radix(&mode, 8)?;
            commands::fs_mkdir(channel, &path, mode, parents).await
        }
        Command::Chmod { mode, path } => {
            let mode = u32::from_str_radix(&mode, 8)?;
            commands::fs_chmod(channel, &path, mode).await
        }
        Command::Chown { owner, path } => commands::fs_chown(channel, &path, &owner).await,
        Command::Md5sum { path } => commands::fs_md5sum(channel, &path).await,
        Command::Rcp { src, dst } => commands::rcp(channel, &src, &dst).await,
        Command::FsFreeze => commands::fs_freeze(channel).await,
        Command::FsUnfreeze => commands::fs_unfreeze(channel).await,
        Command::SecureShell { user, shell, command } => {
            let cid = cli
                .endpoint
                .cid()
                .ok_or_else(|| anyhow::anyhow!("secure-shell requires a cid: endpoint"))?;
            commands::secure_shell(channel, cid, &user, shell.as_deref(), &command).await
        }
    }
}

async fn run_ip(channel: tonic::transport::Channel, action: IpCommand) -> Result<()> {
    match action {
        IpCommand::Addr { action } => match action {
            IpAddrCommand::Show => commands::ip_addr_show(channel).await,
            IpAddrCommand::Add { args } => {
                let (addr, dev) = parse_addr_dev(&args)?;
                commands::ip_addr_add(channel, &dev, &addr).await
            }
            IpAddrCommand::Del { args } => {
                let (addr, dev) = parse_addr_dev(&args)?;
                commands::ip_addr_del(channel, &dev, &addr).await
            }
        },
        IpCommand::Link { action } => match action {
            IpLinkCommand::Set { args } => {
                let (up, dev) = parse_link_set(&args)?;
                commands::ip_link_set(channel, &dev, up).await
            }
        },
        IpCommand::Route { action } => match action {
            IpRouteCommand::List => commands::ip_route_list(channel).await,
            IpRouteCommand::Add { args } => {
                let (prefix, via, dev) = parse_route(&args)?;
                commands::ip_route_add(channel, &prefix, via.as_deref(), &dev).await
            }
            IpRouteCommand::Del { args } => {
                let (prefix, via, dev) = parse_route(&args)?;
                commands::ip_route_del(channel, &prefix, via.as_deref(), &dev).await
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(s: &str) -> Vec<String> {
        s.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn addr_dev_parses_bare_keyword_grammar() {
        let (addr, dev) = parse_addr_dev(&toks("192.168.1.5/24 dev eth0")).unwrap();
        assert_eq!(addr, "192.168.1.5/24");
        assert_eq!(dev, "eth0");
    }

    #[test]
    fn addr_dev_rejects_missing_dev_keyword() {
        assert!(parse_addr_dev(&toks("192.168.1.5/24 eth0")).is_err());
    }

    #[test]
    fn link_set_parses_state_and_dev() {
        let (up, dev) = parse_link_set(&toks("up dev eth0")).unwrap();
        assert!(up);
        assert_eq!(dev, "eth0");

        let (up, dev) = parse_link_set(&toks("down dev eth0")).unwrap();
        assert!(!up);
        assert_eq!(dev, "eth0");
    }

    #[test]
    fn route_parses_prefix_via_and_dev() {
        let (prefix, via, dev) = parse_route(&toks("10.0.0.0/24 via 10.0.0.1 dev eth0")).unwrap();
        assert_eq!(prefix, "10.0.0.0/24");
        assert_eq!(via.as_deref(), Some("10.0.0.1"));
        assert_eq!(dev, "eth0");
    }

    #[test]
    fn route_parses_without_via() {
        let (prefix, via, dev) = parse_route(&toks("10.0.0.0/24 dev eth0")).unwrap();
        assert_eq!(prefix, "10.0.0.0/24");
        assert_eq!(via, None);
        assert_eq!(dev, "eth0");
    }

    #[test]
    fn route_requires_dev() {
        assert!(parse_route(&toks("10.0.0.0/24 via 10.0.0.1")).is_err());
    }
}
