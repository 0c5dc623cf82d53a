//! CLI surface and runtime configuration for the agent binary.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// VM-socket / link-local TCP port the RPC server listens on.
pub const RPC_PORT: u32 = 8383;
/// VM-socket port the embedded SSH endpoint listens on.
pub const SSH_PORT: u32 = 4949;
/// Default virtio-serial character device path.
pub const DEFAULT_SERIAL_PATH: &str = "/dev/virtio-ports/org.guest-agent.0";
/// Default certificate directory, overridable via `CERTDIR`.
pub const DEFAULT_CERT_DIR: &str = "/etc/guest-agent/certs";
/// Interval between telemetry polls.
pub const TELEMETRY_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);
/// Delay between `ShutdownAgent` replying and the process actually exiting.
pub const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(3);
/// Interval between link-local address poll attempts.
pub const LINK_LOCAL_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3);
/// Maximum number of link-local poll attempts before giving up.
pub const LINK_LOCAL_POLL_ATTEMPTS: u32 = 20;
/// Idle timeout for SSH sessions.
pub const SSH_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10 * 60);
/// Maximum accepted upload size: 2 GiB.
pub const MAX_UPLOAD_BYTES: u64 = 1 << 31;
/// Reference chunk size used when streaming downloads.
pub const DOWNLOAD_CHUNK_BYTES: usize = 2 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "guest-agent", version, about = "In-guest VM agent")]
pub struct Cli {
    /// Increase log verbosity; repeatable.
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the agent's RPC and SSH listeners.
    Serve(ServeArgs),
    /// One-shot cloud-init NoCloud network bring-up/tear-down.
    Netinit(NetinitArgs),
    /// Print the agent version and exit.
    Version,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Disable the embedded SSH endpoint.
    #[arg(long)]
    pub without_ssh: bool,

    /// Disable the IPv6 link-local TCP fallback transport.
    #[arg(long)]
    pub without_tcp: bool,

    /// Force the virtio-serial transport even if vsock is available.
    #[arg(long)]
    pub legacy: bool,

    /// Virtio-serial device path, used when vsock is unavailable or `--legacy` is set.
    #[arg(long, default_value = DEFAULT_SERIAL_PATH)]
    pub path: PathBuf,

    /// Directory holding CA.crt, agent.crt, agent.key.
    #[arg(long, env = "CERTDIR", default_value = DEFAULT_CERT_DIR)]
    pub cert_dir: PathBuf,
}

#[derive(Args, Debug, Clone)]
#[command(group(clap::ArgGroup::new("iface_action").required(true).args(["configure_iface", "deconfigure_iface"])))]
pub struct NetinitArgs {
    /// Bring up and configure the named interface from the NoCloud datasource.
    #[arg(long, value_name = "NAME")]
    pub configure_iface: Option<String>,

    /// Bring down and strip addresses from the named interface.
    #[arg(long, value_name = "NAME")]
    pub deconfigure_iface: Option<String>,
}

/// Runtime configuration assembled from [`ServeArgs`], independent of clap.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub without_ssh: bool,
    pub without_tcp: bool,
    pub legacy_mode: bool,
    pub serial_path: PathBuf,
    pub cert_dir: PathBuf,
}

impl From<ServeArgs> for AgentConfig {
    fn from(args: ServeArgs) -> Self {
        Self {
            without_ssh: args.without_ssh,
            without_tcp: args.without_tcp,
            legacy_mode: args.legacy,
            serial_path: args.path,
            cert_dir: args.cert_dir,
        }
    }
}
