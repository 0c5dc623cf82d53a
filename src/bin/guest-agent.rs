//! Binary entrypoint: parses the CLI, wires up tracing, and dispatches to
//! the `serve` / `netinit` / `version` subcommands.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use guest_agent::config::{AgentConfig, Cli, Commands};
use guest_agent::ssh::SshUserKey;
use guest_agent::{server, Error};

fn init_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return ExitCode::from(1);
        }
    };

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> ExitCode {
    match cli.command {
        Commands::Serve(args) => run_serve(args.into()).await,
        Commands::Netinit(args) => run_netinit(args).await,
        Commands::Version => {
            println!("guest-agent {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
    }
}

async fn run_serve(config: AgentConfig) -> ExitCode {
    let ssh_user_key = if config.without_ssh {
        None
    } else {
        match SshUserKey::generate() {
            Ok(key) => Some(Arc::new(key)),
            Err(e) => {
                tracing::error!(error = %e, "failed to generate ssh host/bearer key");
                return exit_code_for(&e);
            }
        }
    };

    match server::serve(config, ssh_user_key).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "agent exited with error");
            exit_code_for(&e)
        }
    }
}

async fn run_netinit(args: guest_agent::config::NetinitArgs) -> ExitCode {
    let result = if let Some(name) = args.configure_iface {
        guest_agent::netinit::configure_iface(&name).await
    } else if let Some(name) = args.deconfigure_iface {
        guest_agent::netinit::deconfigure_iface(&name).await
    } else {
        // clap's ArgGroup makes this unreachable; kept for exhaustiveness.
        Err(Error::InvalidArgument(
            "one of --configure-iface or --deconfigure-iface is required".to_string(),
        ))
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "netinit failed");
            exit_code_for(&e)
        }
    }
}

/// Maps the agent's error taxonomy onto process exit codes: usage/config
/// problems exit 2, everything else exits 1.
fn exit_code_for(err: &Error) -> ExitCode {
    match err {
        Error::Config(_) | Error::InvalidArgument(_) => ExitCode::from(2),
        _ => ExitCode::from(1),
    }
}
