//! vmrelay CLI - Tunnel a cloud VM port to localhost
//!
//! Opens a relay-backed tunnel and prints the local endpoint, so RDP or
//! SSH clients can connect to localhost instead of the VM directly.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vmrelay_client::{
    AllowAllRelayPolicy, BrokerConfig, BrokerEvent, RelayPolicy, SameProcessRelayPolicy,
    StaticCredential, TunnelBroker,
};
use vmrelay_proto::Target;
use vmrelay_transport::{RelayClientConfig, RelayConnector, TransportSecurity};

/// vmrelay - Reach cloud VM ports through an identity-aware relay
#[derive(Parser, Debug)]
#[command(name = "vmrelay")]
#[command(about = "vmrelay - Reach cloud VM ports through an identity-aware relay")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open a tunnel to one VM port and keep it up until Ctrl+C
    #[command(long_about = r#"
Open a tunnel to a VM port through the relay and print the local
endpoint to connect to.

EXAMPLES:
  # Tunnel RDP to a VM
  vmrelay connect --relay relay.example.com:9443 \
    --token $VMRELAY_TOKEN \
    --project my-project --zone us-central1-a \
    --instance win-vm-1 --port 3389

ENVIRONMENT VARIABLES:
  VMRELAY_RELAY     Relay endpoint address
  VMRELAY_TOKEN     Bearer token presented to the relay
  VMRELAY_PROJECT   Cloud project of the target VM
  VMRELAY_ZONE      Zone of the target VM
  VMRELAY_INSTANCE  Target VM instance name
    "#)]
    Connect {
        /// Relay endpoint (e.g., relay.example.com:9443)
        #[arg(long, env = "VMRELAY_RELAY")]
        relay: String,

        /// Bearer token presented to the relay
        #[arg(long, env = "VMRELAY_TOKEN")]
        token: String,

        /// Cloud project of the target VM
        #[arg(long, env = "VMRELAY_PROJECT")]
        project: String,

        /// Zone of the target VM
        #[arg(long, env = "VMRELAY_ZONE")]
        zone: String,

        /// Target VM instance name
        #[arg(long, env = "VMRELAY_INSTANCE")]
        instance: String,

        /// VM port to tunnel (e.g., 3389 for RDP, 22 for SSH)
        #[arg(long, default_value = "3389")]
        port: u16,

        /// Only admit local connections made by this process
        #[arg(long)]
        same_process_only: bool,

        /// Skip certificate verification (insecure, for development only)
        #[arg(long)]
        insecure: bool,

        /// Connect to the relay without TLS (test relays only)
        #[arg(long)]
        plaintext: bool,

        /// Tunnel establishment timeout in seconds
        #[arg(long, default_value = "30")]
        connect_timeout: u64,
    },
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Connect {
            relay,
            token,
            project,
            zone,
            instance,
            port,
            same_process_only,
            insecure,
            plaintext,
            connect_timeout,
        } => {
            let target = Target::new(project, zone, instance, port);
            info!("Tunneling {} via relay {}", target, relay);

            let mut config = if insecure {
                warn!("Certificate verification disabled (insecure mode)");
                RelayClientConfig::client_insecure(relay)
            } else {
                RelayClientConfig::client_default(relay)
            };
            if plaintext {
                warn!("Connecting to the relay without TLS");
                config.security = TransportSecurity::Plaintext;
            }

            let connector = RelayConnector::new(config).context("Invalid relay configuration")?;
            let broker = TunnelBroker::new(
                connector,
                Arc::new(StaticCredential::new(token)),
                BrokerConfig {
                    connect_timeout: Duration::from_secs(connect_timeout),
                    ..BrokerConfig::default()
                },
            );

            let policy: Arc<dyn RelayPolicy> = if same_process_only {
                Arc::new(SameProcessRelayPolicy)
            } else {
                Arc::new(AllowAllRelayPolicy)
            };

            let endpoint = broker
                .connect(
                    &target,
                    policy,
                    Duration::from_secs(connect_timeout.saturating_add(5)),
                )
                .await
                .context("Failed to open tunnel")?;

            info!("Tunnel ready: connect to {}", endpoint);
            println!("{}", endpoint);

            let mut events = broker.events();
            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);

            loop {
                tokio::select! {
                    _ = &mut ctrl_c => {
                        info!("Received Ctrl+C, shutting down...");
                        break;
                    }
                    event = events.recv() => {
                        match event {
                            Ok(BrokerEvent::TunnelLost { target, reason }) => {
                                warn!("Tunnel to {} lost: {}", target, reason);
                                break;
                            }
                            Ok(BrokerEvent::TunnelClosed { target }) => {
                                info!("Tunnel to {} closed", target);
                                break;
                            }
                            Err(_) => break,
                        }
                    }
                }
            }

            broker.shutdown().await;
        }
    }

    Ok(())
}
