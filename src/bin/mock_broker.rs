//! Mock broker launcher
//!
//! Parses the CLI surface in the spec and runs a [`mqtt_channel_engine::broker`]
//! instance in the foreground until the process is killed. Exits 0 on a clean
//! shutdown, non-zero on a configuration error or bind failure.

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use mqtt_channel_engine::broker::{Auth, BrokerConfig};

/// In-process MQTT 3.1 mock broker, for exercising the channel engine end to end.
#[derive(Parser, Debug)]
#[command(name = "mock-broker", version)]
struct Cli {
    /// Port to bind; 0 selects an ephemeral port.
    #[arg(short = 'p', long = "port", default_value_t = 1883)]
    port: u16,

    /// Resend interval in seconds; 0 disables resend.
    #[arg(short = 't', long = "resend-interval", default_value_t = 15)]
    resend_interval_secs: u64,

    /// Maximum in-flight acknowledgeable messages per client session.
    #[arg(short = 'm', long = "max-inflight")]
    max_inflight: Option<usize>,

    /// Allow anonymous connect when no credentials are presented and no
    /// whitelist is configured.
    #[arg(short = 'a', long = "allow-anonymous")]
    allow_anonymous: bool,

    /// Credential whitelist: `user1:pass1,user2:pass2`.
    #[arg(short = 'u', long = "users")]
    users: Option<String>,

    /// Ignore credentials: accept any client regardless of what it sends.
    #[arg(short = 'i', long = "ignore-credentials")]
    ignore_credentials: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut auth = Auth::new(cli.allow_anonymous, cli.ignore_credentials);
    if let Some(users) = &cli.users {
        auth = match auth.with_credentials(users) {
            Ok(auth) => auth,
            Err(e) => {
                eprintln!("configuration error: {e}");
                return ExitCode::FAILURE;
            }
        };
    }

    let config = BrokerConfig {
        bind_addr: SocketAddr::from(([0, 0, 0, 0], cli.port)),
        resend_interval_ms: cli.resend_interval_secs as i64 * 1000,
        max_inflight: cli.max_inflight,
        auth,
    };

    let broker = match mqtt_channel_engine::broker::spawn(config) {
        Ok(broker) => broker,
        Err(e) => {
            eprintln!("failed to bind: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(addr = %broker.local_addr(), "mock broker running; Ctrl+C to stop");
    // The CLI surface has no "stop" flag; the process runs until killed, at
    // which point the OS reclaims the listening socket.
    loop {
        std::thread::park();
    }
}
