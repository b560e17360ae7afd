//! rstunneld - the tunneling daemon.

use std::path::PathBuf;
use std::time::Duration;

use argh::FromArgs;
use tokio::net::UnixListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rstunnel::control::ControlServer;
use rstunnel::service::TunnelService;
use rstunnel::ssh::SshDialerConfig;

/// Rule-based SSH tunneling daemon.
#[derive(FromArgs)]
struct Args {
    /// path of the control socket (default: $RSTUNNEL_SOCKET or the temp dir)
    #[argh(option, short = 's')]
    socket: Option<PathBuf>,

    /// ssh connect/handshake timeout in seconds
    #[argh(option, default = "15")]
    timeout: u64,

    /// bound in seconds on interactive passphrase waits (unbounded when
    /// omitted)
    #[argh(option)]
    passphrase_timeout: Option<u64>,
}

fn default_socket_path() -> PathBuf {
    std::env::var_os("RSTUNNEL_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("rstunnel.sock"))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Args = argh::from_env();
    let socket_path = args.socket.unwrap_or_else(default_socket_path);

    // A stale socket from a previous run would make bind fail.
    if socket_path.exists() {
        if let Err(e) = std::fs::remove_file(&socket_path) {
            error!("cannot remove stale socket {}: {e}", socket_path.display());
            std::process::exit(1);
        }
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(e) => {
            error!("cannot bind control socket {}: {e}", socket_path.display());
            std::process::exit(1);
        }
    };
    info!("control socket at {}", socket_path.display());

    let service = TunnelService::new(SshDialerConfig {
        connect_timeout: Duration::from_secs(args.timeout),
        passphrase_timeout: args.passphrase_timeout.map(Duration::from_secs),
    });

    let (server, stop_rx) = ControlServer::new(service);

    tokio::select! {
        _ = server.serve(listener, stop_rx) => {
            info!("control server exited");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
        }
    }

    let _ = std::fs::remove_file(&socket_path);
}
