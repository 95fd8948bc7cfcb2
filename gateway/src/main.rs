//! `gtp-gateway`: terminates GTP-U tunnels and bridges each to a TUN device for user
//! equipment emulation, driven by the JSON control protocol in
//! [`gtp_dataplane::wire`].

mod control;
mod eventloop;
mod handlers;
mod supervisor;

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::mpsc;

use clap::Parser;
use gtp_dataplane::Registry;

use eventloop::Eventloop;

fn main() -> ExitCode {
    let cli = Cli::parse();

    if !has_necessary_permissions() && !cli.no_check {
        #[expect(clippy::print_stderr, reason = "No logger has been set up yet")]
        {
            eprintln!(
                "gtp-gateway needs to be executed as `root` or with the `CAP_NET_ADMIN` capability."
            );
        }
        return ExitCode::FAILURE;
    }

    if let Err(error) = logging::setup_global_subscriber(
        &std::env::var("RUST_LOG").unwrap_or_default(),
        matches!(cli.log_format, LogFormat::Json),
    ) {
        #[expect(clippy::print_stderr, reason = "Logging setup itself failed")]
        {
            eprintln!("Failed to set up logging: {error:#}");
        }
        return ExitCode::FAILURE;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %cli.control_addr,
        "gtp-gateway starting"
    );

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "gtp-gateway exiting");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    // Must happen before any other thread is spawned: every thread created afterwards
    // inherits this blocked mask, so only the signal thread ever observes SIGCHLD/SIGUSR1.
    let signal_mask = supervisor::block_signals()?;

    let (tx, rx) = mpsc::channel();

    supervisor::spawn_signal_thread(signal_mask, tx.clone());

    let registry = Arc::new(Registry::new());

    let listener = socket_factory::tcp_listener(cli.control_addr)
        .map_err(|e| anyhow::anyhow!(e).context("Failed to bind control channel listener"))?;
    control::spawn_acceptor(listener, tx);

    Eventloop::new(registry, rx).run();

    Ok(())
}

#[cfg(target_os = "linux")]
fn has_necessary_permissions() -> bool {
    let is_root = nix::unistd::Uid::current().is_root();
    let has_net_admin = caps::has_cap(
        None,
        caps::CapSet::Effective,
        caps::Capability::CAP_NET_ADMIN,
    )
    .is_ok_and(|b| b);

    is_root || has_net_admin
}

#[cfg(not(target_os = "linux"))]
fn has_necessary_permissions() -> bool {
    false
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address the control channel listens on.
    #[arg(long, env = "GTP_GATEWAY_CONTROL_ADDR", default_value = "127.0.0.1:4268")]
    control_addr: SocketAddr,

    /// Log output format.
    #[arg(long, env = "GTP_GATEWAY_LOG_FORMAT", default_value = "human")]
    log_format: LogFormat,

    /// Skip the root/`CAP_NET_ADMIN` permission probe at startup.
    #[arg(long, default_value_t = false)]
    no_check: bool,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum LogFormat {
    Json,
    Human,
}
