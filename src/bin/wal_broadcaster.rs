//! Entry point for the WAL broadcaster executable.

use clap::Parser;
use tracing::{error, info};

use wal_broadcaster::config::{Args, BroadcasterConf};
use wal_broadcaster::{logging, Broadcaster};

fn main() {
    let args = Args::parse();
    let verbose = args.verbose;

    if let Err(e) = logging::init(verbose) {
        eprintln!("failed to initialize logging: {e:#}");
        std::process::exit(1);
    }

    let conf = match BroadcasterConf::from_args(args) {
        Ok(conf) => conf,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(e.exit_code());
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .thread_name("wal-broadcaster-worker")
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to create tokio runtime: {e:#}");
            std::process::exit(1);
        }
    };

    let exit_code = runtime.block_on(run(conf));
    std::process::exit(exit_code);
}

async fn run(conf: BroadcasterConf) -> i32 {
    info!(
        safekeepers = conf.safekeepers.len(),
        quorum = conf.quorum,
        primary = %conf.primary_host,
        "starting wal broadcaster"
    );

    let mut broadcaster = Broadcaster::new(conf);
    tokio::select! {
        result = broadcaster.run() => match result {
            Ok(()) => {
                info!("wal broadcaster shut down cleanly");
                0
            }
            Err(e) => {
                error!(error = %e, "wal broadcaster exited with an error");
                e.exit_code()
            }
        },
        _ = wait_for_shutdown_signal() => {
            info!("received shutdown signal, exiting");
            0
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
