//! rund - staged service manager daemon
//!
//! Runs as a direct child of PID 1. Boots the enabled services stage by
//! stage, supervises them, and listens on `<runtime dir>/rund.sock` for
//! commands from runctl. SIGTERM/SIGINT stop every started service in
//! reverse start order before exiting; SIGHUP reloads the definitions
//! directory.

use std::path::PathBuf;
use std::process;

use clap::Parser;

use rund::manager::Manager;
use rund::signals::{parent_is_init, DaemonSignal, SignalHandler};
use rund::{control, logs, protocol};

#[derive(Parser)]
#[command(name = "rund")]
#[command(version)]
#[command(about = "Staged service manager driven by a PID-1 init")]
struct Args {
    /// Runtime directory; must not pre-exist, holds the control socket
    runtime_dir: PathBuf,
    /// Configuration directory; holds services/*.rsv and enabled_services
    config_dir: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    logs::init_daemon_logging();

    if !parent_is_init() {
        eprintln!("rund must be run by PID 1");
        process::exit(1);
    }

    let manager = Manager::new(args.runtime_dir.clone(), args.config_dir);

    if let Err(e) = manager.init_runtime() {
        log::error!("could not initialize service manager: {}", e);
        process::exit(1);
    }

    let socket_path = protocol::socket_path(&args.runtime_dir);
    let listener = match control::bind(&socket_path) {
        Ok(listener) => listener,
        Err(e) => {
            log::error!(
                "could not bind control socket ({}): {}",
                socket_path.display(),
                e
            );
            process::exit(1);
        }
    };
    log::info!("rund listening on {}", socket_path.display());

    let shared = manager.into_shared();

    match SignalHandler::new() {
        Ok(mut handler) => {
            let manager = shared.clone();
            tokio::spawn(async move {
                loop {
                    match handler.wait().await {
                        DaemonSignal::Term | DaemonSignal::Int => {
                            Manager::shutdown(&manager).await;
                            process::exit(0);
                        }
                        DaemonSignal::Hup => {
                            manager.write().await.reload();
                        }
                    }
                }
            });
        }
        Err(e) => {
            log::error!("could not set up signal handlers: {}", e);
        }
    }

    Manager::boot(&shared).await;

    control::serve(listener, shared).await;
}
