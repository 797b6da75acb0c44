//! runctl - control client for rund
//!
//! Talks JSON to the daemon over the control socket. `enable`/`disable` do
//! not involve the daemon at all: they edit the enabled_services file and
//! take effect at the next boot.

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};

use rund::protocol::{self, Request, Response};
use rund::services::EnabledStore;

#[derive(Parser)]
#[command(name = "runctl")]
#[command(version)]
#[command(about = "Control the rund service manager")]
struct Args {
    /// Runtime directory of the running manager
    #[arg(long, default_value = "/run/rund")]
    runtime_dir: PathBuf,

    /// Configuration directory (for enable/disable)
    #[arg(long, default_value = "/etc/rund")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a service
    Start { name: String },

    /// Stop a service
    Stop { name: String },

    /// Restart a service
    Restart { name: String },

    /// Show one service's status
    Status { name: String },

    /// List all loaded services
    List,

    /// Reload service definitions from disk
    Reload,

    /// Enable a service at a boot stage
    Enable {
        name: String,
        /// Boot stage (0 disables)
        #[arg(default_value_t = 3)]
        stage: u32,
    },

    /// Disable a service
    Disable { name: String },
}

fn main() {
    let args = Args::parse();

    let request = match args.command {
        Command::Enable { name, stage } => {
            enable(&args.config_dir, &name, stage);
            return;
        }
        Command::Disable { name } => {
            enable(&args.config_dir, &name, 0);
            return;
        }
        Command::Start { name } => Request::with_service("start", &name),
        Command::Stop { name } => Request::with_service("stop", &name),
        Command::Restart { name } => Request::with_service("restart", &name),
        Command::Status { name } => Request::with_service("status", &name),
        Command::List => Request::new("list"),
        Command::Reload => Request::new("reload"),
    };

    let socket_path = protocol::socket_path(&args.runtime_dir);
    match call(&socket_path, &request) {
        Ok(response) => print_response(response),
        Err(e) => {
            eprintln!("runctl: could not reach the manager at {}: {}", socket_path.display(), e);
            process::exit(1);
        }
    }
}

fn enable(config_dir: &Path, name: &str, stage: u32) {
    let store = EnabledStore::new(config_dir);
    if let Err(e) = store.set(name, stage) {
        eprintln!("runctl: {}", e);
        process::exit(1);
    }
    if stage == 0 {
        println!("Service ({}) disabled", name);
    } else {
        println!("Service ({}) enabled at stage {}", name, stage);
    }
}

/// One request per connection: write, half-close, read the single response.
fn call(socket_path: &Path, request: &Request) -> std::io::Result<Response> {
    let mut stream = UnixStream::connect(socket_path)?;

    let encoded = serde_json::to_vec(request)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    stream.write_all(&encoded)?;
    stream.shutdown(Shutdown::Write)?;

    let mut data = Vec::new();
    stream.read_to_end(&mut data)?;

    serde_json::from_slice(&data)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn print_response(response: Response) {
    match response {
        Response::Success { success } => println!("{}", success),
        Response::Error { error } => {
            eprintln!("error: {}", error);
            process::exit(1);
        }
        Response::Status(status) => {
            println!("● {}", status.name);
            if !status.description.is_empty() {
                println!("     Desc: {}", status.description);
            }
            println!("    State: {}", status.state);
            println!("      PID: {}", status.process_id);
        }
        Response::List { services } => {
            if services.is_empty() {
                println!("No services loaded");
                return;
            }
            println!("{:<24} {:>10} {:>8}  {}", "SERVICE", "STATE", "PID", "DESCRIPTION");
            for status in services {
                println!(
                    "{:<24} {:>10} {:>8}  {}",
                    status.name, status.state, status.process_id, status.description
                );
            }
        }
    }
}
