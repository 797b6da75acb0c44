//! Control protocol server
//!
//! Single acceptor, one task per connection. A request is read until the
//! peer half-closes or a short read marks the end, parsed as JSON, dispatched
//! on its `command` field, answered with exactly one JSON object. Per-request
//! errors go back to the client; the listener itself never stops.

use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use crate::manager::{Manager, SharedManager};
use crate::protocol::{Request, Response, ServiceStatus};
use crate::services::ServiceRecord;

/// Chunk size for request reads; a read shorter than this ends the request.
const READ_CHUNK: usize = 1024;

/// Bind the control socket. A failure here is fatal to the daemon.
pub fn bind(path: &Path) -> std::io::Result<UnixListener> {
    UnixListener::bind(path)
}

/// Accept loop. Runs for the lifetime of the daemon.
pub async fn serve(listener: UnixListener, manager: SharedManager) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let manager = manager.clone();
                tokio::spawn(handle_connection(stream, manager));
            }
            Err(e) => {
                log::error!("could not accept control connection: {}", e);
            }
        }
    }
}

async fn handle_connection(mut stream: UnixStream, manager: SharedManager) {
    let data = match read_request(&mut stream).await {
        Ok(data) => data,
        Err(e) => {
            log::error!("could not read control request: {}", e);
            return;
        }
    };

    let response = match serde_json::from_slice::<Request>(&data) {
        Ok(request) => dispatch(request, &manager).await,
        Err(_) => Response::error("invalid JSON request"),
    };

    let encoded = match serde_json::to_vec(&response) {
        Ok(encoded) => encoded,
        Err(e) => {
            log::error!("could not encode control response: {}", e);
            return;
        }
    };
    if let Err(e) = stream.write_all(&encoded).await {
        log::error!("could not write control response: {}", e);
    }
}

/// Read the whole request: chunks of `READ_CHUNK` until EOF or a short read.
async fn read_request(stream: &mut UnixStream) -> std::io::Result<Vec<u8>> {
    let mut data = Vec::new();
    loop {
        let mut chunk = [0u8; READ_CHUNK];
        let n = stream.read(&mut chunk).await?;
        data.extend_from_slice(&chunk[..n]);
        if n < READ_CHUNK {
            break;
        }
    }
    Ok(data)
}

async fn dispatch(request: Request, manager: &SharedManager) -> Response {
    match request.command.as_str() {
        "start" => {
            let Some(name) = request.service else {
                return Response::error("'service' field missing");
            };
            match Manager::start_service(manager, &name).await {
                Ok(()) => Response::success(format!("Service ({}) has started", name)),
                Err(e) => Response::error(format!("could not start service ({}): {}", name, e)),
            }
        }

        "stop" => {
            let Some(name) = request.service else {
                return Response::error("'service' field missing");
            };
            match Manager::stop_service(manager, &name).await {
                Ok(()) => Response::success(format!("Service ({}) has stopped", name)),
                Err(e) => Response::error(format!("could not stop service ({}): {}", name, e)),
            }
        }

        "restart" => {
            let Some(name) = request.service else {
                return Response::error("'service' field missing");
            };
            match Manager::restart_service(manager, &name).await {
                Ok(()) => Response::success(format!("Service ({}) has restarted", name)),
                Err(e) => Response::error(format!("could not restart service ({}): {}", name, e)),
            }
        }

        "status" => {
            let Some(name) = request.service else {
                return Response::error("'service' field missing");
            };
            let manager = manager.read().await;
            match manager.registry().by_name(&name) {
                Some(record) => Response::Status(status_of(record)),
                None => Response::error(format!("service ({}) not found", name)),
            }
        }

        "list" => {
            let manager = manager.read().await;
            Response::List {
                services: manager.registry().iter().map(status_of).collect(),
            }
        }

        "reload" => {
            manager.write().await.reload();
            Response::success("Services reloaded successfully")
        }

        other => Response::error(format!("command ({}) has not been implemented", other)),
    }
}

fn status_of(record: &ServiceRecord) -> ServiceStatus {
    ServiceStatus {
        name: record.def.name.clone(),
        description: record.def.description.clone(),
        state: record.state.as_str().to_string(),
        process_id: record.process_id,
    }
}
