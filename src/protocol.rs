//! Control protocol for manager <-> client communication
//!
//! One JSON request per connection, one JSON response back. The request names
//! a command and, for the per-service commands, the target service. Responses
//! are a success/error envelope or a status object; states travel as the
//! lower-case words produced by `ServiceState::as_str`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Name of the control socket inside the runtime directory.
pub const SOCKET_FILE: &str = "rund.sock";

/// Control socket path for a given runtime directory.
pub fn socket_path(runtime_dir: &Path) -> PathBuf {
    runtime_dir.join(SOCKET_FILE)
}

/// Request from the control client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

impl Request {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            service: None,
        }
    }

    pub fn with_service(command: &str, service: &str) -> Self {
        Self {
            command: command.to_string(),
            service: Some(service.to_string()),
        }
    }
}

/// Status of one service as reported over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub description: String,
    pub state: String,
    pub process_id: i32,
}

/// Response to the control client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Success { success: String },
    Error { error: String },
    Status(ServiceStatus),
    List { services: Vec<ServiceStatus> },
}

impl Response {
    pub fn success(msg: impl Into<String>) -> Self {
        Self::Success {
            success: msg.into(),
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self::Error { error: msg.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let encoded = serde_json::to_value(Request::with_service("start", "web")).unwrap();
        assert_eq!(encoded, json!({"command": "start", "service": "web"}));

        let encoded = serde_json::to_value(Request::new("list")).unwrap();
        assert_eq!(encoded, json!({"command": "list"}));
    }

    #[test]
    fn test_request_parses_without_service() {
        let request: Request = serde_json::from_str(r#"{"command":"reload"}"#).unwrap();
        assert_eq!(request.command, "reload");
        assert!(request.service.is_none());
    }

    #[test]
    fn test_response_wire_shapes() {
        let encoded = serde_json::to_value(Response::success("done")).unwrap();
        assert_eq!(encoded, json!({"success": "done"}));

        let encoded = serde_json::to_value(Response::error("nope")).unwrap();
        assert_eq!(encoded, json!({"error": "nope"}));

        let status = ServiceStatus {
            name: "web".into(),
            description: "frontend".into(),
            state: "running".into(),
            process_id: 42,
        };
        let encoded = serde_json::to_value(Response::Status(status.clone())).unwrap();
        assert_eq!(
            encoded,
            json!({"name": "web", "description": "frontend", "state": "running", "process_id": 42})
        );

        let encoded = serde_json::to_value(Response::List {
            services: vec![status],
        })
        .unwrap();
        assert_eq!(encoded["services"][0]["name"], "web");
    }

    #[test]
    fn test_response_roundtrip() {
        for raw in [
            r#"{"success":"ok"}"#,
            r#"{"error":"bad"}"#,
            r#"{"name":"a","description":"","state":"stopped","process_id":0}"#,
            r#"{"services":[]}"#,
        ] {
            let decoded: Response = serde_json::from_str(raw).unwrap();
            let reencoded = serde_json::to_string(&decoded).unwrap();
            assert_eq!(
                serde_json::from_str::<serde_json::Value>(raw).unwrap(),
                serde_json::from_str::<serde_json::Value>(&reencoded).unwrap()
            );
        }
    }

    #[test]
    fn test_socket_path() {
        assert_eq!(
            socket_path(Path::new("/run/rund")),
            PathBuf::from("/run/rund/rund.sock")
        );
    }
}
