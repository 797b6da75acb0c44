//! Service definitions and the descriptor loader
//!
//! A service is described by one YAML file inside the configuration
//! directory's `services/` folder. The loader parses descriptors into
//! [`ServiceDefinition`]s, keys their identity on the file path, and uses a
//! SHA-256 content checksum to decide whether a reload actually changes
//! anything.

mod enabled;
mod registry;

pub use enabled::{EnabledStore, StoreError};
pub use registry::Registry;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer};
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;

/// File suffix that marks a descriptor as loadable.
pub const SERVICE_SUFFIX: &str = "rsv";

/// Runtime state of a supervised service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Read-error sentinel for external queries; never stored in a record.
    Unknown,
    Unloaded,
    Starting,
    Running,
    Stopped,
    Crashed,
    Completed,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Unloaded => "unloaded",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
            Self::Completed => "completed",
        }
    }
}

/// How a service's main process is expected to behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// May complete normally; a zero exit is not a failure.
    Simple,
    /// Expected to stay resident; any exit is unexpected.
    Background,
}

/// Restart policy applied by the reap observer after an unrequested exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    #[default]
    No,
    /// Restart after a crash, at most [`RESTART_LIMIT`] times in a row.
    OnFailure,
    /// Restart unconditionally, with no cap.
    Always,
}

/// Upper bound on consecutive `OnFailure` restarts.
pub const RESTART_LIMIT: u32 = 5;

/// Descriptor keys accept `restart: true`, `restart: "true"` or
/// `restart: always`; anything else quietly means "no restart".
fn deserialize_restart<'de, D>(deserializer: D) -> Result<RestartPolicy, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_yaml::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_yaml::Value::Bool(true) => RestartPolicy::OnFailure,
        serde_yaml::Value::String(s) => match s.as_str() {
            "true" => RestartPolicy::OnFailure,
            "always" => RestartPolicy::Always,
            _ => RestartPolicy::No,
        },
        _ => RestartPolicy::No,
    })
}

fn default_true() -> bool {
    true
}

/// One parsed service descriptor.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub kind: ServiceKind,
    pub start_cmd: String,
    #[serde(default)]
    pub stop_cmd: String,
    /// POSIX user to run as; empty or `root` means no credential switch.
    #[serde(default)]
    pub user: String,
    #[serde(default, deserialize_with = "deserialize_restart")]
    pub restart: RestartPolicy,
    /// Descriptor number (>= 3) the child writes one byte to when ready;
    /// 0 or any value <= 2 disables the readiness rendezvous.
    #[serde(default)]
    pub ready_fd: i32,
    /// Start the child in its own process group so stragglers can be killed
    /// with one signal.
    #[serde(default = "default_true")]
    pub setpgid: bool,
    /// Classify a nonzero exit (or any exit of a `background` service) as
    /// Crashed; when false such exits become Stopped.
    #[serde(default = "default_true")]
    pub crash_on_safe_exit: bool,
    /// Redirect the child's stdout/stderr into a per-service rotating log.
    #[serde(default = "default_true")]
    pub log_output: bool,

    /// Where the descriptor was read from; identity across reloads.
    #[serde(skip)]
    pub file_path: PathBuf,
    /// SHA-256 of the descriptor contents at last successful load.
    #[serde(skip)]
    pub checksum: [u8; 32],
}

impl ServiceDefinition {
    pub fn has_stop_cmd(&self) -> bool {
        !self.stop_cmd.trim().is_empty()
    }

    /// Whether starting this service requires a credential switch.
    pub fn switches_user(&self) -> bool {
        !self.user.is_empty() && self.user != "root"
    }

    pub fn wants_readiness(&self) -> bool {
        self.ready_fd > 2
    }
}

/// A loaded service plus the runtime fields owned by its supervisor.
#[derive(Debug)]
pub struct ServiceRecord {
    pub def: ServiceDefinition,
    pub state: ServiceState,
    /// Pid of the live child; 0 when none.
    pub process_id: i32,
    pub restart_count: u32,
    /// One-shot sender created per run; the matching receiver lives with the
    /// reap observer and tells it the exit was requested.
    pub stop_tx: Option<oneshot::Sender<()>>,
    /// A checksum-changed descriptor arrived while the service was busy;
    /// reload when it next goes quiescent.
    pub should_reload: bool,
}

impl ServiceRecord {
    pub fn new(def: ServiceDefinition) -> Self {
        Self {
            def,
            state: ServiceState::Unloaded,
            process_id: 0,
            restart_count: 0,
            stop_tx: None,
            should_reload: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("could not read service file: {0}")]
    Read(#[source] std::io::Error),

    #[error("could not parse service file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid service file: {0}")]
    Validation(String),

    #[error("service with name ({0}) has already been loaded")]
    NameCollision(String),
}

/// What a [`load`] call did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Fresh record appended.
    Loaded,
    /// Existing record replaced in its slot.
    Reloaded,
    /// Checksum matched; nothing touched.
    Unchanged,
    /// Service is Starting/Running; reload deferred via `should_reload`.
    Deferred,
    /// Descriptor vanished from disk; record dropped.
    Removed,
}

fn content_checksum(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

/// Load (or reload, or unload) the descriptor at `path` into the registry.
///
/// The registry slot is the unit of identity: a reload replaces the record in
/// place, carrying over `restart_count`, the stop channel, and the current
/// state. A service that is Starting or Running is never swapped out from
/// under its supervisor; it gets `should_reload` set instead and the reap
/// observer or stop path finishes the job. All errors leave the registry
/// untouched.
pub fn load(registry: &mut Registry, path: &Path) -> Result<LoadOutcome, LoadError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => Some(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(LoadError::Read(e)),
    };

    let slot = registry.position_by_path(path);

    if let (Some(bytes), Some(idx)) = (&bytes, slot) {
        if let Some(record) = registry.get_mut(idx) {
            if record.def.checksum == content_checksum(bytes) {
                return Ok(LoadOutcome::Unchanged);
            }
            if matches!(record.state, ServiceState::Starting | ServiceState::Running) {
                record.should_reload = true;
                log::warn!(
                    "Service ({}) is currently running and will be reloaded when stopped",
                    record.def.name
                );
                return Ok(LoadOutcome::Deferred);
            }
            record.should_reload = false;
        }
    }

    let Some(bytes) = bytes else {
        // Descriptor vanished from disk.
        let Some(idx) = slot else {
            return Err(LoadError::Read(std::io::Error::from(
                std::io::ErrorKind::NotFound,
            )));
        };
        if let Some(record) = registry.get_mut(idx) {
            if matches!(record.state, ServiceState::Starting | ServiceState::Running) {
                record.should_reload = true;
                log::warn!(
                    "Service ({}) is currently running and will be unloaded when stopped",
                    record.def.name
                );
                return Ok(LoadOutcome::Deferred);
            }
            let name = record.def.name.clone();
            registry.remove_if(|r| r.def.file_path == path);
            log::info!("Service ({}) has been removed", name);
        }
        return Ok(LoadOutcome::Removed);
    };

    if slot.is_some() {
        log::info!("Reloading service ({})...", path.display());
    } else {
        log::info!("Loading service ({})...", path.display());
    }

    let mut def: ServiceDefinition = serde_yaml::from_slice(&bytes)?;
    def.file_path = path.to_path_buf();
    def.checksum = content_checksum(&bytes);

    if def.name.is_empty() {
        return Err(LoadError::Validation("service name is empty".into()));
    }
    if def.start_cmd.trim().is_empty() {
        return Err(LoadError::Validation(format!(
            "service ({}) has an empty start_cmd",
            def.name
        )));
    }

    let colliding = registry
        .iter()
        .enumerate()
        .any(|(i, r)| r.def.name == def.name && Some(i) != slot);
    if colliding {
        return Err(LoadError::NameCollision(def.name));
    }

    let name = def.name.clone();
    let mut record = ServiceRecord::new(def);

    match slot {
        Some(idx) => {
            if let Some(old) = registry.get_mut(idx) {
                record.restart_count = old.restart_count;
                record.stop_tx = old.stop_tx.take();
                record.state = old.state;
            }
            registry.replace_at(idx, record);
            log::info!("Service ({}) has been reloaded", name);
            Ok(LoadOutcome::Reloaded)
        }
        None => {
            registry.insert(record);
            log::info!("Service ({}) has been loaded", name);
            Ok(LoadOutcome::Loaded)
        }
    }
}
