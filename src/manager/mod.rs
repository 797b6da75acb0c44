//! Service manager
//!
//! Owns the registry and the started-order log, and drives the orchestrator
//! paths: boot (load everything, start stage by stage), reload (sweep the
//! definitions directory) and shutdown (stop everything in reverse start
//! order). Per-service supervision lives in [`supervise`].

mod supervise;

pub use supervise::ManagerError;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::logs;
use crate::services::{self, EnabledStore, Registry, SERVICE_SUFFIX};

/// Shared manager handle. The lock guards record state, not time: it is held
/// for quick reads and commits only, never across a readiness or stop wait,
/// so control handlers and reap observers stay concurrent.
pub type SharedManager = Arc<RwLock<Manager>>;

pub struct Manager {
    registry: Registry,
    /// Names that have at least once reached Running, in first-start order.
    /// Read in reverse by [`Manager::shutdown`].
    started_order: Vec<String>,
    runtime_dir: PathBuf,
    config_dir: PathBuf,
    log_root: PathBuf,
}

impl Manager {
    pub fn new(runtime_dir: PathBuf, config_dir: PathBuf) -> Self {
        Self {
            registry: Registry::new(),
            started_order: Vec::new(),
            runtime_dir,
            config_dir,
            log_root: PathBuf::from(logs::LOG_ROOT),
        }
    }

    /// Override the log root (the daemon default is `/var/log/rund`).
    pub fn set_log_root(&mut self, root: PathBuf) {
        self.log_root = root;
    }

    /// Wrap the manager for concurrent use.
    pub fn into_shared(self) -> SharedManager {
        Arc::new(RwLock::new(self))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn started_order(&self) -> &[String] {
        &self.started_order
    }

    pub fn socket_path(&self) -> PathBuf {
        crate::protocol::socket_path(&self.runtime_dir)
    }

    fn services_dir(&self) -> PathBuf {
        self.config_dir.join("services")
    }

    /// Create the runtime directory. A pre-existing directory means another
    /// manager already owns this runtime and is fatal by design.
    pub fn init_runtime(&self) -> Result<(), ManagerError> {
        if self.runtime_dir.exists() {
            return Err(ManagerError::RuntimeDirExists(self.runtime_dir.clone()));
        }
        std::fs::create_dir_all(&self.runtime_dir).map_err(ManagerError::Io)?;
        Ok(())
    }

    /// Run the loader over one descriptor path, logging failures. Loader
    /// errors never propagate: the registry is simply left unchanged.
    pub fn load_definition(&mut self, path: &Path) -> Option<services::LoadOutcome> {
        match services::load(&mut self.registry, path) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                log::error!("could not load service file ({}): {}", path.display(), e);
                None
            }
        }
    }

    /// Descriptor paths currently present in the services directory, sorted
    /// for a deterministic load order.
    fn descriptor_paths(&self) -> Vec<PathBuf> {
        let dir = self.services_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("could not read services directory ({}): {}", dir.display(), e);
                return Vec::new();
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file() && path.extension() == Some(std::ffi::OsStr::new(SERVICE_SUFFIX))
            })
            .collect();
        paths.sort();
        paths
    }

    /// Initial boot: load every descriptor, then start the enabled services
    /// stage by stage in ascending order. Unknown names and individual start
    /// failures degrade the boot, they never abort it. Services are started
    /// one at a time, but the lock is released between them so the control
    /// socket answers during a slow boot.
    pub async fn boot(manager: &SharedManager) {
        log::info!("Initializing service manager...");

        let stages = {
            let mut mgr = manager.write().await;
            for path in mgr.descriptor_paths() {
                mgr.load_definition(&path);
            }
            EnabledStore::new(&mgr.config_dir).read()
        };

        for (stage, names) in stages {
            if stage == 0 {
                // Stage 0 is "disabled".
                continue;
            }
            log::info!("Starting stage {} services...", stage);
            for name in names {
                if manager.read().await.registry.by_name(&name).is_none() {
                    log::warn!("enabled service ({}) is not loaded, skipping", name);
                    continue;
                }
                if let Err(e) = Manager::start_service(manager, &name).await {
                    log::error!("could not start service ({}): {}", name, e);
                }
            }
        }

        log::info!("Service manager initialized");
    }

    /// Hot reload: re-run the loader over every descriptor on disk, then push
    /// registry entries whose descriptor vanished back through the loader so
    /// they are removed (or deferred, when still running).
    pub fn reload(&mut self) {
        log::info!("Reloading all services...");

        for path in self.descriptor_paths() {
            self.load_definition(&path);
        }

        let vanished: Vec<PathBuf> = self
            .registry
            .iter()
            .filter(|r| !r.def.file_path.exists())
            .map(|r| r.def.file_path.clone())
            .collect();
        for path in vanished {
            self.load_definition(&path);
        }

        log::info!("All services have been reloaded");
    }

    /// Stop every started service in reverse start order. Failures are logged
    /// and the walk continues; shutdown always runs to completion.
    pub async fn shutdown(manager: &SharedManager) {
        log::info!("Stopping all services...");

        let order: Vec<String> = {
            let mgr = manager.read().await;
            mgr.started_order.iter().rev().cloned().collect()
        };
        for name in order {
            if manager.read().await.registry.by_name(&name).is_none() {
                continue;
            }
            if let Err(e) = Manager::stop_service(manager, &name).await {
                log::error!("could not stop service ({}): {}", name, e);
            }
        }

        log::info!("All services have stopped");
    }
}
