//! Per-service supervision
//!
//! One service's lifecycle is a strict chain: `start` spawns the shell child
//! (own process group, optional credential switch, optional readiness pipe),
//! a dedicated reap observer waits on the child and classifies its exit, and
//! `stop` tears the child down with TERM-then-KILL escalation. The one-shot
//! stop channel is the only way the observer can tell a requested exit from a
//! crash: `stop` fires it before signalling the child, the observer checks it
//! after `wait` returns.
//!
//! Every wait in here carries a deadline. Readiness gets 10 seconds, a TERM'd
//! child gets 5, a `background` service's stop_cmd follow-up gets 15; on
//! expiry the whole process group is killed.
//!
//! Lock discipline: the manager lock is taken only to read a record and to
//! commit an outcome, never across a bounded wait. Readiness and death waits
//! run unlocked, and the reap observer classifies an exit under the lock but
//! re-enters `start` for a policy restart only after releasing it. One
//! service blocked in a 10 second readiness wait, or flapping through
//! restarts, must never stall another service's observer or a control
//! request.

use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::logs;
use crate::services::{
    RestartPolicy, ServiceDefinition, ServiceKind, ServiceState, RESTART_LIMIT,
};

use super::{Manager, SharedManager};

/// How long a child with a `ready_fd` has to write its readiness byte.
const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period between SIGTERM and SIGKILL on the no-stop_cmd path.
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a `background` service gets to die after its stop_cmd ran.
const BACKGROUND_STOP_TIMEOUT: Duration = Duration::from_secs(15);

const DEATH_PROBE_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("service not found: {0}")]
    NotFound(String),

    #[error("service was removed: {0}")]
    Removed(String),

    #[error("runtime directory ({0}) already exists")]
    RuntimeDirExists(PathBuf),

    #[error("unknown user ({0})")]
    UnknownUser(String),

    #[error("could not open log file: {0}")]
    Log(#[source] std::io::Error),

    #[error("could not set up readiness pipe: {0}")]
    Pipe(#[source] nix::Error),

    #[error("could not spawn process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("service ({0}) did not signal readiness within {1:?}")]
    ReadinessTimeout(String, Duration),

    #[error("could not stop process gracefully")]
    GracefulStop,

    #[error("service ({0}) did not exit within {1:?}")]
    StopTimeout(String, Duration),

    #[error("stop command failed: {0}")]
    StopCommand(String),

    #[error("{0}")]
    Io(#[source] std::io::Error),
}

impl Manager {
    /// Start a service by name. A no-op when it is already Starting or
    /// Running.
    pub async fn start_service(
        manager: &SharedManager,
        name: &str,
    ) -> Result<(), ManagerError> {
        // Resolve and spawn under the lock. Spawning is quick; the readiness
        // wait below is not and runs unlocked.
        let (def, pid, mut child, log_file, pipe_r) = {
            let mut mgr = manager.write().await;

            let def = {
                let record = mgr
                    .registry
                    .by_name(name)
                    .ok_or_else(|| ManagerError::NotFound(name.to_string()))?;
                if matches!(record.state, ServiceState::Starting | ServiceState::Running) {
                    return Ok(());
                }
                record.def.clone()
            };

            log::info!("Starting service ({})...", def.name);

            // Every failure from here to Running leaves the record in Crashed
            // with no pid and no leaked descriptors.
            let log_file = if def.log_output {
                match logs::open_target_log(&mgr.log_root, &def.name) {
                    Ok(file) => Some(file),
                    Err(e) => {
                        mgr.mark_crashed(name);
                        return Err(ManagerError::Log(e));
                    }
                }
            } else {
                None
            };

            let (mut cmd, pipe) = match build_start_command(&def, log_file.as_ref()) {
                Ok(built) => built,
                Err(e) => {
                    mgr.mark_crashed(name);
                    return Err(e);
                }
            };

            let child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    mgr.mark_crashed(name);
                    return Err(ManagerError::Spawn(e));
                }
            };
            let pid = child.id().map(|p| p as i32).unwrap_or(0);

            if let Some(record) = mgr.registry.by_name_mut(name) {
                record.process_id = pid;
                record.state = ServiceState::Starting;
            }
            if !mgr.started_order.iter().any(|n| n == name) {
                mgr.started_order.push(name.to_string());
            }

            let Some((pipe_r, pipe_w)) = pipe else {
                // No readiness rendezvous: running as soon as the spawn
                // lands, all within this one lock hold.
                let (stop_tx, stop_rx) = oneshot::channel();
                if let Some(record) = mgr.registry.by_name_mut(name) {
                    record.state = ServiceState::Running;
                    record.stop_tx = Some(stop_tx);
                }
                spawn_reap_observer(manager, def.name.clone(), pid, child, log_file, stop_rx);
                log::info!("Service ({}) has started", def.name);
                return Ok(());
            };
            // The child holds the only live write end from here on.
            drop(pipe_w);

            (def, pid, child, log_file, pipe_r)
        };

        // Wait for the readiness byte with no locks held, so control
        // requests and other services' observers keep flowing.
        let ready = await_ready_byte(pipe_r).await;

        if !ready {
            kill_group(pid);
            let _ = child.wait().await;
            let mut mgr = manager.write().await;
            if let Some(record) = mgr.registry.by_name_mut(name) {
                if record.process_id == pid {
                    record.process_id = 0;
                    record.state = ServiceState::Crashed;
                }
            }
            return Err(ManagerError::ReadinessTimeout(def.name, READY_TIMEOUT));
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        {
            let mut mgr = manager.write().await;
            if let Some(record) = mgr.registry.by_name_mut(name) {
                if record.process_id == pid {
                    record.state = ServiceState::Running;
                    record.stop_tx = Some(stop_tx);
                }
            }
        }
        spawn_reap_observer(manager, def.name.clone(), pid, child, log_file, stop_rx);

        log::info!("Service ({}) has started", def.name);
        Ok(())
    }

    /// Stop a service by name. A no-op when it is not Running.
    pub async fn stop_service(
        manager: &SharedManager,
        name: &str,
    ) -> Result<(), ManagerError> {
        // Validate, probe and fire the stop channel in one lock hold, so the
        // reap observer can never classify this exit as a crash once stop has
        // committed to it. The escalation waits below run unlocked.
        let (def, pid) = {
            let mut mgr = manager.write().await;
            let Some(record) = mgr.registry.by_name_mut(name) else {
                return Err(ManagerError::NotFound(name.to_string()));
            };
            if record.state != ServiceState::Running {
                return Ok(());
            }
            let def = record.def.clone();
            let pid = record.process_id;

            log::info!("Stopping service ({})...", def.name);

            if !def.has_stop_cmd() && !process_alive(pid) {
                record.state = ServiceState::Stopped;
                record.process_id = 0;
                let reload_path = record.should_reload.then(|| record.def.file_path.clone());
                kill_group(pid);
                if let Some(path) = reload_path {
                    mgr.load_definition(&path);
                }
                log::info!("Service ({}) has stopped (process already dead)", def.name);
                return Ok(());
            }

            if let Some(tx) = record.stop_tx.take() {
                let _ = tx.send(());
            }
            (def, pid)
        };

        let result = run_stop(&def, pid).await;

        // On every path out of a stop: sweep the process group, settle the
        // final state, clear the pid and fire any deferred reload. The pid
        // check keeps a stale stop from clobbering a newer run.
        kill_group(pid);
        let final_state = match &result {
            Ok(state) => *state,
            Err(_) => ServiceState::Crashed,
        };
        {
            let mut mgr = manager.write().await;
            let reload_path = match mgr.registry.by_name_mut(name) {
                Some(record) if record.process_id == pid => {
                    record.state = final_state;
                    record.process_id = 0;
                    record.should_reload.then(|| record.def.file_path.clone())
                }
                _ => None,
            };
            if let Some(path) = reload_path {
                mgr.load_definition(&path);
            }
        }

        result.map(|_| log::info!("Service ({}) has stopped", def.name))
    }

    /// Stop then start. Fails when the service disappeared in a deferred
    /// reload window between the two.
    pub async fn restart_service(
        manager: &SharedManager,
        name: &str,
    ) -> Result<(), ManagerError> {
        Manager::stop_service(manager, name).await?;
        if manager.read().await.registry.by_name(name).is_none() {
            return Err(ManagerError::Removed(name.to_string()));
        }
        Manager::start_service(manager, name).await
    }

    fn mark_crashed(&mut self, name: &str) {
        if let Some(record) = self.registry.by_name_mut(name) {
            record.process_id = 0;
            record.state = ServiceState::Crashed;
        }
    }

    /// Classify a child exit and apply the restart bookkeeping. Called with
    /// the manager lock held, after the child has been reaped; returns
    /// whether the caller should start the service again (which it must do
    /// without this lock).
    fn handle_exit(
        &mut self,
        name: &str,
        pid: i32,
        status: Option<ExitStatus>,
        mut stop_rx: oneshot::Receiver<()>,
    ) -> bool {
        let stop_requested = stop_rx.try_recv().is_ok();

        if stop_requested {
            // stop() owns the final state and pid; only the bookkeeping
            // belongs to the observer.
            let reload_path = match self.registry.by_name_mut(name) {
                Some(record) => {
                    record.restart_count = 0;
                    if record.should_reload {
                        Some(record.def.file_path.clone())
                    } else {
                        None
                    }
                }
                None => return false,
            };
            if let Some(path) = reload_path {
                self.load_definition(&path);
            }
            return false;
        }

        let (reload_path, consider_restart) = {
            let Some(record) = self.registry.by_name_mut(name) else {
                return false;
            };
            if record.process_id != pid {
                // A newer run owns the record; this observer is stale.
                return false;
            }

            // Unrequested exit: sweep whatever the shell wrapper left behind.
            kill_group(pid);

            let clean_exit = status.map(|s| s.success()).unwrap_or(false);

            if record.def.kind == ServiceKind::Simple && clean_exit {
                record.restart_count = 0;
                if record.def.has_stop_cmd() {
                    // Recipe-style wrapper: its stop_cmd owns termination,
                    // so the service keeps counting as running.
                    return false;
                }
                record.state = ServiceState::Completed;
                record.process_id = 0;
                log::info!("Service ({}) has completed", name);
                let path = record.should_reload.then(|| record.def.file_path.clone());
                (path, false)
            } else {
                if record.def.crash_on_safe_exit {
                    record.state = ServiceState::Crashed;
                    log::warn!("Service ({}) has crashed", name);
                } else {
                    record.state = ServiceState::Stopped;
                    log::info!("Service ({}) has exited", name);
                }
                record.process_id = 0;
                let path = record.should_reload.then(|| record.def.file_path.clone());
                (path, true)
            }
        };

        if let Some(path) = reload_path {
            self.load_definition(&path);
        }
        if !consider_restart {
            return false;
        }

        // The deferred reload may have replaced or removed the record;
        // re-resolve by name before deciding on a restart.
        let (policy, count) = match self.registry.by_name(name) {
            Some(record) => (record.def.restart, record.restart_count),
            None => return false,
        };
        match policy {
            RestartPolicy::Always => true,
            RestartPolicy::OnFailure if count < RESTART_LIMIT => {
                if let Some(record) = self.registry.by_name_mut(name) {
                    record.restart_count = count + 1;
                }
                true
            }
            _ => false,
        }
    }
}

/// One observer per run: waits on the child, then re-locks the manager and
/// settles the record. It deliberately holds only the service name, not the
/// record, and re-resolves after the wait; a reload may have replaced the
/// record in the meantime. A policy restart happens after the classification
/// lock is released, so a crash-looping service cannot wedge the rest of the
/// manager.
fn spawn_reap_observer(
    manager: &SharedManager,
    name: String,
    pid: i32,
    mut child: Child,
    log_file: Option<File>,
    stop_rx: oneshot::Receiver<()>,
) {
    let weak = Arc::downgrade(manager);
    tokio::spawn(async move {
        let status = child.wait().await.ok();
        // This run's log descriptor is released with its observer.
        drop(log_file);
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let restart = {
            let mut mgr = shared.write().await;
            mgr.handle_exit(&name, pid, status, stop_rx)
        };
        if restart {
            if let Err(e) = Box::pin(Manager::start_service(&shared, &name)).await {
                log::error!("could not restart service ({}): {}", name, e);
            }
        }
    });
}

/// The fallible middle of `stop_service`: either the TERM path or the
/// stop_cmd path, run without the manager lock. Returns the state to record
/// on success.
async fn run_stop(def: &ServiceDefinition, pid: i32) -> Result<ServiceState, ManagerError> {
    if !def.has_stop_cmd() {
        if kill(Pid::from_raw(pid), Signal::SIGTERM).is_err() {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            return Err(ManagerError::GracefulStop);
        }
        if !wait_for_death(pid, GRACEFUL_STOP_TIMEOUT).await {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            return Err(ManagerError::StopTimeout(
                def.name.clone(),
                GRACEFUL_STOP_TIMEOUT,
            ));
        }
        return Ok(ServiceState::Stopped);
    }

    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c").arg(&def.stop_cmd);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::null());
    if def.switches_user() {
        let (uid, gid) = resolve_user(&def.user)?;
        cmd.uid(uid);
        cmd.gid(gid);
    }

    let status = cmd
        .status()
        .await
        .map_err(|e| ManagerError::StopCommand(e.to_string()))?;
    if !status.success() {
        return Err(ManagerError::StopCommand(format!(
            "exit status {}",
            status.code().unwrap_or(-1)
        )));
    }

    if def.kind == ServiceKind::Background && !wait_for_death(pid, BACKGROUND_STOP_TIMEOUT).await
    {
        let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        return Err(ManagerError::StopTimeout(
            def.name.clone(),
            BACKGROUND_STOP_TIMEOUT,
        ));
    }

    Ok(ServiceState::Stopped)
}

/// Build the start invocation: `/bin/sh -c "exec <start_cmd>"` with stdio
/// wired to the log file (or /dev/null), credentials applied, and the
/// post-fork setup for process group and readiness descriptor installed.
/// Returns the pipe ends (read, write) when a readiness rendezvous is
/// configured; both must stay open until after the spawn.
fn build_start_command(
    def: &ServiceDefinition,
    log_file: Option<&File>,
) -> Result<(Command, Option<(OwnedFd, OwnedFd)>), ManagerError> {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c").arg(format!("exec {}", def.start_cmd));
    cmd.stdin(Stdio::null());

    match log_file {
        Some(file) => {
            let out = file.try_clone().map_err(ManagerError::Log)?;
            let err = file.try_clone().map_err(ManagerError::Log)?;
            cmd.stdout(Stdio::from(out));
            cmd.stderr(Stdio::from(err));
        }
        None => {
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        }
    }

    if def.switches_user() {
        let (uid, gid) = resolve_user(&def.user)?;
        cmd.uid(uid);
        cmd.gid(gid);
    }

    let pipe = if def.wants_readiness() {
        Some(nix::unistd::pipe().map_err(ManagerError::Pipe)?)
    } else {
        None
    };

    let setpgid = def.setpgid;
    let ready_fd = def.ready_fd;
    let pipe_fds = pipe
        .as_ref()
        .map(|(read, write)| (read.as_raw_fd(), write.as_raw_fd()));
    unsafe {
        cmd.pre_exec(move || {
            if setpgid && libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if let Some((read_fd, write_fd)) = pipe_fds {
                // Land the write end at exactly `ready_fd`; the child only
                // ever sees that one descriptor.
                if write_fd != ready_fd {
                    if libc::dup2(write_fd, ready_fd) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    libc::close(write_fd);
                }
                if read_fd != ready_fd {
                    libc::close(read_fd);
                }
            }
            Ok(())
        });
    }

    Ok((cmd, pipe))
}

/// Block (off the runtime) on the readiness pipe until one byte arrives or
/// the deadline passes. SIGCHLD is routine here and poll(2) is not restarted
/// after a signal, so interrupted polls retry against the same deadline.
async fn await_ready_byte(pipe_r: OwnedFd) -> bool {
    tokio::task::spawn_blocking(move || {
        let fd = pipe_r.as_raw_fd();
        let deadline = Instant::now() + READY_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let mut pollfd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };
            let rc =
                unsafe { libc::poll(&mut pollfd, 1, remaining.as_millis() as libc::c_int) };
            if rc == 0 {
                return false;
            }
            if rc < 0 {
                if interrupted() {
                    continue;
                }
                return false;
            }
            let mut byte = 0u8;
            let n =
                unsafe { libc::read(fd, &mut byte as *mut u8 as *mut libc::c_void, 1) };
            if n == 1 {
                return true;
            }
            if n < 0 && interrupted() {
                continue;
            }
            return false;
        }
    })
    .await
    .unwrap_or(false)
}

fn interrupted() -> bool {
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR)
}

fn resolve_user(name: &str) -> Result<(u32, u32), ManagerError> {
    // uid + primary gid only; supplementary groups are not initialised.
    match nix::unistd::User::from_name(name) {
        Ok(Some(user)) => Ok((user.uid.as_raw(), user.gid.as_raw())),
        _ => Err(ManagerError::UnknownUser(name.to_string())),
    }
}

fn process_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// SIGKILL the whole process group of `pid`.
fn kill_group(pid: i32) {
    if pid > 0 {
        let _ = kill(Pid::from_raw(-pid), Signal::SIGKILL);
    }
}

/// Poll the pid with signal 0 until it is gone or the deadline passes.
async fn wait_for_death(pid: i32, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if !process_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(DEATH_PROBE_INTERVAL).await;
    }
}
