//! Integration tests for the per-service supervisor
//!
//! These spawn real /bin/sh children and watch the state machine settle.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rund::manager::Manager;
use rund::services::ServiceState;
use rund::SharedManager;
use tokio::time::{sleep, Instant};

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

fn unique_test_dir() -> PathBuf {
    let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = PathBuf::from(format!("/tmp/rund-sup-{}-{}", std::process::id(), id));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(dir.join("services")).unwrap();
    dir
}

fn write_service(dir: &Path, file: &str, content: &str) -> PathBuf {
    let path = dir.join("services").join(file);
    fs::write(&path, content).unwrap();
    path
}

fn shared_manager(dir: &Path) -> SharedManager {
    let mut manager = Manager::new(dir.join("runtime"), dir.to_path_buf());
    manager.set_log_root(dir.join("log"));
    manager.into_shared()
}

async fn load(manager: &SharedManager, path: &Path) {
    manager.write().await.load_definition(path).unwrap();
}

async fn state_of(manager: &SharedManager, name: &str) -> ServiceState {
    let manager = manager.read().await;
    manager
        .registry()
        .by_name(name)
        .map(|r| r.state)
        .unwrap_or(ServiceState::Unknown)
}

async fn pid_of(manager: &SharedManager, name: &str) -> i32 {
    let manager = manager.read().await;
    manager
        .registry()
        .by_name(name)
        .map(|r| r.process_id)
        .unwrap_or(0)
}

async fn wait_for_state(
    manager: &SharedManager,
    name: &str,
    state: ServiceState,
    limit: Duration,
) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if state_of(manager, name).await == state {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

fn process_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

#[tokio::test]
async fn test_simple_service_completes() {
    let dir = unique_test_dir();
    let path = write_service(
        &dir,
        "one.rsv",
        "name: one\ntype: simple\nstart_cmd: \"true\"\nlog_output: false\n",
    );
    let manager = shared_manager(&dir);
    load(&manager, &path).await;

    Manager::start_service(&manager, "one").await.unwrap();

    assert!(wait_for_state(&manager, "one", ServiceState::Completed, Duration::from_secs(5)).await);
    assert_eq!(pid_of(&manager, "one").await, 0);
    assert_eq!(
        manager.read().await.registry().by_name("one").unwrap().restart_count,
        0
    );
}

#[tokio::test]
async fn test_background_crash_hits_restart_cap() {
    let dir = unique_test_dir();
    let path = write_service(
        &dir,
        "two.rsv",
        "name: two\ntype: background\nstart_cmd: \"sh -c 'exit 1'\"\nrestart: true\nlog_output: false\n",
    );
    let manager = shared_manager(&dir);
    load(&manager, &path).await;

    Manager::start_service(&manager, "two").await.unwrap();

    // The restart chain is quick: wait for it to exhaust the cap.
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        {
            let m = manager.read().await;
            let record = m.registry().by_name("two").unwrap();
            if record.restart_count == 5
                && record.state == ServiceState::Crashed
                && record.process_id == 0
            {
                break;
            }
        }
        assert!(Instant::now() < deadline, "restart cap never reached");
        sleep(Duration::from_millis(50)).await;
    }

    // No sixth restart fires.
    sleep(Duration::from_millis(500)).await;
    let m = manager.read().await;
    let record = m.registry().by_name("two").unwrap();
    assert_eq!(record.restart_count, 5);
    assert_eq!(record.state, ServiceState::Crashed);
    assert_eq!(record.process_id, 0);
}

#[tokio::test]
async fn test_graceful_stop_via_term() {
    let dir = unique_test_dir();
    let path = write_service(
        &dir,
        "three.rsv",
        "name: three\ntype: background\nstart_cmd: \"sh -c 'trap \\\"exit 0\\\" TERM; sleep 60 & wait'\"\nlog_output: false\n",
    );
    let manager = shared_manager(&dir);
    load(&manager, &path).await;

    Manager::start_service(&manager, "three").await.unwrap();
    assert_eq!(state_of(&manager, "three").await, ServiceState::Running);
    let pid = pid_of(&manager, "three").await;
    assert_ne!(pid, 0);
    assert!(process_alive(pid));

    let started = Instant::now();
    Manager::stop_service(&manager, "three").await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(state_of(&manager, "three").await, ServiceState::Stopped);
    assert_eq!(pid_of(&manager, "three").await, 0);
    assert!(!process_alive(pid));
}

#[tokio::test]
async fn test_stop_cmd_that_leaves_background_alive_escalates() {
    let dir = unique_test_dir();
    let path = write_service(
        &dir,
        "four.rsv",
        "name: four\ntype: background\nstart_cmd: sleep 30\nstop_cmd: \"true\"\nlog_output: false\n",
    );
    let manager = shared_manager(&dir);
    load(&manager, &path).await;

    Manager::start_service(&manager, "four").await.unwrap();
    let pid = pid_of(&manager, "four").await;
    assert!(process_alive(pid));

    // The stop_cmd succeeds but never kills the child, so the 15 second
    // background follow-up expires and escalates to SIGKILL.
    let result = Manager::stop_service(&manager, "four").await;
    assert!(result.is_err());

    assert_eq!(state_of(&manager, "four").await, ServiceState::Crashed);
    assert_eq!(pid_of(&manager, "four").await, 0);
    assert!(!process_alive(pid));
}

#[tokio::test]
async fn test_readiness_byte_marks_running() {
    let dir = unique_test_dir();
    let path = write_service(
        &dir,
        "ready.rsv",
        "name: ready\ntype: background\nstart_cmd: \"sh -c 'echo >&3; exec sleep 60'\"\nready_fd: 3\nlog_output: false\n",
    );
    let manager = shared_manager(&dir);
    load(&manager, &path).await;

    Manager::start_service(&manager, "ready").await.unwrap();

    assert_eq!(state_of(&manager, "ready").await, ServiceState::Running);
    let pid = pid_of(&manager, "ready").await;
    assert!(process_alive(pid));

    Manager::stop_service(&manager, "ready").await.unwrap();
    assert!(!process_alive(pid));
}

#[tokio::test]
async fn test_readiness_timeout_crashes_service() {
    let dir = unique_test_dir();
    let path = write_service(
        &dir,
        "five.rsv",
        "name: five\ntype: background\nstart_cmd: sleep 60\nready_fd: 3\nlog_output: false\n",
    );
    let manager = shared_manager(&dir);
    load(&manager, &path).await;

    let started = Instant::now();
    let result = Manager::start_service(&manager, "five").await;
    assert!(result.is_err());
    assert!(started.elapsed() >= Duration::from_secs(10));

    let m = manager.read().await;
    let record = m.registry().by_name("five").unwrap();
    assert_eq!(record.state, ServiceState::Crashed);
    assert_eq!(record.process_id, 0);
}

#[tokio::test]
async fn test_start_is_noop_while_running() {
    let dir = unique_test_dir();
    let path = write_service(
        &dir,
        "idem.rsv",
        "name: idem\ntype: background\nstart_cmd: sleep 60\nlog_output: false\n",
    );
    let manager = shared_manager(&dir);
    load(&manager, &path).await;

    Manager::start_service(&manager, "idem").await.unwrap();
    let pid = pid_of(&manager, "idem").await;

    // Second start must not spawn a second child.
    Manager::start_service(&manager, "idem").await.unwrap();
    assert_eq!(pid_of(&manager, "idem").await, pid);

    Manager::stop_service(&manager, "idem").await.unwrap();
}

#[tokio::test]
async fn test_crash_on_safe_exit_false_classifies_stopped() {
    let dir = unique_test_dir();
    let path = write_service(
        &dir,
        "soft.rsv",
        "name: soft\ntype: background\nstart_cmd: \"sh -c 'exit 1'\"\ncrash_on_safe_exit: false\nlog_output: false\n",
    );
    let manager = shared_manager(&dir);
    load(&manager, &path).await;

    Manager::start_service(&manager, "soft").await.unwrap();
    assert!(wait_for_state(&manager, "soft", ServiceState::Stopped, Duration::from_secs(5)).await);
    assert_eq!(pid_of(&manager, "soft").await, 0);
}

#[tokio::test]
async fn test_restart_resolves_fresh_record() {
    let dir = unique_test_dir();
    let path = write_service(
        &dir,
        "cycle.rsv",
        "name: cycle\ntype: background\nstart_cmd: sleep 60\nlog_output: false\n",
    );
    let manager = shared_manager(&dir);
    load(&manager, &path).await;

    Manager::start_service(&manager, "cycle").await.unwrap();
    let first_pid = pid_of(&manager, "cycle").await;

    Manager::restart_service(&manager, "cycle").await.unwrap();
    let second_pid = pid_of(&manager, "cycle").await;

    assert_eq!(state_of(&manager, "cycle").await, ServiceState::Running);
    assert_ne!(second_pid, 0);
    assert_ne!(first_pid, second_pid);
    assert!(!process_alive(first_pid));

    Manager::stop_service(&manager, "cycle").await.unwrap();
}

#[tokio::test]
async fn test_service_log_captures_output() {
    let dir = unique_test_dir();
    let path = write_service(
        &dir,
        "noisy.rsv",
        "name: noisy\ntype: simple\nstart_cmd: echo hello-from-noisy\n",
    );
    let manager = shared_manager(&dir);
    load(&manager, &path).await;

    Manager::start_service(&manager, "noisy").await.unwrap();
    assert!(wait_for_state(&manager, "noisy", ServiceState::Completed, Duration::from_secs(5)).await);

    let contents = fs::read_to_string(dir.join("log").join("noisy.log")).unwrap();
    assert!(contents.starts_with("------ "), "session header present");
    assert!(contents.contains("hello-from-noisy"));
}
