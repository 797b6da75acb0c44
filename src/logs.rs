//! Rotating log sink
//!
//! The manager and every service with `log_output` write to
//! `<log root>/<target>.log`. Opening a target's log moves any previous file
//! into the `old/` sibling directory (one level of rotation) and stamps a
//! session header so consecutive boots are easy to tell apart. The manager's
//! own log additionally tees to stderr.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Default log root used by the daemon.
pub const LOG_ROOT: &str = "/var/log/rund";

/// Target name of the manager's own log file.
pub const MANAGER_TARGET: &str = "rund";

/// Open (rotating) the log file for `target` under `root`.
pub fn open_target_log(root: &Path, target: &str) -> io::Result<File> {
    let old_dir = root.join("old");
    fs::create_dir_all(root)?;
    fs::create_dir_all(&old_dir)?;

    let log_path = root.join(format!("{}.log", target));
    if log_path.exists() {
        let _ = fs::rename(&log_path, old_dir.join(format!("{}.log", target)));
    }

    let mut file = OpenOptions::new().create(true).append(true).open(&log_path)?;
    writeln!(
        file,
        "------ {} ------",
        chrono::Local::now().format("%a %b %e %H:%M:%S %Y")
    )?;
    Ok(file)
}

/// Writer that duplicates everything to a file and stderr.
pub struct TeeWriter {
    file: File,
}

impl TeeWriter {
    pub fn new(file: File) -> Self {
        Self { file }
    }
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write_all(buf)?;
        io::stderr().write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        io::stderr().flush()
    }
}

/// Set up the daemon logger: file + stderr tee when the log root is usable,
/// plain stderr otherwise.
pub fn init_daemon_logging() {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));

    match open_target_log(Path::new(LOG_ROOT), MANAGER_TARGET) {
        Ok(file) => {
            builder.target(env_logger::Target::Pipe(Box::new(TeeWriter::new(file))));
        }
        Err(e) => {
            eprintln!("rund: could not set up log file, logging to stderr only: {}", e);
        }
    }

    builder.init();
}
