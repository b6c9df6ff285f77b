// src/logging.rs
//
// Timestamped logging for the pipeline. `tlog!` writes to stderr and, when
// enabled, mirrors every line into a per-run log file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Global log file handle. When `Some`, `tlog!` writes to this file as well.
pub static LOG_FILE: Mutex<Option<std::fs::File>> = Mutex::new(None);

/// When false, `tlog!` skips stderr (a terminal UI owns the screen).
pub static CONSOLE_LOGGING: AtomicBool = AtomicBool::new(true);

const LOG_LINK_NAME: &str = "uartscope.log";

/// Enable or disable stderr output for `tlog!`. File logging is unaffected.
pub fn set_console_logging(enabled: bool) {
    CONSOLE_LOGGING.store(enabled, Ordering::Relaxed);
}

/// Format a log line with the local `HH:MM:SS.mmm` prefix.
pub fn stamp(message: std::fmt::Arguments<'_>) -> String {
    format!("{} {}", chrono::Local::now().format("%H:%M:%S%.3f"), message)
}

/// Start file logging into `log_dir`.
/// Creates a timestamped log file and a `uartscope.log` symlink (Unix only).
/// Returns the path of the new log file.
pub fn init_file_logging(log_dir: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(log_dir)?;

    let filename = chrono::Local::now()
        .format("%Y%m%d-%H%M%S-uartscope.log")
        .to_string();
    let log_path = log_dir.join(&filename);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    #[cfg(unix)]
    {
        let symlink_path = log_dir.join(LOG_LINK_NAME);
        let _ = std::fs::remove_file(&symlink_path);
        if let Err(e) = std::os::unix::fs::symlink(&filename, &symlink_path) {
            eprintln!(
                "{}",
                stamp(format_args!("[logging] Failed to create {} symlink: {}", LOG_LINK_NAME, e))
            );
        }
    }

    if let Ok(mut guard) = LOG_FILE.lock() {
        *guard = Some(file);
    }

    // tlog! would lock LOG_FILE again, so write the banner directly
    if CONSOLE_LOGGING.load(Ordering::Relaxed) {
        eprintln!(
            "{}",
            stamp(format_args!("[logging] File logging started: {}", log_path.display()))
        );
    }

    Ok(log_path)
}

/// Stop file logging and close the log file.
pub fn stop_file_logging() {
    if let Ok(mut guard) = LOG_FILE.lock() {
        if guard.take().is_some() && CONSOLE_LOGGING.load(Ordering::Relaxed) {
            eprintln!("{}", stamp(format_args!("[logging] File logging stopped")));
        }
    }
}

/// Timestamped logging macro.
/// Prepends `HH:MM:SS.mmm` local time to every message written to stderr.
/// Also writes to the log file when file logging is enabled.
#[macro_export]
macro_rules! tlog {
    ($($arg:tt)*) => {{
        use std::io::Write as _;
        let msg = $crate::logging::stamp(format_args!($($arg)*));
        if $crate::logging::CONSOLE_LOGGING.load(std::sync::atomic::Ordering::Relaxed) {
            eprintln!("{}", msg);
        }
        if let Ok(mut guard) = $crate::logging::LOG_FILE.lock() {
            if let Some(ref mut f) = *guard {
                let _ = writeln!(f, "{}", msg);
            }
        }
    }};
}
