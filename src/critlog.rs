//! Fatal-error crash log (spec §7: "A fatal error (corruption, repeated
//! fatal backend failures) writes `mount.s3ql_crit.log`, unmounts, and
//! exits nonzero").
//!
//! A second, target-less writer alongside the `log`/`env_logger` facade
//! every other layer uses: one line per fatal event, appended to a
//! dedicated file rather than stdout/stderr, so an operator can find the
//! reason for an unplanned unmount after the process is gone.

use std::fs::OpenOptions;
use std::io::Write;

pub const CRIT_LOG_FILENAME: &str = "mount.s3ql_crit.log";

/// Appends a timestamped fatal-error line to [`CRIT_LOG_FILENAME`] in the
/// current working directory. Best-effort: failing to write the crit log
/// itself must never block the fatal-shutdown path that called this.
pub fn record_fatal(message: &str) {
    record_fatal_in(std::path::Path::new("."), message)
}

fn record_fatal_in(dir: &std::path::Path, message: &str) {
    log::error!("{message}");
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let line = format!("[{secs}] FATAL: {message}\n");
    if let Ok(mut f) = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(CRIT_LOG_FILENAME))
    {
        let _ = f.write_all(line.as_bytes());
    }
}

/// Records the fatal error, unmounts the currently mounted filesystem (if
/// any — set by `main.rs` at mount time), and exits the process nonzero
/// (spec §7).
pub fn fatal_shutdown(message: &str, exit_code: i32) -> ! {
    record_fatal(message);
    if let Some(mountpoint) = crate::MOUNT_POINT.get() {
        let mut cmd = std::process::Command::new("fusermount");
        cmd.arg("-u").arg(mountpoint);
        let _ = cmd.status();
    }
    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_fatal_appends_to_the_crit_log() {
        let dir = tempfile::tempdir().unwrap();
        record_fatal_in(dir.path(), "test corruption");
        let contents = std::fs::read_to_string(dir.path().join(CRIT_LOG_FILENAME)).unwrap();
        assert!(contents.contains("test corruption"));
    }
}
