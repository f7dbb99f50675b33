//! Keep a companion application running.

use std::io;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;
use tracing::info;

/// The kernel truncates `comm` to this many bytes
const COMM_LEN: usize = 15;

/// Process name a command line shows up as in `/proc/<pid>/comm`
fn process_name(command: &str) -> Option<String> {
    let program = command.split_whitespace().next()?;
    let base = Path::new(program).file_name()?.to_string_lossy();
    Some(base.chars().take(COMM_LEN).collect())
}

/// Whether any process under `proc_root` runs `command`
pub fn is_running(proc_root: &Path, command: &str) -> io::Result<bool> {
    let Some(name) = process_name(command) else {
        return Ok(false);
    };

    for entry in std::fs::read_dir(proc_root)? {
        let entry = entry?;
        let is_pid = entry
            .file_name()
            .to_str()
            .is_some_and(|s| s.bytes().all(|b| b.is_ascii_digit()));
        if !is_pid {
            continue;
        }

        // Processes can exit between listing and reading
        if let Ok(comm) = std::fs::read_to_string(entry.path().join("comm")) {
            if comm.trim_end() == name {
                return Ok(true);
            }
        }
    }

    Ok(false)
}

/// Spawn `command` detached from the daemon
pub fn launch(command: &str) -> io::Result<()> {
    let mut parts = command.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;

    let child = Command::new(program)
        .args(parts)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()?;

    info!("Launched {} (pid {:?})", command, child.id());
    Ok(())
}

/// Relaunch `command` if it is not running. Returns whether a launch happened.
pub fn ensure_running(proc_root: &Path, command: &str) -> io::Result<bool> {
    if command.trim().is_empty() {
        return Ok(false);
    }

    if is_running(proc_root, command)? {
        debug!("Watchdog target {} is running", command);
        return Ok(false);
    }

    info!("Watchdog target {} not running, relaunching", command);
    launch(command)?;
    Ok(true)
}
