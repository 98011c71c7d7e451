use std::time::Duration;

use tokio::process::{Child, Command};

const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Puts the script in its own session so every helper it forks can be signalled together.
#[cfg(unix)]
pub(crate) fn apply_process_group(cmd: &mut Command) {
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
pub(crate) fn apply_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn signal_group(child: &Child, signal: libc::c_int) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as i32), signal);
        }
    }
}

#[cfg(unix)]
fn request_stop(child: &Child) {
    signal_group(child, libc::SIGTERM);
}

#[cfg(not(unix))]
fn request_stop(_child: &Child) {}

#[cfg(unix)]
fn force_stop(child: &Child) {
    signal_group(child, libc::SIGKILL);
}

#[cfg(not(unix))]
fn force_stop(_child: &Child) {}

/// SIGTERM the process group, then SIGKILL whatever is left after the grace period.
pub(crate) async fn terminate_child(child: &mut Child) -> Option<std::process::ExitStatus> {
    request_stop(child);
    if let Ok(status) = tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        return status.ok();
    }
    force_stop(child);
    let _ = child.kill().await;
    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(status) => status.ok(),
        Err(_) => None,
    }
}
