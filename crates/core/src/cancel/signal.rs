//! Process-group signalling.
//!
//! Every subprocess is started as the leader of a new session, so its pid is
//! also its process-group id. Signalling the group reaches the grandchildren
//! that wrapper scripts fan out into.

use std::io;

/// Signal sent to a process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Polite shutdown request (SIGTERM).
    Terminate,
    /// Forced kill (SIGKILL).
    Kill,
}

fn sanitize_pgid(pgid: u32) -> io::Result<i32> {
    // 0 addresses our own group and 1 is init; neither is ever a child group.
    match i32::try_from(pgid) {
        Ok(id) if id > 1 => Ok(id),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal process group {pgid}"),
        )),
    }
}

/// Send `signal` to every process in the group.
///
/// Returns `Ok(false)` when the group no longer exists.
#[cfg(unix)]
pub fn signal_group(pgid: u32, signal: Signal) -> io::Result<bool> {
    let id = sanitize_pgid(pgid)?;
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };

    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(id, sig) };
    if rc == 0 {
        return Ok(true);
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
pub fn signal_group(pgid: u32, _signal: Signal) -> io::Result<bool> {
    // Without process groups the runner falls back to killing the direct child.
    sanitize_pgid(pgid)?;
    Ok(false)
}

/// Whether any process of the group is still alive.
#[cfg(unix)]
pub fn group_alive(pgid: u32) -> bool {
    let Ok(id) = sanitize_pgid(pgid) else {
        return false;
    };

    // SAFETY: signal 0 only performs the existence and permission check.
    let rc = unsafe { libc::killpg(id, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn group_alive(_pgid: u32) -> bool {
    false
}
