//! Adopting a listener passed down by a predecessor process.
//!
//! Follows the socket-activation convention: `LISTEN_FDS` says how many fds
//! start at fd 3, `LISTEN_PID` (when present) names the intended process.

use std::os::unix::io::FromRawFd;

use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// First inherited fd.
pub(crate) const LISTEN_FDS_START: i32 = 3;

/// Take over the listener inherited from the predecessor, if any.
///
/// Returns `Ok(None)` on a cold start (`LISTEN_FDS` absent or `0`) or when
/// `LISTEN_PID` names another process. Environment claims that do not hold
/// up (wrong count, fd 3 not a socket) are errors: a half-inherited state
/// is a bug in the predecessor.
pub fn inherit_listener() -> Result<Option<TcpListener>> {
    let Some(raw) = std::env::var("LISTEN_FDS").ok() else {
        return Ok(None);
    };

    if let Ok(pid) = std::env::var("LISTEN_PID") {
        if pid.trim() != std::process::id().to_string() {
            debug!(listen_pid = %pid, "LISTEN_PID names another process, not inheriting");
            return Ok(None);
        }
    }

    let count: usize = raw
        .trim()
        .parse()
        .map_err(|_| Error::Inherit(format!("LISTEN_FDS={raw:?} is not a number")))?;
    if count == 0 {
        return Ok(None);
    }
    if count != 1 {
        return Err(Error::Inherit(format!(
            "expected exactly one inherited listener, LISTEN_FDS says {count}"
        )));
    }

    let fd = LISTEN_FDS_START;
    if !is_socket(fd) {
        return Err(Error::Inherit(format!("fd {fd} is not a valid socket")));
    }

    // SAFETY: fd 3 was validated as a socket and ownership passes to us.
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    std_listener.set_nonblocking(true)?;
    let listener = TcpListener::from_std(std_listener)?;

    // Children must not re-inherit stale values.
    std::env::remove_var("LISTEN_FDS");
    std::env::remove_var("LISTEN_PID");

    info!(fd, addr = ?listener.local_addr().ok(), "Inherited listener from predecessor");
    Ok(Some(listener))
}

/// Whether `fd` refers to an open socket.
pub(crate) fn is_socket(fd: i32) -> bool {
    // SAFETY: fstat only writes into the zeroed stat buffer we own.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::fstat(fd, &mut stat) };
    if result != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}
