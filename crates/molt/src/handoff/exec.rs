//! Starting a successor and re-executing the current binary, with the
//! listener passed through at fd 3.

use std::convert::Infallible;
use std::ffi::{CString, OsString};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tracing::info;

use super::inherit::LISTEN_FDS_START;
use super::{PREDECESSOR_PID_ENV, SUCCESSOR_PID_ENV};
use crate::error::{Error, Result};

/// Start a second copy of the current binary, with the same arguments,
/// serving on the listener at `listener_fd`.
///
/// The child learns our pid through `MOLT_PREDECESSOR_PID` so it can
/// report readiness. `LISTEN_PID` is left unset because the child's pid is
/// not known before it exists.
pub(crate) fn spawn_successor(listener_fd: RawFd) -> Result<Child> {
    let exe = std::env::current_exe().map_err(Error::Exec)?;
    let args: Vec<OsString> = std::env::args_os().skip(1).collect();
    info!(exe = %exe.display(), fd = listener_fd, "Starting successor");
    successor_command(&exe, args, listener_fd)
        .spawn()
        .map_err(Error::Exec)
}

fn successor_command(exe: &Path, args: Vec<OsString>, listener_fd: RawFd) -> Command {
    let mut command = Command::new(exe);
    command
        .args(args)
        .env("LISTEN_FDS", "1")
        .env_remove("LISTEN_PID")
        .env_remove(SUCCESSOR_PID_ENV)
        .env(PREDECESSOR_PID_ENV, std::process::id().to_string());

    // SAFETY: runs in the forked child before exec and only calls dup2 and
    // fcntl, which are async-signal-safe.
    unsafe {
        command.pre_exec(move || {
            if listener_fd != LISTEN_FDS_START && libc::dup2(listener_fd, LISTEN_FDS_START) < 0 {
                return Err(io::Error::last_os_error());
            }
            clear_cloexec(LISTEN_FDS_START)
        });
    }
    command
}

/// Replace the current process with a fresh copy of its binary, handing
/// `listener` over at fd 3.
///
/// The pid is unchanged, so `LISTEN_PID` is set to our own pid. `extra_env`
/// is added to the new image's environment. On success this never returns.
pub fn re_exec(listener: TcpListener, extra_env: &[(&str, &str)]) -> Result<Infallible> {
    let exe = std::env::current_exe().map_err(Error::Exec)?;
    let std_listener = listener.into_std().map_err(Error::Exec)?;
    let source = std_listener.as_raw_fd();

    info!(exe = %exe.display(), fd = source, "Preparing re-exec");

    if source != LISTEN_FDS_START {
        // dup2 onto fd 3; the copy does not carry FD_CLOEXEC.
        let rc = unsafe { libc::dup2(source, LISTEN_FDS_START) };
        if rc < 0 {
            return Err(Error::Exec(io::Error::last_os_error()));
        }
    }
    clear_cloexec(LISTEN_FDS_START).map_err(Error::Exec)?;

    // The original fd (if different) keeps CLOEXEC and is closed by exec.
    std::mem::forget(std_listener);

    let args: Vec<String> = std::env::args().collect();
    let pid = std::process::id().to_string();
    let mut env = vec![("LISTEN_FDS", "1"), ("LISTEN_PID", pid.as_str())];
    env.extend_from_slice(extra_env);
    Err(Error::Exec(exec_with_env(&exe, &args, &env)))
}

fn clear_cloexec(fd: i32) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn to_cstring(s: &str, what: &str) -> io::Result<CString> {
    CString::new(s).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{what} contains a NUL byte"),
        )
    })
}

/// Execute a new process image with extra environment variables.
///
/// Builds the environment explicitly for execve rather than mutating our
/// own, which is unsound with other threads running. Only returns on error.
fn exec_with_env(exe: &Path, args: &[String], extra_env: &[(&str, &str)]) -> io::Error {
    match build_exec(exe, args, extra_env) {
        Ok((c_exe, c_args, c_env)) => {
            let arg_ptrs: Vec<*const libc::c_char> = c_args
                .iter()
                .map(|a| a.as_ptr())
                .chain(std::iter::once(std::ptr::null()))
                .collect();
            let env_ptrs: Vec<*const libc::c_char> = c_env
                .iter()
                .map(|e| e.as_ptr())
                .chain(std::iter::once(std::ptr::null()))
                .collect();

            info!(exe = %exe.display(), "Executing new process image");
            unsafe {
                libc::execve(c_exe.as_ptr(), arg_ptrs.as_ptr(), env_ptrs.as_ptr());
            }
            io::Error::last_os_error()
        }
        Err(e) => e,
    }
}

type ExecParts = (CString, Vec<CString>, Vec<CString>);

fn build_exec(exe: &Path, args: &[String], extra_env: &[(&str, &str)]) -> io::Result<ExecParts> {
    let c_exe = to_cstring(&exe.to_string_lossy(), "executable path")?;

    let c_args = args
        .iter()
        .map(|a| to_cstring(a, "argument"))
        .collect::<io::Result<Vec<_>>>()?;

    let mut env: std::collections::BTreeMap<String, String> = std::env::vars().collect();
    for (k, v) in extra_env {
        env.insert(k.to_string(), v.to_string());
    }
    let c_env = env
        .iter()
        .map(|(k, v)| to_cstring(&format!("{k}={v}"), "environment variable"))
        .collect::<io::Result<Vec<_>>>()?;

    Ok((c_exe, c_args, c_env))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    #[test]
    fn test_clear_cloexec() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);

        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);

        clear_cloexec(fd).unwrap();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_eq!(flags & libc::FD_CLOEXEC, 0);

        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_clear_cloexec_on_bad_fd_fails() {
        assert!(clear_cloexec(-1).is_err());
    }

    #[test]
    fn test_build_exec_adds_listen_env() {
        let args = vec!["server".to_string(), "--flag".to_string()];
        let (exe, c_args, env) = build_exec(
            Path::new("/usr/bin/server"),
            &args,
            &[("LISTEN_FDS", "1"), ("LISTEN_PID", "42")],
        )
        .unwrap();

        assert_eq!(exe.to_str().unwrap(), "/usr/bin/server");
        assert_eq!(c_args.len(), 2);
        let env: Vec<&str> = env.iter().map(|e| e.to_str().unwrap()).collect();
        assert!(env.contains(&"LISTEN_FDS=1"));
        assert!(env.contains(&"LISTEN_PID=42"));
    }

    #[test]
    fn test_build_exec_rejects_nul_bytes() {
        let args = vec!["bad\0arg".to_string()];
        let err = build_exec(Path::new("/bin/true"), &args, &[]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_successor_env_names_us_as_predecessor() {
        let command = successor_command(Path::new("/bin/true"), vec!["--flag".into()], 7);
        let envs: Vec<_> = command.as_std().get_envs().collect();
        let pid = std::process::id().to_string();
        let os = OsStr::new;

        assert!(envs.contains(&(os("LISTEN_FDS"), Some(os("1")))));
        assert!(envs.contains(&(os(PREDECESSOR_PID_ENV), Some(os(pid.as_str())))));
        assert!(envs.contains(&(os("LISTEN_PID"), None)));
        assert!(envs.contains(&(os(SUCCESSOR_PID_ENV), None)));

        let args: Vec<_> = command.as_std().get_args().collect();
        assert_eq!(args, [os("--flag")]);
    }

    #[tokio::test]
    async fn test_successor_receives_listener_at_fd_3() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let check = r#"test -S /dev/fd/3 && test "$LISTEN_FDS" = 1 && test -z "$LISTEN_PID""#;

        let mut command = successor_command(
            Path::new("/bin/sh"),
            vec!["-c".into(), check.into()],
            listener.as_raw_fd(),
        );
        let status = command.status().await.unwrap();
        assert!(status.success(), "child saw no listener at fd 3: {status}");
    }
}
