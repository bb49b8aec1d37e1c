//! Process re-execution with file descriptor passing.
//!
//! Clears CLOEXEC on the listening sockets, sets LISTEN_FDS/LISTEN_FD_NAMES,
//! then either execs the binary in place ([`restart`]) or starts it as a child
//! next to this process ([`spawn_successor`]).

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::ffi::{CString, OsStr, OsString};
use std::io;
use std::net::TcpListener;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};

use tracing::{debug, info};

use crate::error::HandoffError;
use crate::inherit::{FIRST_INHERITED_FD, LISTEN_FDS, LISTEN_FD_NAMES};

pub(crate) const PREDECESSOR_PID: &str = "MOULT_PREDECESSOR_PID";

/// Temporary fds live at or above this so they never collide with 3..N.
const TEMP_FD_BASE: RawFd = 100;

/// Suffix Linux appends to `/proc/self/exe` once the running binary is unlinked.
const DELETED_SUFFIX: &[u8] = b" (deleted)";

/// Replace the current process image, passing the given listeners through.
///
/// 1. Dups each listener to a temporary high fd (safe against clobber)
/// 2. Dups each temporary fd to the contiguous range fd 3..N
/// 3. Clears CLOEXEC on each target fd
/// 4. Execs the binary this process was started as, with the current arguments
///    and environment plus `LISTEN_FDS`, `LISTEN_FD_NAMES` and
///    `MOULT_PREDECESSOR_PID`
///
/// Does not return on success. On failure the error is returned, but whatever
/// previously occupied fds 3..N has been replaced, so the caller must not try to
/// keep serving; exit and let the supervisor restart the process.
pub fn restart(listeners: &[(&str, &TcpListener)]) -> Result<Infallible, HandoffError> {
    let exe = successor_exe()?;
    info!(exe = %exe.display(), listener_count = listeners.len(), "Preparing restart");

    // Phase 1: dup all source fds to high fds first. If a source fd is at 4 and
    // we need to dup another to 4, we'd destroy it.
    let temp_fds = dup_all_high(listeners)?;

    // Phase 2: dup2 from temp fds to target range 3..N and clear CLOEXEC there.
    let mut target_fds: Vec<RawFd> = Vec::with_capacity(temp_fds.len());
    for (temp_fd, target_fd) in placements(&temp_fds) {
        let placed = dup_to(temp_fd, target_fd).and_then(|()| clear_cloexec(target_fd));
        if let Err(e) = placed {
            close_all(&temp_fds);
            return Err(HandoffError::Prepare(e));
        }
        target_fds.push(target_fd);
    }

    // Temp fds carry CLOEXEC so exec would close them, but be explicit.
    close_all(&temp_fds);

    let names = listener_names(listeners);
    info!(
        fds = ?target_fds,
        names = ?names,
        exe = %exe.display(),
        "Executing replacement process"
    );

    let args: Vec<OsString> = std::env::args_os().collect();
    let fd_count = listeners.len().to_string();
    let fd_names = names.join(":");
    let pid = std::process::id().to_string();
    exec_with_env(
        &exe,
        &args,
        &[
            (LISTEN_FDS, fd_count.as_str()),
            (LISTEN_FD_NAMES, fd_names.as_str()),
            (PREDECESSOR_PID, pid.as_str()),
        ],
    )
}

/// Start the binary this process was started as, as a child that inherits the
/// given listeners at fds 3..N. This process keeps its own copies and keeps
/// serving; the child names it in `MOULT_PREDECESSOR_PID` so it can signal the
/// takeover.
///
/// Returns once the child has exec'd. The caller owns the [`Child`] and should
/// reap it.
pub fn spawn_successor(listeners: &[(&str, &TcpListener)]) -> Result<Child, HandoffError> {
    let exe = successor_exe()?;
    info!(exe = %exe.display(), listener_count = listeners.len(), "Spawning successor");

    let temp_fds = dup_all_high(listeners)?;
    let moves: Vec<(RawFd, RawFd)> = placements(&temp_fds).collect();

    let mut args = std::env::args_os();
    let arg0 = args.next().unwrap_or_else(|| exe.clone().into_os_string());
    let names = listener_names(listeners);

    let mut command = Command::new(&exe);
    command
        .arg0(arg0)
        .args(args)
        .env(LISTEN_FDS, listeners.len().to_string())
        .env(LISTEN_FD_NAMES, names.join(":"))
        .env(PREDECESSOR_PID, std::process::id().to_string());

    // SAFETY: the hook runs between fork and exec and only calls dup2 and fcntl,
    // both async-signal-safe. It does not allocate. The temp fds are >= 100 and
    // the targets are 3..N, so no move overwrites a source that is still needed.
    // std's exec-error pipe may sit inside 3..N and get replaced; a failed exec
    // then surfaces as a successor that never signals, and this process keeps
    // serving.
    unsafe {
        command.pre_exec(move || {
            for &(temp_fd, target_fd) in &moves {
                dup_to(temp_fd, target_fd)?;
                clear_cloexec(target_fd)?;
            }
            Ok(())
        });
    }

    let spawned = command.spawn();
    close_all(&temp_fds);

    let child = spawned.map_err(|source| HandoffError::Exec {
        exe: exe.clone(),
        source,
    })?;
    info!(pid = child.id(), names = ?names, exe = %exe.display(), "Successor started");
    Ok(child)
}

/// Path of the binary to start as the successor.
///
/// Resolved from `argv[0]` the way the shell resolved it at startup, so a new
/// binary installed over the original path is what runs. `current_exe` names
/// the inode this process runs from, which a rename-over deploy has unlinked;
/// it is only the fallback, with the `" (deleted)"` marker removed.
fn successor_exe() -> Result<PathBuf, HandoffError> {
    let path_var = std::env::var_os("PATH");
    if let Some(exe) = std::env::args_os()
        .next()
        .and_then(|argv0| resolve_program(&argv0, path_var.as_deref()))
    {
        return Ok(exe);
    }

    let exe = std::env::current_exe().map_err(HandoffError::Prepare)?;
    Ok(strip_deleted_suffix(exe))
}

/// Resolve a program name like `execvp` does: names containing a slash are
/// paths, bare names are looked up in `path_var`.
fn resolve_program(program: &OsStr, path_var: Option<&OsStr>) -> Option<PathBuf> {
    if program.is_empty() {
        return None;
    }

    let program = Path::new(program);
    if program.as_os_str().as_bytes().contains(&b'/') {
        return is_executable(program).then(|| program.to_path_buf());
    }

    std::env::split_paths(path_var?)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn strip_deleted_suffix(exe: PathBuf) -> PathBuf {
    match exe.as_os_str().as_bytes().strip_suffix(DELETED_SUFFIX) {
        Some(stripped) => PathBuf::from(OsStr::from_bytes(stripped)),
        None => exe,
    }
}

fn listener_names<'a>(listeners: &[(&'a str, &TcpListener)]) -> Vec<&'a str> {
    listeners.iter().map(|(name, _)| *name).collect()
}

/// Dup every listener to a high CLOEXEC fd. On error nothing is leaked.
fn dup_all_high(listeners: &[(&str, &TcpListener)]) -> Result<Vec<RawFd>, HandoffError> {
    let mut temp_fds: Vec<RawFd> = Vec::with_capacity(listeners.len());
    for (name, listener) in listeners {
        match dup_high(listener.as_raw_fd()) {
            Ok(fd) => temp_fds.push(fd),
            Err(e) => {
                close_all(&temp_fds);
                return Err(HandoffError::Prepare(io::Error::new(
                    e.kind(),
                    format!("failed to dup listener '{name}': {e}"),
                )));
            }
        }
    }
    Ok(temp_fds)
}

/// Pair each temp fd with its slot in 3..N.
fn placements(temp_fds: &[RawFd]) -> impl Iterator<Item = (RawFd, RawFd)> + '_ {
    temp_fds
        .iter()
        .enumerate()
        .map(|(offset, temp_fd)| (*temp_fd, FIRST_INHERITED_FD + offset as RawFd))
}

/// Duplicate `fd` to a free descriptor >= [`TEMP_FD_BASE`] with CLOEXEC set.
fn dup_high(fd: RawFd) -> io::Result<RawFd> {
    // SAFETY: fcntl F_DUPFD_CLOEXEC has no memory-safety preconditions.
    let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, TEMP_FD_BASE) };
    if dup < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(dup)
}

fn dup_to(source: RawFd, target: RawFd) -> io::Result<()> {
    // SAFETY: dup2 has no memory-safety preconditions.
    if unsafe { libc::dup2(source, target) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Clear CLOEXEC so the fd survives exec.
fn clear_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: F_GETFD / F_SETFD have no memory-safety preconditions.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn close_all(fds: &[RawFd]) {
    for fd in fds {
        // SAFETY: every fd here was created by dup_high and is owned by us.
        unsafe { libc::close(*fd) };
    }
}

/// Current environment with `extra_env` added, overriding existing keys.
fn merged_env(extra_env: &[(&str, &str)]) -> BTreeMap<OsString, OsString> {
    let mut env_map: BTreeMap<OsString, OsString> = std::env::vars_os().collect();
    for (key, value) in extra_env {
        env_map.insert(OsString::from(key), OsString::from(value));
    }
    env_map
}

fn to_cstring(bytes: Vec<u8>) -> Result<CString, HandoffError> {
    CString::new(bytes).map_err(|e| {
        HandoffError::Prepare(io::Error::new(io::ErrorKind::InvalidInput, e))
    })
}

/// Execute a new process image with additional environment variables.
/// Does not return on success.
///
/// Uses execve with an explicit environment instead of mutating the process
/// environment from a multi-threaded runtime.
fn exec_with_env(
    exe: &Path,
    args: &[OsString],
    extra_env: &[(&str, &str)],
) -> Result<Infallible, HandoffError> {
    let c_exe = to_cstring(exe.as_os_str().as_bytes().to_vec())?;

    let c_args = args
        .iter()
        .map(|a| to_cstring(a.as_bytes().to_vec()))
        .collect::<Result<Vec<_>, _>>()?;

    let c_env = merged_env(extra_env)
        .into_iter()
        .map(|(k, v)| {
            let mut entry = k.into_vec();
            entry.push(b'=');
            entry.extend_from_slice(v.as_bytes());
            to_cstring(entry)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let c_arg_ptrs: Vec<*const libc::c_char> = c_args
        .iter()
        .map(|a| a.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();

    let c_env_ptrs: Vec<*const libc::c_char> = c_env
        .iter()
        .map(|e| e.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();

    debug!(exe = %exe.display(), argc = c_args.len(), "execve");

    // SAFETY: all pointers reference NUL-terminated strings that outlive the
    // call, and both arrays are NULL-terminated.
    unsafe {
        libc::execve(c_exe.as_ptr(), c_arg_ptrs.as_ptr(), c_env_ptrs.as_ptr());
    }

    // execve only returns on error
    Err(HandoffError::Exec {
        exe: exe.to_path_buf(),
        source: io::Error::last_os_error(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// CLOEXEC flag management works correctly.
    #[test]
    fn test_clear_cloexec() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);

        // Set CLOEXEC
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

    /// dup_high produces a high fd with CLOEXEC set.
    #[test]
    fn test_dup_high_range_and_cloexec() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);

        let high_fd = dup_high(fd).unwrap();
        assert!(high_fd >= TEMP_FD_BASE);

        let flags = unsafe { libc::fcntl(high_fd, libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);

        unsafe {
            libc::close(fd);
            libc::close(high_fd);
        }
    }

    #[test]
    fn test_merged_env_overrides_and_keeps_existing() {
        let env = merged_env(&[(LISTEN_FDS, "1"), ("PATH", "/moult/override")]);

        assert_eq!(env.get(&OsString::from(LISTEN_FDS)), Some(&OsString::from("1")));
        assert_eq!(
            env.get(&OsString::from("PATH")),
            Some(&OsString::from("/moult/override"))
        );
        if let Some((key, value)) = std::env::vars_os().find(|(k, _)| k != "PATH" && k != LISTEN_FDS) {
            assert_eq!(env.get(&key), Some(&value));
        }
    }

    /// A failed execve is reported, not panicked on.
    #[test]
    fn test_exec_failure_is_returned() {
        let exe = Path::new("/nonexistent/moult-replacement");
        let args = vec![OsString::from("moult-replacement")];

        let err = exec_with_env(exe, &args, &[(LISTEN_FDS, "1")]).unwrap_err();
        match err {
            HandoffError::Exec { exe: failed, source } => {
                assert_eq!(failed, exe);
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_deleted_suffix_is_stripped() {
        assert_eq!(
            strip_deleted_suffix(PathBuf::from("/srv/moult-server (deleted)")),
            PathBuf::from("/srv/moult-server")
        );
        assert_eq!(
            strip_deleted_suffix(PathBuf::from("/srv/moult-server")),
            PathBuf::from("/srv/moult-server")
        );
    }

    #[test]
    fn test_program_with_slash_is_used_as_path() {
        let exe = std::env::current_exe().unwrap();
        assert_eq!(resolve_program(exe.as_os_str(), None), Some(exe));
        assert_eq!(
            resolve_program(OsStr::new("/nonexistent/moult-server"), None),
            None
        );
        assert_eq!(resolve_program(OsStr::new(""), None), None);
    }

    #[test]
    fn test_bare_program_is_searched_on_path() {
        let empty = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();

        let not_executable = empty.path().join("moult-server");
        std::fs::write(&not_executable, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&not_executable, std::fs::Permissions::from_mode(0o644)).unwrap();

        let executable = bin.path().join("moult-server");
        std::fs::write(&executable, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&executable, std::fs::Permissions::from_mode(0o755)).unwrap();

        let path_var = std::env::join_paths([empty.path(), bin.path()]).unwrap();
        assert_eq!(
            resolve_program(OsStr::new("moult-server"), Some(&path_var)),
            Some(executable)
        );
        assert_eq!(resolve_program(OsStr::new("moult-missing"), Some(&path_var)), None);
        assert_eq!(resolve_program(OsStr::new("moult-server"), None), None);
    }

    #[test]
    fn test_placements_start_at_first_inherited_fd() {
        let moves: Vec<_> = placements(&[120, 121]).collect();
        assert_eq!(moves, vec![(120, 3), (121, 4)]);
    }

    #[test]
    fn test_nul_in_argument_is_rejected() {
        let args = vec![OsString::from_vec(b"bad\0arg".to_vec())];
        let err = exec_with_env(Path::new("/bin/true"), &args, &[]).unwrap_err();
        assert!(matches!(err, HandoffError::Prepare(_)));
    }
}
