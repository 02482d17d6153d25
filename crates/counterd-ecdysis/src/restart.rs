//! Process handoff with file descriptor passing.
//!
//! Spawns the successor with the listening sockets remapped to fd 3..3+N and
//! the write end of a readiness pipe at fd 3+N, then waits for the successor
//! to write a byte to that pipe. A successor that exits, closes the pipe or
//! misses the startup timeout is killed and reaped.

use std::ffi::{OsStr, OsString};
use std::io::{self, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::envelope::{HandoffEnvelope, LISTEN_FDS_START};
use crate::error::HandoffError;

/// A successor that confirmed readiness.
#[derive(Debug)]
pub struct Successor {
    pid: u32,
    _child: Option<Child>,
}

impl Successor {
    /// A successor known only by its process id, for transports that do not
    /// keep a child handle.
    pub fn from_pid(pid: u32) -> Self {
        Self { pid, _child: None }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

/// Platform capability for starting a successor with inherited listeners.
#[async_trait]
pub trait HandoffTransport: Send + Sync {
    /// Check that a successor can be started at all, before any listener
    /// state is touched.
    fn preflight(&self) -> Result<(), HandoffError>;

    /// Start a successor that inherits `envelope` and wait until it is ready,
    /// it fails, `startup_timeout` elapses or `abort` is cancelled.
    async fn spawn_successor(
        &self,
        envelope: HandoffEnvelope,
        startup_timeout: Duration,
        abort: CancellationToken,
    ) -> Result<Successor, HandoffError>;
}

#[async_trait]
impl<T: HandoffTransport + ?Sized> HandoffTransport for std::sync::Arc<T> {
    fn preflight(&self) -> Result<(), HandoffError> {
        (**self).preflight()
    }

    async fn spawn_successor(
        &self,
        envelope: HandoffEnvelope,
        startup_timeout: Duration,
        abort: CancellationToken,
    ) -> Result<Successor, HandoffError> {
        (**self)
            .spawn_successor(envelope, startup_timeout, abort)
            .await
    }
}

/// POSIX fork/exec transport.
///
/// By default re-executes the program this process was started as, with the
/// current arguments.
#[derive(Debug, Clone, Default)]
pub struct ExecTransport {
    program: Option<PathBuf>,
    args: Option<Vec<OsString>>,
}

impl ExecTransport {
    /// Re-exec the program this process was started as, with its original
    /// arguments.
    ///
    /// The path is resolved now from `argv[0]`, the working directory and
    /// `PATH`, rather than from `/proc/self/exe`, so a binary replaced by
    /// rename is picked up by the next restart. Construct this at startup,
    /// before anything changes the working directory.
    pub fn current_program() -> Self {
        let program = std::env::args_os().next().and_then(|argv0| {
            let cwd = std::env::current_dir().ok()?;
            resolve_program(&argv0, &cwd, std::env::var_os("PATH").as_deref())
        });
        if program.is_none() {
            debug!("Could not resolve argv[0], falling back to the running executable");
        }
        Self {
            program,
            args: None,
        }
    }

    /// Run `program` with `args` as the successor.
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: Some(program.into()),
            args: Some(args.into_iter().map(Into::into).collect()),
        }
    }

    fn program(&self) -> Result<PathBuf, HandoffError> {
        let program = match &self.program {
            Some(program) => program.clone(),
            None => std::env::current_exe().map_err(|source| {
                HandoffError::ExecutableUnavailable {
                    path: "<current executable>".to_string(),
                    source,
                }
            })?,
        };

        // The binary may have been removed since we started.
        std::fs::metadata(&program).map_err(|source| HandoffError::ExecutableUnavailable {
            path: program.display().to_string(),
            source,
        })?;
        Ok(program)
    }

    fn args(&self) -> Vec<OsString> {
        match &self.args {
            Some(args) => args.clone(),
            None => std::env::args_os().skip(1).collect(),
        }
    }
}

#[async_trait]
impl HandoffTransport for ExecTransport {
    fn preflight(&self) -> Result<(), HandoffError> {
        self.program()?;
        std::env::current_dir().map_err(HandoffError::WorkingDirectoryUnavailable)?;
        Ok(())
    }

    async fn spawn_successor(
        &self,
        envelope: HandoffEnvelope,
        startup_timeout: Duration,
        abort: CancellationToken,
    ) -> Result<Successor, HandoffError> {
        let program = self.program()?;
        let (ready_rx, ready_tx) = cloexec_pipe().map_err(HandoffError::Prepare)?;

        let mut sources = envelope.source_fds();
        sources.push(ready_tx.as_raw_fd());
        let mut staged = vec![-1; sources.len()];

        let mut command = Command::new(&program);
        command
            .args(self.args())
            .envs(envelope.env())
            .stdin(Stdio::null())
            .kill_on_drop(false);

        // SAFETY: the closure runs between fork and exec and only calls
        // async-signal-safe libc functions on pre-allocated buffers.
        unsafe {
            command.pre_exec(move || remap_descriptors(&sources, &mut staged));
        }

        info!(
            exe = %program.display(),
            generation = envelope.generation(),
            addrs = ?envelope.addresses(),
            "Spawning successor"
        );
        let mut child = command.spawn().map_err(HandoffError::Spawn)?;
        let pid = child.id().unwrap_or_default();

        // Only the child may hold the write end, so EOF means it died.
        drop(ready_tx);
        drop(envelope);

        let outcome = tokio::select! {
            ready = tokio::time::timeout(startup_timeout, wait_ready(ready_rx, &mut child, pid)) => {
                match ready {
                    Ok(result) => result,
                    Err(_) => Err(HandoffError::Timeout { pid, timeout: startup_timeout }),
                }
            }
            _ = abort.cancelled() => Err(HandoffError::Aborted { pid }),
        };

        match outcome {
            Ok(()) => {
                info!(pid, "Successor signalled readiness");
                Ok(Successor {
                    pid,
                    _child: Some(child),
                })
            }
            Err(e) => {
                reclaim(&mut child, pid).await;
                Err(e)
            }
        }
    }
}

async fn wait_ready(ready_rx: OwnedFd, child: &mut Child, pid: u32) -> Result<(), HandoffError> {
    let mut ready_rx = pipe::Receiver::from_owned_fd(ready_rx).map_err(HandoffError::Readiness)?;
    let mut buf = [0u8; 1];

    tokio::select! {
        read = ready_rx.read(&mut buf) => match read {
            Ok(1) => Ok(()),
            Ok(_) => {
                debug!(pid, "Readiness pipe closed without a readiness byte");
                let status = child.try_wait().ok().flatten();
                Err(HandoffError::SuccessorExited { pid, status })
            }
            Err(e) => Err(HandoffError::Readiness(e)),
        },
        status = child.wait() => Err(HandoffError::SuccessorExited { pid, status: status.ok() }),
    }
}

/// Kill and reap a successor that did not make it.
async fn reclaim(child: &mut Child, pid: u32) {
    if let Err(e) = child.start_kill() {
        debug!(pid, error = %e, "Successor already gone");
    }
    match child.wait().await {
        Ok(status) => debug!(pid, %status, "Reaped failed successor"),
        Err(e) => warn!(pid, error = %e, "Failed to reap successor"),
    }
}

/// Move `sources` onto fd 3.. in the child. Runs between fork and exec.
///
/// Phase 1 dups every source above the target range so that a later dup2
/// cannot clobber a source still waiting to be moved. Phase 2 dups onto the
/// targets and clears CLOEXEC there. The staging copies keep CLOEXEC and
/// vanish at exec.
fn remap_descriptors(sources: &[RawFd], staged: &mut [RawFd]) -> io::Result<()> {
    let floor = LISTEN_FDS_START + sources.len() as RawFd;

    for (slot, &source) in staged.iter_mut().zip(sources) {
        let fd = unsafe { libc::fcntl(source, libc::F_DUPFD_CLOEXEC, floor) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        *slot = fd;
    }

    for (i, &fd) in staged.iter().enumerate() {
        let target = LISTEN_FDS_START + i as RawFd;
        if unsafe { libc::dup2(fd, target) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = unsafe { libc::fcntl(target, libc::F_GETFD) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(target, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Create a pipe with CLOEXEC set on both ends. Returns `(read, write)`.
fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [-1 as RawFd; 2];

    #[cfg(target_os = "linux")]
    {
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
        }
    }

    // SAFETY: pipe(2) just returned two fresh descriptors we own.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    Ok((read, write))
}

/// Resolve `argv0` the way a shell found it: a name containing `/` is a path
/// (relative ones against `cwd`), a bare name is looked up in `path_var`.
/// Symlinks are kept as given.
fn resolve_program(argv0: &OsStr, cwd: &Path, path_var: Option<&OsStr>) -> Option<PathBuf> {
    if argv0.is_empty() {
        return None;
    }
    if argv0.as_bytes().contains(&b'/') {
        return Some(cwd.join(argv0));
    }

    std::env::split_paths(path_var?)
        .map(|dir| {
            // An empty PATH entry means the working directory.
            let dir = if dir.as_os_str().is_empty() {
                cwd.to_path_buf()
            } else {
                cwd.join(dir)
            };
            dir.join(argv0)
        })
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Tell the parent this successor is serving.
pub(crate) fn notify_ready(fd: OwnedFd) -> io::Result<()> {
    let mut pipe = std::fs::File::from(fd);
    pipe.write_all(b"1")?;
    pipe.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::ListenerRegistry;

    fn registry_with_listener() -> (ListenerRegistry, std::net::SocketAddr) {
        let registry = ListenerRegistry::default();
        let listener = registry.register("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr();
        (registry, addr)
    }

    fn sh(script: &str) -> ExecTransport {
        ExecTransport::new("/bin/sh", ["-c", script])
    }

    fn process_exists(pid: u32) -> bool {
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    /// CLOEXEC flag management works correctly.
    #[test]
    fn test_cloexec_pipe() {
        let (read, write) = cloexec_pipe().unwrap();
        for fd in [read.as_raw_fd(), write.as_raw_fd()] {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            assert_ne!(flags & libc::FD_CLOEXEC, 0);
        }
    }

    fn is_cloexec(fd: RawFd) -> bool {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        flags >= 0 && flags & libc::FD_CLOEXEC != 0
    }

    fn inode(fd: RawFd) -> Option<(libc::dev_t, libc::ino_t)> {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        (unsafe { libc::fstat(fd, &mut stat) } == 0).then_some((stat.st_dev, stat.st_ino))
    }

    /// Sources end up on 3, 4, ... in order without CLOEXEC, even when a
    /// source already sits on one of the targets.
    #[test]
    fn test_remap_descriptors_lands_on_listen_range() {
        let (read_a, _write_a) = cloexec_pipe().unwrap();
        let (read_b, write_b) = cloexec_pipe().unwrap();

        // Remap in a forked child so this process's own fds 3.. are untouched.
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0);
        if pid == 0 {
            let ok = (|| {
                if unsafe { libc::dup2(read_b.as_raw_fd(), LISTEN_FDS_START) } < 0 {
                    return false;
                }
                let sources = [write_b.as_raw_fd(), LISTEN_FDS_START, read_a.as_raw_fd()];
                let expected = sources.map(inode);
                let mut staged = [-1; 3];
                if remap_descriptors(&sources, &mut staged).is_err() {
                    return false;
                }
                (0..3).all(|i| {
                    let target = LISTEN_FDS_START + i as RawFd;
                    expected[i].is_some() && inode(target) == expected[i] && !is_cloexec(target)
                }) && staged.iter().all(|&fd| fd >= LISTEN_FDS_START + 3 && is_cloexec(fd))
            })();
            unsafe { libc::_exit(if ok { 0 } else { 1 }) };
        }

        let mut status = 0;
        assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 0);
    }

    #[test]
    fn test_resolve_program() {
        let cwd = Path::new("/srv/counterd");
        assert_eq!(
            resolve_program(OsStr::new("./bin/counterd"), cwd, None),
            Some(PathBuf::from("/srv/counterd/./bin/counterd"))
        );
        assert_eq!(
            resolve_program(OsStr::new("/usr/local/bin/counterd"), cwd, None),
            Some(PathBuf::from("/usr/local/bin/counterd"))
        );
        assert_eq!(
            resolve_program(OsStr::new("sh"), cwd, Some(OsStr::new("/nonexistent:/bin"))),
            Some(PathBuf::from("/bin/sh"))
        );
        assert_eq!(resolve_program(OsStr::new("sh"), cwd, None), None);
        assert_eq!(resolve_program(OsStr::new(""), cwd, None), None);
    }

    /// Deploying by renaming a new binary over the old path must not break
    /// the next restart.
    #[test]
    fn test_program_replaced_by_rename_passes_preflight() {
        let dir = std::env::temp_dir().join(format!("counterd-exec-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let program = dir.join("counterd");
        std::fs::copy("/bin/sh", &program).unwrap();
        let transport = ExecTransport::new(&program, ["-c", "true"]);
        transport.preflight().unwrap();

        let staged = dir.join("counterd.new");
        std::fs::copy("/bin/sh", &staged).unwrap();
        std::fs::rename(&staged, &program).unwrap();
        assert!(transport.preflight().is_ok());

        std::fs::remove_file(&program).unwrap();
        assert!(matches!(
            transport.preflight(),
            Err(HandoffError::ExecutableUnavailable { .. })
        ));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_executable_fails_preflight() {
        let transport = ExecTransport::new("/nonexistent/counterd", Vec::<String>::new());
        assert!(matches!(
            transport.preflight(),
            Err(HandoffError::ExecutableUnavailable { .. })
        ));
        assert!(ExecTransport::current_program().preflight().is_ok());
    }

    #[tokio::test]
    async fn test_successor_ready_with_inherited_listener() {
        let (registry, addr) = registry_with_listener();
        let envelope = HandoffEnvelope::snapshot(&registry, 1).unwrap();

        // The successor checks the contract, then reports ready and lingers.
        let transport = sh(&format!(
            r#"test "$LISTEN_FDS" = 1 || exit 3
test "$LISTEN_FD_NAMES" = "{addr}" || exit 4
test "$COUNTERD_GENERATION" = 1 || exit 5
test "$COUNTERD_READY_FD" = 4 || exit 6
printf 1 >&4
exec sleep 5"#
        ));

        let successor = transport
            .spawn_successor(envelope, Duration::from_secs(5), CancellationToken::new())
            .await
            .unwrap();
        assert!(process_exists(successor.pid()));

        unsafe { libc::kill(successor.pid() as libc::pid_t, libc::SIGKILL) };
        // Parent still owns and serves its listener.
        assert!(std::net::TcpStream::connect(addr).is_ok());
    }

    #[tokio::test]
    async fn test_crashing_successor_is_reported() {
        let (registry, addr) = registry_with_listener();
        let envelope = HandoffEnvelope::snapshot(&registry, 1).unwrap();

        let err = sh("exit 1")
            .spawn_successor(envelope, Duration::from_secs(5), CancellationToken::new())
            .await
            .unwrap_err();

        let pid = err.successor_pid().expect("successor was spawned");
        assert!(matches!(err, HandoffError::SuccessorExited { .. }));
        assert!(!process_exists(pid));
        assert!(std::net::TcpStream::connect(addr).is_ok());
    }

    #[tokio::test]
    async fn test_slow_successor_times_out_and_is_reaped() {
        let (registry, addr) = registry_with_listener();
        let envelope = HandoffEnvelope::snapshot(&registry, 1).unwrap();

        let started = std::time::Instant::now();
        let err = sh("exec sleep 30")
            .spawn_successor(
                envelope,
                Duration::from_millis(200),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, HandoffError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
        let pid = err.successor_pid().unwrap();
        assert!(!process_exists(pid));
        assert!(std::net::TcpStream::connect(addr).is_ok());
    }

    #[tokio::test]
    async fn test_abort_reaps_successor() {
        let (registry, _addr) = registry_with_listener();
        let envelope = HandoffEnvelope::snapshot(&registry, 1).unwrap();
        let abort = CancellationToken::new();
        abort.cancel();

        let err = sh("exec sleep 30")
            .spawn_successor(envelope, Duration::from_secs(5), abort)
            .await
            .unwrap_err();

        assert!(matches!(err, HandoffError::Aborted { .. }));
        assert!(!process_exists(err.successor_pid().unwrap()));
    }

    #[test]
    fn test_notify_ready_writes_one_byte() {
        use std::io::Read;

        let (read, write) = cloexec_pipe().unwrap();
        notify_ready(write).unwrap();

        let mut buf = Vec::new();
        std::fs::File::from(read).read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"1");
    }
}
