//! Launching the measured command.
//!
//! The command is forked up front but held before `exec` until the counters
//! are attached to its pid, so nothing it does goes uncounted. Counters
//! opened with `enable_on_exec` start exactly at the exec.

use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};

/// A forked child blocked on a pipe until [`release`](ChildCommand::release).
///
/// A second pipe, close-on-exec on the child side, reports exec failure: EOF
/// means the exec went through, four bytes are the errno of a failed one.
///
/// Dropping an unreaped child kills it with `SIGKILL` and reaps it.
pub struct ChildCommand {
    pub pid: i32,
    release_pipe: Option<File>,
    exec_pipe: Option<File>,
    /// Set by whoever reaps the child first.
    reaped: Arc<AtomicBool>,
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Find `name` the way `execvp` would.
fn resolve_executable(name: &str) -> Result<PathBuf> {
    if name.contains('/') {
        let path = Path::new(name);
        if !path.exists() {
            bail!("Command not found: {}", name);
        }
        if !is_executable(path) {
            bail!("'{}' is not an executable file", name);
        }
        return Ok(path.to_path_buf());
    }

    let path_var = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
        .with_context(|| format!("Command '{}' not found in PATH", name))
}

/// Map a `waitpid` status to a shell-style exit code.
pub fn exit_code(status: i32) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        1
    }
}

fn pipe(flags: libc::c_int) -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), flags) } != 0 {
        return Err(std::io::Error::last_os_error()).context("Failed to create pipe");
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Fork a child that will exec `command` once released.
///
/// Must be called before the session starts any threads: the child side of
/// the fork only makes async-signal-safe calls and never returns.
pub fn spawn_stopped(command: &[String]) -> Result<ChildCommand> {
    let Some(program) = command.first() else {
        bail!("No command specified to run");
    };
    let resolved = resolve_executable(program)?;
    tracing::debug!("resolved {} -> {}", program, resolved.display());

    // Everything the child needs is allocated before the fork
    let path = CString::new(resolved.as_os_str().as_bytes())
        .context("Command path contains a null byte")?;
    let args = command
        .iter()
        .map(|arg| {
            CString::new(arg.as_bytes())
                .with_context(|| format!("Argument contains a null byte: {}", arg))
        })
        .collect::<Result<Vec<_>>>()?;
    let mut argv: Vec<*const libc::c_char> = args.iter().map(|a| a.as_ptr()).collect();
    argv.push(std::ptr::null());

    let (release_read, release_write) = pipe(0)?;
    let (exec_read, exec_write) = pipe(libc::O_CLOEXEC)?;
    let parent = unsafe { libc::getpid() };

    match unsafe { libc::fork() } {
        -1 => Err(std::io::Error::last_os_error()).context("fork() failed"),
        0 => unsafe {
            libc::close(release_write.as_raw_fd());
            libc::close(exec_read.as_raw_fd());

            // Do not outlive an evstat that dies before releasing us
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
            if libc::getppid() != parent {
                libc::_exit(1);
            }

            let mut buf = [0u8; 1];
            let n = libc::read(
                release_read.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                1,
            );
            libc::close(release_read.as_raw_fd());
            if n <= 0 {
                libc::_exit(1);
            }

            libc::execv(path.as_ptr(), argv.as_ptr());

            let errno = (*libc::__errno_location()).to_ne_bytes();
            libc::write(
                exec_write.as_raw_fd(),
                errno.as_ptr() as *const libc::c_void,
                errno.len(),
            );
            libc::_exit(127)
        },
        pid => {
            drop(release_read);
            drop(exec_write);
            Ok(ChildCommand {
                pid,
                release_pipe: Some(File::from(release_write)),
                exec_pipe: Some(File::from(exec_read)),
                reaped: Arc::new(AtomicBool::new(false)),
            })
        }
    }
}

impl ChildCommand {
    /// Let the child exec.
    pub fn release(&mut self) -> Result<()> {
        if let Some(mut pipe) = self.release_pipe.take() {
            pipe.write_all(&[1])
                .context("Failed to signal the command to start")?;
        }
        Ok(())
    }

    /// Block until the exec has happened, or report why it did not.
    pub fn wait_for_exec(&mut self) -> Result<()> {
        let Some(mut pipe) = self.exec_pipe.take() else {
            return Ok(());
        };
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf)
            .context("Failed to read the exec status pipe")?;
        if buf.is_empty() {
            return Ok(());
        }

        let errno = match <[u8; 4]>::try_from(buf.as_slice()) {
            Ok(bytes) => i32::from_ne_bytes(bytes),
            Err(_) => libc::EIO,
        };
        if self
            .reaped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let mut status = 0;
            unsafe { libc::waitpid(self.pid, &mut status, 0) };
        }
        Err(std::io::Error::from_raw_os_error(errno)).context("Cannot execute command")
    }

    /// Reap the child on a background thread and send its exit code through
    /// `notify` as `wrap(code)`.
    pub fn spawn_waiter<T: Send + 'static>(
        &self,
        notify: Sender<T>,
        wrap: impl FnOnce(i32) -> T + Send + 'static,
    ) -> Result<()> {
        let pid = self.pid;
        let reaped = self.reaped.clone();
        thread::Builder::new()
            .name("child_waiter".to_string())
            .spawn(move || {
                let mut status = 0;
                let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
                if ret == pid {
                    reaped.store(true, Ordering::Release);
                    let _ = notify.send(wrap(exit_code(status)));
                }
            })?;
        Ok(())
    }

    /// A callable that forwards a signal to the child until it is reaped,
    /// for use from handlers that outlive this borrow.
    pub fn signaller(&self) -> impl Fn(libc::c_int) + Send + 'static {
        let pid = self.pid;
        let reaped = self.reaped.clone();
        move |sig| {
            if !reaped.load(Ordering::Acquire) {
                unsafe { libc::kill(pid, sig) };
            }
        }
    }
}

impl Drop for ChildCommand {
    fn drop(&mut self) {
        self.release_pipe.take();
        self.exec_pipe.take();
        if self
            .reaped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            unsafe {
                libc::kill(self.pid, libc::SIGKILL);
                let mut status = 0;
                libc::waitpid(self.pid, &mut status, 0);
            }
        }
    }
}
