//! `RUN` step execution.
//!
//! Commands run with a cleared environment holding exactly the step's
//! environment, in their own process group so a timeout or cancellation can
//! kill everything they spawned. By default the process is chrooted into the
//! staged rootfs, inside a fresh user namespace when the builder is not root.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{BuildError, CommandStatus, Isolation};
use crate::consts::OUTPUT_TAIL_BYTES;
use crate::recipe::RunCommand;
use crate::util::fs::resolve_in_rootfs;

/// How long a killed command's pipes may take to close.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Everything needed to run one command against a staged rootfs.
pub(crate) struct RunRequest<'a> {
  pub command: &'a RunCommand,
  pub env: &'a BTreeMap<String, String>,
  pub rootfs: &'a Path,
  /// Absolute working directory inside the image.
  pub workdir: &'a str,
  pub isolation: Isolation,
  pub shell: Option<&'a str>,
  pub timeout: Option<Duration>,
}

enum Finished {
  Done(std::process::ExitStatus),
  TimedOut,
  Cancelled,
}

/// Interleaved stdout and stderr, trimmed as it grows.
#[derive(Clone, Default)]
struct OutputBuffer(Arc<Mutex<Vec<u8>>>);

impl OutputBuffer {
  fn append(&self, bytes: &[u8]) {
    let mut buf = self.0.lock().unwrap_or_else(|e| e.into_inner());
    buf.extend_from_slice(bytes);
    if buf.len() > 2 * OUTPUT_TAIL_BYTES {
      let excess = buf.len() - OUTPUT_TAIL_BYTES;
      buf.drain(..excess);
    }
  }

  fn tail(&self) -> String {
    let buf = self.0.lock().unwrap_or_else(|e| e.into_inner());
    tail(&String::from_utf8_lossy(&buf), OUTPUT_TAIL_BYTES)
  }
}

fn drain<R>(pipe: Option<R>, buffer: &OutputBuffer) -> Option<JoinHandle<()>>
where
  R: AsyncRead + Unpin + Send + 'static,
{
  let mut pipe = pipe?;
  let buffer = buffer.clone();
  Some(tokio::spawn(async move {
    let mut chunk = [0u8; 8192];
    loop {
      match pipe.read(&mut chunk).await {
        Ok(0) | Err(_) => break,
        Ok(n) => buffer.append(&chunk[..n]),
      }
    }
  }))
}

async fn join_all(readers: Vec<JoinHandle<()>>) {
  for reader in readers {
    let _ = reader.await;
  }
}

/// Run a command to completion.
///
/// A non-zero exit, a timeout or a cancellation is returned as
/// [`BuildError::CommandFailed`] carrying the tail of what the command
/// printed. The captured output is returned on success.
pub(crate) async fn run_command(req: &RunRequest<'_>, cancel: &CancellationToken) -> Result<String, BuildError> {
  let argv = command_argv(req.command, req.shell);
  let cmd_text = req.command.to_string();
  info!(cmd = %cmd_text, workdir = %req.workdir, isolation = ?req.isolation, "running command");

  let cwd = resolve_in_rootfs(req.rootfs, req.workdir).map_err(|e| BuildError::PathError {
    path: req.workdir.to_string(),
    message: e.to_string(),
  })?;
  if !cwd.is_dir() {
    return Err(BuildError::PathError {
      path: req.workdir.to_string(),
      message: "working directory does not exist in the image".to_string(),
    });
  }

  let mut command = Command::new(&argv[0]);
  command
    .args(&argv[1..])
    .env_clear()
    .envs(req.env)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

  match req.isolation {
    Isolation::Host => {
      command.current_dir(cwd);
    }
    Isolation::Chroot => enter_rootfs(&mut command, req.rootfs, req.workdir)?,
  }

  #[cfg(unix)]
  command.process_group(0);

  let mut child = match command.spawn() {
    Ok(child) => child,
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
      return Err(BuildError::CommandFailed {
        cmd: cmd_text,
        status: CommandStatus::Exited(127),
        output: format!("{}: {}", argv[0], e),
      });
    }
    Err(e) if req.isolation == Isolation::Chroot => {
      warn!(error = %e, "cannot enter the image rootfs");
      return Err(BuildError::Io(std::io::Error::new(
        e.kind(),
        format!("cannot run the command inside the image rootfs: {}", e),
      )));
    }
    Err(e) => return Err(e.into()),
  };
  let pid = child.id();
  debug!(pid = ?pid, program = %argv[0], "spawned process");

  let output = OutputBuffer::default();
  let readers: Vec<JoinHandle<()>> = [
    drain(child.stdout.take(), &output),
    drain(child.stderr.take(), &output),
  ]
  .into_iter()
  .flatten()
  .collect();

  let finished = tokio::select! {
    status = child.wait() => Finished::Done(status?),
    _ = expire(req.timeout) => Finished::TimedOut,
    _ = cancel.cancelled() => Finished::Cancelled,
  };

  let status = match finished {
    Finished::Done(status) => {
      join_all(readers).await;
      status
    }
    Finished::TimedOut => {
      warn!(cmd = %cmd_text, timeout = ?req.timeout, "command timed out");
      kill_group(pid);
      let _ = tokio::time::timeout(DRAIN_GRACE, join_all(readers)).await;
      return Err(interrupted(cmd_text, CommandStatus::TimedOut, &output));
    }
    Finished::Cancelled => {
      warn!(cmd = %cmd_text, "command cancelled");
      kill_group(pid);
      let _ = tokio::time::timeout(DRAIN_GRACE, join_all(readers)).await;
      return Err(interrupted(cmd_text, CommandStatus::Cancelled, &output));
    }
  };

  let captured = output.tail();
  if !captured.is_empty() {
    debug!(output = %captured, "command output");
  }

  if !status.success() {
    return Err(BuildError::CommandFailed {
      cmd: cmd_text,
      status: exit_status(&status),
      output: captured,
    });
  }

  Ok(captured)
}

fn interrupted(cmd: String, status: CommandStatus, output: &OutputBuffer) -> BuildError {
  BuildError::CommandFailed {
    cmd,
    status,
    output: output.tail(),
  }
}

async fn expire(timeout: Option<Duration>) {
  match timeout {
    Some(duration) => tokio::time::sleep(duration).await,
    None => std::future::pending().await,
  }
}

fn command_argv(command: &RunCommand, shell: Option<&str>) -> Vec<String> {
  match command {
    RunCommand::Shell(cmd) => {
      let (shell, mut argv) = get_shell(shell);
      argv.insert(0, shell);
      argv.push(cmd.clone());
      argv
    }
    RunCommand::Exec(argv) => argv.clone(),
  }
}

/// The shell program and the flags that precede the command string.
/// Defaults to `/bin/sh`.
fn get_shell(override_shell: Option<&str>) -> (String, Vec<String>) {
  if let Some(shell) = override_shell {
    let args = if shell.contains("powershell") || shell.contains("pwsh") {
      vec!["-NoProfile".to_string(), "-Command".to_string()]
    } else if shell.contains("cmd") {
      vec!["/C".to_string()]
    } else {
      vec!["-c".to_string()]
    };
    return (shell.to_string(), args);
  }

  #[cfg(unix)]
  {
    ("/bin/sh".to_string(), vec!["-c".to_string()])
  }

  #[cfg(windows)]
  {
    (
      "powershell.exe".to_string(),
      vec!["-NoProfile".to_string(), "-Command".to_string()],
    )
  }
}

#[cfg(unix)]
fn enter_rootfs(command: &mut Command, rootfs: &Path, workdir: &str) -> Result<(), BuildError> {
  use std::ffi::CString;
  use std::os::unix::ffi::OsStrExt;

  let invalid = |path: String| BuildError::PathError {
    path,
    message: "path contains a NUL byte".to_string(),
  };
  let root = CString::new(rootfs.as_os_str().as_bytes()).map_err(|_| invalid(rootfs.display().to_string()))?;
  let dir = CString::new(workdir).map_err(|_| invalid(workdir.to_string()))?;

  #[cfg(target_os = "linux")]
  let maps = userns::IdMaps::for_current_user();
  #[cfg(target_os = "linux")]
  debug!(user_namespace = maps.is_some(), "entering image rootfs");

  // SAFETY: the closure runs between fork and exec and only makes
  // async-signal-safe libc calls on memory prepared before the fork.
  unsafe {
    command.pre_exec(move || {
      #[cfg(target_os = "linux")]
      if let Some(maps) = &maps {
        userns::enter(maps)?;
      }
      if libc::chroot(root.as_ptr()) != 0 || libc::chdir(dir.as_ptr()) != 0 {
        return Err(std::io::Error::last_os_error());
      }
      Ok(())
    });
  }
  Ok(())
}

/// Unprivileged chroot: a new user namespace mapping the builder's ids to
/// root, plus a private mount namespace.
#[cfg(target_os = "linux")]
mod userns {
  use std::ffi::{CStr, CString};
  use std::io;

  pub(super) struct IdMaps {
    uid_map: CString,
    gid_map: CString,
  }

  impl IdMaps {
    /// `None` when already root, where a plain chroot works.
    pub(super) fn for_current_user() -> Option<Self> {
      // SAFETY: geteuid and getegid cannot fail and touch no memory.
      let (uid, gid) = unsafe { (libc::geteuid(), libc::getegid()) };
      if uid == 0 {
        return None;
      }
      Some(Self {
        uid_map: CString::new(format!("0 {} 1", uid)).ok()?,
        gid_map: CString::new(format!("0 {} 1", gid)).ok()?,
      })
    }
  }

  /// Must run in the single-threaded child before exec.
  pub(super) fn enter(maps: &IdMaps) -> io::Result<()> {
    // SAFETY: unshare has no memory-safety preconditions.
    if unsafe { libc::unshare(libc::CLONE_NEWUSER | libc::CLONE_NEWNS) } != 0 {
      return Err(io::Error::last_os_error());
    }
    write_proc(c"/proc/self/setgroups", c"deny")?;
    write_proc(c"/proc/self/uid_map", &maps.uid_map)?;
    write_proc(c"/proc/self/gid_map", &maps.gid_map)
  }

  fn write_proc(path: &CStr, contents: &CStr) -> io::Result<()> {
    let bytes = contents.to_bytes();
    // SAFETY: both pointers come from live NUL-terminated buffers and the
    // descriptor is closed before returning.
    unsafe {
      let fd = libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
      if fd < 0 {
        return Err(io::Error::last_os_error());
      }
      let written = libc::write(fd, bytes.as_ptr().cast(), bytes.len());
      let error = io::Error::last_os_error();
      libc::close(fd);
      if written < 0 || written as usize != bytes.len() {
        return Err(error);
      }
    }
    Ok(())
  }
}

#[cfg(not(unix))]
fn enter_rootfs(_command: &mut Command, _rootfs: &Path, _workdir: &str) -> Result<(), BuildError> {
  Err(BuildError::Io(std::io::Error::new(
    std::io::ErrorKind::Unsupported,
    "chroot isolation requires a unix host; use host isolation",
  )))
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
  let Some(pgid) = pid.and_then(|p| i32::try_from(p).ok()) else {
    return;
  };
  // SAFETY: killpg has no memory-safety preconditions.
  if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
    debug!(pgid, error = %std::io::Error::last_os_error(), "killpg failed");
  }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

#[cfg(unix)]
fn exit_status(status: &std::process::ExitStatus) -> CommandStatus {
  use std::os::unix::process::ExitStatusExt;

  match (status.code(), status.signal()) {
    (Some(code), _) => CommandStatus::Exited(code),
    (None, Some(signal)) => CommandStatus::Signaled(signal),
    (None, None) => CommandStatus::Exited(1),
  }
}

#[cfg(not(unix))]
fn exit_status(status: &std::process::ExitStatus) -> CommandStatus {
  CommandStatus::Exited(status.code().unwrap_or(1))
}

/// The last `max` bytes of `text`, cut at a character boundary.
fn tail(text: &str, max: usize) -> String {
  if text.len() <= max {
    return text.to_string();
  }
  let mut start = text.len() - max;
  while !text.is_char_boundary(start) {
    start += 1;
  }
  text[start..].to_string()
}
