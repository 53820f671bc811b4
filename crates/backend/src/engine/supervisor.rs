//! Process ownership: spawning, liveness, signalling, and the pieces of the
//! shutdown sequence that touch the OS.

use std::{
  io,
  process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio},
  sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, Ordering},
  },
  thread::JoinHandle,
  time::{Duration, Instant},
};

use kibitz_core::EngineConfig;

use super::sink::{Diagnostics, report};
use crate::error::{EngineError, EngineFailure};

const POLL: Duration = Duration::from_millis(10);

/// Invoked once per generation when the engine fails
pub type RecoveryHook = Arc<dyn Fn(EngineFailure) + Send + Sync>;

/// The pipes of a freshly spawned engine
pub(crate) struct Spawned {
  pub child: Child,
  pub stdin: ChildStdin,
  pub stdout: ChildStdout,
  pub stderr: ChildStderr,
}

/// Build the launch command: either a direct exec or a shell line
pub(crate) fn build_command(config: &EngineConfig) -> Command {
  let mut cmd = match &config.shell {
    Some(line) => shell_command(line),
    None => {
      let mut cmd = Command::new(&config.command);
      cmd.args(&config.args);
      cmd
    }
  };

  if let Some(dir) = &config.working_dir {
    cmd.current_dir(dir);
  }
  cmd.envs(&config.env);
  cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());

  #[cfg(unix)]
  {
    use std::os::unix::process::CommandExt;
    // Own group, so signals also reach anything a shell line starts
    cmd.process_group(0);
  }

  cmd
}

#[cfg(unix)]
fn shell_command(line: &str) -> Command {
  let mut cmd = Command::new("sh");
  cmd.arg("-c").arg(line);
  cmd
}

#[cfg(not(unix))]
fn shell_command(line: &str) -> Command {
  let mut cmd = Command::new("cmd");
  cmd.arg("/C").arg(line);
  cmd
}

pub(crate) fn spawn(config: &EngineConfig) -> Result<Spawned, EngineError> {
  let launch_error = |source: io::Error| EngineError::Launch {
    command: config.display_command(),
    source,
  };

  let mut child = build_command(config).spawn().map_err(launch_error)?;

  let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
  let (Some(stdin), Some(stdout), Some(stderr)) = pipes else {
    let _ = child.kill();
    let _ = child.wait();
    return Err(launch_error(io::Error::other("engine pipes were not captured")));
  };

  Ok(Spawned {
    child,
    stdin,
    stdout,
    stderr,
  })
}

/// The process handle. Read by any thread, written only by the supervisor;
/// readers treat an empty slot as a dead engine.
#[derive(Default)]
pub(crate) struct ProcessSlot {
  child: Mutex<Option<Child>>,
}

impl ProcessSlot {
  fn lock(&self) -> MutexGuard<'_, Option<Child>> {
    self.child.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn install(&self, child: Child) {
    *self.lock() = Some(child);
  }

  pub fn is_occupied(&self) -> bool {
    self.lock().is_some()
  }

  pub fn is_alive(&self) -> bool {
    match self.lock().as_mut() {
      Some(child) => matches!(child.try_wait(), Ok(None)),
      None => false,
    }
  }

  pub fn pid(&self) -> Option<u32> {
    self.lock().as_ref().map(Child::id)
  }

  /// Exit status, waiting up to `wait` for the process to finish
  pub fn exit_status(&self, wait: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + wait;
    loop {
      {
        let mut guard = self.lock();
        let child = guard.as_mut()?;
        match child.try_wait() {
          Ok(Some(status)) => return Some(status),
          Ok(None) => {}
          Err(_) => return None,
        }
      }
      if Instant::now() >= deadline {
        return None;
      }
      std::thread::sleep(POLL);
    }
  }

  /// Ask the engine to exit
  pub fn terminate(&self) -> io::Result<()> {
    let mut guard = self.lock();
    let Some(child) = guard.as_mut() else {
      return Ok(());
    };
    if !matches!(child.try_wait(), Ok(None)) {
      return Ok(());
    }
    signal_group(child, Signal::Terminate)
  }

  /// Kill the engine outright
  pub fn kill(&self) -> io::Result<()> {
    let mut guard = self.lock();
    let Some(child) = guard.as_mut() else {
      return Ok(());
    };
    if !matches!(child.try_wait(), Ok(None)) {
      return Ok(());
    }
    signal_group(child, Signal::Kill)
  }

  pub fn clear(&self) -> Option<Child> {
    self.lock().take()
  }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
  Terminate,
  Kill,
}

#[cfg(unix)]
fn signal_group(child: &mut Child, signal: Signal) -> io::Result<()> {
  let sig = match signal {
    Signal::Terminate => libc::SIGTERM,
    Signal::Kill => libc::SIGKILL,
  };
  // Negative pid addresses the process group created at spawn
  let pgid = -(child.id() as i32);
  if unsafe { libc::kill(pgid, sig) } == 0 {
    return Ok(());
  }
  let err = io::Error::last_os_error();
  match signal {
    // Group already gone; fall back to the direct child
    Signal::Kill => child.kill(),
    Signal::Terminate => Err(err),
  }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _signal: Signal) -> io::Result<()> {
  // Termination is always forceful here
  child.kill()
}

/// Reports the first failure of one engine generation and swallows the rest
pub(crate) struct FailureLatch {
  tripped: AtomicBool,
  on_trip: Box<dyn Fn(Option<EngineFailure>) + Send + Sync>,
}

impl FailureLatch {
  pub fn new<F>(on_trip: F) -> Self
  where
    F: Fn(Option<EngineFailure>) + Send + Sync + 'static,
  {
    Self {
      tripped: AtomicBool::new(false),
      on_trip: Box::new(on_trip),
    }
  }

  /// Record that the engine is finished. `None` means it exited on purpose.
  ///
  /// Returns whether this call was the first.
  pub fn trip(&self, failure: Option<EngineFailure>) -> bool {
    if self.tripped.swap(true, Ordering::AcqRel) {
      return false;
    }
    (self.on_trip)(failure);
    true
  }

  /// Stop reporting; used when the supervisor itself is tearing down
  pub fn disarm(&self) {
    self.tripped.store(true, Ordering::Release);
  }

  pub fn is_tripped(&self) -> bool {
    self.tripped.load(Ordering::Acquire)
  }
}

/// Join a thread, giving up after `timeout`
pub(crate) fn join_bounded(handle: JoinHandle<()>, timeout: Duration, diag: &Diagnostics) -> bool {
  let name = handle.thread().name().unwrap_or("unnamed").to_string();

  if handle.thread().id() == std::thread::current().id() {
    report!(diag, DEBUG, thread = name; "not joining a thread from itself");
    return false;
  }

  let deadline = Instant::now() + timeout;
  while !handle.is_finished() {
    if Instant::now() >= deadline {
      report!(diag, WARN, thread = name; "thread did not stop within {timeout:?}, detaching");
      return false;
    }
    std::thread::sleep(Duration::from_millis(5));
  }

  if handle.join().is_err() {
    report!(diag, ERROR, thread = name; "thread panicked");
  }
  true
}
