#![allow(unsafe_code)]

use std::io::{self, Read};
use std::mem;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::str;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::command::StageSpec;
use crate::signal::Signal;

/// How often a waiting thread checks whether a child has exited.
pub const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A child process running in its own process group, with stdout and stderr
/// captured into a shared buffer.
///
/// All methods take `&self` so that one thread can wait on the process while
/// another signals it.
pub struct Process {
    child: Mutex<Child>,
    pid: u32,
    output: OutputBuffer,
}

impl Process {
    pub fn spawn(spec: &StageSpec) -> io::Result<Self> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        imp::isolate(&mut command);
        debug!("Assembled command {:?}", command);

        let mut child = command.spawn()?;
        let output = OutputBuffer::default();
        if let Err(err) = output.attach(&mut child) {
            abandon(&mut child);
            return Err(err);
        }

        Ok(Self {
            pid: child.id(),
            child: Mutex::new(child),
            output,
        })
    }

    pub const fn id(&self) -> u32 {
        self.pid
    }

    /// Non-blocking exit check. Once the child has been reaped this keeps
    /// returning the same status, whichever thread reaped it.
    pub fn try_wait(&self) -> io::Result<Option<ExitStatus>> {
        self.child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_wait()
    }

    /// Polls for exit every [`POLL_INTERVAL`] until `timeout` has elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> io::Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    pub fn signal(&self, signal: Signal) {
        debug!("Sending {:?} to process group {}", signal, self.pid);
        if let Err(err) = imp::signal(self, signal) {
            // the group may already be gone
            debug!("Couldn't signal process group {}: {}", self.pid, err);
        }
    }

    /// Everything the process has written and nobody has taken yet, waiting
    /// up to `settle` for its output streams to close.
    pub fn output(&self, settle: Duration) -> String {
        self.output.settle(settle);
        self.output.take()
    }

    /// Takes what the process has written since the last take, without
    /// waiting. Keeps the buffer from growing for long-lived processes.
    pub fn take_output(&self) -> String {
        self.output.take()
    }
}

/// Kills and reaps a child whose setup failed halfway.
fn abandon(child: &mut Child) {
    if let Err(err) = child.kill() {
        debug!("Couldn't kill pid {}: {}", child.id(), err);
    }
    if let Err(err) = child.wait() {
        debug!("Couldn't reap pid {}: {}", child.id(), err);
    }
}

#[derive(Clone, Default)]
struct OutputBuffer {
    data: Arc<Mutex<Vec<u8>>>,
    open: Arc<AtomicUsize>,
}

impl OutputBuffer {
    fn attach(&self, child: &mut Child) -> io::Result<()> {
        if let Some(stdout) = child.stdout.take() {
            self.capture(stdout)?;
        }
        if let Some(stderr) = child.stderr.take() {
            self.capture(stderr)?;
        }
        Ok(())
    }

    fn capture<R: Read + Send + 'static>(&self, mut stream: R) -> io::Result<()> {
        let buffer = self.clone();
        self.open.fetch_add(1, Ordering::SeqCst);

        let spawned = thread::Builder::new()
            .name("stage-output".into())
            .spawn(move || {
                let mut chunk = [0_u8; 4096];
                loop {
                    match stream.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => buffer
                            .data
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .extend_from_slice(&chunk[..n]),
                        Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                        Err(err) => {
                            debug!("Output stream closed: {}", err);
                            break;
                        }
                    }
                }
                buffer.open.fetch_sub(1, Ordering::SeqCst);
            });

        if let Err(err) = spawned {
            self.open.fetch_sub(1, Ordering::SeqCst);
            return Err(err);
        }
        Ok(())
    }

    fn settle(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while self.open.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Drains the buffer. A multi-byte character cut off at the end stays
    /// behind for the next take.
    fn take(&self) -> String {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let complete = match str::from_utf8(&data) {
            Err(err) if err.error_len().is_none() => err.valid_up_to(),
            _ => data.len(),
        };

        let rest = data.split_off(complete);
        let taken = mem::replace(&mut *data, rest);
        String::from_utf8_lossy(&taken).into_owned()
    }
}

#[cfg(unix)]
mod imp {
    use super::Process;
    use crate::signal::Signal;
    use nix::sys::signal::killpg;
    use nix::unistd::{setsid, Pid};
    use nix::{self, Error};
    use std::convert::TryFrom;
    use std::io;
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    fn from_nix_error(err: nix::Error) -> io::Error {
        match err {
            Error::Sys(errno) => io::Error::from_raw_os_error(errno as i32),
            Error::InvalidPath => io::Error::new(io::ErrorKind::InvalidInput, err),
            _ => io::Error::new(io::ErrorKind::Other, err),
        }
    }

    /// Puts the child in a new session so the whole group can be signalled.
    pub fn isolate(command: &mut Command) {
        unsafe {
            command.pre_exec(|| setsid().map_err(from_nix_error).map(|_| ()));
        }
    }

    pub fn signal(process: &Process, signal: Signal) -> io::Result<()> {
        let pgid = i32::try_from(process.id())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        killpg(Pid::from_raw(pgid), signal.to_nix()).map_err(from_nix_error)
    }
}

#[cfg(not(unix))]
mod imp {
    use super::Process;
    use crate::signal::Signal;
    use std::io;
    use std::process::Command;
    use std::sync::PoisonError;

    pub fn isolate(_command: &mut Command) {}

    /// There is no graceful termination here: both signals kill the child.
    pub fn signal(process: &Process, _signal: Signal) -> io::Result<()> {
        process
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .kill()
    }
}
