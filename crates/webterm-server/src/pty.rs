//! Shell processes running under a PTY.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, ExitStatus, MasterPty, PtySize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("pty is closed")]
    Closed,
    #[error("failed to spawn shell: {0}")]
    Spawn(String),
    #[error("pty i/o failed: {0}")]
    Io(String),
    #[error("invalid signal number: {0}")]
    InvalidSignal(u8),
}

impl From<std::io::Error> for PtyError {
    fn from(err: std::io::Error) -> Self {
        PtyError::Io(err.to_string())
    }
}

/// The shell the child runs: `$SHELL` (falling back to `/bin/bash`) on
/// POSIX, `cmd.exe` on Windows.
fn default_shell() -> String {
    if cfg!(windows) {
        "cmd.exe".to_string()
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// One shell child attached to a PTY master.
///
/// The handle owns the child, the master, and a cancellation token that
/// fires when the handle closes. `close` is idempotent; every other
/// operation fails with [`PtyError::Closed`] afterwards. Reads run on a
/// reader cloned out via [`PtyHandle::output_reader`] so that closing the
/// master is what unblocks them.
pub struct PtyHandle {
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
    pid: Option<u32>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl PtyHandle {
    /// Spawn the platform shell under a new PTY of the given size. The
    /// child inherits the parent's environment. Both dimensions must be
    /// nonzero; callers using the implicit default pass (80, 24).
    pub fn open(cols: u16, rows: u16) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(cols, rows))
            .map_err(|e| PtyError::Spawn(e.to_string()))?;

        let shell = default_shell();
        let cmd = CommandBuilder::new(&shell);
        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        // The slave must not outlive the spawn or the master never sees EOF.
        drop(pair.slave);

        let pid = child.process_id();
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Spawn(e.to_string()))?;

        debug!(%shell, pid, cols, rows, "spawned shell under pty");

        Ok(Self {
            master: Mutex::new(Some(pair.master)),
            writer: Mutex::new(Some(writer)),
            child: Mutex::new(Some(child)),
            pid,
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    /// Clone a blocking reader for the master's output stream. The reader
    /// returns EOF (or an error) once the child exits and the master closes.
    pub fn output_reader(&self) -> Result<Box<dyn Read + Send>, PtyError> {
        if self.is_closed() {
            return Err(PtyError::Closed);
        }
        self.master
            .lock()
            .as_ref()
            .ok_or(PtyError::Closed)?
            .try_clone_reader()
            .map_err(|e| PtyError::Io(e.to_string()))
    }

    /// Write the whole buffer to the child's input and flush.
    pub fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        if self.is_closed() {
            return Err(PtyError::Closed);
        }
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(PtyError::Closed)?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// Apply a new window size. The kernel raises SIGWINCH in the child.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        if self.is_closed() {
            return Err(PtyError::Closed);
        }
        self.master
            .lock()
            .as_ref()
            .ok_or(PtyError::Closed)?
            .resize(pty_size(cols, rows))
            .map_err(|e| PtyError::Io(e.to_string()))
    }

    /// Deliver a signal to the child. On Windows there is no equivalent of
    /// the POSIX signal set, so any signal terminates the child.
    pub fn signal(&self, signum: u8) -> Result<(), PtyError> {
        if self.is_closed() {
            return Err(PtyError::Closed);
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            let signal = Signal::try_from(i32::from(signum))
                .map_err(|_| PtyError::InvalidSignal(signum))?;
            let pid = self.pid.ok_or(PtyError::Closed)?;
            kill(Pid::from_raw(pid as i32), signal).map_err(|e| PtyError::Io(e.to_string()))
        }

        #[cfg(windows)]
        {
            let mut guard = self.child.lock();
            let child = guard.as_mut().ok_or(PtyError::Closed)?;
            child.kill().map_err(PtyError::from)
        }
    }

    /// Close the handle: release the master, ask the child to terminate
    /// (SIGTERM on POSIX, kill on Windows), and fire the lifetime token.
    /// Idempotent; returns without waiting for the child to exit.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Dropping the master closes its descriptor, which unblocks any
        // outstanding read with EOF/EIO once the child is gone.
        drop(self.writer.lock().take());
        drop(self.master.lock().take());

        let mut guard = self.child.lock();
        if let Some(child) = guard.as_mut() {
            #[cfg(unix)]
            {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;
                if let Some(pid) = self.pid {
                    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                }
            }
            #[cfg(windows)]
            {
                let _ = child.kill();
            }
            // Reap if it already exited so it doesn't linger as a zombie.
            let _ = child.try_wait();
        }
        drop(guard);

        self.cancel.cancel();
        debug!(pid = self.pid, "pty closed");
    }

    /// Block until the child exits and return its status. One-shot; safe to
    /// call after `close`. Callers on the async side should wrap this in
    /// `spawn_blocking`.
    pub fn wait(&self) -> Result<ExitStatus, PtyError> {
        let mut child = self.child.lock().take().ok_or(PtyError::Closed)?;
        child.wait().map_err(PtyError::from)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves when the handle has been closed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn read_until(handle: &PtyHandle, needle: &str, deadline: Duration) -> String {
        let mut reader = handle.output_reader().expect("clone reader");
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let mut output = String::new();
        let start = std::time::Instant::now();
        while start.elapsed() < deadline {
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(chunk) => {
                    output.push_str(&String::from_utf8_lossy(&chunk));
                    if output.contains(needle) {
                        return output;
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        output
    }

    #[test]
    fn shell_echoes_written_input() {
        let handle = PtyHandle::open(80, 24).expect("open pty");
        handle.write(b"echo marker123\n").expect("write");
        let output = read_until(&handle, "marker123", Duration::from_secs(5));
        assert!(
            output.contains("marker123"),
            "expected marker in output, got: {output:?}"
        );
        handle.close();
    }

    #[test]
    fn resize_succeeds_while_live() {
        let handle = PtyHandle::open(80, 24).expect("open pty");
        handle.resize(132, 50).expect("resize");
        handle.resize(40, 10).expect("resize smaller");
        handle.close();
    }

    #[test]
    fn operations_fail_after_close() {
        let handle = PtyHandle::open(80, 24).expect("open pty");
        handle.close();
        handle.close(); // idempotent

        assert!(matches!(handle.write(b"x"), Err(PtyError::Closed)));
        assert!(matches!(handle.resize(10, 10), Err(PtyError::Closed)));
        assert!(matches!(handle.signal(15), Err(PtyError::Closed)));
        assert!(matches!(handle.output_reader(), Err(PtyError::Closed)));
        assert!(handle.is_closed());
    }

    #[test]
    fn wait_returns_after_exit() {
        let handle = PtyHandle::open(80, 24).expect("open pty");
        handle.write(b"exit\n").expect("write exit");
        let status = handle.wait().expect("wait");
        assert!(status.success(), "shell should exit cleanly: {status:?}");
    }

    #[test]
    fn close_fires_lifetime_token() {
        let handle = PtyHandle::open(80, 24).expect("open pty");
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        handle.close();
        runtime.block_on(async {
            tokio::time::timeout(Duration::from_secs(1), handle.closed())
                .await
                .expect("token should fire on close");
        });
    }
}
