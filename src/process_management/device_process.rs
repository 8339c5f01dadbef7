use log::{debug, error, info, warn};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::error_handling::types::ProcessError;
use crate::process_management::types::DeviceCommand;

const LOG_CHANNEL_CAPACITY: usize = 1024;

/// Lines decoded from a device's combined stdout and stderr.
///
/// The sequence ends once both streams are closed, i.e. when the process
/// exited or was killed. It cannot be restarted.
pub struct LogLines {
    rx: mpsc::Receiver<String>,
}

impl LogLines {
    pub fn new(rx: mpsc::Receiver<String>) -> Self {
        Self { rx }
    }

    /// Waits for the next line; `None` once the process output is closed.
    pub async fn next_line(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// Forwards every non-empty line of `reader` to `tx`.
///
/// Bytes that are not valid UTF-8 are replaced rather than dropping the line.
pub async fn pump_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim().to_string();
                if line.is_empty() {
                    continue;
                }
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Device output closed: {}", e);
                break;
            }
        }
    }
}

/// One spawned device binary running in its own process group.
///
/// Lifecycle: [`execute`](Self::execute) spawns the process and starts the
/// output readers, [`log_lines`](Self::log_lines) hands the output out once,
/// [`stop`](Self::stop) terminates the whole group.
pub struct DeviceProcess {
    command: DeviceCommand,
    child: Option<Child>,
    pgid: Option<i32>,
    lines: Option<LogLines>,
    grace: Duration,
}

impl DeviceProcess {
    pub fn new(command: DeviceCommand, grace: Duration) -> Self {
        Self {
            command,
            child: None,
            pgid: None,
            lines: None,
            grace,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /// Spawns the process without waiting for it.
    pub fn execute(&mut self) -> Result<(), ProcessError> {
        if self.child.is_some() {
            return Err(ProcessError::AlreadyStarted);
        }
        info!("Starting device: {}", self.command.display());

        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            // New session, so the device and anything it forks share one process group.
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(|e| {
            error!(
                "Failed to spawn {}: {}",
                self.command.program.display(),
                e
            );
            ProcessError::SpawnFailed(e.to_string())
        })?;

        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, tx));
        }

        self.pgid = child.id().map(|p| p as i32);
        debug!("Device process group {:?}", self.pgid);
        self.child = Some(child);
        self.lines = Some(LogLines::new(rx));
        Ok(())
    }

    /// Hands out the output stream. Only the first call succeeds.
    pub fn log_lines(&mut self) -> Result<LogLines, ProcessError> {
        self.lines.take().ok_or(ProcessError::LogStreamTaken)
    }

    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Terminates the process group and waits for the process to exit.
    ///
    /// SIGTERM first, SIGKILL once the grace period is over. Calling it on a
    /// process that never started or already exited does nothing.
    pub async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("Device process already exited with {}", status);
                return;
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to query device process state: {}", e),
        }

        if let Some(pgid) = self.pgid {
            signal_group(pgid, Signal::Term);
        }

        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) => info!("Device process stopped ({})", status),
            Ok(Err(e)) => warn!("Failed to wait for device process: {}", e),
            Err(_) => {
                warn!(
                    "Device process ignored SIGTERM for {:?}, killing it",
                    self.grace
                );
                if let Some(pgid) = self.pgid {
                    signal_group(pgid, Signal::Kill);
                }
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill device process: {}", e);
                }
            }
        }
    }
}

impl Drop for DeviceProcess {
    fn drop(&mut self) {
        if let (Some(child), Some(pgid)) = (self.child.as_mut(), self.pgid) {
            if matches!(child.try_wait(), Ok(None)) {
                warn!("Device process group {} dropped while running, killing it", pgid);
                signal_group(pgid, Signal::Kill);
            }
        }
    }
}

enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pgid: i32, signal: Signal) {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    if pgid <= 0 {
        return;
    }
    let rc = unsafe { libc::kill(-pgid, sig) };
    if rc == -1 {
        debug!(
            "Signal {} to group {} failed: {}",
            sig,
            pgid,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: i32, _signal: Signal) {}
