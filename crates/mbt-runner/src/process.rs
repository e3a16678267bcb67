use chrono::Utc;
use std::fs;
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service_spawn_failed: {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("service_exited: {command} exited with {status} before becoming ready\n{log_tail}")]
    Exited {
        command: String,
        status: String,
        log_tail: String,
    },
    #[error("service_timeout: {command} not ready after {waited:?}\n{log_tail}")]
    Timeout {
        command: String,
        waited: Duration,
        log_tail: String,
    },
    #[error("service_io: {0}")]
    Io(#[from] std::io::Error),
}

/// A spawned helper process (path engine, test-code service) whose whole
/// process group is interrupted on `kill()` or drop.
#[derive(Debug)]
pub struct ServiceProcess {
    child: Option<Child>,
    command: String,
    log_path: PathBuf,
}

impl ServiceProcess {
    pub fn spawn(command: &[String], working_dir: Option<&Path>, label: &str) -> Result<Self, ServiceError> {
        let command_line = command.join(" ");
        let (program, args) = command.split_first().ok_or_else(|| ServiceError::Spawn {
            command: command_line.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        })?;

        let log_path = std::env::temp_dir().join(format!(
            "mbt_{}_{}_{}.log",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let log = fs::File::create(&log_path)?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(log));
        cmd.stderr(Stdio::from(log_err));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = cmd.spawn().map_err(|source| ServiceError::Spawn {
            command: command_line.clone(),
            source,
        })?;
        info!(pid = child.id(), command = %command_line, log = %log_path.display(), "service spawned");
        Ok(Self {
            child: Some(child),
            command: command_line,
            log_path,
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn read_log(&self) -> String {
        fs::read_to_string(&self.log_path).unwrap_or_default()
    }

    /// Polls `probe` until it reports ready. Exit of the process or the
    /// deadline passing is an error carrying the tail of the log.
    pub fn wait_ready<F>(&mut self, timeout: Duration, mut probe: F) -> Result<(), ServiceError>
    where
        F: FnMut(&Self) -> bool,
    {
        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            if probe(self) {
                debug!(command = %self.command, waited = ?started.elapsed(), "service ready");
                return Ok(());
            }
            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child.try_wait()? {
                    self.child = None;
                    return Err(ServiceError::Exited {
                        command: self.command.clone(),
                        status: status.to_string(),
                        log_tail: self.log_tail(20),
                    });
                }
            }
            if Instant::now() >= deadline {
                return Err(ServiceError::Timeout {
                    command: self.command.clone(),
                    waited: timeout,
                    log_tail: self.log_tail(20),
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Interrupts the process and all of its descendants. Safe to call
    /// repeatedly.
    pub fn kill(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        let pid = child.id();
        signal_group(pid, "-INT");
        let deadline = Instant::now() + KILL_GRACE;
        let mut stopped = false;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    info!(pid, %status, "service stopped");
                    stopped = true;
                    break;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(POLL_INTERVAL),
                _ => break,
            }
        }
        // Background descendants may ignore SIGINT; sweep whatever is left of the group.
        signal_group(pid, "-KILL");
        if !stopped {
            warn!(pid, "service ignored interrupt, killed");
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    fn log_tail(&self, lines: usize) -> String {
        let log = self.read_log();
        let all: Vec<&str> = log.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }
}

impl Drop for ServiceProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: &str) {
    let group = format!("-{}", pid);
    let result = Command::new("kill")
        .args([signal, "--", group.as_str()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(err) = result {
        warn!(pid, signal, error = %err, "failed to signal process group");
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: &str) {}

pub fn free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

pub fn port_accepts(port: u16) -> bool {
    TcpStream::connect(("127.0.0.1", port)).is_ok()
}
