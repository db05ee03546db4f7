//! PTY adapter: spawn, resize, write, and tear down a child shell.
//!
//! A blocking reader thread drains the PTY master and forwards chunks into
//! a tokio channel, so async consumers never touch the blocking PTY API.
//! The child is killed on drop; explicit teardown sends SIGTERM first and
//! escalates to SIGKILL after a grace period.
//!
//! In daemon mode the command is wrapped in a shell that ignores SIGHUP,
//! so the PTY survives the parent's controlling terminal going away.

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::constants::PTY_KILL_GRACE;

/// Events emitted by a running PTY.
#[derive(Debug)]
pub enum PtyEvent {
    /// Raw output bytes from the child.
    Data(Vec<u8>),
    /// The child exited.
    Exit {
        /// Child exit code.
        code: i32,
    },
}

/// What to spawn inside the PTY.
#[derive(Debug, Clone)]
pub struct PtySpawnSpec {
    /// Program to run.
    pub command: String,
    /// Program arguments.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: Option<String>,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
    /// Terminal width.
    pub cols: u16,
    /// Terminal height.
    pub rows: u16,
    /// Wrap the child in a SIGHUP-immune shell.
    pub daemon: bool,
}

/// Handle to a spawned PTY child.
///
/// Single writer, single reader: the owning session manager writes input,
/// the internal thread reads output.
pub struct PtyProcess {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Arc<Mutex<Option<Box<dyn Child + Send + Sync>>>>,
    reader_thread: Option<thread::JoinHandle<()>>,
    pid: Option<u32>,
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl PtyProcess {
    /// Spawn a child process inside a fresh PTY.
    ///
    /// `TERM` is forced to `xterm-256color`; browser-side terminal
    /// emulators assume it.
    ///
    /// # Errors
    ///
    /// Returns an error if the PTY cannot be opened or the command fails
    /// to spawn.
    pub fn spawn(spec: &PtySpawnSpec) -> Result<(Self, UnboundedReceiver<PtyEvent>)> {
        let pty_system = native_pty_system();
        let size = PtySize {
            rows: spec.rows,
            cols: spec.cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let pair = pty_system.openpty(size).context("Failed to open PTY")?;

        let mut cmd = if spec.daemon {
            let mut wrapped = CommandBuilder::new("sh");
            wrapped.arg("-c");
            wrapped.arg(format!(
                "trap '' HUP; exec {}",
                shell_join(&spec.command, &spec.args)
            ));
            wrapped
        } else {
            let mut direct = CommandBuilder::new(&spec.command);
            for arg in &spec.args {
                direct.arg(arg);
            }
            direct
        };

        if let Some(cwd) = &spec.cwd {
            cmd.cwd(Path::new(cwd));
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .context("Failed to spawn PTY child")?;
        let pid = child.process_id();
        drop(pair.slave);

        let writer = pair
            .master
            .take_writer()
            .context("Failed to take PTY writer")?;
        let reader = pair
            .master
            .try_clone_reader()
            .context("Failed to clone PTY reader")?;

        let child = Arc::new(Mutex::new(Some(child)));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let reader_thread = spawn_reader_thread(reader, Arc::clone(&child), event_tx);

        Ok((
            Self {
                master: pair.master,
                writer,
                child,
                reader_thread: Some(reader_thread),
                pid,
            },
            event_rx,
        ))
    }

    /// Write input bytes to the child. Synchronous and backpressured by
    /// the PTY.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn write_input(&mut self, input: &[u8]) -> Result<()> {
        self.writer.write_all(input)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Resize the PTY.
    pub fn resize(&self, cols: u16, rows: u16) {
        let _ = self.master.resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        });
    }

    /// Child process id, when the platform exposes one.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Terminate the child: SIGTERM, a grace period, then SIGKILL.
    ///
    /// Blocks for at most [`PTY_KILL_GRACE`]. Safe to call more than once.
    pub fn kill(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            // SAFETY: plain kill(2) on a pid we spawned; worst case ESRCH.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }

        let deadline = Instant::now() + PTY_KILL_GRACE;
        loop {
            {
                let mut guard = self.child.lock().expect("child lock poisoned");
                let Some(child) = guard.as_mut() else { return };

                match child.try_wait() {
                    Ok(Some(_)) => {
                        guard.take();
                        return;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        log::warn!("PTY child wait failed: {e}");
                        guard.take();
                        return;
                    }
                }

                if Instant::now() >= deadline {
                    log::warn!("PTY child ignored SIGTERM, killing");
                    if let Some(mut child) = guard.take() {
                        let _ = child.kill();
                        let _ = child.wait();
                    }
                    return;
                }
            }
            thread::sleep(std::time::Duration::from_millis(50));
        }
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.kill();
        if let Some(handle) = self.reader_thread.take() {
            // Reader exits on EOF once the child is gone.
            let _ = handle.join();
        }
    }
}

/// Read PTY output on a dedicated thread and forward it as events.
///
/// On EOF the child is reaped and a final `Exit` event is emitted, unless
/// an explicit kill already claimed the child handle.
fn spawn_reader_thread(
    mut reader: Box<dyn Read + Send>,
    child: Arc<Mutex<Option<Box<dyn Child + Send + Sync>>>>,
    event_tx: UnboundedSender<PtyEvent>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if event_tx.send(PtyEvent::Data(buf[..n].to_vec())).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    log::debug!("PTY read ended: {e}");
                    break;
                }
            }
        }

        let code = {
            let mut guard = child.lock().expect("child lock poisoned");
            match guard.as_mut() {
                Some(child) => {
                    let code = child.wait().map(|s| s.exit_code() as i32).unwrap_or(-1);
                    guard.take();
                    Some(code)
                }
                // Killed explicitly; the owner is already tearing down.
                None => None,
            }
        };

        if let Some(code) = code {
            let _ = event_tx.send(PtyEvent::Exit { code });
        }
    })
}

/// Join a command and arguments into a single-quoted shell string.
fn shell_join(command: &str, args: &[String]) -> String {
    let mut parts = vec![shell_quote(command)];
    parts.extend(args.iter().map(|a| shell_quote(a)));
    parts.join(" ")
}

fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:".contains(&b))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}
