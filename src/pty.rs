//! PTY session management.
//!
//! A [`PtySession`] owns one pseudo-terminal: the master file descriptor,
//! the child process handle, and a detached reader thread that fans each
//! chunk out to the terminal parser, the raw ring buffer, and the
//! notification detector. The reader is the sole writer to those
//! structures; everyone else snapshots through the session's locks.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;

use crate::constants::{PTY_KILL_GRACE, PTY_RAW_RING_BYTES};
use crate::ring_buffer::RingBuffer;
use crate::terminal::{detect_notifications, Notification, TerminalParser};

/// Errors surfaced by PTY operations.
#[derive(Debug, Error)]
pub enum PtyError {
    /// The child process could not be started.
    #[error("failed to spawn PTY command: {0}")]
    SpawnFailed(String),
    /// The PTY has already reached EOF; writes are dropped.
    #[error("PTY is closed")]
    Closed,
    /// Underlying I/O failure on the master fd.
    #[error("PTY I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A running process under a pseudo-terminal.
pub struct PtySession {
    master: Option<Box<dyn MasterPty + Send>>,
    writer: Option<Box<dyn Write + Send>>,
    reader_thread: Option<thread::JoinHandle<()>>,
    child: Option<Box<dyn Child + Send>>,
    child_pid: Option<u32>,
    parser: Arc<Mutex<TerminalParser>>,
    raw: Arc<Mutex<RingBuffer>>,
    saw_output: Arc<AtomicBool>,
    eof: Arc<AtomicBool>,
    closed: bool,
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySession")
            .field("child_pid", &self.child_pid)
            .field("eof", &self.eof.load(Ordering::Relaxed))
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl PtySession {
    /// Spawn `command` under a new PTY at the given size.
    ///
    /// `command` is split on whitespace; the first token is the program.
    /// `TERM=xterm-256color` is set unless the caller overrides it. Detected
    /// OSC notifications are forwarded on `notification_tx`.
    pub fn spawn(
        command: &str,
        cwd: &Path,
        env: &HashMap<String, String>,
        rows: u16,
        cols: u16,
        notification_tx: Sender<Notification>,
    ) -> Result<Self, PtyError> {
        let parts: Vec<&str> = command.split_whitespace().collect();
        if parts.is_empty() {
            return Err(PtyError::SpawnFailed("empty command".to_string()));
        }

        let pty_system = native_pty_system();
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let pair = pty_system
            .openpty(size)
            .map_err(|e| PtyError::SpawnFailed(format!("openpty: {e}")))?;

        let mut cmd = CommandBuilder::new(parts[0]);
        for arg in &parts[1..] {
            cmd.arg(arg);
        }
        cmd.cwd(cwd);
        if !env.contains_key("TERM") {
            cmd.env("TERM", "xterm-256color");
        }
        for (key, value) in env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        let child_pid = child.process_id();

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(format!("clone reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(format!("take writer: {e}")))?;

        let parser = Arc::new(Mutex::new(TerminalParser::new(rows, cols)));
        let raw = Arc::new(Mutex::new(RingBuffer::new(PTY_RAW_RING_BYTES)));
        let saw_output = Arc::new(AtomicBool::new(false));
        let eof = Arc::new(AtomicBool::new(false));

        let reader_parser = Arc::clone(&parser);
        let reader_raw = Arc::clone(&raw);
        let reader_saw_output = Arc::clone(&saw_output);
        let reader_eof = Arc::clone(&eof);

        let reader_thread = thread::spawn(move || {
            log::debug!("PTY reader thread started (pid {:?})", child_pid);
            let mut buf = [0u8; 4096];

            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        reader_saw_output.store(true, Ordering::Relaxed);

                        for notification in detect_notifications(&buf[..n]) {
                            let _ = notification_tx.send(notification);
                        }

                        {
                            let mut parser = reader_parser.lock().unwrap();
                            parser.feed(&buf[..n]);
                        }
                        {
                            let mut raw = reader_raw.lock().unwrap();
                            raw.push(&buf[..n]);
                        }
                    }
                    Err(e) => {
                        log::debug!("PTY read error (pid {:?}): {}", child_pid, e);
                        break;
                    }
                }
            }

            reader_eof.store(true, Ordering::Relaxed);
            log::debug!("PTY reader thread exiting (pid {:?})", child_pid);
        });

        Ok(Self {
            master: Some(pair.master),
            writer: Some(writer),
            reader_thread: Some(reader_thread),
            child: Some(child),
            child_pid,
            parser,
            raw,
            saw_output,
            eof,
            closed: false,
        })
    }

    /// Write input bytes to the PTY.
    ///
    /// Returns [`PtyError::Closed`] after the child has exited; callers
    /// treat that as non-fatal.
    pub fn write(&mut self, input: &[u8]) -> Result<(), PtyError> {
        if self.eof.load(Ordering::Relaxed) || self.closed {
            return Err(PtyError::Closed);
        }
        let Some(writer) = self.writer.as_mut() else {
            return Err(PtyError::Closed);
        };
        writer.write_all(input)?;
        writer.flush()?;
        Ok(())
    }

    /// Resize the PTY winsize and the terminal parser together.
    pub fn resize(&self, rows: u16, cols: u16) {
        let rows = rows.max(1);
        let cols = cols.max(1);
        {
            let mut parser = self.parser.lock().unwrap();
            parser.resize(rows, cols);
        }
        if let Some(master) = &self.master {
            let _ = master.resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            });
        }
    }

    /// Return and clear the raw output buffer (byte-fidelity streaming).
    #[must_use]
    pub fn drain_raw(&self) -> Vec<u8> {
        self.raw.lock().unwrap().drain()
    }

    /// Shared handle to this session's terminal parser.
    #[must_use]
    pub fn parser(&self) -> Arc<Mutex<TerminalParser>> {
        Arc::clone(&self.parser)
    }

    /// True once the child has produced any output.
    #[must_use]
    pub fn saw_output(&self) -> bool {
        self.saw_output.load(Ordering::Relaxed)
    }

    /// True once the reader hit EOF (child exited or fd closed).
    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.eof.load(Ordering::Relaxed)
    }

    /// Non-blocking exit check. Returns the exit code once the child has
    /// terminated.
    pub fn try_exit_code(&mut self) -> Option<u32> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.exit_code()),
            Ok(None) => None,
            Err(e) => {
                log::warn!("try_wait failed (pid {:?}): {}", self.child_pid, e);
                None
            }
        }
    }

    /// Terminate the child: SIGTERM, up to 2 s grace, then SIGKILL.
    /// Idempotent; closes the master fd and joins the reader.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(mut child) = self.child.take() {
            let already_dead = matches!(child.try_wait(), Ok(Some(_)));

            if !already_dead {
                #[cfg(unix)]
                if let Some(pid) = self.child_pid {
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    }
                }

                let deadline = Instant::now() + PTY_KILL_GRACE;
                let mut exited = false;
                while Instant::now() < deadline {
                    if matches!(child.try_wait(), Ok(Some(_))) {
                        exited = true;
                        break;
                    }
                    thread::sleep(Duration::from_millis(50));
                }

                if !exited {
                    log::info!(
                        "PTY child {:?} ignored SIGTERM, escalating to kill",
                        self.child_pid
                    );
                    if let Err(e) = child.kill() {
                        log::warn!("failed to kill PTY child: {}", e);
                    }
                }
            }

            // Reap to avoid zombies.
            let _ = child.wait();
        }

        // Dropping writer/master closes the fds, which unblocks the reader.
        self.writer = None;
        self.master = None;

        if let Some(handle) = self.reader_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    /// Commands are whitespace-split, so multi-word shell bodies go
    /// through a script file.
    fn spawn_script(dir: &tempfile::TempDir, body: &str) -> PtySession {
        let script = dir.path().join("test.sh");
        std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        let (tx, _rx) = mpsc::channel();
        PtySession::spawn(
            &format!("sh {}", script.display()),
            dir.path(),
            &HashMap::new(),
            24,
            80,
            tx,
        )
        .expect("spawn sh")
    }

    #[test]
    fn test_spawn_empty_command_fails() {
        let (tx, _rx) = mpsc::channel();
        let result =
            PtySession::spawn("", Path::new("/tmp"), &HashMap::new(), 24, 80, tx);
        assert!(matches!(result, Err(PtyError::SpawnFailed(_))));
    }

    #[test]
    fn test_spawn_missing_binary_fails() {
        let (tx, _rx) = mpsc::channel();
        let result = PtySession::spawn(
            "/nonexistent/binary-that-is-not-here",
            Path::new("/tmp"),
            &HashMap::new(),
            24,
            80,
            tx,
        );
        // portable-pty may report spawn failure either at spawn time or as
        // an immediate EOF depending on platform; both are acceptable.
        if let Ok(mut session) = result {
            std::thread::sleep(Duration::from_millis(500));
            assert!(session.is_eof() || session.try_exit_code().is_some());
            session.close();
        }
    }

    #[test]
    fn test_output_reaches_parser_and_raw_buffer() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut session = spawn_script(&dir, "echo marker-xyz; sleep 5");

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = false;
        while Instant::now() < deadline {
            let text = session.parser().lock().unwrap().rows_text().join("\n");
            if text.contains("marker-xyz") {
                seen = true;
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        assert!(seen, "child output never reached the parser");
        assert!(session.saw_output());

        let raw = session.drain_raw();
        assert!(!raw.is_empty());
        // Drain clears.
        assert!(session.drain_raw().is_empty() || !session.is_eof());

        session.close();
    }

    #[test]
    fn test_exit_code_observed() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut session = spawn_script(&dir, "exit 3");
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut code = None;
        while Instant::now() < deadline {
            if let Some(c) = session.try_exit_code() {
                code = Some(c);
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(code, Some(3));
    }

    #[test]
    fn test_close_is_idempotent_and_write_after_close_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut session = spawn_script(&dir, "sleep 30");
        session.close();
        session.close();
        assert!(matches!(session.write(b"x"), Err(PtyError::Closed)));
    }
}
