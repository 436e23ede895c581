use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::{PtyError, SpawnError};

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 30;

const READ_CHUNK_BYTES: usize = 8 * 1024;
const EVENT_CHANNEL_DEPTH: usize = 64;
/// How long the waiter lets trailing output drain after the shell exits.
const OUTPUT_LINGER: Duration = Duration::from_millis(250);
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything needed to launch one shell inside a fresh pty.
///
/// The environment is always explicit: the child sees exactly `env`, nothing
/// is inherited behind the caller's back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnConfig {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

impl SpawnConfig {
    /// A config for `program` with an empty environment and the default size.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Copies the current process environment into the config. Entries already
    /// present are kept.
    pub fn with_host_env(mut self) -> Self {
        for (key, value) in std::env::vars() {
            self.env.entry(key).or_insert(value);
        }
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }
}

impl Default for SpawnConfig {
    fn default() -> Self {
        let mut config = SpawnConfig::new(default_shell()).with_host_env();
        config.cwd = home_dir();
        config
    }
}

/// `$SHELL` when set, otherwise `/bin/sh` (`%COMSPEC%` / `cmd.exe` on Windows).
pub fn default_shell() -> String {
    if let Ok(shell) = std::env::var("SHELL") {
        if !shell.trim().is_empty() {
            return shell;
        }
    }
    if cfg!(windows) {
        if let Ok(comspec) = std::env::var("COMSPEC") {
            if !comspec.trim().is_empty() {
                return comspec;
            }
        }
        return "cmd.exe".into();
    }
    "/bin/sh".into()
}

pub fn home_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf())
}

/// Events produced by a session, in pty order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    Output(Vec<u8>),
    /// The shell process exited (on its own or through `destroy`). Always the
    /// last event, even when a background job still holds the pty open.
    Exited,
}

/// Shared between the reader and waiter threads. Whoever takes the sender out
/// ends the stream, so nothing can follow `Exited`.
type EventSink = Arc<Mutex<Option<mpsc::Sender<PtyEvent>>>>;

/// One-shot flag that threads can block on with a deadline.
#[derive(Default)]
struct Latch {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    fn set(&self) {
        *self.set.lock() = true;
        self.cond.notify_all();
    }

    fn is_set(&self) -> bool {
        *self.set.lock()
    }

    /// Returns whether the latch was set before `timeout` ran out.
    fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut set = self.set.lock();
        while !*set {
            if self.cond.wait_until(&mut set, deadline).timed_out() {
                break;
            }
        }
        *set
    }
}

struct PtyIo {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
}

/// One shell running inside one pseudoterminal.
///
/// Writes and resizes share the `io` lock, so a resize never lands in the
/// middle of a write and the recorded size always matches what the kernel was
/// last told. The child itself lives on a waiter thread that reports its exit;
/// the session only keeps a killer. Taking the killer out of its `Option` is
/// what makes `destroy` idempotent.
pub struct PtySession {
    io: Mutex<Option<PtyIo>>,
    killer: Mutex<Option<Box<dyn ChildKiller + Send + Sync>>>,
    exited: Arc<Latch>,
    last_size: Mutex<(u16, u16)>,
    pid: Option<u32>,
    program: String,
}

impl PtySession {
    /// Spawns the shell and starts pumping its output into the returned
    /// channel. Output is buffered in the channel until the caller reads it.
    pub fn spawn(config: &SpawnConfig) -> Result<(Self, mpsc::Receiver<PtyEvent>), SpawnError> {
        if config.cols == 0 || config.rows == 0 {
            return Err(SpawnError::InvalidSize {
                cols: config.cols,
                rows: config.rows,
            });
        }
        if let Some(cwd) = &config.cwd {
            if !cwd.is_dir() {
                return Err(SpawnError::MissingCwd(cwd.clone()));
            }
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(config.cols, config.rows))
            .map_err(|err| SpawnError::OpenPty(err.to_string()))?;

        let cmd = build_command(config);
        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|err| SpawnError::Spawn {
                program: config.program.clone(),
                reason: err.to_string(),
            })?;
        // Only the child keeps the slave open, so the reader sees EOF when it exits.
        drop(pair.slave);

        let attached = pair
            .master
            .take_writer()
            .and_then(|writer| Ok((writer, pair.master.try_clone_reader()?)));
        let (writer, reader) = match attached {
            Ok(handles) => handles,
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SpawnError::Attach(err.to_string()));
            }
        };

        let pid = child.process_id();
        let mut killer = child.clone_killer();
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let events: EventSink = Arc::new(Mutex::new(Some(tx)));
        let exited = Arc::new(Latch::default());
        let reader_done = Arc::new(Latch::default());

        let waiter = {
            let events = Arc::clone(&events);
            let exited = Arc::clone(&exited);
            let reader_done = Arc::clone(&reader_done);
            thread::Builder::new()
                .name(thread_name("pty-waiter", pid))
                .spawn(move || watch_child(child, events, exited, reader_done))
        };
        if let Err(err) = waiter {
            // The closure, and the child with it, is gone; stop the process by pid.
            let _ = killer.kill();
            return Err(SpawnError::ReaderThread(err));
        }

        let session = PtySession {
            io: Mutex::new(Some(PtyIo {
                master: pair.master,
                writer,
            })),
            killer: Mutex::new(Some(killer)),
            exited,
            last_size: Mutex::new((config.cols, config.rows)),
            pid,
            program: config.program.clone(),
        };

        // From here on an early return drops `session`, which kills the child.
        thread::Builder::new()
            .name(thread_name("pty-reader", pid))
            .spawn(move || pump_output(reader, events, reader_done))?;

        debug!(
            program = %config.program,
            pid = ?pid,
            cols = config.cols,
            rows = config.rows,
            "pty session spawned"
        );
        Ok((session, rx))
    }

    /// Forwards raw bytes to the shell's stdin.
    pub fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        let mut io = self.io.lock();
        match io.as_mut() {
            Some(io) => {
                io.writer.write_all(data)?;
                io.writer.flush()?;
                Ok(())
            }
            None => Err(PtyError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "pty session destroyed",
            ))),
        }
    }

    /// Tells the pty about a new size. A destroyed session ignores the call.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        if cols == 0 || rows == 0 {
            return Err(PtyError::InvalidSize { cols, rows });
        }
        let mut io = self.io.lock();
        let Some(io) = io.as_mut() else {
            trace!(cols, rows, "resize ignored, session already destroyed");
            return Ok(());
        };
        io.master
            .resize(pty_size(cols, rows))
            .map_err(|err| PtyError::Resize(err.to_string()))?;
        // Still under the io lock, so readers never see a size the pty was not given.
        *self.last_size.lock() = (cols, rows);
        Ok(())
    }

    /// Kills the child, waits for the waiter thread to reap it and releases
    /// the pty. Returns `true` only for the call that actually tore the
    /// session down.
    pub fn destroy(&self) -> bool {
        let Some(mut killer) = self.killer.lock().take() else {
            return false;
        };
        if !self.exited.is_set() {
            if let Err(err) = killer.kill() {
                trace!(pid = ?self.pid, error = %err, "kill on pty child failed");
            }
            if !self.exited.wait_for(REAP_TIMEOUT) {
                warn!(pid = ?self.pid, "pty child still running after kill");
            }
        }
        // Dropping the master hangs up the pty for anything still attached.
        drop(self.io.lock().take());
        true
    }

    pub fn is_destroyed(&self) -> bool {
        self.killer.lock().is_none()
    }

    /// Whether the shell process has exited and been reaped.
    pub fn has_exited(&self) -> bool {
        self.exited.is_set()
    }

    /// Current `(cols, rows)`. Survives `destroy`.
    pub fn size(&self) -> (u16, u16) {
        *self.last_size.lock()
    }

    pub fn process_id(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (cols, rows) = self.size();
        f.debug_struct("PtySession")
            .field("program", &self.program)
            .field("pid", &self.pid)
            .field("cols", &cols)
            .field("rows", &rows)
            .field("destroyed", &self.is_destroyed())
            .finish()
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

fn build_command(config: &SpawnConfig) -> CommandBuilder {
    let mut cmd = CommandBuilder::new(&config.program);
    cmd.args(&config.args);
    cmd.env_clear();
    for (key, value) in &config.env {
        cmd.env(key, value);
    }
    if !config.env.contains_key("TERM") {
        cmd.env("TERM", "xterm-256color");
    }
    if let Some(cwd) = &config.cwd {
        cmd.cwd(cwd);
    }
    cmd
}

fn thread_name(prefix: &str, pid: Option<u32>) -> String {
    match pid {
        Some(pid) => format!("{prefix}-{pid}"),
        None => prefix.to_string(),
    }
}

fn watch_child(
    mut child: Box<dyn Child + Send + Sync>,
    events: EventSink,
    exited: Arc<Latch>,
    reader_done: Arc<Latch>,
) {
    let pid = child.process_id();
    match child.wait() {
        Ok(status) => debug!(pid = ?pid, exit_code = status.exit_code(), "pty child exited"),
        Err(err) => warn!(pid = ?pid, error = %err, "failed to wait on pty child"),
    }
    exited.set();

    // Let the reader forward what the shell printed last. A background job
    // can keep the pty open indefinitely, so this is bounded.
    if !reader_done.wait_for(OUTPUT_LINGER) {
        debug!(pid = ?pid, "pty still held open after shell exit");
    }
    if let Some(tx) = events.lock().take() {
        let _ = tx.blocking_send(PtyEvent::Exited);
    }
}

fn pump_output(mut reader: Box<dyn Read + Send>, events: EventSink, done: Arc<Latch>) {
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let sink = events.lock();
                let Some(tx) = sink.as_ref() else {
                    trace!("session already reported exit; reader exiting");
                    break;
                };
                if tx.blocking_send(PtyEvent::Output(buf[..n].to_vec())).is_err() {
                    trace!("pty output receiver dropped; reader exiting");
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                // Linux reports EIO once the slave side is gone.
                trace!(error = %err, "pty read ended");
                break;
            }
        }
    }
    done.set();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh() -> SpawnConfig {
        SpawnConfig::new("/bin/sh")
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .env("PS1", "$ ")
            .env("TERM", "dumb")
    }

    #[test]
    fn spawn_config_keeps_explicit_env_over_host_env() {
        let config = SpawnConfig::new("/bin/sh")
            .env("PATH", "/nowhere")
            .with_host_env();
        assert_eq!(config.env.get("PATH").map(String::as_str), Some("/nowhere"));
        assert_eq!((config.cols, config.rows), (DEFAULT_COLS, DEFAULT_ROWS));
    }

    #[test]
    fn zero_size_is_rejected_before_spawning() {
        let err = PtySession::spawn(&sh().size(0, 24)).unwrap_err();
        assert!(matches!(err, SpawnError::InvalidSize { cols: 0, rows: 24 }));
    }

    #[test]
    fn missing_cwd_is_a_spawn_error() {
        let err = PtySession::spawn(&sh().cwd("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, SpawnError::MissingCwd(_)));
    }

    #[test]
    fn missing_shell_binary_is_a_spawn_error() {
        let err = PtySession::spawn(&SpawnConfig::new("/no/such/shell")).unwrap_err();
        match err {
            SpawnError::Spawn { program, .. } => assert_eq!(program, "/no/such/shell"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    fn wait_for_exit(rx: &mut mpsc::Receiver<PtyEvent>, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            match rx.try_recv() {
                Ok(PtyEvent::Exited) => return true,
                Ok(PtyEvent::Output(_)) => {}
                Err(mpsc::error::TryRecvError::Empty) => thread::sleep(Duration::from_millis(20)),
                Err(mpsc::error::TryRecvError::Disconnected) => return false,
            }
        }
        false
    }

    #[test]
    fn exit_is_reported_while_a_background_job_holds_the_pty() {
        let (session, mut rx) = PtySession::spawn(&sh()).expect("spawn sh");
        session.write(b"sleep 30 &\nexit\n").expect("write");

        assert!(wait_for_exit(&mut rx, Duration::from_secs(5)));
        assert!(session.has_exited());
        assert!(session.destroy());
        // Nothing may follow the exit event.
        thread::sleep(Duration::from_millis(100));
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn destroy_reports_exit_to_the_event_stream() {
        let (session, mut rx) = PtySession::spawn(&sh()).expect("spawn sh");
        assert!(session.destroy());
        assert!(session.has_exited());
        assert!(wait_for_exit(&mut rx, Duration::from_secs(5)));
    }

    #[test]
    fn destroy_is_idempotent() {
        let (session, _rx) = PtySession::spawn(&sh()).expect("spawn sh");
        assert!(!session.is_destroyed());
        assert!(session.destroy());
        assert!(!session.destroy());
        assert!(session.is_destroyed());
        // Resize after destroy is silently ignored.
        session.resize(100, 50).expect("resize after destroy");
        assert_eq!(session.size(), (DEFAULT_COLS, DEFAULT_ROWS));
    }

    #[test]
    fn resize_rejects_zero_and_records_valid_size() {
        let (session, _rx) = PtySession::spawn(&sh()).expect("spawn sh");
        assert!(matches!(
            session.resize(0, 10),
            Err(PtyError::InvalidSize { cols: 0, rows: 10 })
        ));
        session.resize(132, 43).expect("resize");
        assert_eq!(session.size(), (132, 43));
    }

    #[test]
    fn write_after_destroy_fails() {
        let (session, _rx) = PtySession::spawn(&sh()).expect("spawn sh");
        session.destroy();
        assert!(session.write(b"echo hi\n").is_err());
    }
}
