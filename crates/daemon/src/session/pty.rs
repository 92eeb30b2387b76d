//! Native pseudo-terminal backend.
//!
//! Spawns the shell on the slave side of a pty pair and reads the merged
//! output stream from the master side on a blocking task.

use std::io::{Read, Write};
use std::time::Duration;

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;

use super::backend::{
    BackendError, BackendEvent, BackendExit, LaunchSpec, Terminator, EVENT_QUEUE_CAPACITY,
};

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// How long the exit notification waits for the reader to drain.
pub(crate) const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// A shell process attached to a pseudo-terminal.
pub struct NativePty {
    /// The PTY master handle.
    master: Box<dyn MasterPty + Send>,

    /// Input queue drained by the writer task; `None` once the pty closed.
    input_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,

    /// Termination capability shared with the provisioning layer.
    terminator: Terminator,

    /// Output and exit events, until taken.
    events: Option<mpsc::Receiver<BackendEvent>>,

    /// Current terminal size.
    cols: u16,
    rows: u16,

    /// Process ID.
    pid: Option<u32>,
}

/// Returns whether this host can open a pseudo-terminal at all.
pub fn probe() -> bool {
    match native_pty_system().openpty(pty_size(1, 1)) {
        Ok(_pair) => true,
        Err(e) => {
            tracing::info!(error = %e, "Native pseudo-terminal unavailable");
            false
        }
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

impl NativePty {
    /// Spawns the shell described by `spec` on a new pseudo-terminal.
    ///
    /// Must be called from within a tokio runtime: the reader and exit
    /// watcher run as runtime tasks.
    pub fn spawn(spec: &LaunchSpec) -> Result<Self, BackendError> {
        let pair = native_pty_system()
            .openpty(pty_size(spec.cols, spec.rows))
            .map_err(|e| BackendError::Spawn(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.args(&spec.args);
        cmd.cwd(&spec.cwd);
        for key in &spec.env_remove {
            cmd.env_remove(key);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| BackendError::Spawn(e.to_string()))?;
        // The slave side must close in this process so EOF reaches the reader.
        drop(pair.slave);

        let pid = child.process_id();
        let terminator = Terminator::native(child.clone_killer());

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| BackendError::Spawn(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| BackendError::Spawn(e.to_string()))?;

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        // Writes to the master block while the child is not reading its
        // input, so they happen on a blocking task fed by a queue.
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        tokio::task::spawn_blocking(move || write_loop(writer, input_rx));

        let reader_task = tokio::task::spawn_blocking({
            let tx = tx.clone();
            move || read_loop(reader, tx)
        });

        let exit_terminator = terminator.clone();
        tokio::spawn(async move {
            let status = tokio::task::spawn_blocking(move || child.wait()).await;
            let exit = match status {
                Ok(Ok(status)) => BackendExit {
                    code: Some(status.exit_code() as i32),
                    signal: None,
                },
                Ok(Err(e)) => {
                    tracing::warn!(pid = ?pid, error = %e, "Failed to wait for PTY child");
                    BackendExit::default()
                }
                Err(e) => {
                    tracing::error!(pid = ?pid, error = %e, "PTY wait task panicked");
                    BackendExit::default()
                }
            };

            if tokio::time::timeout(OUTPUT_DRAIN_GRACE, reader_task)
                .await
                .is_err()
            {
                tracing::debug!(pid = ?pid, "PTY reader still open after exit, not waiting");
            }

            exit_terminator.mark_exited();
            let _ = tx.send(BackendEvent::Exit(exit)).await;
        });

        tracing::debug!(pid = ?pid, program = %spec.program, "Spawned PTY process");

        Ok(Self {
            master: pair.master,
            input_tx: Some(input_tx),
            terminator,
            events: Some(rx),
            cols: spec.cols,
            rows: spec.rows,
            pid,
        })
    }

    /// Returns the process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the current terminal size.
    pub fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }

    /// Queues data for the PTY. A closed pty makes this a no-op.
    pub fn write(&mut self, data: &[u8]) -> Result<(), BackendError> {
        if let Some(input_tx) = &self.input_tx {
            if input_tx.send(data.to_vec()).is_err() {
                tracing::debug!(pid = ?self.pid, "PTY writer closed, dropping input");
                self.input_tx = None;
            }
        }
        Ok(())
    }

    /// Resizes the PTY to the given dimensions.
    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), BackendError> {
        self.master
            .resize(pty_size(cols, rows))
            .map_err(|e| BackendError::Resize(e.to_string()))?;

        self.cols = cols;
        self.rows = rows;

        tracing::debug!(pid = ?self.pid, cols = cols, rows = rows, "Resized PTY");
        Ok(())
    }

    pub(crate) fn terminator(&self) -> Terminator {
        self.terminator.clone()
    }

    pub(crate) fn take_events(&mut self) -> Option<mpsc::Receiver<BackendEvent>> {
        self.events.take()
    }
}

fn read_loop(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<BackendEvent>) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(BackendEvent::Output(buffer[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // EIO once the slave side is gone.
            Err(e) => {
                tracing::trace!(error = %e, "PTY read ended");
                break;
            }
        }
    }
}

fn write_loop(mut writer: Box<dyn Write + Send>, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(data) = rx.blocking_recv() {
        if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
            tracing::debug!(error = %e, "PTY write ended");
            break;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn sh_spec() -> LaunchSpec {
        LaunchSpec {
            program: "/bin/sh".to_string(),
            args: Vec::new(),
            cwd: std::env::temp_dir(),
            env: vec![("TERM".to_string(), "xterm-256color".to_string())],
            env_remove: Vec::new(),
            cols: 80,
            rows: 24,
        }
    }

    async fn collect_until(
        rx: &mut mpsc::Receiver<BackendEvent>,
        marker: &str,
    ) -> (String, Option<BackendExit>) {
        let mut output = String::new();
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Some(BackendEvent::Output(data))) => {
                    output.push_str(&String::from_utf8_lossy(&data));
                    if output.contains(marker) {
                        return (output, None);
                    }
                }
                Ok(Some(BackendEvent::Exit(exit))) => return (output, Some(exit)),
                Ok(None) => break,
                Err(_) => {}
            }
        }
        (output, None)
    }

    #[tokio::test]
    async fn test_pty_spawn_and_output() {
        let mut pty = NativePty::spawn(&sh_spec()).expect("failed to spawn PTY");
        let mut rx = pty.take_events().unwrap();
        assert!(pty.take_events().is_none());
        assert!(pty.pid().is_some());

        pty.write(b"echo native_pty_marker\n").unwrap();
        let (output, _) = collect_until(&mut rx, "native_pty_marker").await;
        assert!(output.contains("native_pty_marker"), "output was: {output:?}");

        pty.terminator().terminate().unwrap();
    }

    #[tokio::test]
    async fn test_pty_resize() {
        let mut pty = NativePty::spawn(&sh_spec()).unwrap();
        assert_eq!(pty.size(), (80, 24));

        pty.resize(120, 40).unwrap();
        assert_eq!(pty.size(), (120, 40));

        pty.terminator().terminate().unwrap();
    }

    #[tokio::test]
    async fn test_pty_exit_code() {
        let mut pty = NativePty::spawn(&sh_spec()).unwrap();
        let mut rx = pty.take_events().unwrap();

        pty.write(b"exit 7\n").unwrap();

        let mut exit = None;
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Some(BackendEvent::Exit(e))) => {
                    exit = Some(e);
                    break;
                }
                Ok(Some(_)) | Err(_) => {}
                Ok(None) => break,
            }
        }

        assert_eq!(exit.map(|e| e.code), Some(Some(7)));
        assert!(pty.terminator().has_exited());
        // Terminating an exited process must not fail.
        assert!(pty.terminator().terminate().is_ok());
    }

    #[tokio::test]
    async fn test_pty_write_does_not_wait_for_reader() {
        let mut spec = sh_spec();
        spec.args = vec!["-c".to_string(), "stty raw -echo; sleep 30".to_string()];
        let mut pty = NativePty::spawn(&spec).unwrap();
        let _rx = pty.take_events().unwrap();

        // Far more than the pty input buffer holds while nobody reads it.
        let writer = tokio::task::spawn_blocking(move || {
            pty.write(&[b'x'; 1_000_000]).unwrap();
            pty.write(b"more").unwrap();
            pty
        });
        let pty = timeout(Duration::from_secs(5), writer)
            .await
            .expect("write blocked on a child that is not reading")
            .unwrap();

        pty.terminator().terminate().unwrap();
    }
}
