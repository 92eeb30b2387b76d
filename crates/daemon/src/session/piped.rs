//! Fallback backend: a plain child process with piped stdio.
//!
//! Used when the host cannot provide a pseudo-terminal. stdout and stderr
//! are read on separate pipes and both forwarded as terminal output. There
//! is no terminal geometry, so resize requests are recorded and otherwise
//! ignored.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::backend::{
    BackendError, BackendEvent, BackendExit, LaunchSpec, Terminator, EVENT_QUEUE_CAPACITY,
};
use super::pty::OUTPUT_DRAIN_GRACE;

/// Buffer size for reading from the output pipes.
const READ_BUFFER_SIZE: usize = 4096;

/// Time allowed after a polite termination request before killing outright.
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

/// A shell process attached to plain pipes.
pub struct PipedProcess {
    /// Input queue drained by the stdin writer task; `None` once the pipe closed.
    stdin_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,

    /// Termination capability shared with the provisioning layer.
    terminator: Terminator,

    /// Output and exit events, until taken.
    events: Option<mpsc::Receiver<BackendEvent>>,

    /// Last requested terminal size.
    cols: u16,
    rows: u16,

    /// Process ID.
    pid: Option<u32>,
}

impl PipedProcess {
    /// Spawns the shell described by `spec` with piped stdio.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(spec: &LaunchSpec) -> Result<Self, BackendError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in &spec.env_remove {
            cmd.env_remove(key);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| BackendError::Spawn(e.to_string()))?;
        let pid = child.id();

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_output(stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_output(stderr, tx.clone())));
        }

        let stdin_tx = child.stdin.take().map(|stdin| {
            let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
            tokio::spawn(forward_input(stdin, stdin_rx));
            stdin_tx
        });

        let token = CancellationToken::new();
        let terminator = Terminator::fallback(token.clone());

        let exit_terminator = terminator.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = token.cancelled() => stop_child(&mut child).await,
            };
            let exit = match status {
                Ok(status) => exit_from_status(status),
                Err(e) => {
                    tracing::warn!(pid = ?pid, error = %e, "Failed to wait for child process");
                    BackendExit::default()
                }
            };

            let drained = futures_util::future::join_all(readers);
            if tokio::time::timeout(OUTPUT_DRAIN_GRACE, drained).await.is_err() {
                tracing::debug!(pid = ?pid, "Output pipes still open after exit, not waiting");
            }

            exit_terminator.mark_exited();
            let _ = tx.send(BackendEvent::Exit(exit)).await;
        });

        tracing::debug!(pid = ?pid, program = %spec.program, "Spawned piped process");

        Ok(Self {
            stdin_tx,
            terminator,
            events: Some(rx),
            cols: spec.cols,
            rows: spec.rows,
            pid,
        })
    }

    /// Returns the process ID, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the last requested terminal size.
    pub fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }

    /// Queues data for the process input. A closed pipe makes this a no-op.
    pub fn write(&mut self, data: &[u8]) -> Result<(), BackendError> {
        if let Some(stdin_tx) = &self.stdin_tx {
            if stdin_tx.send(data.to_vec()).is_err() {
                tracing::debug!(pid = ?self.pid, "stdin pipe closed, dropping input");
                self.stdin_tx = None;
            }
        }
        Ok(())
    }

    /// Records the requested size. Plain pipes have no terminal geometry.
    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), BackendError> {
        self.cols = cols;
        self.rows = rows;
        tracing::trace!(
            pid = ?self.pid,
            cols = cols,
            rows = rows,
            "Resize ignored by piped backend"
        );
        Ok(())
    }

    pub(crate) fn terminator(&self) -> Terminator {
        self.terminator.clone()
    }

    pub(crate) fn take_events(&mut self) -> Option<mpsc::Receiver<BackendEvent>> {
        self.events.take()
    }
}

async fn forward_output<R>(mut pipe: R, tx: mpsc::Sender<BackendEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match pipe.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(BackendEvent::Output(buffer[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::trace!(error = %e, "Output pipe read ended");
                break;
            }
        }
    }
}

async fn forward_input(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(data) = rx.recv().await {
        if let Err(e) = stdin.write_all(&data).await {
            tracing::debug!(error = %e, "stdin pipe closed");
            break;
        }
        if stdin.flush().await.is_err() {
            break;
        }
    }
}

/// Asks the child to exit, then kills it if it has not done so in time.
async fn stop_child(child: &mut Child) -> std::io::Result<std::process::ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::debug!(pid = pid, error = %e, "SIGTERM failed");
        }
        if let Ok(status) = tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
            return status;
        }
    }

    child.start_kill()?;
    child.wait().await
}

fn exit_from_status(status: std::process::ExitStatus) -> BackendExit {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    BackendExit {
        code: status.code(),
        signal,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn spec(program: &str) -> LaunchSpec {
        LaunchSpec {
            program: program.to_string(),
            args: Vec::new(),
            cwd: std::env::temp_dir(),
            env: vec![("SHELLMUX_TEST".to_string(), "piped_env_value".to_string())],
            env_remove: Vec::new(),
            cols: 80,
            rows: 30,
        }
    }

    async fn next_exit(rx: &mut mpsc::Receiver<BackendEvent>) -> Option<BackendExit> {
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Some(BackendEvent::Exit(exit))) => return Some(exit),
                Ok(Some(_)) | Err(_) => {}
                Ok(None) => return None,
            }
        }
        None
    }

    async fn read_until(rx: &mut mpsc::Receiver<BackendEvent>, marker: &str) -> String {
        let mut output = String::new();
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Some(BackendEvent::Output(data))) => {
                    output.push_str(&String::from_utf8_lossy(&data));
                    if output.contains(marker) {
                        break;
                    }
                }
                Ok(Some(BackendEvent::Exit(_))) | Ok(None) => break,
                Err(_) => {}
            }
        }
        output
    }

    #[tokio::test]
    async fn test_piped_stdout_forwarded() {
        let mut child = PipedProcess::spawn(&spec("/bin/sh")).unwrap();
        let mut rx = child.take_events().unwrap();

        child.write(b"echo $SHELLMUX_TEST\n").unwrap();
        let output = read_until(&mut rx, "piped_env_value").await;
        assert!(output.contains("piped_env_value"), "output was: {output:?}");

        child.terminator().terminate().unwrap();
    }

    #[tokio::test]
    async fn test_piped_stderr_forwarded() {
        let mut child = PipedProcess::spawn(&spec("/bin/sh")).unwrap();
        let mut rx = child.take_events().unwrap();

        child.write(b"echo stderr_marker 1>&2\n").unwrap();
        let output = read_until(&mut rx, "stderr_marker").await;
        assert!(output.contains("stderr_marker"));

        child.terminator().terminate().unwrap();
    }

    #[tokio::test]
    async fn test_piped_resize_is_recorded_only() {
        let mut child = PipedProcess::spawn(&spec("/bin/sh")).unwrap();

        assert!(child.resize(132, 50).is_ok());
        assert_eq!(child.size(), (132, 50));

        child.terminator().terminate().unwrap();
    }

    #[tokio::test]
    async fn test_piped_exit_code_and_late_write() {
        let mut child = PipedProcess::spawn(&spec("/bin/sh")).unwrap();
        let mut rx = child.take_events().unwrap();

        child.write(b"exit 3\n").unwrap();
        let exit = next_exit(&mut rx).await.expect("no exit event");
        assert_eq!(exit.code, Some(3));
        assert!(child.terminator().has_exited());

        // Writing after the pipe closed is silently ignored.
        assert!(child.write(b"echo nobody\n").is_ok());
        assert!(child.terminator().terminate().is_ok());
    }

    #[tokio::test]
    async fn test_piped_terminate() {
        let mut child = PipedProcess::spawn(&spec("/bin/sh")).unwrap();
        let mut rx = child.take_events().unwrap();

        child.terminator().terminate().unwrap();
        let exit = next_exit(&mut rx).await.expect("no exit event");
        assert_eq!(exit.signal, Some(nix::sys::signal::Signal::SIGTERM as i32));
        assert_eq!(exit.code, None);

        // Only one exit notification per handle.
        assert_eq!(timeout(Duration::from_millis(200), rx.recv()).await.ok(), Some(None));
    }

    #[tokio::test]
    async fn test_piped_output_waits_for_room() {
        let mut child = PipedProcess::spawn(&spec("/bin/sh")).unwrap();
        let mut rx = child.take_events().unwrap();

        child
            .write(b"head -c 2000000 /dev/zero | tr '\\0' a; echo done_marker\n")
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        // Nobody drained, so the readers are parked on a full queue.
        let mut queued = 0;
        while let Ok(BackendEvent::Output(_)) = rx.try_recv() {
            queued += 1;
        }
        assert!(queued > 0);
        assert!(queued <= EVENT_QUEUE_CAPACITY, "queued {queued} chunks");

        // Draining lets the rest through, in order.
        let mut tail = Vec::new();
        let finished = timeout(Duration::from_secs(10), async {
            while let Some(BackendEvent::Output(data)) = rx.recv().await {
                tail.extend_from_slice(&data);
                tail.drain(..tail.len().saturating_sub(64));
                if String::from_utf8_lossy(&tail).contains("done_marker") {
                    return true;
                }
            }
            false
        })
        .await;
        assert_eq!(finished.ok(), Some(true));

        child.terminator().terminate().unwrap();
    }

    #[tokio::test]
    async fn test_piped_spawn_missing_program() {
        let result = PipedProcess::spawn(&spec("/definitely/not/a/shell"));
        assert!(matches!(result, Err(BackendError::Spawn(_))));
    }
}
