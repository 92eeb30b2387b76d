//! Host adapter.
//!
//! Serves the session registry over a line-oriented transport: one JSON
//! [`Command`] per input line, one JSON [`Event`] per output line. The
//! binary runs it over stdin/stdout.
//!
//! The loop is the registry's single owner. Commands, backend events,
//! context key updates and focus edges are multiplexed with a biased
//! `select!` so queued output for a session is always written before its
//! closed event.

use std::sync::Arc;

use protocol::{decode_line, encode_line, Command, ContextValue, Event};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::focus::{ContextKey, ContextSink, FocusTracker};
use crate::session::SessionRegistry;

/// Context sink that queues updates for the host loop.
#[derive(Debug, Clone)]
pub struct ChannelContextSink {
    tx: mpsc::UnboundedSender<(ContextKey, ContextValue)>,
}

impl ChannelContextSink {
    pub fn new(tx: mpsc::UnboundedSender<(ContextKey, ContextValue)>) -> Self {
        Self { tx }
    }
}

impl ContextSink for ChannelContextSink {
    fn publish(&self, key: ContextKey, value: ContextValue) {
        // The loop may already be gone during shutdown.
        let _ = self.tx.send((key, value));
    }
}

/// Line protocol front end for a session registry.
pub struct Host {
    registry: SessionRegistry,
    focus: Arc<FocusTracker>,
    context_rx: mpsc::UnboundedReceiver<(ContextKey, ContextValue)>,
}

impl Host {
    /// Creates a host with a registry built from `config`.
    pub fn new(config: &Config) -> Self {
        Self::with_registry(SessionRegistry::from_config(config))
    }

    /// Creates a host around an existing registry.
    pub fn with_registry(registry: SessionRegistry) -> Self {
        let (tx, context_rx) = mpsc::unbounded_channel();
        let focus = Arc::new(FocusTracker::new(Arc::new(ChannelContextSink::new(tx))));
        let registry = registry.with_focus_tracker(focus.clone());
        Self {
            registry,
            focus,
            context_rx,
        }
    }

    /// Returns the registry.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Returns the focus tracker.
    pub fn focus(&self) -> &Arc<FocusTracker> {
        &self.focus
    }

    /// Serves commands from `reader` until EOF, a `shutdown` command, or
    /// cancellation of `shutdown`. Everything is disposed before returning.
    pub async fn run<R, W>(
        mut self,
        reader: R,
        mut writer: W,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut output_rx = self.registry.subscribe_output();
        let mut closed_rx = self.registry.subscribe_closed();

        let result = self
            .serve(reader, &mut writer, &shutdown, &mut output_rx, &mut closed_rx)
            .await;

        self.registry.dispose_all();
        self.focus.dispose();

        let flushed = self.flush_remaining(&mut writer, &mut output_rx, &mut closed_rx).await;
        tracing::info!("Host stopped");
        result.and(flushed)
    }

    async fn serve<R, W>(
        &mut self,
        reader: R,
        writer: &mut W,
        shutdown: &CancellationToken,
        output_rx: &mut Option<broadcast::Receiver<crate::session::SessionOutput>>,
        closed_rx: &mut Option<broadcast::Receiver<String>>,
    ) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        let mut focus_rx = self.focus.on_focus_change();

        loop {
            tokio::select! {
                biased;

                Some((key, value)) = self.context_rx.recv() => {
                    write_event(writer, &context_event(key, value)).await?;
                }
                output = recv_or_pending(output_rx) => {
                    write_event(writer, &Event::Output { id: output.id, data: output.data }).await?;
                }
                id = recv_or_pending(closed_rx) => {
                    write_event(writer, &Event::Closed { id }).await?;
                }
                focused = recv_or_pending(&mut focus_rx) => {
                    write_event(writer, &Event::FocusChanged { focused }).await?;
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown requested");
                    return Ok(());
                }
                line = lines.next_line() => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) => {
                            tracing::info!("Input closed");
                            return Ok(());
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to read command");
                            return Ok(());
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }

                    match decode_line::<Command>(&line) {
                        Ok(Command::Shutdown) => {
                            tracing::info!("Shutdown command received");
                            write_event(writer, &ack("shutdown", true)).await?;
                            return Ok(());
                        }
                        Ok(command) => {
                            if let Some(event) = self.dispatch(command).await {
                                write_event(writer, &event).await?;
                            }
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "Rejected command line");
                            write_event(writer, &Event::Error { message: e.to_string() }).await?;
                        }
                    }
                }
                _ = self.registry.process_next_event() => {}
            }
        }
    }

    /// Applies one command to the registry and focus tracker.
    ///
    /// Returns the event to send back, if any.
    pub async fn dispatch(&mut self, command: Command) -> Option<Event> {
        tracing::debug!(command = command.name(), "Dispatching command");
        let name = command.name();

        match command {
            Command::CreateSession { config } => Some(match self.registry.create(config).await {
                Ok(id) => self.session_created(&id),
                Err(e) => Event::Error {
                    message: e.to_string(),
                },
            }),
            Command::CloseSession { id } => Some(ack(name, self.registry.close(&id))),
            Command::ClearSession { id } => Some(ack(name, self.registry.clear(&id))),
            Command::SendInput { id, data } => {
                Some(ack(name, self.registry.send_input(&id, data.as_bytes())))
            }
            Command::ResizeSession { id, cols, rows } => {
                Some(ack(name, self.registry.resize(&id, cols, rows)))
            }
            Command::SetActive { id } => {
                self.registry.set_active(&id);
                None
            }
            Command::SplitActive => Some(match self.registry.split_active().await {
                Ok(Some(id)) => self.session_created(&id),
                Ok(None) => ack(name, false),
                Err(e) => Event::Error {
                    message: e.to_string(),
                },
            }),
            Command::ListSessions => Some(Event::Sessions {
                sessions: self.registry.list(),
            }),
            Command::Focus { id } => {
                let id = id.filter(|id| self.registry.contains(id));
                if let Some(id) = &id {
                    self.registry.set_active(id);
                }
                self.focus.focus(id.as_deref());
                None
            }
            Command::Blur => {
                self.focus.blur();
                None
            }
            Command::SetTextSelected { selected } => {
                self.focus.set_text_selected(selected);
                None
            }
            Command::SetInteractiveProcess { interactive } => {
                self.focus.set_interactive_process(interactive);
                None
            }
            Command::SetSidebarFocus { focused } => {
                self.focus.set_sidebar_focus(focused);
                None
            }
            Command::Shutdown => Some(ack(name, true)),
        }
    }

    fn session_created(&self, id: &str) -> Event {
        match self.registry.get(id) {
            Some(summary) => Event::SessionCreated {
                id: summary.id,
                config: summary.config,
            },
            // Exited before the event could be built; its closed event follows.
            None => ack("create_session", true),
        }
    }

    async fn flush_remaining<W>(
        &mut self,
        writer: &mut W,
        output_rx: &mut Option<broadcast::Receiver<crate::session::SessionOutput>>,
        closed_rx: &mut Option<broadcast::Receiver<String>>,
    ) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if let Some(rx) = output_rx.as_mut() {
            while let Ok(output) = rx.try_recv() {
                write_event(writer, &Event::Output { id: output.id, data: output.data }).await?;
            }
        }
        if let Some(rx) = closed_rx.as_mut() {
            while let Ok(id) = rx.try_recv() {
                write_event(writer, &Event::Closed { id }).await?;
            }
        }
        while let Ok((key, value)) = self.context_rx.try_recv() {
            write_event(writer, &context_event(key, value)).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("registry", &self.registry)
            .field("focus", &self.focus)
            .finish()
    }
}

fn ack(command: &str, success: bool) -> Event {
    Event::Ack {
        command: command.to_string(),
        success,
    }
}

fn context_event(key: ContextKey, value: ContextValue) -> Event {
    Event::Context {
        key: key.as_str().to_string(),
        value,
    }
}

async fn write_event<W>(writer: &mut W, event: &Event) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let line = encode_line(event)?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Receives the next value, pending forever once the channel is gone.
async fn recv_or_pending<T: Clone>(rx: &mut Option<broadcast::Receiver<T>>) -> T {
    loop {
        let Some(inner) = rx.as_mut() else {
            return std::future::pending().await;
        };
        match inner.recv().await {
            Ok(value) => return value,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped = skipped, "Host fell behind, events dropped");
            }
            Err(RecvError::Closed) => *rx = None,
        }
    }
}
