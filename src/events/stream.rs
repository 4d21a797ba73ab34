//! WebSocket transport for the engine's event stream.
//!
//! [`connect`] opens the socket and spawns one task that forwards
//! [`ControlFrame`]s out and parsed [`GenerationEvent`]s in. Frames that do
//! not parse are logged and skipped; binary and ping frames are ignored.

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::types::{ControlFrame, GenerationEvent, parse_event};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum StreamError {
    /// Failed to establish the WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The connection went away.
    #[error("Event stream closed")]
    Closed,
}

/// A live event stream connection.
pub struct EventStream {
    /// Send subscribe/unsubscribe frames through here.
    pub control: mpsc::UnboundedSender<ControlFrame>,
    /// Parsed inbound events.
    pub events: mpsc::Receiver<GenerationEvent>,
    task: JoinHandle<()>,
}

impl EventStream {
    pub fn subscribe(&self, job_id: &str) -> Result<(), StreamError> {
        self.control
            .send(ControlFrame::Subscribe {
                job_id: job_id.to_string(),
            })
            .map_err(|_| StreamError::Closed)
    }

    pub fn unsubscribe(&self, job_id: &str) -> Result<(), StreamError> {
        self.control
            .send(ControlFrame::Unsubscribe {
                job_id: job_id.to_string(),
            })
            .map_err(|_| StreamError::Closed)
    }

    /// Split into the control sender and event receiver, leaving the
    /// forwarding task running in the background.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<ControlFrame>,
        mpsc::Receiver<GenerationEvent>,
    ) {
        (self.control, self.events)
    }

    pub fn close(self) {
        self.task.abort();
    }
}

/// Connect to the engine's WebSocket endpoint (e.g. `ws://host:8000/ws`).
pub async fn connect(ws_url: &str) -> Result<EventStream, StreamError> {
    let (ws_stream, _response) = connect_async(ws_url).await.map_err(|e| {
        StreamError::Connection(format!("Failed to connect to event stream at {ws_url}: {e}"))
    })?;
    tracing::info!(url = ws_url, "connected to event stream");

    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<ControlFrame>();
    let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
    let (mut sink, mut source) = ws_stream.split();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = control_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!(error = %e, "failed to encode control frame");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        tracing::error!(error = %e, "failed to send control frame");
                        break;
                    }
                }
                msg = source.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => match parse_event(&text) {
                            Ok(event) => {
                                if event_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, raw_message = %text, "failed to parse event frame");
                            }
                        },
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(?frame, "event stream closed by server");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::error!(error = %e, "event stream receive error");
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
    });

    Ok(EventStream {
        control: control_tx,
        events: event_rx,
        task,
    })
}
