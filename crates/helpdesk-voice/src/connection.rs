//! WebSocket driver for a [`SessionProtocol`].
//!
//! One task per call. It multiplexes socket reads, captured frames, playback
//! polling and the shutdown signal; writes go through a separate writer task so
//! a slow socket never stalls inbound handling. Captured frames that don't fit
//! in the writer queue are dropped.

use crate::capture::{AudioFrame, CaptureConduit};
use crate::error::{VoiceError, VoiceResult};
use crate::playback::AudioOutput;
use crate::protocol::OutboundMessage;
use crate::session::{Flow, SessionProtocol};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on the WebSocket handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound messages waiting for the socket.
const WRITE_QUEUE_DEPTH: usize = 32;

/// How long to wait for the close handshake on the way out.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Open the session connection.
pub async fn connect(endpoint: &str) -> VoiceResult<WsStream> {
    debug!("Connecting to {}", endpoint);
    match tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(endpoint)).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(VoiceError::Connection(format!(
            "timed out connecting to {} after {:?}",
            endpoint, CONNECT_TIMEOUT
        ))),
    }
}

/// Everything a running call owns. Handed back when the driver exits.
pub struct CallResources<O: AudioOutput> {
    pub session: SessionProtocol<O>,
    pub capture: CaptureConduit,
}

/// A spawned call driver.
pub struct SessionTask<O: AudioOutput + 'static> {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<CallResources<O>>,
}

impl<O: AudioOutput + 'static> SessionTask<O> {
    /// Spawn the driver for an already-open connection.
    pub fn spawn(
        ws: WsStream,
        resources: CallResources<O>,
        frames: mpsc::Receiver<AudioFrame>,
        poll_interval: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(drive(ws, resources, frames, poll_interval, shutdown_rx));
        Self {
            shutdown: Some(shutdown_tx),
            handle,
        }
    }

    /// The driver has exited on its own (remote close, error).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Ask the driver to close and wait for it to release everything.
    pub async fn shutdown(mut self) -> Option<CallResources<O>> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.handle.await {
            Ok(resources) => Some(resources),
            Err(e) => {
                warn!("Session task ended abnormally: {}", e);
                None
            }
        }
    }
}

/// Run one call until the socket closes, the agent errors, or shutdown fires.
/// Capture and playback are released as soon as the loop exits, before the
/// close handshake.
pub async fn drive<O: AudioOutput>(
    ws: WsStream,
    mut resources: CallResources<O>,
    mut frames: mpsc::Receiver<AudioFrame>,
    poll_interval: Duration,
    mut shutdown: oneshot::Receiver<()>,
) -> CallResources<O> {
    let (mut write, mut read) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(WRITE_QUEUE_DEPTH);

    let mut writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = write.send(msg).await {
                debug!("Writer stopped: {}", e);
                return;
            }
            if closing {
                break;
            }
        }
        let _ = write.close().await;
    });

    let session = &mut resources.session;
    for msg in session.on_open() {
        if let Err(e) = enqueue(&out_tx, &msg) {
            session.on_transport_error(&e);
        }
    }

    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while session.state().is_active() {
        tokio::select! {
            _ = &mut shutdown => {
                info!(target: "helpdesk::voice", "Closing connection on request");
                break;
            }
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if session.handle_inbound_text(text.as_str()) == Flow::Terminate {
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(target: "helpdesk::voice", "Agent closed connection: {:?}", frame);
                    break;
                }
                Some(Ok(Message::Binary(data))) => {
                    debug!("Ignoring {} byte binary frame", data.len());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    session.on_transport_error(&VoiceError::from(e));
                    break;
                }
                None => {
                    info!(target: "helpdesk::voice", "Connection dropped");
                    break;
                }
            },
            Some(frame) = frames.recv() => {
                if let Some(msg) = session.on_frame(&frame) {
                    match enqueue(&out_tx, &msg) {
                        Ok(true) => session.note_frame_sent(),
                        Ok(false) => debug!("Write queue full, dropped frame {}", frame.sequence),
                        Err(e) => {
                            session.on_transport_error(&e);
                            break;
                        }
                    }
                }
            }
            _ = ticker.tick() => session.poll_playback(),
        }
    }

    // Devices go first; the close handshake must not hold the mic or speaker.
    // Joining the capture thread is short: it exits as soon as it sees the stop signal.
    resources.capture.stop();
    resources.session.on_close();

    let _ = out_tx.try_send(Message::Close(None));
    drop(out_tx);
    if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
        debug!("Close handshake did not finish in {:?}", CLOSE_GRACE);
        writer.abort();
    }
    resources
}

/// Queue a message for the writer. `Ok(false)` means the queue was full.
fn enqueue(out_tx: &mpsc::Sender<Message>, msg: &OutboundMessage) -> VoiceResult<bool> {
    let text = msg.to_json()?;
    match out_tx.try_send(Message::Text(text.into())) {
        Ok(()) => Ok(true),
        Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
        Err(mpsc::error::TrySendError::Closed(_)) => {
            Err(VoiceError::Connection("connection writer closed".to_string()))
        }
    }
}
