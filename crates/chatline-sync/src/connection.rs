use crate::backoff::Backoff;
use crate::config::SyncConfig;
use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::observe::lock;
use chatline_core::wire::encode_frame;
use chatline_core::{Message, Notification};
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{error, info, warn};

pub const SEND_WHILE_DISCONNECTED: &str = "Not connected to the server; the message was not sent.";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Closure {
    /// Last lease released; never reconnects.
    Intentional,
    /// Server completed a normal close; never reconnects.
    Clean,
    /// Anything else; reconnects after backoff.
    Unclean,
}

#[derive(Default)]
struct Lifecycle {
    subscribers: usize,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
}

struct Inner {
    config: SyncConfig,
    engine: Arc<SyncEngine>,
    state: watch::Sender<ConnectionState>,
    lifecycle: Mutex<Lifecycle>,
}

impl Inner {
    /// Only the task of the live generation may publish state, so a socket
    /// still winding down cannot overwrite its successor.
    fn set_state(&self, generation: u64, next: ConnectionState) {
        let lifecycle = lock(&self.lifecycle);
        if lifecycle.generation != generation {
            return;
        }
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            info!("ws_state: {next}");
        }
    }

    fn release(&self) {
        let mut lifecycle = lock(&self.lifecycle);
        lifecycle.subscribers = lifecycle.subscribers.saturating_sub(1);
        if lifecycle.subscribers > 0 {
            return;
        }
        info!("ws_release: last subscriber detached");
        lifecycle.outbound = None;
        if let Some(shutdown) = lifecycle.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(watchdog) = lifecycle.watchdog.take() {
            watchdog.abort();
        }
        self.engine.stall().disarm();
    }
}

/// Owns the single websocket. The socket is opened when the first lease is
/// taken and closed, without reconnecting, when the last lease is dropped.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(config: SyncConfig, engine: Arc<SyncEngine>) -> Self {
        let (state, _rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                engine,
                state,
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.inner.engine
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn subscribers(&self) -> usize {
        lock(&self.inner.lifecycle).subscribers
    }

    /// Registers a logical subscriber. Must be called from within a Tokio
    /// runtime: the 0 -> 1 edge spawns the connection task.
    pub fn subscribe(&self) -> ConnectionLease {
        let mut lifecycle = lock(&self.inner.lifecycle);
        lifecycle.subscribers += 1;
        if lifecycle.subscribers == 1 {
            self.activate(&mut lifecycle);
        }
        ConnectionLease {
            inner: self.inner.clone(),
        }
    }

    fn activate(&self, lifecycle: &mut Lifecycle) {
        lifecycle.generation += 1;
        let generation = lifecycle.generation;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        lifecycle.outbound = Some(outbound_tx);
        lifecycle.shutdown = Some(shutdown_tx);

        let engine = &self.inner.engine;
        lifecycle.watchdog = Some(engine.stall().spawn_watchdog(engine.notifications().clone()));

        // The previous socket finishes closing before the next one opens.
        let previous = lifecycle.task.take();
        lifecycle.task = Some(tokio::spawn(connection_loop(
            self.inner.clone(),
            generation,
            previous,
            outbound_rx,
            shutdown_rx,
        )));
    }

    /// Transmits a message. Not queued: when the socket is not connected the
    /// message is dropped, an error notification is published and
    /// `SyncError::NotConnected` is returned so the caller can offer a resend.
    pub fn send(&self, message: Message) -> Result<(), SyncError> {
        let frame = encode_frame(&message, self.inner.config.max_frame_bytes)?;
        let outbound = lock(&self.inner.lifecycle).outbound.clone();
        let Some(outbound) = outbound else {
            return Err(self.reject_send(&message));
        };

        // The echo is recorded only once the frame is in the channel, and both
        // happen under the engine lock.
        let sent = self.inner.engine.transmit_outbound(message.clone(), || {
            self.is_connected() && outbound.send(frame).is_ok()
        });
        if !sent {
            return Err(self.reject_send(&message));
        }
        Ok(())
    }

    fn reject_send(&self, message: &Message) -> SyncError {
        error!(
            "ws_send_error: not connected, dropping message id={} conversation={}",
            message.id, message.conversation_id
        );
        self.inner
            .engine
            .notifications()
            .publish(Notification::error(SEND_WHILE_DISCONNECTED));
        SyncError::NotConnected
    }
}

/// Keeps the connection active while held.
#[must_use = "dropping the lease releases the connection"]
pub struct ConnectionLease {
    inner: Arc<Inner>,
}

impl ConnectionLease {
    pub fn release(self) {}
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.inner.release();
    }
}

async fn connection_loop(
    inner: Arc<Inner>,
    generation: u64,
    previous: Option<JoinHandle<()>>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    if let Some(previous) = previous {
        let _ = previous.await;
    }
    let mut backoff = Backoff::new(inner.config.backoff_initial, inner.config.backoff_max);

    loop {
        inner.set_state(generation, ConnectionState::Connecting);
        let connect = tokio::select! {
            result = connect_async(inner.config.ws_url.as_str()) => result,
            _ = &mut shutdown_rx => {
                inner.set_state(generation, ConnectionState::Disconnected);
                return;
            }
        };
        let socket = match connect {
            Ok((socket, _)) => socket,
            Err(err) => {
                warn!("ws_connect_error: {err}");
                inner.set_state(generation, ConnectionState::Disconnected);
                if !wait_backoff(&mut backoff, &mut shutdown_rx).await {
                    return;
                }
                continue;
            }
        };
        backoff.reset();
        drop_unsent(&inner, &mut outbound_rx);
        inner.set_state(generation, ConnectionState::Connected);

        let closure = pump(&inner, socket, &mut outbound_rx, &mut shutdown_rx).await;
        inner.set_state(generation, ConnectionState::Disconnected);
        match closure {
            Closure::Intentional => {
                info!("ws_closed: intentional");
                return;
            }
            Closure::Clean => {
                info!("ws_closed: server closed normally");
                return;
            }
            Closure::Unclean => {
                drop_unsent(&inner, &mut outbound_rx);
                if !wait_backoff(&mut backoff, &mut shutdown_rx).await {
                    return;
                }
            }
        }
    }
}

async fn pump(
    inner: &Inner,
    socket: Socket,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> Closure {
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => inner.engine.receive_frame(&text),
                Some(Ok(WsMessage::Binary(bytes))) => inner.engine.receive_binary_frame(&bytes),
                Some(Ok(WsMessage::Close(frame))) => return closure_for(frame.as_ref()),
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!("ws_read_error: {err}");
                    return Closure::Unclean;
                }
                None => return Closure::Unclean,
            },
            outgoing = outbound_rx.recv() => match outgoing {
                Some(frame) => {
                    if let Err(err) = sink.send(WsMessage::Text(frame)).await {
                        warn!("ws_write_error: {err}");
                        return Closure::Unclean;
                    }
                }
                None => {
                    close_gracefully(&mut sink).await;
                    return Closure::Intentional;
                }
            },
            _ = &mut *shutdown_rx => {
                close_gracefully(&mut sink).await;
                return Closure::Intentional;
            }
        }
    }
}

async fn close_gracefully<S>(sink: &mut S)
where
    S: futures_util::Sink<WsMessage> + Unpin,
{
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "client closing".into(),
    };
    let _ = sink.send(WsMessage::Close(Some(frame))).await;
    let _ = sink.close().await;
}

fn closure_for(frame: Option<&CloseFrame<'_>>) -> Closure {
    match frame {
        Some(frame) if frame.code == CloseCode::Normal => Closure::Clean,
        _ => Closure::Unclean,
    }
}

/// Discards frames accepted by `send` that never reached a socket, so nothing
/// is replayed on the next connection. The outstanding turn is ended and the
/// user is told to resend.
fn drop_unsent(inner: &Inner, outbound_rx: &mut mpsc::UnboundedReceiver<String>) -> usize {
    let mut dropped = 0;
    while let Ok(frame) = outbound_rx.try_recv() {
        warn!("ws_send_dropped: bytes={}", frame.len());
        dropped += 1;
    }
    if dropped > 0 {
        inner.engine.abandon_turn();
        inner
            .engine
            .notifications()
            .publish(Notification::error(SEND_WHILE_DISCONNECTED));
    }
    dropped
}

/// Sleeps for the next backoff delay; false when shutdown arrived first.
async fn wait_backoff(backoff: &mut Backoff, shutdown_rx: &mut oneshot::Receiver<()>) -> bool {
    let delay = backoff.next_delay();
    info!("ws_reconnect_scheduled: delay_ms={}", delay.as_millis());
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown_rx => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;

    #[test]
    fn only_normal_close_is_clean() {
        let normal = CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Borrowed("bye"),
        };
        let away = CloseFrame {
            code: CloseCode::Away,
            reason: Cow::Borrowed("restart"),
        };
        assert_eq!(closure_for(Some(&normal)), Closure::Clean);
        assert_eq!(closure_for(Some(&away)), Closure::Unclean);
        assert_eq!(closure_for(None), Closure::Unclean);
    }

    #[tokio::test]
    async fn unsent_frames_are_dropped_and_reported() {
        let config = SyncConfig::new(url::Url::parse("ws://127.0.0.1:9/ws").expect("url"));
        let engine = Arc::new(SyncEngine::new(&config));
        let (state, _rx) = watch::channel(ConnectionState::Disconnected);
        let inner = Inner {
            config,
            engine: engine.clone(),
            state,
            lifecycle: Mutex::new(Lifecycle::default()),
        };
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert_eq!(drop_unsent(&inner, &mut rx), 0);
        assert!(engine.notifications().latest().is_empty());

        engine.set_current_message("are you there?");
        let message = Message::user_text("c1", "are you there?", Default::default());
        assert!(engine.transmit_outbound(message, || tx.send("frame".to_string()).is_ok()));
        tx.send("frame".to_string()).expect("queue");

        assert_eq!(drop_unsent(&inner, &mut rx), 2);
        assert!(rx.try_recv().is_err());
        let latest = engine.notifications().latest();
        assert_eq!(latest.message, SEND_WHILE_DISCONNECTED);
        assert_eq!(engine.current_message(), "are you there?");
        assert!(!engine.is_message_incoming());
        assert!(!engine.stall().is_armed());
    }

    #[test]
    fn state_labels() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Disconnected.as_str(), "disconnected");
    }
}
