//! Per-connection session driver.
//!
//! A session couples one transport to at most one PTY and runs three
//! concurrent activities: the reader loop (peer frames in), the PTY pump
//! (shell output out), and the heartbeat ticker. They coordinate only
//! through the session cancellation token and the write-lock over the
//! transport's outbound half; each writes whole frames, so the lock is all
//! the ordering the wire needs.

use std::io::Read;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use webterm_proto::{self as proto, FrameType};

use crate::pty::{PtyError, PtyHandle};
use crate::registry::Registry;
use crate::transport::{Incoming, TransportError, TransportReader, TransportWriter};

/// Window size used when the peer sends data before any resize.
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

const PTY_READ_BUFFER_SIZE: usize = 4096;
const PUMP_CHANNEL_CAPACITY: usize = 64;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// One connection bound to one (lazily created) PTY.
///
/// Lifecycle: `Open` from construction, `Draining` once the cancellation
/// token fires, `Closed` after [`Session::cleanup`] has run. Cleanup happens
/// exactly once and releases the PTY, the transport, and the registry slot
/// in that order before firing the `done` latch.
pub struct Session {
    id: Uuid,
    // Back-reference to hand fresh Arcs to spawned tasks; never keeps the
    // session alive on its own.
    me: Weak<Session>,
    writer: Mutex<TransportWriter>,
    pty: Mutex<Option<Arc<PtyHandle>>>,
    cancel: CancellationToken,
    done: CancellationToken,
    cleaned: AtomicBool,
    registry: Arc<Registry>,
}

impl Session {
    pub fn new(writer: TransportWriter, registry: Arc<Registry>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id: Uuid::new_v4(),
            me: me.clone(),
            writer: Mutex::new(writer),
            pty: Mutex::new(None),
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
            cleaned: AtomicBool::new(false),
            registry,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Request teardown. Idempotent; observable by every session task.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves once cleanup has fully run and the session left the registry.
    pub async fn closed(&self) {
        self.done.cancelled().await
    }

    /// Drive the session to completion. Returns only after cleanup.
    pub async fn run(self: Arc<Self>, mut reader: TransportReader) {
        info!(session = %self.id, "session opened");

        let heartbeat = tokio::spawn(self.clone().heartbeat());
        self.read_loop(&mut reader).await;
        self.cancel.cancel();
        let _ = heartbeat.await;

        self.cleanup().await;
    }

    async fn read_loop(&self, reader: &mut TransportReader) {
        loop {
            let incoming = tokio::select! {
                _ = self.cancel.cancelled() => return,
                incoming = reader.recv() => incoming,
            };

            match incoming {
                Ok(Incoming::Binary(bytes)) => {
                    if self.handle_frame(&bytes).await.is_break() {
                        return;
                    }
                }
                // Text and transport-level control messages carry nothing
                // for us; pong bookkeeping already happened in the reader.
                Ok(Incoming::Text) | Ok(Incoming::Control) => {}
                Err(TransportError::PeerClosed) => {
                    debug!(session = %self.id, "peer closed connection");
                    return;
                }
                Err(error) => {
                    warn!(session = %self.id, %error, "transport read failed");
                    return;
                }
            }
        }
    }

    async fn handle_frame(&self, raw: &[u8]) -> ControlFlow<()> {
        let frame = match proto::decode(raw) {
            Ok((frame, _)) => frame,
            Err(error) => {
                debug!(session = %self.id, %error, "undecodable frame");
                self.send_error(&format!("bad frame: {error}")).await;
                return ControlFlow::Continue(());
            }
        };

        match frame.frame_type {
            FrameType::Data => self.handle_data(&frame.payload).await,
            FrameType::Resize => self.handle_resize(&frame.payload).await,
            FrameType::Control => self.handle_control(&frame.payload).await,
            FrameType::Heartbeat => ControlFlow::Continue(()),
            FrameType::Close => {
                debug!(session = %self.id, "peer sent close frame");
                ControlFlow::Break(())
            }
            FrameType::Error | FrameType::Unknown(_) => {
                let wire = frame.frame_type.to_wire();
                self.send_error(&format!("unknown frame type: 0x{wire:02x}"))
                    .await;
                ControlFlow::Continue(())
            }
        }
    }

    async fn handle_data(&self, payload: &[u8]) -> ControlFlow<()> {
        let pty = match self.ensure_pty().await {
            Ok(pty) => pty,
            Err(error) => {
                warn!(session = %self.id, %error, "failed to create pty");
                self.send_error(&format!("failed to create pty: {error}"))
                    .await;
                return ControlFlow::Break(());
            }
        };

        if let Err(error) = pty.write(payload) {
            warn!(session = %self.id, %error, "pty write failed");
            self.send_error(&format!("pty write failed: {error}")).await;
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    async fn handle_resize(&self, payload: &[u8]) -> ControlFlow<()> {
        let pty = match self.ensure_pty().await {
            Ok(pty) => pty,
            Err(error) => {
                warn!(session = %self.id, %error, "failed to create pty");
                self.send_error(&format!("failed to create pty: {error}"))
                    .await;
                return ControlFlow::Break(());
            }
        };

        let (cols, rows) = match proto::decode_resize(payload) {
            Ok(dims) => dims,
            Err(error) => {
                self.send_error(&format!("bad resize payload: {error}")).await;
                return ControlFlow::Continue(());
            }
        };
        if cols == 0 || rows == 0 {
            self.send_error("bad resize payload: dimensions must be nonzero")
                .await;
            return ControlFlow::Continue(());
        }

        if let Err(error) = pty.resize(cols, rows) {
            warn!(session = %self.id, %error, cols, rows, "resize failed");
            self.send_error(&format!("resize failed: {error}")).await;
        }
        ControlFlow::Continue(())
    }

    async fn handle_control(&self, payload: &[u8]) -> ControlFlow<()> {
        let signum = match proto::decode_control(payload) {
            Ok(signum) => signum,
            Err(error) => {
                self.send_error(&format!("bad control payload: {error}")).await;
                return ControlFlow::Continue(());
            }
        };

        // No implicit spawn here: a signal with no child to receive it is a
        // client ordering mistake, not a reason to fork a shell.
        let pty = self.pty.lock().await.clone();
        let Some(pty) = pty else {
            self.send_error("no pty to signal").await;
            return ControlFlow::Continue(());
        };

        match pty.signal(signum) {
            Ok(()) => {
                debug!(session = %self.id, signum, "delivered signal");
                ControlFlow::Continue(())
            }
            Err(PtyError::InvalidSignal(signum)) => {
                self.send_error(&format!("invalid signal number: {signum}"))
                    .await;
                ControlFlow::Continue(())
            }
            Err(error) => {
                warn!(session = %self.id, %error, signum, "signal delivery failed");
                self.send_error(&format!("signal delivery failed: {error}"))
                    .await;
                ControlFlow::Break(())
            }
        }
    }

    /// Return the session's PTY, creating it (and starting the output pump)
    /// on first use.
    async fn ensure_pty(&self) -> Result<Arc<PtyHandle>, PtyError> {
        let mut guard = self.pty.lock().await;
        if let Some(pty) = guard.as_ref() {
            return Ok(pty.clone());
        }

        let pty = Arc::new(PtyHandle::open(DEFAULT_COLS, DEFAULT_ROWS)?);
        let reader = pty.output_reader()?;
        *guard = Some(pty.clone());
        info!(session = %self.id, cols = DEFAULT_COLS, rows = DEFAULT_ROWS, "pty created");

        if let Some(session) = self.me.upgrade() {
            tokio::spawn(session.pump(pty.clone(), reader));
        }
        Ok(pty)
    }

    /// Forward PTY output to the peer as DATA frames until EOF, a read
    /// error, or cancellation.
    async fn pump(self: Arc<Self>, pty: Arc<PtyHandle>, reader: Box<dyn Read + Send>) {
        let (tx, mut rx) = mpsc::channel::<std::io::Result<Vec<u8>>>(PUMP_CHANNEL_CAPACITY);

        tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            let mut buf = [0u8; PTY_READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // Linux reports EIO on the master once the child is
                        // gone; that is the ordinary end of the stream.
                        #[cfg(unix)]
                        if e.raw_os_error() == Some(libc::EIO) {
                            break;
                        }
                        let _ = tx.blocking_send(Err(e));
                        break;
                    }
                }
            }
        });

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = pty.closed() => break,
                chunk = rx.recv() => match chunk {
                    Some(Ok(data)) => self.send_frame(FrameType::Data, &data).await,
                    Some(Err(error)) => {
                        warn!(session = %self.id, %error, "pty read failed");
                        self.send_error(&format!("pty read failed: {error}")).await;
                        break;
                    }
                    None => {
                        debug!(session = %self.id, "pty reached eof");
                        break;
                    }
                },
            }
        }

        self.cancel.cancel();
    }

    /// Ping the peer every 30 s. The transport reader treats any inbound
    /// message, pongs included, as proof of life; a peer that answers
    /// nothing for 60 s trips the read deadline instead.
    async fn heartbeat(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.tick().await; // the first tick is immediate

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let mut writer = self.writer.lock().await;
                    if let Err(error) = writer.ping().await {
                        warn!(session = %self.id, %error, "heartbeat ping failed");
                        drop(writer);
                        self.cancel.cancel();
                        return;
                    }
                }
            }
        }
    }

    /// Encode and send one frame under the write-lock. A failure (or an
    /// oversized payload, which only an internal bug can produce) cancels
    /// the session instead of propagating.
    async fn send_frame(&self, frame_type: FrameType, payload: &[u8]) {
        let bytes = match proto::encode(frame_type, payload) {
            Ok(bytes) => bytes,
            Err(error) => {
                error!(session = %self.id, %error, "failed to encode outbound frame");
                self.cancel.cancel();
                return;
            }
        };

        let mut writer = self.writer.lock().await;
        if let Err(error) = writer.send_binary(bytes).await {
            warn!(session = %self.id, %error, "transport write failed");
            drop(writer);
            self.cancel.cancel();
        }
    }

    async fn send_error(&self, message: &str) {
        self.send_frame(FrameType::Error, message.as_bytes()).await
    }

    /// Release everything, exactly once: cancel subordinate tasks, close
    /// the PTY, close the transport, deregister, then fire the done latch.
    /// No farewell frame is sent; the transport close is the signal.
    async fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();
        if let Some(pty) = self.pty.lock().await.take() {
            pty.close();
        }
        self.writer.lock().await.close().await;
        self.registry.remove(self.id);
        self.done.cancel();
        info!(session = %self.id, "session closed");
    }
}
