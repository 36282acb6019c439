//! Multiplexed connection over a [`SecretConnection`].
//!
//! Implements the connection state machine:
//!
//! ```text
//! Created --start--> Running --close / fatal error--> Closing --loops exit--> Closed
//! ```
//!
//! Two tasks own the halves of the secret connection. The send loop
//! schedules channel chunks, pings and pongs and flushes the write buffer;
//! the receive loop decodes packets and hands reassembled messages to the
//! `on_receive` callback or, without one, to the channel's bounded receive
//! queue read through [`ChannelHandle::recv`]. A supervisor task joins both,
//! drains the queues when a flushing close was requested and then shuts the
//! stream down.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use ed25519_dalek::VerifyingKey;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use super::channel::{
    ChannelReceiver, ChannelSender, RecvChannel, SendChannel, channel, select_channel,
};
use super::packet::{Packet, PacketCodec};
use super::secret::{RawStream, SecretConnection, SecretReadHalf, SecretWriteHalf};
use super::status::{ChannelStatus, Status};
use super::timer::{ThrottleTimer, sleep_until_opt};
use crate::core::{
    ChannelDescriptor, ConnectionError, DEFAULT_SAMPLE_RATE, DEFAULT_WINDOW_SIZE, MConnConfig,
    MIN_READ_BUFFER_SIZE, MIN_WRITE_BUFFER_SIZE, NUM_BATCH_PACKET_MSGS, UPDATE_STATS_INTERVAL,
};
use crate::crypto::IdentityKeypair;
use crate::flowrate::Monitor;

/// Callback receiving `(channel_id, message)` for every reassembled message.
pub type OnReceive = Arc<dyn Fn(u8, Bytes) + Send + Sync>;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Channels may be registered; no I/O yet.
    Created,
    /// Send and receive loops are running.
    Running,
    /// Stop requested; loops are winding down.
    Closing,
    /// Loops exited and the stream is shut down.
    Closed,
}

/// State shared by the handle, the loops and the supervisor.
#[derive(Debug)]
struct Shared {
    phase: Mutex<ConnectionPhase>,
    /// Stops both loops.
    quit: CancellationToken,
    /// Interrupts in-flight writes; only cancelled by a non-flushing stop.
    abort: CancellationToken,
    /// Cancelled once the connection is fully closed.
    done: CancellationToken,
    flush_on_close: AtomicBool,
    wake_send: Notify,
    send_pong: Notify,
    pong_received: Notify,
    error_tx: mpsc::Sender<ConnectionError>,
    send_monitor: Monitor,
    recv_monitor: Monitor,
}

impl Shared {
    fn is_running(&self) -> bool {
        *self.phase.lock() == ConnectionPhase::Running
    }

    /// Move a running connection to `Closing`, reporting `err`.
    ///
    /// Only the first call has any effect.
    fn stop(&self, err: ConnectionError, flush: bool) -> bool {
        {
            let mut phase = self.phase.lock();
            if *phase != ConnectionPhase::Running {
                return false;
            }
            *phase = ConnectionPhase::Closing;
        }

        if flush {
            self.flush_on_close.store(true, Ordering::Release);
        } else {
            self.abort.cancel();
        }
        if self.error_tx.try_send(err).is_err() {
            trace!("error channel full, dropping error");
        }
        self.quit.cancel();
        true
    }
}

/// Everything the loops take ownership of on start.
struct Startup<S> {
    conn: SecretConnection<S>,
    send_channels: Vec<SendChannel>,
    recv_channels: HashMap<u8, RecvChannel>,
    on_receive: Option<OnReceive>,
}

/// Cloneable handle of a registered channel.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    sender: ChannelSender,
    receiver: ChannelReceiver,
    shared: Arc<Shared>,
}

impl ChannelHandle {
    /// Channel id.
    pub fn id(&self) -> u8 {
        self.sender.id()
    }

    /// Queue `msg`, waiting for room in the send queue.
    ///
    /// Returns false if the connection is not running or stops while waiting.
    pub async fn send(&self, msg: impl Into<Bytes>) -> bool {
        if !self.shared.is_running() {
            return false;
        }
        let msg = msg.into();
        let len = msg.len();
        if !self.sender.enqueue(msg, &self.shared.quit).await {
            debug!(channel_id = self.id(), "send failed");
            return false;
        }
        trace!(channel_id = self.id(), len, "queued message");
        self.shared.wake_send.notify_one();
        true
    }

    /// Queue `msg` if there is room right now.
    pub fn try_send(&self, msg: impl Into<Bytes>) -> bool {
        if !self.shared.is_running() {
            return false;
        }
        match self.sender.try_enqueue(msg.into()) {
            Ok(()) => {
                self.shared.wake_send.notify_one();
                true
            }
            Err(err) => {
                trace!(channel_id = self.id(), %err, "try_send rejected");
                false
            }
        }
    }

    /// Whether a message could be queued right now.
    pub fn can_send(&self) -> bool {
        self.shared.is_running() && self.sender.can_send()
    }

    /// Next reassembled message, when no `on_receive` callback is set.
    ///
    /// Up to 100 messages are buffered; the receive loop waits while the
    /// queue is full. Returns `None` once the connection has stopped and
    /// the queue is drained.
    pub async fn recv(&self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    /// A buffered message, if one is ready.
    pub fn try_recv(&self) -> Option<Bytes> {
        self.receiver.try_recv()
    }
}

/// A connection multiplexing prioritized channels over one secret connection.
///
/// ```no_run
/// # async fn run(stream: tokio::net::TcpStream) -> Result<(), mconn_transport::ConnectionError> {
/// use mconn_transport::prelude::*;
///
/// let identity = IdentityKeypair::generate();
/// let conn = MConnection::connect(stream, &identity, MConnConfig::default()).await?;
/// let chat = conn.register_channel(ChannelDescriptor::new(0x20).priority(5))?;
/// conn.set_on_receive(|id, msg| println!("channel {id}: {} bytes", msg.len()))?;
/// conn.start()?;
/// chat.send(&b"hello"[..]).await;
/// conn.flush_and_close("bye").await;
/// # Ok(())
/// # }
/// ```
pub struct MConnection<S> {
    config: MConnConfig,
    shared: Arc<Shared>,
    startup: Mutex<Option<Startup<S>>>,
    channels: RwLock<BTreeMap<u8, ChannelHandle>>,
    error_rx: Mutex<Option<mpsc::Receiver<ConnectionError>>>,
    remote_pub_key: VerifyingKey,
    created: Instant,
}

impl<S: RawStream> MConnection<S> {
    /// Run the secret connection handshake over `stream`, bounded by
    /// `config.handshake_timeout`, and wrap the result.
    pub async fn connect(
        stream: S,
        local: &IdentityKeypair,
        config: MConnConfig,
    ) -> Result<Self, ConnectionError> {
        config.validate()?;
        let conn = SecretConnection::make_with_config(stream, local, &config).await?;
        Self::new(conn, config)
    }

    /// Wrap an established secret connection.
    pub fn new(conn: SecretConnection<S>, config: MConnConfig) -> Result<Self, ConnectionError> {
        config.validate()?;
        let (error_tx, error_rx) = mpsc::channel(1);
        let remote_pub_key = *conn.remote_pub_key();

        let shared = Arc::new(Shared {
            phase: Mutex::new(ConnectionPhase::Created),
            quit: CancellationToken::new(),
            abort: CancellationToken::new(),
            done: CancellationToken::new(),
            flush_on_close: AtomicBool::new(false),
            wake_send: Notify::new(),
            send_pong: Notify::new(),
            pong_received: Notify::new(),
            error_tx,
            send_monitor: Monitor::new(DEFAULT_SAMPLE_RATE, DEFAULT_WINDOW_SIZE),
            recv_monitor: Monitor::new(DEFAULT_SAMPLE_RATE, DEFAULT_WINDOW_SIZE),
        });

        Ok(Self {
            config,
            shared,
            startup: Mutex::new(Some(Startup {
                conn,
                send_channels: Vec::new(),
                recv_channels: HashMap::new(),
                on_receive: None,
            })),
            channels: RwLock::new(BTreeMap::new()),
            error_rx: Mutex::new(Some(error_rx)),
            remote_pub_key,
            created: Instant::now(),
        })
    }

    /// Register a channel. Only allowed before [`start`](Self::start).
    pub fn register_channel(
        &self,
        desc: ChannelDescriptor,
    ) -> Result<ChannelHandle, ConnectionError> {
        let mut startup = self.startup.lock();
        let Some(startup) = startup.as_mut() else {
            return Err(ConnectionError::AlreadyStarted);
        };
        let mut channels = self.channels.write();
        if channels.contains_key(&desc.id) {
            return Err(ConnectionError::DuplicateChannel(desc.id));
        }

        let id = desc.id;
        let (sender, send, recv, receiver) =
            channel(desc, self.config.max_packet_msg_payload_size);
        let pos = startup.send_channels.partition_point(|ch| ch.id() < id);
        startup.send_channels.insert(pos, send);
        startup.recv_channels.insert(id, recv);

        let handle = ChannelHandle {
            sender,
            receiver,
            shared: self.shared.clone(),
        };
        channels.insert(id, handle.clone());
        debug!(channel_id = id, "registered channel");
        Ok(handle)
    }

    /// Set the callback for reassembled messages. Only allowed before start.
    ///
    /// Without a callback, messages wait in each channel's receive queue.
    pub fn set_on_receive<F>(&self, on_receive: F) -> Result<(), ConnectionError>
    where
        F: Fn(u8, Bytes) + Send + Sync + 'static,
    {
        match self.startup.lock().as_mut() {
            Some(startup) => {
                startup.on_receive = Some(Arc::new(on_receive));
                Ok(())
            }
            None => Err(ConnectionError::AlreadyStarted),
        }
    }

    /// Spawn the send and receive loops. Must be called within a tokio runtime.
    pub fn start(&self) -> Result<(), ConnectionError> {
        let startup = {
            let mut phase = self.shared.phase.lock();
            if *phase != ConnectionPhase::Created {
                return Err(ConnectionError::AlreadyStarted);
            }
            let startup = self
                .startup
                .lock()
                .take()
                .ok_or(ConnectionError::AlreadyStarted)?;
            *phase = ConnectionPhase::Running;
            startup
        };

        let Startup {
            conn,
            send_channels,
            recv_channels,
            on_receive,
        } = startup;
        let (reader, writer) = conn.into_split();
        let codec = PacketCodec::new(self.config.max_packet_msg_payload_size);

        let send = SendRoutine {
            writer,
            channels: send_channels,
            codec: codec.clone(),
            buf: BytesMut::with_capacity(MIN_WRITE_BUFFER_SIZE),
            flush_timer: ThrottleTimer::new(self.config.flush_throttle),
            shared: self.shared.clone(),
            config: self.config.clone(),
            interrupted: false,
        };
        let recv = RecvRoutine {
            reader,
            channels: recv_channels,
            codec,
            buf: BytesMut::with_capacity(MIN_READ_BUFFER_SIZE),
            on_receive,
            shared: self.shared.clone(),
            recv_rate: self.config.recv_rate,
        };

        let span = info_span!("mconn", remote = %fingerprint(&self.remote_pub_key));
        let send = tokio::spawn(send.run().instrument(span.clone()));
        let recv = tokio::spawn(recv.run().instrument(span.clone()));
        tokio::spawn(supervise(self.shared.clone(), send, recv).instrument(span));
        debug!("connection started");
        Ok(())
    }

    /// Close without draining queued messages and wait for the loops to exit.
    pub async fn close(&self, reason: impl Into<String>) {
        self.shutdown(reason.into(), false).await;
    }

    /// Send every queued message, then close.
    pub async fn flush_and_close(&self, reason: impl Into<String>) {
        self.shutdown(reason.into(), true).await;
    }

    async fn shutdown(&self, reason: String, flush: bool) {
        let current = {
            let mut phase = self.shared.phase.lock();
            let current = *phase;
            if current == ConnectionPhase::Created {
                *phase = ConnectionPhase::Closed;
            }
            current
        };

        match current {
            ConnectionPhase::Created => {
                let startup = self.startup.lock().take();
                if let Some(mut startup) = startup {
                    if let Err(err) = startup.conn.shutdown().await {
                        debug!(%err, "failed to shut down unstarted connection");
                    }
                }
                self.shared.quit.cancel();
                self.shared.done.cancel();
            }
            ConnectionPhase::Running => {
                info!(%reason, flush, "closing connection");
                self.shared.stop(ConnectionError::Closed(reason), flush);
            }
            ConnectionPhase::Closing | ConnectionPhase::Closed => {}
        }
        self.shared.done.cancelled().await;
    }

    /// Send `msg` on channel `channel_id`, waiting for queue room.
    pub async fn send(&self, channel_id: u8, msg: impl Into<Bytes>) -> bool {
        match self.channel(channel_id) {
            Some(handle) => handle.send(msg).await,
            None => {
                error!(channel_id, "cannot send on unknown channel");
                false
            }
        }
    }

    /// Send `msg` on channel `channel_id` if its queue has room.
    pub fn try_send(&self, channel_id: u8, msg: impl Into<Bytes>) -> bool {
        match self.channel(channel_id) {
            Some(handle) => handle.try_send(msg),
            None => {
                error!(channel_id, "cannot send on unknown channel");
                false
            }
        }
    }

    /// Whether channel `channel_id` could take a message right now.
    pub fn can_send(&self, channel_id: u8) -> bool {
        self.channel(channel_id)
            .is_some_and(|handle| handle.can_send())
    }
}

impl<S> MConnection<S> {
    /// Handle of a registered channel.
    pub fn channel(&self, id: u8) -> Option<ChannelHandle> {
        self.channels.read().get(&id).cloned()
    }

    /// Take the receiver of the connection's terminal error.
    ///
    /// At most one error is ever delivered. Returns `None` after the first call.
    pub fn error_ch(&self) -> Option<mpsc::Receiver<ConnectionError>> {
        self.error_rx.lock().take()
    }

    /// Current lifecycle state.
    pub fn phase(&self) -> ConnectionPhase {
        *self.shared.phase.lock()
    }

    /// Whether the loops are running.
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Identity key the peer proved during the handshake.
    pub fn remote_pub_key(&self) -> &VerifyingKey {
        &self.remote_pub_key
    }

    /// Connection configuration.
    pub fn config(&self) -> &MConnConfig {
        &self.config
    }

    /// Throughput and queue snapshot.
    pub fn status(&self) -> Status {
        let channels = self
            .channels
            .read()
            .values()
            .map(|handle| {
                let shared = handle.sender.shared();
                ChannelStatus {
                    id: shared.desc.id,
                    priority: shared.desc.priority,
                    send_queue_size: shared.queue_size(),
                    send_queue_capacity: shared.desc.send_queue_capacity,
                }
            })
            .collect();

        Status {
            connected_for: self.created.elapsed(),
            send_monitor: self.shared.send_monitor.status(),
            recv_monitor: self.shared.recv_monitor.status(),
            channels,
        }
    }
}

impl<S> Drop for MConnection<S> {
    fn drop(&mut self) {
        self.shared
            .stop(ConnectionError::Closed("connection dropped".into()), false);
    }
}

impl<S> std::fmt::Debug for MConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MConnection")
            .field("remote", &fingerprint(&self.remote_pub_key))
            .field("phase", &*self.shared.phase.lock())
            .field("channels", &self.channels.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

fn fingerprint(key: &VerifyingKey) -> String {
    key.as_bytes()[..6]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

// =============================================================================
// SEND LOOP
// =============================================================================

enum Action {
    Flush,
    Ping,
    Pong,
    SendSome,
}

struct SendRoutine<S> {
    writer: SecretWriteHalf<S>,
    channels: Vec<SendChannel>,
    codec: PacketCodec,
    buf: BytesMut,
    flush_timer: ThrottleTimer,
    shared: Arc<Shared>,
    config: MConnConfig,
    /// A write was abandoned midway; the stream is unusable.
    interrupted: bool,
}

impl<S: RawStream> SendRoutine<S> {
    async fn run(mut self) -> Self {
        let shared = self.shared.clone();
        let start = Instant::now();
        let mut ping = time::interval_at(
            start + self.config.ping_interval,
            self.config.ping_interval,
        );
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stats = time::interval_at(start + UPDATE_STATS_INTERVAL, UPDATE_STATS_INTERVAL);
        let mut pong_deadline: Option<Instant> = None;

        loop {
            let action = tokio::select! {
                _ = shared.quit.cancelled() => break,
                _ = sleep_until_opt(self.flush_timer.deadline()) => {
                    self.flush_timer.unset();
                    Action::Flush
                }
                _ = stats.tick() => {
                    self.channels.iter_mut().for_each(SendChannel::update_stats);
                    continue;
                }
                _ = ping.tick() => {
                    debug!("send ping");
                    pong_deadline = Some(Instant::now() + self.config.pong_timeout);
                    Action::Ping
                }
                _ = sleep_until_opt(pong_deadline) => {
                    let err = ConnectionError::PongTimeout;
                    error!(%err, "connection failed in send routine");
                    shared.stop(err, false);
                    break;
                }
                _ = shared.pong_received.notified() => {
                    pong_deadline = None;
                    continue;
                }
                _ = shared.send_pong.notified() => {
                    debug!("send pong");
                    Action::Pong
                }
                _ = shared.wake_send.notified() => Action::SendSome,
            };

            let result = tokio::select! {
                biased;
                _ = shared.abort.cancelled() => {
                    self.interrupted = true;
                    break;
                }
                result = self.perform(action) => result,
            };

            if let Err(err) = result {
                if !shared.quit.is_cancelled() {
                    error!(%err, "connection failed in send routine");
                    shared.stop(err, false);
                }
                break;
            }
        }
        self
    }

    async fn perform(&mut self, action: Action) -> Result<(), ConnectionError> {
        match action {
            Action::Flush => self.flush().await,
            Action::Ping => self.send_control(Packet::Ping).await,
            Action::Pong => self.send_control(Packet::Pong).await,
            Action::SendSome => {
                if !self.send_some_packet_msgs().await? {
                    self.shared.wake_send.notify_one();
                }
                Ok(())
            }
        }
    }

    async fn send_control(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        let before = self.buf.len();
        self.codec.encode(packet, &mut self.buf)?;
        self.shared.send_monitor.update(self.buf.len() - before);
        self.flush().await
    }

    async fn flush(&mut self) -> Result<(), ConnectionError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.writer.write(&self.buf).await?;
        self.buf.clear();
        Ok(())
    }

    /// Rate limit, then send one batch. Returns true once the queues are empty.
    async fn send_some_packet_msgs(&mut self) -> Result<bool, ConnectionError> {
        self.shared
            .send_monitor
            .limit(self.codec.max_size(), self.config.send_rate, true)
            .await;
        self.send_batch_packet_msgs(NUM_BATCH_PACKET_MSGS).await
    }

    async fn send_batch_packet_msgs(&mut self, batch: usize) -> Result<bool, ConnectionError> {
        let mut sent = 0;
        let mut exhausted = false;
        for _ in 0..batch {
            let Some(i) = select_channel(&mut self.channels) else {
                exhausted = true;
                break;
            };
            sent += self.channels[i].write_packet_msg_to(&mut self.codec, &mut self.buf)?;
            self.flush_timer.set();
            if self.buf.len() >= MIN_WRITE_BUFFER_SIZE {
                self.flush().await?;
            }
        }
        if sent > 0 {
            self.shared.send_monitor.update(sent);
        }
        Ok(exhausted)
    }

    /// Drain the queues if requested, then shut the stream down.
    async fn finish(mut self) {
        if self.interrupted {
            return;
        }

        if self.shared.flush_on_close.load(Ordering::Acquire) {
            loop {
                match self.send_batch_packet_msgs(NUM_BATCH_PACKET_MSGS).await {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(err) => {
                        warn!(%err, "failed to drain send queues");
                        return;
                    }
                }
            }
            if let Err(err) = self.flush().await {
                warn!(%err, "failed to flush on close");
                return;
            }
        }

        if let Err(err) = self.writer.shutdown().await {
            debug!(%err, "failed to shut down stream");
        }
    }
}

// =============================================================================
// RECEIVE LOOP
// =============================================================================

struct RecvRoutine<S> {
    reader: SecretReadHalf<S>,
    channels: HashMap<u8, RecvChannel>,
    codec: PacketCodec,
    buf: BytesMut,
    on_receive: Option<OnReceive>,
    shared: Arc<Shared>,
    recv_rate: i64,
}

impl<S: RawStream> RecvRoutine<S> {
    async fn run(mut self) {
        let shared = self.shared.clone();
        loop {
            let result = tokio::select! {
                _ = shared.quit.cancelled() => break,
                result = self.recv_next() => result,
            };

            if let Err(err) = result {
                if shared.quit.is_cancelled() {
                    break;
                }
                if err.is_eof() {
                    info!("connection is closed by the remote side");
                } else {
                    error!(%err, "connection failed in recv routine");
                }
                shared.stop(err, false);
                break;
            }
        }
    }

    async fn recv_next(&mut self) -> Result<(), ConnectionError> {
        self.shared
            .recv_monitor
            .limit(self.codec.max_size(), self.recv_rate, true)
            .await;

        match self.read_packet().await? {
            Packet::Ping => {
                debug!("receive ping");
                self.shared.send_pong.notify_one();
            }
            Packet::Pong => {
                debug!("receive pong");
                self.shared.pong_received.notify_one();
            }
            Packet::Msg {
                channel_id,
                eof,
                data,
            } => {
                let channel = self
                    .channels
                    .get_mut(&channel_id)
                    .ok_or(ConnectionError::UnknownChannel(channel_id))?;
                if let Some(msg) = channel.recv_packet_msg(eof, &data)? {
                    trace!(channel_id, len = msg.len(), "received message");
                    match &self.on_receive {
                        Some(on_receive) => on_receive(channel_id, msg),
                        None => channel.deliver(msg).await,
                    }
                }
            }
        }
        Ok(())
    }

    async fn read_packet(&mut self) -> Result<Packet, ConnectionError> {
        loop {
            let before = self.buf.len();
            if let Some(packet) = self.codec.decode(&mut self.buf)? {
                self.shared.recv_monitor.update(before - self.buf.len());
                return Ok(packet);
            }
            self.reader.read_buf(&mut self.buf).await?;
        }
    }
}

// =============================================================================
// SUPERVISOR
// =============================================================================

async fn supervise<S: RawStream>(
    shared: Arc<Shared>,
    send: JoinHandle<SendRoutine<S>>,
    recv: JoinHandle<()>,
) {
    shared.quit.cancelled().await;

    match send.await {
        Ok(routine) => routine.finish().await,
        Err(err) => error!(%err, "send routine panicked"),
    }
    if let Err(err) = recv.await {
        error!(%err, "recv routine panicked");
    }

    shared.send_monitor.done();
    shared.recv_monitor.done();
    *shared.phase.lock() = ConnectionPhase::Closed;
    shared.done.cancel();
    debug!("connection closed");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::crypto::IdentityKeypair;

    type Pipe = tokio::io::DuplexStream;

    async fn secret_pair() -> (SecretConnection<Pipe>, SecretConnection<Pipe>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ka, kb) = (IdentityKeypair::generate(), IdentityKeypair::generate());
        let (a, b) = tokio::join!(SecretConnection::make(a, &ka), SecretConnection::make(b, &kb));
        (a.unwrap(), b.unwrap())
    }

    async fn mconn_pair() -> (MConnection<Pipe>, MConnection<Pipe>) {
        let (a, b) = secret_pair().await;
        (
            MConnection::new(a, MConnConfig::default()).unwrap(),
            MConnection::new(b, MConnConfig::default()).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_register_duplicate_channel() {
        let (a, _b) = mconn_pair().await;
        a.register_channel(ChannelDescriptor::new(1)).unwrap();
        assert!(matches!(
            a.register_channel(ChannelDescriptor::new(1)),
            Err(ConnectionError::DuplicateChannel(1))
        ));
    }

    #[tokio::test]
    async fn test_register_after_start() {
        let (a, _b) = mconn_pair().await;
        a.start().unwrap();
        assert!(matches!(
            a.register_channel(ChannelDescriptor::new(1)),
            Err(ConnectionError::AlreadyStarted)
        ));
        assert!(matches!(a.start(), Err(ConnectionError::AlreadyStarted)));
        a.close("test").await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let (a, _b) = secret_pair().await;
        let config = MConnConfig::default()
            .ping_interval(Duration::from_secs(10))
            .pong_timeout(Duration::from_secs(10));
        assert!(matches!(
            MConnection::new(a, config),
            Err(ConnectionError::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_uses_configured_handshake_timeout() {
        let (a, _silent) = tokio::io::duplex(64 * 1024);
        let config = MConnConfig::default().handshake_timeout(Duration::from_millis(250));
        let started = Instant::now();

        let res = MConnection::connect(a, &IdentityKeypair::generate(), config).await;
        assert!(matches!(res, Err(ConnectionError::HandshakeTimeout)));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(250), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(1), "{elapsed:?}");
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config_before_handshake() {
        let (a, _silent) = tokio::io::duplex(64 * 1024);
        let config = MConnConfig::default().flush_throttle(Duration::ZERO);
        assert!(matches!(
            MConnection::connect(a, &IdentityKeypair::generate(), config).await,
            Err(ConnectionError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_send_before_start_fails() {
        let (a, _b) = mconn_pair().await;
        let ch = a.register_channel(ChannelDescriptor::new(1)).unwrap();
        assert!(!ch.try_send(&b"early"[..]));
        assert!(!ch.can_send());
        assert!(!a.send(2, &b"unknown"[..]).await);
    }

    #[tokio::test]
    async fn test_close_unstarted() {
        let (a, _b) = mconn_pair().await;
        a.close("never started").await;
        assert_eq!(a.phase(), ConnectionPhase::Closed);
        assert!(matches!(a.start(), Err(ConnectionError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_message_roundtrip_and_status() {
        let (a, b) = mconn_pair().await;
        let ch = a
            .register_channel(ChannelDescriptor::new(0x20).priority(3))
            .unwrap();
        b.register_channel(ChannelDescriptor::new(0x20)).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.set_on_receive(move |id, msg| {
            let _ = tx.send((id, msg));
        })
        .unwrap();

        a.start().unwrap();
        b.start().unwrap();
        assert!(a.is_running());

        let msg = vec![0x5au8; 5000];
        assert!(ch.send(msg.clone()).await);
        let (id, got) = rx.recv().await.unwrap();
        assert_eq!(id, 0x20);
        assert_eq!(&got[..], &msg[..]);

        let status = a.status();
        let channel = status.channel(0x20).unwrap();
        assert_eq!(channel.priority, 3);
        assert_eq!(channel.send_queue_capacity, 1);

        a.close("done").await;
        b.close("done").await;
        assert_eq!(a.phase(), ConnectionPhase::Closed);
    }

    #[tokio::test]
    async fn test_single_error_on_close() {
        let (a, b) = mconn_pair().await;
        let mut errors = a.error_ch().unwrap();
        assert!(a.error_ch().is_none());
        a.start().unwrap();
        b.start().unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let a = Arc::new(a);
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let a = a.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                a.close("concurrent").await;
                calls.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        assert!(matches!(errors.recv().await, Some(ConnectionError::Closed(_))));
        assert!(errors.try_recv().is_err());
        b.close("done").await;
    }
}
