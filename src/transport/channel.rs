//! Per-channel send queues and reassembly buffers.
//!
//! A registered channel is split three ways:
//! - [`ChannelSender`]: cloneable producer side of the bounded send queue
//! - [`SendChannel`]: owned by the send loop; chunks queued messages
//! - [`RecvChannel`]: owned by the receive loop; reassembles chunks and
//!   queues finished messages for [`ChannelReceiver`] when no callback is set
//!
//! Only the send queue size is shared between them. It counts a message from
//! just before it enters the queue until its last chunk is taken, so it never
//! drops below zero.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::packet::{Packet, PacketCodec};
use crate::core::{
    ChannelDescriptor, ConnectionError, PacketError, RECENTLY_SENT_DECAY, RECV_QUEUE_CAPACITY,
};

/// State visible to both the producers and the send loop.
#[derive(Debug)]
pub(crate) struct ChannelShared {
    pub(crate) desc: ChannelDescriptor,
    queue_size: AtomicUsize,
}

impl ChannelShared {
    /// Messages queued or partially sent.
    pub(crate) fn queue_size(&self) -> usize {
        self.queue_size.load(Ordering::Acquire)
    }
}

/// Build the parts of a channel.
pub(crate) fn channel(
    desc: ChannelDescriptor,
    max_payload: usize,
) -> (ChannelSender, SendChannel, RecvChannel, ChannelReceiver) {
    let desc = desc.fill_defaults();
    let (tx, rx) = mpsc::channel(desc.send_queue_capacity);
    let (inbox_tx, inbox_rx) = mpsc::channel(RECV_QUEUE_CAPACITY);
    let shared = Arc::new(ChannelShared {
        desc: desc.clone(),
        queue_size: AtomicUsize::new(0),
    });

    let sender = ChannelSender {
        tx,
        shared: shared.clone(),
    };
    let send = SendChannel {
        id: desc.id,
        priority: desc.priority,
        rx,
        sending: None,
        recently_sent: 0,
        max_payload,
        shared,
    };
    let recv = RecvChannel {
        id: desc.id,
        capacity: desc.recv_message_capacity,
        recving: BytesMut::with_capacity(desc.recv_buffer_capacity),
        inbox: inbox_tx,
    };
    let receiver = ChannelReceiver {
        inbox: Arc::new(AsyncMutex::new(inbox_rx)),
    };
    (sender, send, recv, receiver)
}

/// Producer side of a channel's send queue.
#[derive(Debug, Clone)]
pub(crate) struct ChannelSender {
    tx: mpsc::Sender<Bytes>,
    shared: Arc<ChannelShared>,
}

impl ChannelSender {
    pub(crate) fn id(&self) -> u8 {
        self.shared.desc.id
    }

    pub(crate) fn shared(&self) -> &Arc<ChannelShared> {
        &self.shared
    }

    /// Queue `msg`, waiting for room unless `quit` fires first.
    pub(crate) async fn enqueue(&self, msg: Bytes, quit: &CancellationToken) -> bool {
        let slot = QueueSlot::reserve(&self.shared.queue_size);
        let sent = tokio::select! {
            _ = quit.cancelled() => false,
            res = self.tx.send(msg) => res.is_ok(),
        };
        if sent {
            slot.commit();
        }
        sent
    }

    /// Queue `msg` without waiting.
    pub(crate) fn try_enqueue(&self, msg: Bytes) -> Result<(), ConnectionError> {
        let slot = QueueSlot::reserve(&self.shared.queue_size);
        match self.tx.try_send(msg) {
            Ok(()) => {
                slot.commit();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(ConnectionError::QueueFull(self.id())),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ConnectionError::NotRunning),
        }
    }

    /// Whether a message could be queued right now.
    pub(crate) fn can_send(&self) -> bool {
        self.shared.queue_size() < self.shared.desc.send_queue_capacity
    }
}

/// A queue size increment taken before a message enters the queue.
///
/// Dropped without [`commit`](Self::commit), the increment is undone.
struct QueueSlot<'a> {
    size: Option<&'a AtomicUsize>,
}

impl<'a> QueueSlot<'a> {
    fn reserve(size: &'a AtomicUsize) -> Self {
        size.fetch_add(1, Ordering::AcqRel);
        Self { size: Some(size) }
    }

    fn commit(mut self) {
        self.size = None;
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        if let Some(size) = self.size {
            size.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Send-loop side of a channel.
#[derive(Debug)]
pub(crate) struct SendChannel {
    id: u8,
    priority: u32,
    rx: mpsc::Receiver<Bytes>,
    sending: Option<Bytes>,
    recently_sent: i64,
    max_payload: usize,
    shared: Arc<ChannelShared>,
}

impl SendChannel {
    pub(crate) fn id(&self) -> u8 {
        self.id
    }

    #[cfg(test)]
    pub(crate) fn recently_sent(&self) -> i64 {
        self.recently_sent
    }

    /// Whether a message is in flight, pulling the next one if not.
    pub(crate) fn has_pending(&mut self) -> bool {
        if self.sending.is_none() {
            match self.rx.try_recv() {
                Ok(msg) => self.sending = Some(msg),
                Err(_) => return false,
            }
        }
        true
    }

    /// Scheduling key: bytes recently sent per unit of priority.
    fn load(&self) -> f32 {
        self.recently_sent as f32 / self.priority as f32
    }

    /// Take the next chunk of the in-flight message.
    ///
    /// The final chunk carries `eof` and releases the queue slot.
    fn next_packet(&mut self) -> Option<Packet> {
        let msg = self.sending.as_mut()?;
        let take = msg.len().min(self.max_payload);
        let data = msg.split_to(take);
        let eof = msg.is_empty();
        if eof {
            self.sending = None;
            self.shared.queue_size.fetch_sub(1, Ordering::AcqRel);
        }
        Some(Packet::Msg {
            channel_id: self.id,
            eof,
            data,
        })
    }

    /// Encode the next chunk into `buf`, returning the bytes written.
    pub(crate) fn write_packet_msg_to(
        &mut self,
        codec: &mut PacketCodec,
        buf: &mut BytesMut,
    ) -> Result<usize, PacketError> {
        let Some(packet) = self.next_packet() else {
            return Ok(0);
        };
        let before = buf.len();
        codec.encode(packet, buf)?;
        let n = buf.len() - before;
        self.recently_sent += n as i64;
        Ok(n)
    }

    /// Decay `recently_sent` so old traffic counts less.
    pub(crate) fn update_stats(&mut self) {
        self.recently_sent = (self.recently_sent as f64 * RECENTLY_SENT_DECAY) as i64;
    }
}

/// Index of the pending channel with the least recent traffic per priority.
///
/// Ties go to the lowest index.
pub(crate) fn select_channel(channels: &mut [SendChannel]) -> Option<usize> {
    let mut least: Option<(usize, f32)> = None;
    for (i, ch) in channels.iter_mut().enumerate() {
        if !ch.has_pending() {
            continue;
        }
        let load = ch.load();
        if least.is_none_or(|(_, min)| load < min) {
            least = Some((i, load));
        }
    }
    least.map(|(i, _)| i)
}

/// Receive-loop side of a channel.
#[derive(Debug)]
pub(crate) struct RecvChannel {
    id: u8,
    capacity: usize,
    recving: BytesMut,
    inbox: mpsc::Sender<Bytes>,
}

impl RecvChannel {
    /// Append a chunk, returning the message once `eof` completes it.
    pub(crate) fn recv_packet_msg(
        &mut self,
        eof: bool,
        data: &[u8],
    ) -> Result<Option<Bytes>, ConnectionError> {
        if self.recving.len() + data.len() > self.capacity {
            return Err(ConnectionError::MessageTooBig {
                channel_id: self.id,
                capacity: self.capacity,
            });
        }
        self.recving.extend_from_slice(data);
        if eof {
            return Ok(Some(self.recving.split().freeze()));
        }
        Ok(None)
    }

    /// Queue a finished message for [`ChannelReceiver::recv`], waiting while
    /// the queue is full.
    pub(crate) async fn deliver(&self, msg: Bytes) {
        if self.inbox.send(msg).await.is_err() {
            debug!(channel_id = self.id, "receiver gone, dropping message");
        }
    }
}

/// Consumer side of a channel's receive queue.
///
/// Ends once the connection stops and the queue is drained.
#[derive(Debug, Clone)]
pub(crate) struct ChannelReceiver {
    inbox: Arc<AsyncMutex<mpsc::Receiver<Bytes>>>,
}

impl ChannelReceiver {
    pub(crate) async fn recv(&self) -> Option<Bytes> {
        self.inbox.lock().await.recv().await
    }

    pub(crate) fn try_recv(&self) -> Option<Bytes> {
        self.inbox.try_lock().ok()?.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::codec::Decoder;

    use super::*;

    fn desc(id: u8) -> ChannelDescriptor {
        ChannelDescriptor::new(id)
    }

    #[test]
    fn test_chunks_and_eof() {
        let (sender, mut send, _, _) = channel(desc(1).send_queue_capacity(4), 10);
        sender.try_enqueue(Bytes::from_static(&[3u8; 25])).unwrap();
        assert_eq!(sender.shared().queue_size(), 1);

        let mut codec = PacketCodec::new(10);
        let mut buf = BytesMut::new();
        assert!(send.has_pending());
        for _ in 0..3 {
            send.write_packet_msg_to(&mut codec, &mut buf).unwrap();
        }
        assert!(!send.has_pending());
        assert_eq!(sender.shared().queue_size(), 0);
        assert_eq!(send.recently_sent(), buf.len() as i64);

        let mut packets = Vec::new();
        while let Some(p) = codec.decode(&mut buf).unwrap() {
            packets.push(p);
        }
        let sizes: Vec<(usize, bool)> = packets
            .iter()
            .map(|p| match p {
                Packet::Msg { data, eof, .. } => (data.len(), *eof),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(sizes, vec![(10, false), (10, false), (5, true)]);
    }

    #[test]
    fn test_empty_message_sends_single_eof() {
        let (sender, mut send, _, _) = channel(desc(1), 10);
        sender.try_enqueue(Bytes::new()).unwrap();

        assert!(send.has_pending());
        assert_eq!(
            send.next_packet(),
            Some(Packet::msg(1, true, Bytes::new()))
        );
        assert!(!send.has_pending());
    }

    #[test]
    fn test_try_enqueue_full() {
        let (sender, _send, _, _) = channel(desc(7), 10);
        sender.try_enqueue(Bytes::from_static(b"a")).unwrap();
        assert!(!sender.can_send());
        assert!(matches!(
            sender.try_enqueue(Bytes::from_static(b"b")),
            Err(ConnectionError::QueueFull(7))
        ));
    }

    #[tokio::test]
    async fn test_blocking_enqueue_waits_for_room() {
        let (sender, mut send, _, _) = channel(desc(1), 10);
        let quit = CancellationToken::new();
        assert!(sender.enqueue(Bytes::from_static(b"first"), &quit).await);

        let second = {
            let sender = sender.clone();
            let quit = quit.clone();
            tokio::spawn(async move { sender.enqueue(Bytes::from_static(b"second"), &quit).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        // Pulling the first message into flight frees its queue slot.
        assert!(send.has_pending());
        assert!(second.await.unwrap());
        assert_eq!(sender.shared().queue_size(), 2);
    }

    #[tokio::test]
    async fn test_blocking_enqueue_aborts_on_quit() {
        let (sender, _send, _, _) = channel(desc(1), 10);
        let quit = CancellationToken::new();
        assert!(sender.enqueue(Bytes::from_static(b"first"), &quit).await);

        quit.cancel();
        assert!(!sender.enqueue(Bytes::from_static(b"second"), &quit).await);
        assert_eq!(sender.shared().queue_size(), 1);
    }

    #[tokio::test]
    async fn test_dropped_enqueue_releases_slot() {
        let (sender, _send, _, _) = channel(desc(1), 10);
        let quit = CancellationToken::new();
        assert!(sender.enqueue(Bytes::from_static(b"first"), &quit).await);

        let waiting = tokio::time::timeout(
            Duration::from_millis(20),
            sender.enqueue(Bytes::from_static(b"second"), &quit),
        )
        .await;
        assert!(waiting.is_err());
        assert_eq!(sender.shared().queue_size(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_queue_size_never_wraps_under_contention() {
        const MESSAGES: usize = 5_000;
        let (sender, mut send, _, _) = channel(desc(1).send_queue_capacity(4), 1024);
        let quit = CancellationToken::new();

        let producer = {
            let sender = sender.clone();
            tokio::spawn(async move {
                for i in 0..MESSAGES {
                    assert!(sender.enqueue(Bytes::from(vec![i as u8; 8]), &quit).await);
                }
            })
        };

        let mut codec = PacketCodec::new(1024);
        let mut buf = BytesMut::new();
        let mut done = 0;
        while done < MESSAGES {
            if !send.has_pending() {
                tokio::task::yield_now().await;
                continue;
            }
            send.write_packet_msg_to(&mut codec, &mut buf).unwrap();
            buf.clear();
            done += 1;
            // queued, in flight and one blocked producer at most
            let size = sender.shared().queue_size();
            assert!(size <= 4 + 2, "queue size {size}");
        }
        producer.await.unwrap();
        assert_eq!(sender.shared().queue_size(), 0);
    }

    #[tokio::test]
    async fn test_delivered_messages_reach_receiver() {
        let (_, _, mut recv, receiver) = channel(desc(5), 10);
        let msg = recv.recv_packet_msg(true, b"queued").unwrap().unwrap();
        recv.deliver(msg).await;
        recv.deliver(Bytes::from_static(b"second")).await;

        assert_eq!(receiver.recv().await, Some(Bytes::from_static(b"queued")));
        assert_eq!(receiver.try_recv(), Some(Bytes::from_static(b"second")));
        assert_eq!(receiver.try_recv(), None);

        drop(recv);
        assert_eq!(receiver.recv().await, None);
    }

    #[tokio::test]
    async fn test_full_receive_queue_applies_backpressure() {
        let (_, _, recv, receiver) = channel(desc(5), 10);
        for _ in 0..RECV_QUEUE_CAPACITY {
            recv.deliver(Bytes::from_static(b"x")).await;
        }
        let blocked =
            tokio::time::timeout(Duration::from_millis(20), recv.deliver(Bytes::new())).await;
        assert!(blocked.is_err());

        assert!(receiver.recv().await.is_some());
        recv.deliver(Bytes::from_static(b"last")).await;
    }

    #[test]
    fn test_reassembly() {
        let (_, _, mut recv, _) = channel(desc(1), 10);
        assert_eq!(recv.recv_packet_msg(false, b"hello ").unwrap(), None);
        assert_eq!(
            recv.recv_packet_msg(true, b"world").unwrap(),
            Some(Bytes::from_static(b"hello world"))
        );
        assert_eq!(
            recv.recv_packet_msg(true, b"").unwrap(),
            Some(Bytes::new())
        );
    }

    #[test]
    fn test_reassembly_capacity() {
        let (_, _, mut recv, _) = channel(desc(9).recv_message_capacity(8), 10);
        recv.recv_packet_msg(false, b"12345").unwrap();
        assert!(matches!(
            recv.recv_packet_msg(true, b"6789"),
            Err(ConnectionError::MessageTooBig { channel_id: 9, capacity: 8 })
        ));
    }

    #[test]
    fn test_update_stats_decays() {
        let (sender, mut send, _, _) = channel(desc(1), 1024);
        sender.try_enqueue(Bytes::from_static(&[0u8; 100])).unwrap();
        let mut buf = BytesMut::new();
        send.write_packet_msg_to(&mut PacketCodec::new(1024), &mut buf).unwrap();

        let before = send.recently_sent();
        send.update_stats();
        assert_eq!(send.recently_sent(), (before as f64 * 0.8) as i64);
    }

    #[test]
    fn test_select_channel_prefers_priority() {
        let max = 1024;
        let (low_tx, low, _, _) = channel(desc(1).priority(1), max);
        let (high_tx, high, _, _) = channel(desc(2).priority(4), max);
        let mut channels = vec![low, high];
        let mut codec = PacketCodec::new(max);
        let mut buf = BytesMut::new();
        let mut picks = [0usize; 2];

        for round in 0..20_000 {
            for tx in [&low_tx, &high_tx] {
                if tx.can_send() {
                    tx.try_enqueue(Bytes::from(vec![0u8; 64 * 1024])).unwrap();
                }
            }
            let i = select_channel(&mut channels).unwrap();
            picks[i] += 1;
            channels[i].write_packet_msg_to(&mut codec, &mut buf).unwrap();
            buf.clear();
            if round % 200 == 199 {
                channels.iter_mut().for_each(SendChannel::update_stats);
            }
        }

        let ratio = picks[1] as f64 / picks[0] as f64;
        assert!((3.5..4.5).contains(&ratio), "ratio {ratio}");
    }

    #[test]
    fn test_select_channel_none_pending() {
        let (_tx, send, _, _) = channel(desc(1), 10);
        assert_eq!(select_channel(&mut [send]), None);
    }
}
