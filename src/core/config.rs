//! Connection and channel configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::constants::*;
use super::error::ConnectionError;

/// Tunables of a multiplexed connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MConnConfig {
    /// Send rate limit in bytes per second.
    pub send_rate: i64,

    /// Receive rate limit in bytes per second.
    pub recv_rate: i64,

    /// Largest payload a single packet carries.
    pub max_packet_msg_payload_size: usize,

    /// Delay between the first buffered packet and the flush.
    pub flush_throttle: Duration,

    /// Interval between pings.
    pub ping_interval: Duration,

    /// Time allowed for a pong after a ping. Must be below `ping_interval`.
    pub pong_timeout: Duration,

    /// Bound on the secret connection handshake.
    pub handshake_timeout: Duration,
}

impl MConnConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self {
            send_rate: DEFAULT_SEND_RATE,
            recv_rate: DEFAULT_RECV_RATE,
            max_packet_msg_payload_size: DEFAULT_MAX_PACKET_MSG_PAYLOAD_SIZE,
            flush_throttle: DEFAULT_FLUSH_THROTTLE,
            ping_interval: DEFAULT_PING_INTERVAL,
            pong_timeout: DEFAULT_PONG_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Set the send rate.
    pub fn send_rate(mut self, rate: i64) -> Self {
        self.send_rate = rate;
        self
    }

    /// Set the receive rate.
    pub fn recv_rate(mut self, rate: i64) -> Self {
        self.recv_rate = rate;
        self
    }

    /// Set the maximum packet payload.
    pub fn max_packet_msg_payload_size(mut self, size: usize) -> Self {
        self.max_packet_msg_payload_size = size;
        self
    }

    /// Set the flush throttle.
    pub fn flush_throttle(mut self, throttle: Duration) -> Self {
        self.flush_throttle = throttle;
        self
    }

    /// Set the ping interval.
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the pong timeout.
    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = timeout;
        self
    }

    /// Set the handshake timeout.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Check the configuration for values the connection cannot run with.
    pub fn validate(&self) -> Result<(), ConnectionError> {
        if self.pong_timeout >= self.ping_interval {
            return Err(ConnectionError::Config(format!(
                "pong_timeout ({:?}) must be less than ping_interval ({:?})",
                self.pong_timeout, self.ping_interval
            )));
        }
        if self.max_packet_msg_payload_size == 0 {
            return Err(ConnectionError::Config(
                "max_packet_msg_payload_size must be positive".into(),
            ));
        }
        if self.send_rate < 0 || self.recv_rate < 0 {
            return Err(ConnectionError::Config(format!(
                "rates must not be negative (send {}, recv {})",
                self.send_rate, self.recv_rate
            )));
        }
        if self.flush_throttle.is_zero() {
            return Err(ConnectionError::Config("flush_throttle must be positive".into()));
        }
        Ok(())
    }
}

impl Default for MConnConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Describes one logical channel of a connection.
///
/// Zero-valued fields are replaced with defaults by [`fill_defaults`].
///
/// [`fill_defaults`]: ChannelDescriptor::fill_defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelDescriptor {
    /// Channel id carried in every packet.
    pub id: u8,

    /// Scheduling weight; higher means a larger share of bandwidth.
    pub priority: u32,

    /// Messages that may wait in the send queue.
    pub send_queue_capacity: usize,

    /// Initial capacity of the reassembly buffer.
    pub recv_buffer_capacity: usize,

    /// Largest message the channel reassembles.
    pub recv_message_capacity: usize,
}

impl ChannelDescriptor {
    /// Create a descriptor with default values for `id`.
    pub fn new(id: u8) -> Self {
        Self {
            id,
            priority: DEFAULT_PRIORITY,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            recv_buffer_capacity: DEFAULT_RECV_BUFFER_CAPACITY,
            recv_message_capacity: DEFAULT_RECV_MESSAGE_CAPACITY,
        }
    }

    /// Set the priority.
    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the send queue capacity.
    pub fn send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity;
        self
    }

    /// Set the initial reassembly buffer capacity.
    pub fn recv_buffer_capacity(mut self, capacity: usize) -> Self {
        self.recv_buffer_capacity = capacity;
        self
    }

    /// Set the largest reassembled message.
    pub fn recv_message_capacity(mut self, capacity: usize) -> Self {
        self.recv_message_capacity = capacity;
        self
    }

    /// Replace zero-valued fields with defaults.
    pub fn fill_defaults(mut self) -> Self {
        if self.priority == 0 {
            self.priority = DEFAULT_PRIORITY;
        }
        if self.send_queue_capacity == 0 {
            self.send_queue_capacity = DEFAULT_SEND_QUEUE_CAPACITY;
        }
        if self.recv_buffer_capacity == 0 {
            self.recv_buffer_capacity = DEFAULT_RECV_BUFFER_CAPACITY;
        }
        if self.recv_message_capacity == 0 {
            self.recv_message_capacity = DEFAULT_RECV_MESSAGE_CAPACITY;
        }
        self
    }
}

impl Default for ChannelDescriptor {
    fn default() -> Self {
        Self::new(0)
    }
}
