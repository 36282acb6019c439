//! Connection status snapshots.

use std::time::Duration;

use crate::flowrate;

/// Snapshot of a multiplexed connection.
#[derive(Debug, Clone)]
pub struct Status {
    /// Time since the connection was created.
    pub connected_for: Duration,
    /// Outbound throughput.
    pub send_monitor: flowrate::Status,
    /// Inbound throughput.
    pub recv_monitor: flowrate::Status,
    /// Registered channels, ordered by id.
    pub channels: Vec<ChannelStatus>,
}

/// Snapshot of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatus {
    /// Channel id.
    pub id: u8,
    /// Scheduling weight.
    pub priority: u32,
    /// Messages queued or partially sent.
    pub send_queue_size: usize,
    /// Send queue bound.
    pub send_queue_capacity: usize,
}

impl Status {
    /// Status of channel `id`, if registered.
    pub fn channel(&self, id: u8) -> Option<&ChannelStatus> {
        self.channels.iter().find(|ch| ch.id == id)
    }
}
