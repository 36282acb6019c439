//! Flow rate monitoring.
//!
//! A [`Monitor`] tracks the bytes moving through one direction of a stream
//! and throttles it to a configured rate. Monitors share a coarse [`Clock`].

mod clock;
mod monitor;

pub use clock::{Clock, ManualClock, TickClock, clock_round};
pub use monitor::{Monitor, Status};
