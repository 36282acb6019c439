//! Core constants, configuration, and error types.
//!
//! This module has no transport dependencies and is always included.

mod config;
mod constants;
mod error;

pub use config::*;
pub use constants::*;
pub use error::*;
