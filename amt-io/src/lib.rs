//! AMT I/O and Platform Abstraction
//!
//! This crate provides the platform pieces an AMT gateway runs on: a UDP
//! socket wrapper for the tunnel and a shared one-shot timer facility.

pub mod socket;
pub mod time;

pub use socket::{is_unreachable, AmtSocket, SocketError};
pub use time::{Scheduler, TimerHandle};
