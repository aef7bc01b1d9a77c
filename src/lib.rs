//! Peer-to-peer chunked file distribution: a tracker with liveness expiry,
//! a connection manager that schedules and de-duplicates block requests,
//! and a piece store that assembles out-of-order blocks into the file.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod legacy;
pub mod manager;
pub mod peer;
pub mod piece;
pub mod storage;
pub mod tracker;

pub use error::{Result, SwarmError};
