//! Point-to-point variant: a central server keeps `username -> address` and
//! `file -> holders`, users talk newline-terminated text, and files move as a
//! raw byte stream that ends when the sender closes.

mod client;
mod registry;
mod server;

pub use client::{fetch_from, serve_peers, LegacyClient};
pub use registry::{Holder, LegacyRegistry, LegacyUser, Registration};
pub use server::{probe, LegacyServer, PING_TIMEOUT};
