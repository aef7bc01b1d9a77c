mod client;
mod message;
mod peer;
mod registry;
mod server;

pub use client::TrackerClient;
pub use message::{TrackerRequest, TrackerResponse, TRACKER_REQUEST_TAG, TRACKER_RESPONSE_TAG};
pub use peer::{generate_peer_id, PeerId, PeerInfo};
pub use registry::{FileEntry, PeerRecord, Registry, ScrapeStats, SwarmMember};
pub use server::{handle_request, spawn_sweeper, TrackerServer};
