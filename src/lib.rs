//! Library crate for neigh-watch: polls the kernel neighbor table for hotspot clients.
pub mod config;
pub mod error;
pub mod hotspot;
pub mod parse;
pub mod poller;
pub mod server;
pub mod source;
pub mod types;

pub use error::SourceError;
pub use poller::NeighborPoller;
pub use types::{DeviceRecord, DeviceSet, ErrorKind, PollerState};
