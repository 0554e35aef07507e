//! sealdrop: peer-to-peer encrypted chunked messaging over WebRTC data
//! channels.
//!
//! Messages are split into fixed-size padded chunks committed to by a
//! Merkle root, encrypted per chunk for one recipient, and sent in random
//! order. The receiver verifies every chunk against the root bound into
//! the channel label and reassembles by index.

pub mod core;
pub mod utils;
pub mod workers;
