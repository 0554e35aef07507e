//! Transfer pipeline: splitting, Merkle commitments, per-chunk encryption,
//! transmission and verified reassembly.

pub mod ack;
pub mod chunk;
pub mod frame;
pub mod label;
pub mod merkle;
pub mod receiver;
pub mod sender;
pub mod splitter;
