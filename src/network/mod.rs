//! Network Module Implementation
//!
//! Framing shared by the node and its clients, on top of tokio's async I/O.
//!
//! # Components
//!
//! - `Connection`: reads length-prefixed frames from a stream
//! - `RequestFrame` / `ResponseFrame`: encode and parse frame bodies
//!
//! Frames larger than the configured maximum are rejected before their body
//! is buffered.

pub use connection::{write_frame, Connection};
pub use frame::{split_frame, RequestFrame, ResponseFrame};

mod connection;
mod frame;
