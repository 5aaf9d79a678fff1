//! The swarm's single bespoke wire protocol (spec §6): a fixed-shape
//! handshake followed by a stream of length-prefixed message frames.
//!
//! A standalone `HandshakeCodec` plus a separate per-message `Decoder`/
//! `Encoder`, each peeking with a `Cursor` before committing to
//! `buf.advance` so a partial frame is never consumed.

pub mod codec;
pub mod handshake;
pub mod message;

pub use codec::MessageCodec;
pub use handshake::{Handshake, HandshakeCodec};
pub use message::Message;
