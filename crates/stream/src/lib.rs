//! Streaming decode of newline-delimited JSON and the typed frames carried
//! on per-task status channels.
//!
//! [`FrameDecoder`] is the synchronous push parser; [`decode_stream`] drives
//! it from any [`tokio::io::AsyncRead`] with cooperative cancellation.

pub mod decoder;
pub mod frame;

pub use decoder::{
    decode_stream, DecodeError, DecodeOutcome, DecodeStats, FrameDecoder, LineError, LineFault,
};
pub use frame::{FrameError, TaskFrame};
