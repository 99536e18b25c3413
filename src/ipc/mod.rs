//! The shell <-> agent message plane: a tagged-union message set carried as
//! length-prefixed frames over a pair of pipes inherited from the spawning
//! process. Messages are whole; the channel never splits or merges them.

mod channel;
mod message;
mod wire;

pub use channel::{is_closed_error, sink_from_fd, source_from_fd, IpcSink, IpcSource};
pub use message::{
    AnnotationUid, CaptureConfig, CaptureFailedReason, GpuTimelineConfig, Message,
};
pub use wire::{read_message, write_message, WireError, MAX_SUFFIX_LEN};
