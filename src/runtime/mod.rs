//! Building blocks for the cooperative async model used throughout the
//! daemon: serial work queues ("strands"), detached logged tasks, one-shot
//! notifiers, plus line/chunk readers for pipe fds.
//!
//! Components that hand out "the next event" (the CPU monitors) keep at most
//! one pending receiver each and cancel a displaced receiver with a sentinel;
//! that bookkeeping lives with their state, under the same lock.

mod notify;
mod reader;
mod spawn;
mod strand;

pub use notify::Notifier;
pub use reader::{consume_all_bytes, consume_all_lines, ChunkReader, LineReader};
pub use spawn::spawn_logged;
pub use strand::SerialQueue;
