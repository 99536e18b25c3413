//! The perf capture engine, run inside the `agent-perf` child: raw
//! perf_event_open plumbing, per-cpu ring-buffer mmaps, the drain path onto
//! the capture stream, fd/timer monitoring, per-core event binding across
//! hot-plug transitions, and the capture orchestrator.

pub mod capture;
pub mod consumer;
pub mod events;
pub mod frame;
pub mod monitor;
pub mod ringbuf;
pub mod sys;

pub use capture::{CaptureError, CaptureOrchestrator};
pub use consumer::BufferConsumer;
pub use events::{CoreBinder, CounterSpec, EventConfig};
pub use monitor::{EventFd, RingbufferMonitor};
pub use ringbuf::{BufferConfig, BufferConfigError, RingBufferMmap};
