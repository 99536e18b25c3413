use serde_derive::{Deserialize, Serialize};

/// Identifies one logical sub-channel (annotation connection, GPU timeline
/// handshake) between the shell and an agent. Assigned monotonically by the
/// agent and never reused within a capture.
pub type AnnotationUid = u32;

/// Why a capture could not be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureFailedReason {
    CommandExecFailed,
    WaitForCoresReadyFailed,
}

impl CaptureFailedReason {
    pub fn to_wire(self) -> u32 {
        match self {
            CaptureFailedReason::CommandExecFailed => 0,
            CaptureFailedReason::WaitForCoresReadyFailed => 1,
        }
    }

    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(CaptureFailedReason::CommandExecFailed),
            1 => Some(CaptureFailedReason::WaitForCoresReadyFailed),
            _ => None,
        }
    }
}

/// Session-level configuration, broadcast to every agent once it is ready.
/// Carried as a JSON suffix on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CaptureConfig {
    /// Sample frequency in Hz for the timeline event.
    pub sample_frequency: u64,
    /// Size of the per-cpu data ring in bytes; zero or a power of two.
    pub data_buffer_size: u64,
    /// Size of the per-cpu AUX ring in bytes; zero or a power of two.
    pub aux_buffer_size: u64,
    /// Stop the capture after this many bytes of APC frames (0 = unlimited).
    pub one_shot_limit: u64,
    /// Live captures drain on a 100ms tick; local ones on a 1s tick.
    pub live_mode: bool,
    /// Command to launch under the capture, if any.
    pub command: Option<Vec<String>>,
    /// Command name to wait for in /proc, if any.
    pub wait_process: Option<String>,
    /// Android package to run agents under, if any.
    pub android_package: Option<String>,
}

/// Configuration for the GPU timeline layer, forwarded to the external
/// annotation agent. Carried as a JSON suffix on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GpuTimelineConfig {
    pub enabled: bool,
    pub layer_libs: Vec<String>,
    pub package_name: Option<String>,
}

/// The IPC message set.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Agent -> shell: the agent finished initializing.
    Ready,
    /// Either direction: orderly shutdown request / acknowledgement.
    Shutdown,
    /// Shell -> perf agent: begin the capture.
    Start,
    /// Perf agent -> shell: counters are enabled and data is flowing.
    CaptureStarted,
    /// Perf agent -> shell: events are attached; these pids are being traced.
    CaptureReady { pids: Vec<i32> },
    /// Perf agent -> shell: the capture could not be started.
    CaptureFailed { reason: CaptureFailedReason },
    /// Perf agent -> shell: now waiting for the target process to appear.
    ExecTargetApp,
    /// Shell -> agents: the session configuration.
    CaptureConfiguration(CaptureConfig),
    /// Perf agent -> shell: a CPU went on or off line.
    CpuStateChange {
        monotonic_delta_ns: u64,
        cpu: i32,
        online: bool,
    },
    /// Annotation agent -> shell: a client connected.
    AnnotationNewConn { uid: AnnotationUid },
    /// Annotation agent -> shell: bytes received from a client.
    AnnotationRecvBytes { uid: AnnotationUid, bytes: Vec<u8> },
    /// Shell -> annotation agent: bytes to send back to a client.
    AnnotationSendBytes { uid: AnnotationUid, bytes: Vec<u8> },
    /// Either direction: a client connection closed.
    AnnotationCloseConn { uid: AnnotationUid },
    /// Shell -> external annotation agent: GPU timeline layer setup.
    GpuTimelineConfiguration(GpuTimelineConfig),
    /// External annotation agent -> shell: GPU timeline bytes.
    GpuTimelineRecv { uid: AnnotationUid, bytes: Vec<u8> },
    /// External annotation agent -> shell: the timeline handshake header.
    GpuTimelineHandshakeTag { uid: AnnotationUid, bytes: Vec<u8> },
    /// Perfetto agent -> shell: a chunk of the trace stream.
    PerfettoRecvBytes { bytes: Vec<u8> },
    /// Perf agent -> shell: one encoded APC frame for the capture stream.
    ApcFrameData { bytes: Vec<u8> },
}

impl Message {
    /// Stable wire tag for this message kind.
    pub fn kind(&self) -> u16 {
        match self {
            Message::Ready => 1,
            Message::Shutdown => 2,
            Message::Start => 3,
            Message::CaptureStarted => 4,
            Message::CaptureReady { .. } => 5,
            Message::CaptureFailed { .. } => 6,
            Message::ExecTargetApp => 7,
            Message::CaptureConfiguration(_) => 8,
            Message::CpuStateChange { .. } => 9,
            Message::AnnotationNewConn { .. } => 10,
            Message::AnnotationRecvBytes { .. } => 11,
            Message::AnnotationSendBytes { .. } => 12,
            Message::AnnotationCloseConn { .. } => 13,
            Message::GpuTimelineConfiguration(_) => 14,
            Message::GpuTimelineRecv { .. } => 15,
            Message::GpuTimelineHandshakeTag { .. } => 16,
            Message::PerfettoRecvBytes { .. } => 17,
            Message::ApcFrameData { .. } => 18,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Ready => "ready",
            Message::Shutdown => "shutdown",
            Message::Start => "start",
            Message::CaptureStarted => "capture_started",
            Message::CaptureReady { .. } => "capture_ready",
            Message::CaptureFailed { .. } => "capture_failed",
            Message::ExecTargetApp => "exec_target_app",
            Message::CaptureConfiguration(_) => "capture_configuration",
            Message::CpuStateChange { .. } => "cpu_state_change",
            Message::AnnotationNewConn { .. } => "annotation_new_conn",
            Message::AnnotationRecvBytes { .. } => "annotation_recv_bytes",
            Message::AnnotationSendBytes { .. } => "annotation_send_bytes",
            Message::AnnotationCloseConn { .. } => "annotation_close_conn",
            Message::GpuTimelineConfiguration(_) => "gpu_timeline_configuration",
            Message::GpuTimelineRecv { .. } => "gpu_timeline_recv",
            Message::GpuTimelineHandshakeTag { .. } => "gpu_timeline_handshake_tag",
            Message::PerfettoRecvBytes { .. } => "perfetto_recv_bytes",
            Message::ApcFrameData { .. } => "apc_frame_data",
        }
    }
}
