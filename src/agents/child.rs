use std::io;
use std::os::fd::{FromRawFd, OwnedFd};

use tokio::net::unix::pipe;

use super::spawner::{
    AGENT_ID_ANNOTATION, AGENT_ID_EXTERNAL, AGENT_ID_PERF, AGENT_ID_PERFETTO, AGENT_IPC_READ_FD,
    AGENT_IPC_WRITE_FD,
};
use crate::ipc::{sink_from_fd, source_from_fd, IpcSink, IpcSource, Message};
use crate::perf::CaptureOrchestrator;

/// True if `arg` selects one of the agent-mode entry points.
pub fn is_agent_id(arg: &str) -> bool {
    matches!(
        arg,
        AGENT_ID_EXTERNAL | AGENT_ID_ANNOTATION | AGENT_ID_PERFETTO | AGENT_ID_PERF
    )
}

/// Entry point for an agent child. Builds its own runtime (the same
/// two-thread shape as the shell) and runs the agent until shutdown.
pub fn agent_main(agent_id: &str) -> i32 {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to build the agent runtime: {e}");
            return 1;
        }
    };
    runtime.block_on(async move {
        match run_agent(agent_id).await {
            Ok(code) => code,
            Err(e) => {
                log::error!("{agent_id}: {e}");
                1
            }
        }
    })
}

fn inherited_channel() -> io::Result<(IpcSource<pipe::Receiver>, IpcSink)> {
    // The spawner installed our channel on these fds before exec.
    let read_fd = unsafe { OwnedFd::from_raw_fd(AGENT_IPC_READ_FD) };
    let write_fd = unsafe { OwnedFd::from_raw_fd(AGENT_IPC_WRITE_FD) };
    Ok((source_from_fd(read_fd)?, sink_from_fd(write_fd)?))
}

async fn run_agent(agent_id: &str) -> io::Result<i32> {
    let (source, sink) = inherited_channel()?;
    log::debug!("agent {agent_id} started as pid {}", std::process::id());

    match agent_id {
        AGENT_ID_PERF => run_perf_agent(source, sink).await,
        _ => run_leaf_agent(agent_id, source, sink).await,
    }
}

/// The minimal ready/shutdown loop shared by the leaf collection agents.
/// Their device-facing halves (annotation sockets, the perfetto reader, the
/// GPU timeline listener) hook in here; the shell-side protocol is complete
/// without them.
async fn run_leaf_agent(
    agent_id: &str,
    mut source: IpcSource<pipe::Receiver>,
    sink: IpcSink,
) -> io::Result<i32> {
    sink.send(Message::Ready).await?;

    loop {
        match source.recv().await {
            Ok(Some(Message::Shutdown)) => {
                log::debug!("{agent_id}: shutdown requested");
                let _ = sink.send(Message::Shutdown).await;
                return Ok(0);
            }
            Ok(Some(Message::CaptureConfiguration(config))) => {
                log::debug!("{agent_id}: received capture configuration {config:?}");
            }
            Ok(Some(Message::GpuTimelineConfiguration(config))) => {
                log::debug!("{agent_id}: received GPU timeline configuration {config:?}");
            }
            Ok(Some(other)) => {
                log::debug!("{agent_id}: ignoring {} message", other.name());
            }
            Ok(None) => {
                log::debug!("{agent_id}: shell closed the channel");
                return Ok(0);
            }
            Err(e) => {
                log::warn!("{agent_id}: receive failed: {e}");
                return Ok(1);
            }
        }
    }
}

/// The perf agent: wait for the session configuration, run the capture
/// orchestrator, and relay start/shutdown requests into it.
async fn run_perf_agent(
    mut source: IpcSource<pipe::Receiver>,
    sink: IpcSink,
) -> io::Result<i32> {
    sink.send(Message::Ready).await?;

    // The configuration arrives via the ready-gated broadcast.
    let config = loop {
        match source.recv().await {
            Ok(Some(Message::CaptureConfiguration(config))) => break config,
            Ok(Some(Message::Shutdown)) => {
                let _ = sink.send(Message::Shutdown).await;
                return Ok(0);
            }
            Ok(Some(other)) => {
                log::debug!("perf agent: ignoring {} before configuration", other.name());
            }
            Ok(None) => return Ok(0),
            Err(e) => {
                log::warn!("perf agent: receive failed: {e}");
                return Ok(1);
            }
        }
    };

    let orchestrator = CaptureOrchestrator::new(sink.clone(), config);
    let capture = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run().await })
    };

    loop {
        match source.recv().await {
            Ok(Some(Message::Start)) => {
                log::debug!("perf agent: capture start requested");
                orchestrator.notify_start();
            }
            Ok(Some(Message::Shutdown)) => {
                log::debug!("perf agent: shutdown requested");
                orchestrator.terminate(true);
                let _ = sink.send(Message::Shutdown).await;
                break;
            }
            Ok(Some(other)) => {
                log::debug!("perf agent: ignoring {} message", other.name());
            }
            Ok(None) => {
                orchestrator.terminate(false);
                break;
            }
            Err(e) => {
                log::warn!("perf agent: receive failed: {e}");
                orchestrator.terminate(false);
                break;
            }
        }
    }

    match capture.await {
        Ok(Ok(exit_code)) => Ok(exit_code),
        Ok(Err(e)) => {
            log::error!("capture failed: {e}");
            Ok(1)
        }
        Err(e) => {
            log::error!("capture task panicked: {e}");
            Ok(1)
        }
    }
}
