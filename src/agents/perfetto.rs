use std::io;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::unix::pipe;

use super::worker::{AgentState, WorkerCore};
use crate::ipc::{IpcSource, Message, WireError};
use crate::runtime::spawn_logged;

/// Destination factory for the perfetto trace stream. The agent has exactly
/// one implicit connection, created when it reports ready.
pub trait PerfettoSource: Send + Sync + 'static {
    fn add_agent_pipe(&self) -> io::Result<Box<dyn AsyncWrite + Send + Unpin>>;
}

struct PerfettoWorker {
    core: Arc<WorkerCore>,
    perfetto_source: Arc<dyn PerfettoSource>,
    pipe: Option<Box<dyn AsyncWrite + Send + Unpin>>,
}

/// Start the shell-side worker for the perfetto agent.
pub fn start(
    core: Arc<WorkerCore>,
    source: IpcSource<pipe::Receiver>,
    perfetto_source: Arc<dyn PerfettoSource>,
) {
    let worker = PerfettoWorker {
        core,
        perfetto_source,
        pipe: None,
    };
    spawn_logged("perfetto message loop", worker.run(source));
}

impl PerfettoWorker {
    async fn run(mut self, mut source: IpcSource<pipe::Receiver>) -> io::Result<()> {
        let error = loop {
            match source.recv().await {
                Ok(Some(message)) => self.on_message(message).await,
                Ok(None) => break true,
                Err(WireError::Io(e)) => {
                    log::debug!("perfetto receive failed: {e}");
                    break true;
                }
                Err(e) => {
                    log::warn!("perfetto protocol violation: {e}");
                    break true;
                }
            }
        };

        log::debug!("perfetto receive loop ended");
        self.core.set_message_loop_terminated();
        if error {
            self.core.shutdown();
        }
        Ok(())
    }

    async fn on_message(&mut self, message: Message) {
        match message {
            Message::Ready => {
                if self.pipe.is_some() {
                    log::error!("perfetto data pipe already created");
                    return;
                }
                match self.perfetto_source.add_agent_pipe() {
                    Ok(writer) => self.pipe = Some(writer),
                    Err(e) => {
                        log::error!("failed to create perfetto data pipe: {e}");
                        return;
                    }
                }
                if self.core.transition_state(AgentState::Ready) {
                    log::debug!("perfetto agent is now ready");
                }
            }
            Message::Shutdown => {
                // Close the write end.
                self.pipe = None;
                if self.core.transition_state(AgentState::ShutdownReceived) {
                    log::debug!("perfetto agent is now shut down");
                }
            }
            Message::PerfettoRecvBytes { bytes } => {
                let Some(pipe) = self.pipe.as_mut() else {
                    log::warn!("perfetto bytes received before the pipe exists, dropped");
                    return;
                };
                if let Err(e) = pipe.write_all(&bytes).await {
                    log::error!("error while forwarding perfetto source bytes: {e}");
                    self.core.request_shutdown().await;
                }
            }
            other => {
                log::warn!("perfetto: unexpected {} message dropped", other.name());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::agents::worker::StateChangeObserver;
    use crate::ipc::{sink_from_fd, source_from_fd, IpcSink};
    use crate::proc::pipe_pair;

    struct TestSource {
        reader: Arc<Mutex<Option<tokio::io::DuplexStream>>>,
    }

    impl PerfettoSource for TestSource {
        fn add_agent_pipe(&self) -> io::Result<Box<dyn AsyncWrite + Send + Unpin>> {
            let (write, read) = tokio::io::duplex(64 * 1024);
            *self.reader.lock() = Some(read);
            Ok(Box::new(write))
        }
    }

    #[tokio::test]
    async fn trace_bytes_flow_after_ready() {
        let (worker_read, agent_write) = pipe_pair().unwrap();
        let (_agent_read, worker_write) = pipe_pair().unwrap();
        let observer: StateChangeObserver = Arc::new(|_, _, _| {});
        let core = WorkerCore::new(
            42,
            super::super::spawner::AGENT_ID_PERFETTO,
            sink_from_fd(worker_write).unwrap(),
            observer,
        );
        let reader = Arc::new(Mutex::new(None));
        start(
            core.clone(),
            source_from_fd(worker_read).unwrap(),
            Arc::new(TestSource {
                reader: reader.clone(),
            }),
        );

        let agent_sink: IpcSink = sink_from_fd(agent_write).unwrap();
        agent_sink.send(Message::Ready).await.unwrap();
        agent_sink
            .send(Message::PerfettoRecvBytes {
                bytes: b"trace-packet".to_vec(),
            })
            .await
            .unwrap();

        let mut stream = loop {
            if let Some(stream) = reader.lock().take() {
                break stream;
            }
            tokio::task::yield_now().await;
        };
        let mut buf = [0u8; 12];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"trace-packet");
        assert_eq!(core.state(), AgentState::Ready);
    }
}
