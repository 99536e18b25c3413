use std::io;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::sync::mpsc;

use super::worker::{AgentState, WorkerCore};
use crate::ipc::{AnnotationUid, GpuTimelineConfig, IpcSource, Message, WireError};
use crate::runtime::spawn_logged;

/// Destination factory for annotation and GPU-timeline byte streams: one
/// writer per connection uid, created inside the capture.
pub trait ExternalSource: Send + Sync + 'static {
    fn add_agent_pipe(
        &self,
        uid: AnnotationUid,
        connection: ExtSourceConnection,
    ) -> io::Result<Box<dyn AsyncWrite + Send + Unpin>>;
}

enum Command {
    CloseUid(AnnotationUid),
}

/// Lets the capture side ask the worker to drop a connection. A no-op once
/// the worker is gone.
pub struct ExtSourceConnection {
    uid: AnnotationUid,
    tx: mpsc::UnboundedSender<Command>,
}

impl ExtSourceConnection {
    pub fn uid(&self) -> AnnotationUid {
        self.uid
    }

    pub fn close(&self) {
        let _ = self.tx.send(Command::CloseUid(self.uid));
    }
}

struct ExtSourceWorker {
    core: Arc<WorkerCore>,
    external_source: Arc<dyn ExternalSource>,
    gpu_timeline_config: GpuTimelineConfig,
    command_tx: mpsc::UnboundedSender<Command>,
    pipes: FxHashMap<AnnotationUid, Box<dyn AsyncWrite + Send + Unpin>>,
    /// Uids that were closed at some point. Uids are never reused, so a
    /// stale message for one of these is silently ignored.
    closed_uids: FxHashSet<AnnotationUid>,
}

/// Start the shell-side worker for the external annotation agent. Handles
/// per-uid connection pipes and forwards annotation / GPU-timeline bytes
/// into the capture.
pub fn start(
    core: Arc<WorkerCore>,
    source: IpcSource<pipe::Receiver>,
    external_source: Arc<dyn ExternalSource>,
    gpu_timeline_config: GpuTimelineConfig,
) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let worker = ExtSourceWorker {
        core,
        external_source,
        gpu_timeline_config,
        command_tx,
        pipes: FxHashMap::default(),
        closed_uids: FxHashSet::default(),
    };
    spawn_logged("ext_source message loop", worker.run(source, command_rx));
}

impl ExtSourceWorker {
    async fn run(
        mut self,
        source: IpcSource<pipe::Receiver>,
        mut command_rx: mpsc::UnboundedReceiver<Command>,
    ) -> io::Result<()> {
        let mut messages = source.into_message_stream();
        let error = loop {
            tokio::select! {
                message = messages.recv() => match message {
                    Some(Ok(message)) => self.on_message(message).await,
                    Some(Err(WireError::Io(e))) => {
                        log::debug!("ext_source receive failed: {e}");
                        break true;
                    }
                    Some(Err(e)) => {
                        // Framing is lost; there is no way to resynchronize.
                        log::warn!("ext_source protocol violation: {e}");
                        break true;
                    }
                    None => break true,
                },
                command = command_rx.recv() => match command {
                    Some(Command::CloseUid(uid)) => self.close_uid(uid, true).await,
                    None => unreachable!("worker holds a command sender"),
                },
            }
        };

        log::debug!("ext_source receive loop ended");
        self.core.set_message_loop_terminated();
        if error {
            self.core.shutdown();
        }
        Ok(())
    }

    async fn on_message(&mut self, message: Message) {
        match message {
            Message::Ready => {
                if self.core.transition_state(AgentState::Ready) {
                    log::debug!("ext_source agent is now ready");
                }
                let config = self.gpu_timeline_config.clone();
                if self
                    .core
                    .send_message(Message::GpuTimelineConfiguration(config))
                    .await
                    .is_err()
                {
                    log::error!("failed to send the GPU timeline configuration to the agent");
                    self.core.request_shutdown().await;
                }
            }
            Message::Shutdown => {
                if self.core.transition_state(AgentState::ShutdownReceived) {
                    log::debug!("ext_source agent is now shut down");
                }
            }
            Message::AnnotationNewConn { uid } => self.on_new_connection(uid),
            Message::AnnotationRecvBytes { uid, bytes }
            | Message::GpuTimelineRecv { uid, bytes }
            | Message::GpuTimelineHandshakeTag { uid, bytes } => {
                self.forward_bytes(uid, bytes).await;
            }
            Message::AnnotationCloseConn { uid } => {
                // The agent closed its end; only our side is left to clean up.
                self.close_uid(uid, false).await;
            }
            other => {
                log::warn!("ext_source: unexpected {} message dropped", other.name());
            }
        }
    }

    fn on_new_connection(&mut self, uid: AnnotationUid) {
        log::debug!("ext_source: new connection {uid}");
        if self.closed_uids.contains(&uid) || self.pipes.contains_key(&uid) {
            log::warn!("ext_source: connection uid {uid} already seen, dropping");
            return;
        }
        let connection = ExtSourceConnection {
            uid,
            tx: self.command_tx.clone(),
        };
        match self.external_source.add_agent_pipe(uid, connection) {
            Ok(writer) => {
                self.pipes.insert(uid, writer);
            }
            Err(e) => {
                log::error!("failed to create external data pipe for uid {uid}: {e}");
            }
        }
    }

    async fn forward_bytes(&mut self, uid: AnnotationUid, bytes: Vec<u8>) {
        if self.closed_uids.contains(&uid) {
            log::trace!("ext_source: data for closed uid {uid}, doing nothing");
            return;
        }
        let Some(writer) = self.pipes.get_mut(&uid) else {
            log::error!("ext_source: data for uid {uid} but no pipe found");
            return;
        };
        if let Err(e) = writer.write_all(&bytes).await {
            log::error!("forwarding external bytes for uid {uid} failed: {e}");
            self.close_uid(uid, true).await;
        }
    }

    /// Close our end of a connection; `notify_agent` additionally tells the
    /// agent to drop its end.
    async fn close_uid(&mut self, uid: AnnotationUid, notify_agent: bool) {
        if self.pipes.remove(&uid).is_none() {
            return;
        }
        self.closed_uids.insert(uid);
        if notify_agent {
            if let Err(e) = self
                .core
                .send_message(Message::AnnotationCloseConn { uid })
                .await
            {
                log::debug!("failed to send close for uid {uid}: {e}");
                self.core.request_shutdown().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::agents::worker::StateChangeObserver;
    use crate::ipc::{sink_from_fd, source_from_fd, IpcSink};
    use crate::proc::pipe_pair;

    struct TestHarness {
        core: Arc<WorkerCore>,
        agent_sink: IpcSink,
        agent_source: crate::ipc::IpcSource<pipe::Receiver>,
        readers: Arc<Mutex<FxHashMap<AnnotationUid, tokio::io::DuplexStream>>>,
    }

    struct TestSource {
        readers: Arc<Mutex<FxHashMap<AnnotationUid, tokio::io::DuplexStream>>>,
        fail_uids: Vec<AnnotationUid>,
    }

    impl ExternalSource for TestSource {
        fn add_agent_pipe(
            &self,
            uid: AnnotationUid,
            _connection: ExtSourceConnection,
        ) -> io::Result<Box<dyn AsyncWrite + Send + Unpin>> {
            if self.fail_uids.contains(&uid) {
                return Err(io::Error::other("refused"));
            }
            let (write, read) = tokio::io::duplex(1024);
            self.readers.lock().insert(uid, read);
            Ok(Box::new(write))
        }
    }

    fn start_harness(fail_uids: Vec<AnnotationUid>) -> TestHarness {
        // agent -> worker direction
        let (worker_read, agent_write) = pipe_pair().unwrap();
        // worker -> agent direction
        let (agent_read, worker_write) = pipe_pair().unwrap();

        let observer: StateChangeObserver = Arc::new(|_, _, _| {});
        let core = WorkerCore::new(
            99,
            super::super::spawner::AGENT_ID_EXTERNAL,
            sink_from_fd(worker_write).unwrap(),
            observer,
        );
        let readers: Arc<Mutex<FxHashMap<AnnotationUid, tokio::io::DuplexStream>>> =
            Arc::new(Mutex::new(FxHashMap::default()));
        start(
            core.clone(),
            source_from_fd(worker_read).unwrap(),
            Arc::new(TestSource {
                readers: readers.clone(),
                fail_uids,
            }),
            GpuTimelineConfig::default(),
        );
        TestHarness {
            core,
            agent_sink: sink_from_fd(agent_write).unwrap(),
            agent_source: source_from_fd(agent_read).unwrap(),
            readers,
        }
    }

    #[tokio::test]
    async fn ready_transitions_state_and_sends_timeline_config() {
        let mut harness = start_harness(vec![]);
        harness.agent_sink.send(Message::Ready).await.unwrap();

        let reply = harness.agent_source.recv().await.unwrap().unwrap();
        assert!(matches!(reply, Message::GpuTimelineConfiguration(_)));
        assert_eq!(harness.core.state(), AgentState::Ready);
    }

    #[tokio::test]
    async fn bytes_flow_into_the_connection_pipe() {
        let harness = start_harness(vec![]);
        harness
            .agent_sink
            .send(Message::AnnotationNewConn { uid: 7 })
            .await
            .unwrap();
        harness
            .agent_sink
            .send(Message::AnnotationRecvBytes {
                uid: 7,
                bytes: b"annotation!".to_vec(),
            })
            .await
            .unwrap();

        // The worker runs concurrently; wait for the reader to show up and
        // deliver the bytes.
        let mut reader = loop {
            if let Some(reader) = harness.readers.lock().remove(&7) {
                break reader;
            }
            tokio::task::yield_now().await;
        };
        let mut buf = [0u8; 11];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"annotation!");
    }

    #[tokio::test]
    async fn gpu_timeline_messages_use_the_same_pipes() {
        let harness = start_harness(vec![]);
        harness
            .agent_sink
            .send(Message::AnnotationNewConn { uid: 3 })
            .await
            .unwrap();
        harness
            .agent_sink
            .send(Message::GpuTimelineHandshakeTag {
                uid: 3,
                bytes: b"ESTATE".to_vec(),
            })
            .await
            .unwrap();
        harness
            .agent_sink
            .send(Message::GpuTimelineRecv {
                uid: 3,
                bytes: b"frame".to_vec(),
            })
            .await
            .unwrap();

        let mut reader = loop {
            if let Some(reader) = harness.readers.lock().remove(&3) {
                break reader;
            }
            tokio::task::yield_now().await;
        };
        let mut buf = [0u8; 11];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ESTATEframe");
    }

    #[tokio::test]
    async fn stale_messages_after_close_are_ignored() {
        let harness = start_harness(vec![]);
        harness
            .agent_sink
            .send(Message::AnnotationNewConn { uid: 11 })
            .await
            .unwrap();
        harness
            .agent_sink
            .send(Message::AnnotationCloseConn { uid: 11 })
            .await
            .unwrap();
        // Stale data for a closed uid must be dropped without complaint, and
        // without tearing the worker down.
        harness
            .agent_sink
            .send(Message::AnnotationRecvBytes {
                uid: 11,
                bytes: b"late".to_vec(),
            })
            .await
            .unwrap();
        harness.agent_sink.send(Message::Ready).await.unwrap();
        let mut harness = harness;
        let reply = harness.agent_source.recv().await.unwrap().unwrap();
        assert!(matches!(reply, Message::GpuTimelineConfiguration(_)));
    }

    #[tokio::test]
    async fn write_failure_closes_the_connection_and_notifies_the_agent() {
        let harness = start_harness(vec![]);
        harness
            .agent_sink
            .send(Message::AnnotationNewConn { uid: 5 })
            .await
            .unwrap();
        // Wait for the pipe, then drop the read half so writes fail.
        loop {
            if let Some(reader) = harness.readers.lock().remove(&5) {
                drop(reader);
                break;
            }
            tokio::task::yield_now().await;
        }
        harness
            .agent_sink
            .send(Message::AnnotationRecvBytes {
                uid: 5,
                bytes: vec![0; 4096],
            })
            .await
            .unwrap();

        let mut harness = harness;
        let reply = harness.agent_source.recv().await.unwrap().unwrap();
        assert_eq!(reply, Message::AnnotationCloseConn { uid: 5 });
    }
}
