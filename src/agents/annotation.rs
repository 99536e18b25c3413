use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tokio::net::unix::pipe;
use tokio::sync::mpsc;

use super::worker::{AgentState, WorkerCore};
use crate::ipc::{AnnotationUid, IpcSource, Message, WireError};
use crate::runtime::spawn_logged;

/// Consumes newly accepted annotation sessions. Implementations usually hand
/// each session to a dedicated thread, since the session API blocks.
pub trait AnnotationSessionConsumer: Send + Sync + 'static {
    fn consume_session(&self, session: AnnotationSession);
}

enum Command {
    CloseUid(AnnotationUid),
}

struct ConnState {
    buffers: VecDeque<Vec<u8>>,
    open: bool,
}

/// One annotation connection: a bounded FIFO of received byte buffers plus a
/// condition that unblocks readers when bytes arrive or the connection
/// closes.
struct AnnotationConnection {
    uid: AnnotationUid,
    worker: Weak<WorkerCore>,
    command_tx: mpsc::UnboundedSender<Command>,
    runtime: tokio::runtime::Handle,
    state: Mutex<ConnState>,
    cond: Condvar,
}

impl AnnotationConnection {
    fn on_recv_bytes(&self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        state.buffers.push_back(bytes);
        // Unlock before notifying; the waiting thread retakes the lock.
        drop(state);
        self.cond.notify_one();
    }

    fn notify_terminated(&self) {
        self.state.lock().open = false;
        self.cond.notify_all();
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Block until some bytes are available or the connection closes.
    /// Returns the number of bytes copied into `buf`; 0 means closed and
    /// drained.
    fn wait_bytes(&self, buf: &mut [u8]) -> usize {
        assert!(!buf.is_empty(), "wait_bytes needs a non-empty buffer");

        let mut state = self.state.lock();
        while state.open && state.buffers.is_empty() {
            self.cond.wait(&mut state);
        }
        let Some(first) = state.buffers.front_mut() else {
            return 0;
        };

        let n = buf.len().min(first.len());
        buf[..n].copy_from_slice(&first[..n]);
        if n < first.len() {
            first.drain(..n);
        } else {
            state.buffers.pop_front();
        }
        n
    }
}

/// The blocking, socket-like face of one annotation connection, handed to
/// the session consumer. All methods may block and must not be called from a
/// runtime worker thread.
#[derive(Clone)]
pub struct AnnotationSession {
    connection: Arc<AnnotationConnection>,
}

impl AnnotationSession {
    pub fn uid(&self) -> AnnotationUid {
        self.connection.uid
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    /// Read whatever is available, blocking until some bytes arrive or the
    /// connection closes (0 bytes).
    pub fn read_some(&self, buf: &mut [u8]) -> usize {
        self.connection.wait_bytes(buf)
    }

    /// Fill `buf` completely. Returns false if the connection closed first.
    pub fn read_exact(&self, mut buf: &mut [u8]) -> bool {
        while !buf.is_empty() {
            let n = self.connection.wait_bytes(buf);
            if n == 0 {
                return false;
            }
            buf = &mut buf[n..];
        }
        true
    }

    /// Send bytes back through the agent to the connected client.
    pub fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        let Some(core) = self.connection.worker.upgrade() else {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        };
        let message = Message::AnnotationSendBytes {
            uid: self.connection.uid,
            bytes: bytes.to_vec(),
        };
        self.connection
            .runtime
            .block_on(async move { core.send_message(message).await })
    }

    /// Close the connection from our side. A no-op if the worker is gone.
    pub fn close(&self) {
        let _ = self
            .connection
            .command_tx
            .send(Command::CloseUid(self.connection.uid));
        self.connection.notify_terminated();
    }
}

struct AnnotationWorker {
    core: Arc<WorkerCore>,
    consumer: Arc<dyn AnnotationSessionConsumer>,
    command_tx: mpsc::UnboundedSender<Command>,
    connections: FxHashMap<AnnotationUid, Arc<AnnotationConnection>>,
}

/// Start the shell-side worker for the blocking-annotation agent.
pub fn start(
    core: Arc<WorkerCore>,
    source: IpcSource<pipe::Receiver>,
    consumer: Arc<dyn AnnotationSessionConsumer>,
) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let worker = AnnotationWorker {
        core,
        consumer,
        command_tx,
        connections: FxHashMap::default(),
    };
    spawn_logged("annotation message loop", worker.run(source, command_rx));
}

impl AnnotationWorker {
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
                        log::debug!("annotation receive failed: {e}");
                        break true;
                    }
                    Some(Err(e)) => {
                        log::warn!("annotation protocol violation: {e}");
                        break true;
                    }
                    None => break true,
                },
                command = command_rx.recv() => match command {
                    Some(Command::CloseUid(uid)) => self.close_uid(uid).await,
                    None => unreachable!("worker holds a command sender"),
                },
            }
        };

        log::debug!("annotation receive loop ended");
        // Unblock every session reader; the agent is not coming back.
        for connection in self.connections.values() {
            connection.notify_terminated();
        }
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
                    log::debug!("annotation agent is now ready");
                }
            }
            Message::Shutdown => {
                for connection in self.connections.values() {
                    connection.notify_terminated();
                }
                if self.core.transition_state(AgentState::ShutdownReceived) {
                    log::debug!("annotation agent is now shut down");
                }
            }
            Message::AnnotationNewConn { uid } => {
                log::debug!("annotation: new connection {uid}");
                if self.connections.contains_key(&uid) {
                    log::error!("annotation: connection uid {uid} already exists, dropping");
                    return;
                }
                let connection = Arc::new(AnnotationConnection {
                    uid,
                    worker: Arc::downgrade(&self.core),
                    command_tx: self.command_tx.clone(),
                    runtime: tokio::runtime::Handle::current(),
                    state: Mutex::new(ConnState {
                        buffers: VecDeque::new(),
                        open: true,
                    }),
                    cond: Condvar::new(),
                });
                self.connections.insert(uid, connection.clone());
                self.consumer
                    .consume_session(AnnotationSession { connection });
            }
            Message::AnnotationRecvBytes { uid, bytes } => {
                match self.connections.get(&uid) {
                    Some(connection) => connection.on_recv_bytes(bytes),
                    None => log::error!("annotation: data for unknown uid {uid}"),
                }
            }
            Message::AnnotationCloseConn { uid } => {
                if let Some(connection) = self.connections.remove(&uid) {
                    connection.notify_terminated();
                }
            }
            other => {
                log::warn!("annotation: unexpected {} message dropped", other.name());
            }
        }
    }

    async fn close_uid(&mut self, uid: AnnotationUid) {
        let Some(connection) = self.connections.remove(&uid) else {
            return;
        };
        connection.notify_terminated();
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::worker::StateChangeObserver;
    use crate::ipc::{sink_from_fd, source_from_fd, IpcSink};
    use crate::proc::pipe_pair;

    struct SessionCollector {
        sessions: Mutex<Vec<AnnotationSession>>,
    }

    impl AnnotationSessionConsumer for SessionCollector {
        fn consume_session(&self, session: AnnotationSession) {
            self.sessions.lock().push(session);
        }
    }

    struct Harness {
        core: Arc<WorkerCore>,
        agent_sink: IpcSink,
        agent_source: crate::ipc::IpcSource<pipe::Receiver>,
        collector: Arc<SessionCollector>,
    }

    fn start_harness() -> Harness {
        let (worker_read, agent_write) = pipe_pair().unwrap();
        let (agent_read, worker_write) = pipe_pair().unwrap();
        let observer: StateChangeObserver = Arc::new(|_, _, _| {});
        let core = WorkerCore::new(
            7,
            super::super::spawner::AGENT_ID_ANNOTATION,
            sink_from_fd(worker_write).unwrap(),
            observer,
        );
        let collector = Arc::new(SessionCollector {
            sessions: Mutex::new(Vec::new()),
        });
        start(
            core.clone(),
            source_from_fd(worker_read).unwrap(),
            collector.clone(),
        );
        Harness {
            core,
            agent_sink: sink_from_fd(agent_write).unwrap(),
            agent_source: source_from_fd(agent_read).unwrap(),
            collector,
        }
    }

    async fn take_session(harness: &Harness) -> AnnotationSession {
        loop {
            if let Some(session) = harness.collector.sessions.lock().pop() {
                return session;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn read_exact_spans_multiple_buffers() {
        let harness = start_harness();
        harness
            .agent_sink
            .send(Message::AnnotationNewConn { uid: 1 })
            .await
            .unwrap();
        let session = take_session(&harness).await;

        let reader = std::thread::spawn(move || {
            let mut buf = [0u8; 8];
            let complete = session.read_exact(&mut buf);
            (complete, buf)
        });

        harness
            .agent_sink
            .send(Message::AnnotationRecvBytes {
                uid: 1,
                bytes: b"abc".to_vec(),
            })
            .await
            .unwrap();
        harness
            .agent_sink
            .send(Message::AnnotationRecvBytes {
                uid: 1,
                bytes: b"defgh".to_vec(),
            })
            .await
            .unwrap();

        let (complete, buf) = reader.join().unwrap();
        assert!(complete);
        assert_eq!(&buf, b"abcdefgh");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn partial_reads_leave_the_rest_for_later() {
        let harness = start_harness();
        harness
            .agent_sink
            .send(Message::AnnotationNewConn { uid: 2 })
            .await
            .unwrap();
        let session = take_session(&harness).await;
        harness
            .agent_sink
            .send(Message::AnnotationRecvBytes {
                uid: 2,
                bytes: b"0123456789".to_vec(),
            })
            .await
            .unwrap();

        let reader = std::thread::spawn(move || {
            let mut first = [0u8; 4];
            assert!(session.read_exact(&mut first));
            let mut second = [0u8; 6];
            assert!(session.read_exact(&mut second));
            (first, second)
        });
        let (first, second) = reader.join().unwrap();
        assert_eq!(&first, b"0123");
        assert_eq!(&second, b"456789");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_from_agent_unblocks_readers() {
        let harness = start_harness();
        harness
            .agent_sink
            .send(Message::AnnotationNewConn { uid: 3 })
            .await
            .unwrap();
        let session = take_session(&harness).await;

        let reader = std::thread::spawn(move || {
            let mut buf = [0u8; 4];
            session.read_exact(&mut buf)
        });

        harness
            .agent_sink
            .send(Message::AnnotationCloseConn { uid: 3 })
            .await
            .unwrap();
        assert!(!reader.join().unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn writes_become_send_bytes_messages() {
        let mut harness = start_harness();
        harness
            .agent_sink
            .send(Message::AnnotationNewConn { uid: 4 })
            .await
            .unwrap();
        let session = take_session(&harness).await;

        let writer = std::thread::spawn(move || session.write_all(b"response"));
        writer.join().unwrap().unwrap();

        let message = harness.agent_source.recv().await.unwrap().unwrap();
        assert_eq!(
            message,
            Message::AnnotationSendBytes {
                uid: 4,
                bytes: b"response".to_vec(),
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn session_close_notifies_the_agent() {
        let mut harness = start_harness();
        harness
            .agent_sink
            .send(Message::AnnotationNewConn { uid: 5 })
            .await
            .unwrap();
        let session = take_session(&harness).await;

        let closer = std::thread::spawn(move || {
            session.close();
            session.is_open()
        });
        assert!(!closer.join().unwrap());

        let message = harness.agent_source.recv().await.unwrap().unwrap();
        assert_eq!(message, Message::AnnotationCloseConn { uid: 5 });
        let _ = harness.core.state();
    }
}
