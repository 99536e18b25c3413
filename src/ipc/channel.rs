use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::unix::pipe;
use tokio::sync::{mpsc, oneshot};

use super::message::Message;
use super::wire::{read_message, write_message, WireError};

/// True if the error means the peer went away rather than that something is
/// wrong with the data. Treated as an orderly close by callers.
pub fn is_closed_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected
    )
}

/// The receive half of an IPC channel.
pub struct IpcSource<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> IpcSource<R> {
    pub fn new(inner: R) -> Self {
        IpcSource { inner }
    }

    /// The next message, or `None` once the peer has closed the channel.
    pub async fn recv(&mut self) -> Result<Option<Message>, WireError> {
        read_message(&mut self.inner).await
    }
}

impl<R: AsyncRead + Unpin + Send + 'static> IpcSource<R> {
    /// Move decoding onto its own task and hand back a channel of messages.
    ///
    /// `recv` is not cancellation-safe (dropping it mid-frame loses the
    /// framing), so loops that select between the source and other inputs
    /// consume this stream instead. The channel closes after a clean EOF or
    /// a final `Err`.
    pub fn into_message_stream(mut self) -> mpsc::UnboundedReceiver<Result<Message, WireError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match self.recv().await {
                    Ok(Some(message)) => {
                        if tx.send(Ok(message)).is_err() {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                }
            }
        });
        rx
    }
}

/// Build a source over the read end of a pipe.
pub fn source_from_fd(fd: OwnedFd) -> io::Result<IpcSource<pipe::Receiver>> {
    set_nonblocking(&fd)?;
    Ok(IpcSource::new(pipe::Receiver::from_owned_fd(fd)?))
}

/// Build a sink over the write end of a pipe.
pub fn sink_from_fd(fd: OwnedFd) -> io::Result<IpcSink> {
    set_nonblocking(&fd)?;
    Ok(IpcSink::new(pipe::Sender::from_owned_fd(fd)?))
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

struct SinkCommand {
    message: Message,
    done: oneshot::Sender<io::Result<()>>,
}

// Bounds the number of queued-but-unwritten messages; senders wait for
// space once the transport falls behind.
const SINK_QUEUE_DEPTH: usize = 64;

/// The send half of an IPC channel.
///
/// Cloneable; any number of producers may send concurrently. Writes are
/// serialized onto a single writer task so that at most one write is ever
/// outstanding and messages are never interleaved. The queue between the
/// producers and the writer is bounded, which is where backpressure from a
/// slow transport lands.
#[derive(Clone)]
pub struct IpcSink {
    tx: mpsc::Sender<SinkCommand>,
}

impl IpcSink {
    pub fn new<W>(mut writer: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<SinkCommand>(SINK_QUEUE_DEPTH);
        tokio::spawn(async move {
            let mut broken: Option<io::ErrorKind> = None;
            while let Some(command) = rx.recv().await {
                let result = match broken {
                    // once the pipe is gone, fail fast instead of retrying
                    Some(kind) => Err(io::Error::from(kind)),
                    None => write_message(&mut writer, &command.message).await,
                };
                if let Err(e) = &result {
                    if is_closed_error(e) {
                        broken = Some(e.kind());
                    }
                }
                let _ = command.done.send(result);
            }
        });
        IpcSink { tx }
    }

    /// Send one message; resolves once it has been fully written. Waits for
    /// queue space when the transport is running behind.
    pub async fn send(&self, message: Message) -> io::Result<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(SinkCommand { message, done })
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        rx.await
            .unwrap_or_else(|_| Err(io::Error::from(io::ErrorKind::BrokenPipe)))
    }
}
