//! Socket-backed connections: the receive and send loops and their shutdown
//! ordering.
//!
//! Each connection owns one OS socket shared by exactly two tasks, a receive
//! loop and a send loop. The loops never take a lock around their syscalls;
//! `&self` readiness plus non-blocking reads and writes is enough because the
//! OS permits one concurrent reader and one concurrent writer per socket.
//! The shutdown lock only serializes the destructive teardown against both.

use std::future::Future;
use std::io::{self, IoSlice};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::connection::AcceptedConnection;
use crate::endpoint::Endpoint;
use crate::error::ConnectionError;
use crate::features::Features;
use crate::pipe::{self, DuplexPipe, PipeOptions};
use crate::BoxFuture;

/// Block size the receive path sizes its buffers against.
const BLOCK_SIZE: usize = 4096;

/// Smallest buffer the receive loop acquires per read; half a block so a
/// partially-filled block can still take another read without a new
/// allocation.
const MIN_ALLOC_BUFFER_SIZE: usize = BLOCK_SIZE / 2;

/// Byte-level socket operations shared by the receive and send loops.
pub trait RawSocket: Send + Sync + 'static {
    fn readable(&self) -> impl Future<Output = io::Result<()>> + Send + '_;

    fn writable(&self) -> impl Future<Output = io::Result<()>> + Send + '_;

    /// Non-blocking read appending into `buf`. `Ok(0)` is FIN.
    fn try_read_buf(&self, buf: &mut BytesMut) -> io::Result<usize>;

    /// Non-blocking vectored write.
    fn try_write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;

    /// Half-closes both directions so pending loop syscalls fail fast.
    /// Errors are ignored by callers.
    fn shutdown_both(&self) -> io::Result<()>;

    fn local_endpoint(&self) -> Option<Endpoint>;

    fn remote_endpoint(&self) -> Option<Endpoint>;
}

#[cfg(unix)]
fn shutdown_raw_fd(fd: std::os::unix::io::RawFd) -> io::Result<()> {
    let rc = unsafe { libc::shutdown(fd, libc::SHUT_RDWR) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

impl RawSocket for tokio::net::TcpStream {
    fn readable(&self) -> impl Future<Output = io::Result<()>> + Send + '_ {
        tokio::net::TcpStream::readable(self)
    }

    fn writable(&self) -> impl Future<Output = io::Result<()>> + Send + '_ {
        tokio::net::TcpStream::writable(self)
    }

    fn try_read_buf(&self, buf: &mut BytesMut) -> io::Result<usize> {
        tokio::net::TcpStream::try_read_buf(self, buf)
    }

    fn try_write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        tokio::net::TcpStream::try_write_vectored(self, bufs)
    }

    #[cfg(unix)]
    fn shutdown_both(&self) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;
        shutdown_raw_fd(self.as_raw_fd())
    }

    #[cfg(not(unix))]
    fn shutdown_both(&self) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    fn local_endpoint(&self) -> Option<Endpoint> {
        self.local_addr().ok().map(Endpoint::Ip)
    }

    fn remote_endpoint(&self) -> Option<Endpoint> {
        self.peer_addr().ok().map(Endpoint::Ip)
    }
}

#[cfg(unix)]
impl RawSocket for tokio::net::UnixStream {
    fn readable(&self) -> impl Future<Output = io::Result<()>> + Send + '_ {
        tokio::net::UnixStream::readable(self)
    }

    fn writable(&self) -> impl Future<Output = io::Result<()>> + Send + '_ {
        tokio::net::UnixStream::writable(self)
    }

    fn try_read_buf(&self, buf: &mut BytesMut) -> io::Result<usize> {
        tokio::net::UnixStream::try_read_buf(self, buf)
    }

    fn try_write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        tokio::net::UnixStream::try_write_vectored(self, bufs)
    }

    fn shutdown_both(&self) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;
        shutdown_raw_fd(self.as_raw_fd())
    }

    fn local_endpoint(&self) -> Option<Endpoint> {
        self.local_addr()
            .ok()
            .and_then(|addr| addr.as_pathname().map(|p| Endpoint::Unix(p.to_path_buf())))
    }

    fn remote_endpoint(&self) -> Option<Endpoint> {
        self.peer_addr()
            .ok()
            .and_then(|addr| addr.as_pathname().map(|p| Endpoint::Unix(p.to_path_buf())))
    }
}

/// How a socket error terminates a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorClass {
    /// The peer went away abruptly.
    Reset,
    /// Expected after the local side tore the socket down.
    Abort,
    Unexpected,
}

fn classify(error: &io::Error) -> ErrorClass {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::ConnectionReset | ErrorKind::BrokenPipe | ErrorKind::NotConnected => {
            ErrorClass::Reset
        }
        ErrorKind::ConnectionAborted if cfg!(windows) => ErrorClass::Reset,
        ErrorKind::Interrupted => ErrorClass::Abort,
        ErrorKind::InvalidInput if cfg!(not(windows)) => ErrorClass::Abort,
        _ if is_canceled(error) => ErrorClass::Abort,
        _ => ErrorClass::Unexpected,
    }
}

#[cfg(unix)]
fn is_canceled(error: &io::Error) -> bool {
    error.raw_os_error() == Some(libc::ECANCELED)
}

#[cfg(not(unix))]
fn is_canceled(_error: &io::Error) -> bool {
    false
}

/// Pipe sizing and receive behavior for one socket connection.
#[derive(Debug, Clone)]
pub struct SocketConnectionOptions {
    /// Sizing of the receive path (socket to application).
    pub input: PipeOptions,
    /// Sizing of the send path (application to socket).
    pub output: PipeOptions,
    /// Wait for readability before acquiring a read buffer.
    pub wait_for_data: bool,
}

impl Default for SocketConnectionOptions {
    fn default() -> Self {
        Self {
            input: PipeOptions::default(),
            output: PipeOptions::default(),
            wait_for_data: true,
        }
    }
}

struct ShutdownState {
    disposed: bool,
    reason: Option<ConnectionError>,
}

/// One accepted socket bound to a duplex pipe pair.
pub struct SocketConnection<S: RawSocket> {
    socket: Arc<S>,
    transport: DuplexPipe,
    application: DuplexPipe,
    features: Features,
    local: Option<Endpoint>,
    remote: Option<Endpoint>,
    wait_for_data: bool,
    shutdown_state: Mutex<ShutdownState>,
    /// Lock-free mirror of the disposed flag for the loops' error
    /// classification.
    socket_disposed: AtomicBool,
    closed: CancellationToken,
    closed_fired: AtomicBool,
    closed_latch: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: RawSocket> SocketConnection<S> {
    pub fn new(socket: S, options: &SocketConnectionOptions) -> Arc<Self> {
        let (transport, application) = pipe::pair(options.input, options.output);
        let local = socket.local_endpoint();
        let remote = socket.remote_endpoint();
        Arc::new(Self {
            socket: Arc::new(socket),
            transport,
            application,
            features: Features::new(),
            local,
            remote,
            wait_for_data: options.wait_for_data,
            shutdown_state: Mutex::new(ShutdownState {
                disposed: false,
                reason: None,
            }),
            socket_disposed: AtomicBool::new(false),
            closed: CancellationToken::new(),
            closed_fired: AtomicBool::new(false),
            closed_latch: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawns the receive and send loops.
    ///
    /// `flush_immediately` is set when bytes were delivered alongside the
    /// accept and should reach the application before the first socket read.
    pub fn start(self: &Arc<Self>, flush_immediately: bool) {
        let receive = {
            let connection = self.clone();
            tokio::spawn(async move { connection.receive_loop(flush_immediately).await })
        };
        let send = {
            let connection = self.clone();
            tokio::spawn(async move { connection.send_loop().await })
        };
        self.tasks.lock().extend([receive, send]);
    }

    /// Idempotent socket teardown; the first caller's reason wins.
    pub fn shutdown(&self, reason: Option<ConnectionError>) {
        let mut state = self.shutdown_state.lock();
        if state.disposed {
            return;
        }
        // The flag flips before the half-close so the error the peer loop
        // gets from its next syscall classifies as an expected abort.
        state.disposed = true;
        self.socket_disposed.store(true, Ordering::Release);
        let reason = reason.unwrap_or(ConnectionError::SendLoopCompleted);
        trace!(%reason, "shutting down socket");
        state.reason = Some(reason);
        let _ = self.socket.shutdown_both();
    }

    /// Tears the connection down and kicks the send loop out of a pending
    /// pipe read.
    pub fn abort(&self, reason: ConnectionError) {
        self.shutdown(Some(reason));
        self.application.input.cancel_pending_read();
    }

    fn shutdown_reason(&self) -> Option<ConnectionError> {
        self.shutdown_state.lock().reason.clone()
    }

    async fn receive_loop(&self, flush_immediately: bool) {
        let error = self.do_receive(flush_immediately).await.err();
        let reason = self.shutdown_reason().or(error);
        self.application.output.complete(reason);
        self.fire_connection_closed();
        self.closed_latch.notified().await;
    }

    async fn do_receive(&self, flush_immediately: bool) -> Result<(), ConnectionError> {
        let input = &self.application.output;
        let mut buf = BytesMut::with_capacity(BLOCK_SIZE);
        let mut flush_pending = flush_immediately;

        loop {
            if flush_pending {
                flush_pending = false;
                let flush = if input.is_backpressured() {
                    debug!("pausing receive, application backpressure");
                    let flush = input.flush().await;
                    debug!("resuming receive");
                    flush
                } else {
                    input.flush().await
                };
                if flush.is_completed() || flush.is_canceled() {
                    return Ok(());
                }
            }

            if self.wait_for_data {
                // Readability first, so idle connections hold no buffer.
                if let Err(error) = self.socket.readable().await {
                    return Err(self.classify_and_log(error));
                }
            }

            buf.reserve(MIN_ALLOC_BUFFER_SIZE);
            match self.socket.try_read_buf(&mut buf) {
                Ok(0) => {
                    debug!("received FIN");
                    return Ok(());
                }
                Ok(count) => {
                    trace!(bytes = count, "received");
                    input.write(buf.split().freeze());
                    flush_pending = true;
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    // Spurious readiness; wait for the socket again.
                    if let Err(error) = self.socket.readable().await {
                        return Err(self.classify_and_log(error));
                    }
                }
                Err(error) => return Err(self.classify_and_log(error)),
            }
        }
    }

    async fn send_loop(&self) {
        let output = &self.application.input;
        let mut reason: Option<ConnectionError> = None;

        loop {
            let result = match output.read().await {
                Ok(result) => result,
                Err(error) => {
                    reason = Some(error);
                    break;
                }
            };
            if result.is_canceled() {
                break;
            }
            if !result.is_empty() {
                if let Err(error) = self.send_segments(result.segments()).await {
                    reason = Some(self.classify_and_log(error));
                    break;
                }
            }
            output.advance(result.len());
            if result.is_completed() {
                break;
            }
        }

        // Tear the socket down first, then unblock a receive loop paused on
        // backpressure so it can observe the teardown and exit.
        self.shutdown(reason);
        self.application.input.complete();
        self.application.output.cancel_pending_flush();
    }

    async fn send_segments(&self, segments: &[Bytes]) -> io::Result<()> {
        let mut index = 0;
        let mut offset = 0;
        while index < segments.len() {
            self.socket.writable().await?;
            let mut slices = Vec::with_capacity(segments.len() - index);
            slices.push(IoSlice::new(&segments[index][offset..]));
            slices.extend(
                segments[index + 1..]
                    .iter()
                    .map(|segment| IoSlice::new(segment)),
            );
            match self.socket.try_write_vectored(&slices) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket wrote zero bytes",
                    ))
                }
                Ok(mut written) => {
                    trace!(bytes = written, "sent");
                    while written > 0 {
                        let remaining = segments[index].len() - offset;
                        if written >= remaining {
                            written -= remaining;
                            index += 1;
                            offset = 0;
                        } else {
                            offset += written;
                            written = 0;
                        }
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => continue,
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }

    fn classify_and_log(&self, error: io::Error) -> ConnectionError {
        let disposed = self.socket_disposed.load(Ordering::Acquire);
        match classify(&error) {
            ErrorClass::Reset => {
                if !disposed {
                    info!("connection reset by peer");
                }
                ConnectionError::Reset
            }
            ErrorClass::Abort => {
                if !disposed {
                    debug!(%error, "unexpected socket abort");
                }
                ConnectionError::Aborted(error.to_string())
            }
            ErrorClass::Unexpected => {
                error!(%error, "unexpected socket error");
                ConnectionError::unexpected(&error)
            }
        }
    }

    /// Raises the connection-closed signal exactly once, off the receive
    /// loop's stack so close observers cannot stall it; the receive loop
    /// waits on the latch so its completion is not observable before the
    /// signal.
    fn fire_connection_closed(&self) {
        if self.closed_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let closed = self.closed.clone();
        let latch = self.closed_latch.clone();
        tokio::spawn(async move {
            closed.cancel();
            latch.notify_one();
        });
    }
}

impl<S: RawSocket> AcceptedConnection for Arc<SocketConnection<S>> {
    fn local_endpoint(&self) -> Option<Endpoint> {
        self.local.clone()
    }

    fn remote_endpoint(&self) -> Option<Endpoint> {
        self.remote.clone()
    }

    fn transport(&self) -> DuplexPipe {
        self.transport.clone()
    }

    fn features(&self) -> &Features {
        &self.features
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn abort(&self, reason: ConnectionError) {
        SocketConnection::abort(self, reason);
    }

    fn dispose(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            // Completing the transport sides lets both loops run their
            // finally blocks even when the peer stays silent.
            self.transport.output.complete(None);
            self.transport.input.complete();
            let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
            for task in tasks {
                let _ = task.await;
            }
        })
    }
}
