//! In-memory transports: the engine exercised without touching a socket.
//!
//! The client handle plays the socket's role: what it writes surfaces on
//! the middleware's input, what middleware writes it can read back.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use strand_transport::pipe::{self, DuplexPipe, PipeOptions, ReadResult};
use strand_transport::{
    AcceptedConnection, BindError, BoxFuture, ConnectionError, Endpoint, Features, Listener,
    ListenerFactory, MultiplexedListener, MultiplexedListenerFactory,
};

struct MemoryConnection {
    transport: DuplexPipe,
    application: DuplexPipe,
    features: Features,
    closed: CancellationToken,
    closed_fired: AtomicBool,
}

impl MemoryConnection {
    fn create() -> (Arc<MemoryConnection>, MemoryClient) {
        let (transport, application) = pipe::pair(PipeOptions::default(), PipeOptions::default());
        let connection = Arc::new(MemoryConnection {
            transport,
            application: application.clone(),
            features: Features::new(),
            closed: CancellationToken::new(),
            closed_fired: AtomicBool::new(false),
        });
        let client = MemoryClient {
            pipe: application,
            server: connection.clone(),
        };
        (connection, client)
    }

    fn fire_closed(&self) {
        if !self.closed_fired.swap(true, Ordering::SeqCst) {
            self.closed.cancel();
        }
    }
}

struct AcceptedMemoryConnection(Arc<MemoryConnection>);

impl AcceptedConnection for AcceptedMemoryConnection {
    fn local_endpoint(&self) -> Option<Endpoint> {
        None
    }

    fn remote_endpoint(&self) -> Option<Endpoint> {
        None
    }

    fn transport(&self) -> DuplexPipe {
        self.0.transport.clone()
    }

    fn features(&self) -> &Features {
        &self.0.features
    }

    fn closed(&self) -> CancellationToken {
        self.0.closed.clone()
    }

    fn abort(&self, reason: ConnectionError) {
        self.0.application.output.complete(Some(reason));
        self.0.application.input.complete();
        self.0.fire_closed();
    }

    fn dispose(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.0.transport.output.complete(None);
            self.0.transport.input.complete();
        })
    }
}

/// Peer half of an in-memory connection.
pub struct MemoryClient {
    pipe: DuplexPipe,
    server: Arc<MemoryConnection>,
}

impl MemoryClient {
    /// Writes bytes toward the middleware and flushes them.
    pub async fn write(&self, data: impl Into<Bytes>) {
        self.pipe.output.write(data.into());
        let _ = self.pipe.output.flush().await;
    }

    /// Reads whatever the middleware has written back.
    pub async fn read(&self) -> Result<ReadResult, ConnectionError> {
        self.pipe.input.read().await
    }

    pub fn advance(&self, count: usize) {
        self.pipe.input.advance(count);
    }

    /// Half-closes cleanly, like a peer FIN.
    pub fn close(&self) {
        self.pipe.output.complete(None);
        self.server.fire_closed();
    }

    /// Tears the connection down abruptly, like a peer RST.
    pub fn reset(&self) {
        self.pipe.output.complete(Some(ConnectionError::Reset));
        self.server.fire_closed();
    }
}

type Inbox = mpsc::UnboundedSender<Box<dyn AcceptedConnection>>;

/// Stream factory producing in-memory connections;
/// [`connect`](Self::connect) returns the peer half.
pub struct MemoryTransportFactory {
    inboxes: Arc<Mutex<HashMap<Endpoint, Inbox>>>,
    next_port: AtomicU16,
}

impl MemoryTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inboxes: Arc::new(Mutex::new(HashMap::new())),
            next_port: AtomicU16::new(40_000),
        })
    }

    /// Connects to a bound endpoint; `None` when nothing listens there.
    pub fn connect(&self, endpoint: &Endpoint) -> Option<MemoryClient> {
        let inbox = self.inboxes.lock().get(endpoint)?.clone();
        let (connection, client) = MemoryConnection::create();
        inbox.send(Box::new(AcceptedMemoryConnection(connection))).ok()?;
        Some(client)
    }
}

impl ListenerFactory for MemoryTransportFactory {
    fn bind(
        &self,
        endpoint: Endpoint,
        _cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<Box<dyn Listener>, BindError>> {
        Box::pin(async move {
            // Port 0 gets a distinct synthetic port, like a kernel bind.
            let effective = match &endpoint {
                Endpoint::Ip(addr) if addr.port() == 0 => {
                    endpoint.with_port(self.next_port.fetch_add(1, Ordering::Relaxed))
                }
                _ => endpoint,
            };
            let (inbox, accepts) = mpsc::unbounded_channel();
            self.inboxes.lock().insert(effective.clone(), inbox);
            Ok(Box::new(MemoryListener {
                endpoint: effective,
                accepts: tokio::sync::Mutex::new(accepts),
                unbound: CancellationToken::new(),
                inboxes: self.inboxes.clone(),
            }) as Box<dyn Listener>)
        })
    }
}

struct MemoryListener {
    endpoint: Endpoint,
    accepts: tokio::sync::Mutex<mpsc::UnboundedReceiver<Box<dyn AcceptedConnection>>>,
    unbound: CancellationToken,
    inboxes: Arc<Mutex<HashMap<Endpoint, Inbox>>>,
}

impl Listener for MemoryListener {
    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    fn accept(&self) -> BoxFuture<'_, io::Result<Option<Box<dyn AcceptedConnection>>>> {
        Box::pin(async move {
            let mut accepts = tokio::select! {
                _ = self.unbound.cancelled() => return Ok(None),
                accepts = self.accepts.lock() => accepts,
            };
            tokio::select! {
                _ = self.unbound.cancelled() => Ok(None),
                connection = accepts.recv() => Ok(connection),
            }
        })
    }

    fn unbind(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.unbound.cancel();
            self.inboxes.lock().remove(&self.endpoint);
        })
    }

    fn dispose(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.unbound.cancel();
            self.inboxes.lock().remove(&self.endpoint);
        })
    }
}

/// Multiplexed factory that records the feature bag each bind received.
/// Valid without TLS, which is exactly why it stays a test fixture.
#[derive(Default)]
pub struct MemoryMultiplexedFactory {
    bound: Mutex<Vec<(Endpoint, Arc<Features>)>>,
}

impl MemoryMultiplexedFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Feature bag of the most recent bind.
    pub fn last_features(&self) -> Option<Arc<Features>> {
        self.bound
            .lock()
            .last()
            .map(|(_endpoint, features)| features.clone())
    }
}

impl MultiplexedListenerFactory for MemoryMultiplexedFactory {
    fn bind(
        &self,
        endpoint: Endpoint,
        features: Arc<Features>,
        _cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<Box<dyn MultiplexedListener>, BindError>> {
        Box::pin(async move {
            self.bound.lock().push((endpoint.clone(), features));
            Ok(Box::new(MemoryMultiplexedListener {
                endpoint,
                unbound: CancellationToken::new(),
            }) as Box<dyn MultiplexedListener>)
        })
    }
}

struct MemoryMultiplexedListener {
    endpoint: Endpoint,
    unbound: CancellationToken,
}

impl MultiplexedListener for MemoryMultiplexedListener {
    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    fn accept(&self) -> BoxFuture<'_, io::Result<Option<Box<dyn AcceptedConnection>>>> {
        Box::pin(async move {
            self.unbound.cancelled().await;
            Ok(None)
        })
    }

    fn unbind(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.unbound.cancel() })
    }

    fn dispose(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}
