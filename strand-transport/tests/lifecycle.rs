//! End-to-end lifecycle scenarios: echo, peer reset, accept failure
//! containment, completion callbacks, drain-with-timeout, wildcard cloning.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_subscriber::prelude::*;

use strand_test_support::{CaptureLayer, CapturedEvents, FaultyListenerFactory, MemoryMultiplexedFactory, MemoryTransportFactory};
use strand_transport::{
    BoxError, ConnectionDelegate, ConnectionError, Endpoint, ListenOptions, Protocols,
    ServerConnection, SocketTransportFactory, TlsConfig, TlsConnectionCallbackOptions,
    TransportManager,
};

fn install_capture() -> (CapturedEvents, tracing::subscriber::DefaultGuard) {
    let (layer, events) = CaptureLayer::new();
    let subscriber = tracing_subscriber::registry().with(layer);
    let guard = tracing::subscriber::set_default(subscriber);
    (events, guard)
}

fn ip_options(addr: &str) -> ListenOptions {
    ListenOptions::new(addr.parse::<SocketAddr>().unwrap().into())
}

fn socket_manager() -> TransportManager {
    TransportManager::new(vec![Arc::new(SocketTransportFactory::default())], Vec::new())
}

/// Middleware that copies everything it reads back to the peer, then
/// completes its write side.
fn echo_middleware(options: &mut ListenOptions) {
    options.use_middleware(|next| {
        Arc::new(move |connection: Arc<ServerConnection>| {
            let next = next.clone();
            Box::pin(async move {
                let transport = connection.transport();
                loop {
                    let result = match transport.input.read().await {
                        Ok(result) => result,
                        Err(_) => break,
                    };
                    if !result.is_empty() {
                        transport.output.write(result.to_bytes());
                        let _ = transport.output.flush().await;
                    }
                    transport.input.advance(result.len());
                    if result.is_completed() {
                        break;
                    }
                }
                transport.output.complete(None);
                next(connection).await
            })
        })
    });
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_graceful_echo() {
    let (events, _guard) = install_capture();
    let manager = socket_manager();
    let mut options = ip_options("127.0.0.1:0");
    echo_middleware(&mut options);

    let endpoint = manager
        .bind(&options, &CancellationToken::new())
        .await
        .unwrap();
    let Endpoint::Ip(addr) = endpoint else {
        panic!("expected ip endpoint");
    };

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    client.shutdown().await.unwrap();

    let mut echoed = Vec::new();
    client.read_to_end(&mut echoed).await.unwrap();
    assert_eq!(echoed, b"ping");

    manager
        .stop(Duration::from_secs(5), &CancellationToken::new())
        .await;

    // The execution scope carries the connection id.
    assert!(events
        .snapshot()
        .iter()
        .any(|event| event.in_scope("ConnectionId=")));
}

#[tokio::test]
async fn test_peer_reset_mid_stream() {
    let (events, _guard) = install_capture();
    let manager = socket_manager();
    let mut options = ip_options("127.0.0.1:0");

    let observed = Arc::new(Mutex::new(Vec::<u8>::new()));
    let seen_error = Arc::new(Mutex::new(None::<ConnectionError>));
    {
        let observed = observed.clone();
        let seen_error = seen_error.clone();
        options.use_middleware(move |next| {
            let observed = observed.clone();
            let seen_error = seen_error.clone();
            Arc::new(move |connection: Arc<ServerConnection>| {
                let observed = observed.clone();
                let seen_error = seen_error.clone();
                let next = next.clone();
                Box::pin(async move {
                    let transport = connection.transport();
                    loop {
                        match transport.input.read().await {
                            Ok(result) => {
                                observed.lock().extend_from_slice(&result.to_bytes());
                                transport.input.advance(result.len());
                                if result.is_completed() {
                                    break;
                                }
                            }
                            Err(error) => {
                                *seen_error.lock() = Some(error);
                                break;
                            }
                        }
                    }
                    next(connection).await
                })
            })
        });
    }

    let endpoint = manager
        .bind(&options, &CancellationToken::new())
        .await
        .unwrap();
    let Endpoint::Ip(addr) = endpoint else {
        panic!("expected ip endpoint");
    };

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"abc").await.unwrap();
    wait_until(|| observed.lock().as_slice() == b"abc").await;

    // SO_LINGER 0 turns the close into an RST.
    socket2::SockRef::from(&client)
        .set_linger(Some(Duration::from_secs(0)))
        .unwrap();
    drop(client);

    wait_until(|| seen_error.lock().is_some()).await;
    assert_eq!(seen_error.lock().clone(), Some(ConnectionError::Reset));
    assert_eq!(events.count(Level::INFO, "connection reset"), 1);

    manager
        .stop(Duration::from_secs(5), &CancellationToken::new())
        .await;
}

#[tokio::test]
async fn test_accept_failures_log_once_per_consumer() {
    let (events, _guard) = install_capture();
    let manager = TransportManager::new(
        vec![Arc::new(FaultyListenerFactory::new(
            "Unexpected error listening",
            5,
        ))],
        Vec::new(),
    );
    let mut options = ip_options("127.0.0.1:0");
    options.set_max_accepts(5);

    manager
        .bind(&options, &CancellationToken::new())
        .await
        .unwrap();

    wait_until(|| events.count(Level::ERROR, "Unexpected error listening") == 5).await;
    assert_eq!(events.count(Level::ERROR, "Unexpected error listening"), 5);

    manager
        .stop(Duration::from_secs(5), &CancellationToken::new())
        .await;
}

#[tokio::test]
async fn test_on_completed_error_is_logged_and_contained() {
    let (events, _guard) = install_capture();
    let factory = MemoryTransportFactory::new();
    let manager = TransportManager::new(vec![factory.clone()], Vec::new());

    let state_seen = Arc::new(Mutex::new(None::<String>));
    let mut options = ip_options("127.0.0.1:0");
    {
        let state_seen = state_seen.clone();
        options.use_middleware(move |next| {
            let state_seen = state_seen.clone();
            Arc::new(move |connection: Arc<ServerConnection>| {
                let state_seen = state_seen.clone();
                let next = next.clone();
                Box::pin(async move {
                    let state_seen = state_seen.clone();
                    connection.on_completed(
                        Box::new("invalid time zone".to_string()),
                        Box::new(move |state| {
                            Box::pin(async move {
                                // The state reaches the callback even though
                                // the callback itself fails.
                                let state = state.downcast::<String>().unwrap();
                                *state_seen.lock() = Some(*state);
                                Err::<(), BoxError>("invalid time zone".into())
                            })
                        }),
                    );
                    next(connection).await
                })
            })
        });
    }

    let endpoint = manager
        .bind(&options, &CancellationToken::new())
        .await
        .unwrap();
    let client = factory.connect(&endpoint).unwrap();
    client.close();

    wait_until(|| events.count(Level::ERROR, "on-completed callback") == 1).await;
    assert_eq!(state_seen.lock().clone(), Some("invalid time zone".to_string()));

    // The connection left the manager; the drain has nothing to wait for.
    manager
        .stop(Duration::from_secs(5), &CancellationToken::new())
        .await;
    assert_eq!(
        events.count(Level::WARN, "not all connections closed gracefully"),
        0
    );
}

#[tokio::test]
async fn test_stop_timeout_aborts_stuck_connections() {
    let (events, _guard) = install_capture();
    let manager = socket_manager();
    let mut options = ip_options("127.0.0.1:0");

    // Middleware that only returns once the transport reports closure.
    options.use_middleware(|next| {
        Arc::new(move |connection: Arc<ServerConnection>| {
            let next = next.clone();
            Box::pin(async move {
                connection.closed().cancelled().await;
                next(connection).await
            })
        })
    });

    let endpoint = manager
        .bind(&options, &CancellationToken::new())
        .await
        .unwrap();
    let Endpoint::Ip(addr) = endpoint else {
        panic!("expected ip endpoint");
    };

    let _client = TcpStream::connect(addr).await.unwrap();
    wait_until(|| events.count(Level::DEBUG, "connection started") == 1).await;

    manager
        .stop(Duration::from_millis(50), &CancellationToken::new())
        .await;

    assert_eq!(
        events.count(Level::WARN, "not all connections closed gracefully"),
        1
    );
    assert_eq!(events.count(Level::WARN, "not all connections aborted"), 0);
    assert!(manager.active_endpoints().await.is_empty());
}

#[tokio::test]
async fn test_wildcard_clone_preserves_endpoint_configuration() {
    let mut options = ip_options("[::]:0");
    options.set_protocols(Protocols::H1);
    options.set_tls(TlsConfig::Callback {
        on_connection: Arc::new(|_context| Box::pin(async { Err::<_, BoxError>("unused".into()) })),
        on_connection_state: None,
    });
    options.use_middleware(|next| next);

    assert!(options.endpoint().is_unspecified());
    let cloned = options.clone_for_ip(std::net::IpAddr::from([127, 0, 0, 1]));

    assert_eq!(cloned.endpoint().to_string(), "127.0.0.1:0");
    assert_eq!(cloned.protocols(), Protocols::H1);
    assert_eq!(
        cloned.protocols_explicitly_set(),
        options.protocols_explicitly_set()
    );
    assert!(cloned.is_tls());
    assert_eq!(cloned.scheme(), "https");
    assert_eq!(cloned.disable_alt_svc(), options.disable_alt_svc());
    assert_eq!(cloned.max_accepts(), options.max_accepts());

    // Both chains execute; the clone's list was copied by value.
    let _original: ConnectionDelegate = options.build();
    let _cloned: ConnectionDelegate = cloned.build();
}

#[tokio::test]
async fn test_multiplexed_bind_publishes_tls_feature_bag() {
    let factory = MemoryMultiplexedFactory::new();
    let manager = TransportManager::new(Vec::new(), vec![factory.clone()]);

    let mut options = ip_options("127.0.0.1:0");
    options.set_tls(TlsConfig::Callback {
        on_connection: Arc::new(|_context| Box::pin(async { Err::<_, BoxError>("unused".into()) })),
        on_connection_state: None,
    });

    manager
        .bind_multiplexed(&options, &CancellationToken::new())
        .await
        .unwrap();

    let features = factory.last_features().unwrap();
    let tls = features.get::<TlsConnectionCallbackOptions>().unwrap();
    assert_eq!(tls.application_protocols, vec![b"h3".to_vec()]);

    manager
        .stop(Duration::from_secs(5), &CancellationToken::new())
        .await;
}

#[tokio::test]
async fn test_memory_echo_roundtrip() {
    let factory = MemoryTransportFactory::new();
    let manager = TransportManager::new(vec![factory.clone()], Vec::new());
    let mut options = ip_options("127.0.0.1:0");
    echo_middleware(&mut options);

    let endpoint = manager
        .bind(&options, &CancellationToken::new())
        .await
        .unwrap();
    let client = factory.connect(&endpoint).unwrap();

    client.write("ping").await;
    let result = client.read().await.unwrap();
    assert_eq!(&result.to_bytes()[..], b"ping");
    client.advance(result.len());
    client.close();

    manager
        .stop(Duration::from_secs(5), &CancellationToken::new())
        .await;
}
