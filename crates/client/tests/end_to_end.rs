use serde_json::json;
use srpc_client::{
    CallOptions, ClientConfig, ConsistentHashLoadBalancer, Error, LoadBalancer, RpcClient,
};
use srpc_protocol::{RemoteErrorKind, Request, SERIALIZER_JSON};
use srpc_registry::StaticRegistry;
use srpc_server::{
    MethodError, RpcServer, ServerConfig, ServerHandle, Service, ServiceRegistry,
    TrafficControlConfig,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn services() -> ServiceRegistry {
    ServiceRegistry::new().with(
        Service::builder("Echo")
            .typed("say", &["string"], |(text,): (String,)| async move {
                Ok::<_, MethodError>(text)
            })
            .typed("add", &["int", "int"], |(a, b): (i64, i64)| async move {
                Ok::<_, MethodError>(a + b)
            })
            .typed("sleep", &["int"], |(millis,): (u64,)| async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok::<_, MethodError>(millis)
            })
            .build(),
    )
}

/// A server whose `Whoami.port` answers with its own listening port.
async fn start(traffic_control: Option<f64>) -> ServerHandle {
    let config = ServerConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        traffic_control: TrafficControlConfig {
            enabled: traffic_control.is_some(),
            permits_per_second: traffic_control.unwrap_or(1000.0),
        },
        ..ServerConfig::default()
    };

    // The port is only known after binding, so each server reports the one
    // it was told about through a shared cell.
    let port = Arc::new(std::sync::OnceLock::<u16>::new());
    let reported = Arc::clone(&port);
    let services = services().with(
        Service::builder("Whoami")
            .method("port", &[], move |_| {
                let port = reported.get().copied().unwrap_or_default();
                async move { Ok::<_, MethodError>(json!(port)) }
            })
            .build(),
    );

    let handle = RpcServer::new(config, services).bind().await.unwrap();
    port.set(handle.local_addr().port()).unwrap();
    handle
}

fn client(registry: Arc<StaticRegistry>, config: ClientConfig) -> RpcClient {
    RpcClient::builder()
        .registry(registry)
        .config(config)
        .build()
        .unwrap()
}

fn registry_for(servers: &[&ServerHandle]) -> Arc<StaticRegistry> {
    let registry = Arc::new(StaticRegistry::new());
    for server in servers {
        registry.register("Echo", server.local_addr());
        registry.register("Whoami", server.local_addr());
    }
    registry
}

#[tokio::test]
async fn test_echo_request_seven() {
    let server = start(None).await;
    let client = client(registry_for(&[&server]), ClientConfig::default());
    let say = || Request::new("Echo", "say").arg("string", "hi");

    for _ in 0..7 {
        client.request(say(), &CallOptions::default()).await.unwrap();
    }

    let pending = client.send(say(), &CallOptions::default()).await.unwrap();
    assert_eq!(pending.request_id(), 7);

    let response = pending.await.unwrap();
    assert_eq!(response.request_id(), 7);
    assert_eq!(response.result(), Some(&json!("hi")));
    assert!(response.error().is_none());
    assert_eq!(client.pending_requests(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_typed_call_and_invoke() {
    let server = start(None).await;
    let client = client(registry_for(&[&server]), ClientConfig::default());

    let sum: i64 = client
        .call(
            Request::new("Echo", "add").arg("int", 2).arg("int", 40),
            &CallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(sum, 42);

    let value = client
        .invoke("Echo", "say", vec!["string".to_string()], vec![json!("x")])
        .await
        .unwrap();
    assert_eq!(value, json!("x"));

    let result: Result<i64, _> = client
        .call(Request::new("Echo", "say").arg("string", "not a number"), &CallOptions::default())
        .await;
    assert!(matches!(result, Err(Error::ResultType(_))));

    server.shutdown().await;
}

#[tokio::test]
async fn test_json_uncompressed_override() {
    let server = start(None).await;
    let client = client(registry_for(&[&server]), ClientConfig::default());

    let options = CallOptions::default().serializer(SERIALIZER_JSON).compressor(0);
    let text: String = client
        .call(Request::new("Echo", "say").arg("string", "plain"), &options)
        .await
        .unwrap();
    assert_eq!(text, "plain");

    server.shutdown().await;
}

#[tokio::test]
async fn test_remote_errors() {
    let server = start(None).await;
    let client = client(registry_for(&[&server]), ClientConfig::default());

    let result = client
        .invoke("Echo", "shout", vec!["string".to_string()], vec![json!("x")])
        .await;
    match result {
        Err(Error::Remote(error)) => assert_eq!(error.kind, RemoteErrorKind::MethodNotFound),
        other => panic!("unexpected result: {other:?}"),
    }

    let result = client
        .invoke("Echo", "add", vec!["int".to_string(), "int".to_string()], vec![json!("a"), json!(1)])
        .await;
    match result {
        Err(Error::Remote(error)) => assert_eq!(error.kind, RemoteErrorKind::Invocation),
        other => panic!("unexpected result: {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_timeout_frees_pending_entry() {
    let server = start(None).await;
    let client = client(registry_for(&[&server]), ClientConfig::default());

    let options = CallOptions::default().timeout(Duration::from_millis(50));
    let result = client
        .request(Request::new("Echo", "sleep").arg("int", 2_000), &options)
        .await;
    assert!(matches!(result, Err(Error::Timeout(_))));
    assert_eq!(client.pending_requests(), 0);

    // The abandoned connection is still busy, so the next call dials anew.
    let text: String = client
        .call(Request::new("Echo", "say").arg("string", "after"), &CallOptions::default())
        .await
        .unwrap();
    assert_eq!(text, "after");

    server.shutdown().await;
}

/// Accepts connections and never reads from them.
async fn stalled_peer() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    addr
}

fn oversized_request() -> Request {
    Request::new("Echo", "say").arg("string", "x".repeat(64 << 20))
}

fn stalled_client(addr: SocketAddr, write_timeout_ms: u64) -> RpcClient {
    let registry = Arc::new(StaticRegistry::new());
    registry.register("Echo", addr);
    let mut config = ClientConfig {
        compressor: "off".to_string(),
        max_frame_len: 128 << 20,
        ..ClientConfig::default()
    };
    config.pool.write_timeout_ms = write_timeout_ms;
    client(registry, config)
}

#[tokio::test]
async fn test_request_timeout_covers_stalled_write() {
    let addr = stalled_peer().await;
    let client = stalled_client(addr, 10_000);

    let options = CallOptions::default().timeout(Duration::from_millis(200));
    let started = Instant::now();
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        client.request(oversized_request(), &options),
    )
    .await
    .expect("request outlived its timeout");

    assert!(matches!(result, Err(Error::Timeout(_))));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(client.pending_requests(), 0);
    assert!(client.pool().address_pool(addr).unwrap().is_empty());
}

#[tokio::test]
async fn test_send_bounded_by_write_timeout() {
    let addr = stalled_peer().await;
    let client = stalled_client(addr, 300);

    let started = Instant::now();
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        client.send(oversized_request(), &CallOptions::default()),
    )
    .await
    .expect("send outlived the write timeout");

    assert!(matches!(result, Err(Error::Timeout(t)) if t == Duration::from_millis(300)));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(client.pending_requests(), 0);
    assert!(client.pool().address_pool(addr).unwrap().is_empty());
}

#[tokio::test]
async fn test_unencodable_request_fails_without_registering() {
    let server = start(None).await;
    let client = client(registry_for(&[&server]), ClientConfig::default());
    let say = || Request::new("Echo", "say").arg("string", "hi");

    let options = CallOptions::default().serializer(99);
    let result = client.request(say(), &options).await;
    assert!(matches!(result, Err(Error::Transport(_))));
    assert_eq!(client.pending_requests(), 0);

    let options = CallOptions::default().compressor(0);
    let result = client.request(oversized_request(), &options).await;
    assert!(matches!(result, Err(Error::Transport(_))));
    assert_eq!(client.pending_requests(), 0);

    // The connection was released, not closed, and serves the next call.
    let pool = client.pool().address_pool(server.local_addr()).unwrap();
    assert_eq!(pool.len(), 1);
    assert_eq!(pool.idle(), 1);

    let text: String = client.call(say(), &CallOptions::default()).await.unwrap();
    assert_eq!(text, "hi");
    assert_eq!(pool.len(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_sequential_calls_reuse_connection() {
    let server = start(None).await;
    let client = client(registry_for(&[&server]), ClientConfig::default());

    for i in 0..10 {
        let text: String = client
            .call(
                Request::new("Echo", "say").arg("string", i.to_string()),
                &CallOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(text, i.to_string());
    }

    let pool = client.pool().address_pool(server.local_addr()).unwrap();
    assert_eq!(pool.len(), 1);
    assert_eq!(pool.idle(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_calls() {
    let server = start(None).await;
    let client = Arc::new(client(registry_for(&[&server]), ClientConfig::default()));

    let calls: Vec<_> = (0..100)
        .map(|i| {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                let text: String = client
                    .call(
                        Request::new("Echo", "say").arg("string", format!("call-{i}")),
                        &CallOptions::default(),
                    )
                    .await
                    .unwrap();
                assert_eq!(text, format!("call-{i}"));
            })
        })
        .collect();

    for call in calls {
        call.await.unwrap();
    }
    assert_eq!(client.pending_requests(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_consistent_hash_affinity_and_membership() {
    let first = start(None).await;
    let second = start(None).await;
    let registry = registry_for(&[&first, &second]);
    let config = ClientConfig {
        load_balancer: "consistent-hash".to_string(),
        ..ClientConfig::default()
    };
    let client = client(Arc::clone(&registry), config);

    let whoami = |key: String| {
        let client = &client;
        async move {
            let options = CallOptions::default().affinity_key(key);
            client
                .call::<u16>(Request::new("Whoami", "port"), &options)
                .await
                .unwrap()
        }
    };

    for key in ["alice", "bob", "carol"] {
        let port = whoami(key.to_string()).await;
        for _ in 0..5 {
            assert_eq!(whoami(key.to_string()).await, port);
        }
    }

    let third = start(None).await;
    registry.register("Whoami", third.local_addr());

    // Find a key the grown ring places on the new server.
    let candidates = [first.local_addr(), second.local_addr(), third.local_addr()];
    let probe = ConsistentHashLoadBalancer::new();
    let key = (0..100_000)
        .map(|i| format!("user-{i}"))
        .find(|key| {
            probe
                .select_address("Whoami", &candidates, key.as_bytes())
                .unwrap()
                == third.local_addr()
        })
        .unwrap();
    assert_eq!(whoami(key).await, third.local_addr().port());

    first.shutdown().await;
    second.shutdown().await;
    third.shutdown().await;
}

#[tokio::test]
async fn test_traffic_control_rejects_third_request() {
    let server = start(Some(2.0)).await;
    let client = client(registry_for(&[&server]), ClientConfig::default());
    let say = || Request::new("Echo", "say").arg("string", "hi");

    client.call::<String>(say(), &CallOptions::default()).await.unwrap();
    client.call::<String>(say(), &CallOptions::default()).await.unwrap();

    match client.call::<String>(say(), &CallOptions::default()).await {
        Err(Error::Remote(error)) => {
            assert_eq!(error.kind, RemoteErrorKind::Filtered);
            assert_eq!(error.filter.as_deref(), Some("traffic-control"));
        }
        other => panic!("unexpected result: {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_server_shutdown_fails_pending() {
    let server = start(None).await;
    let client = client(registry_for(&[&server]), ClientConfig::default());

    let pending = client
        .send(Request::new("Echo", "sleep").arg("int", 5_000), &CallOptions::default())
        .await
        .unwrap();
    server.shutdown().await;

    let result = pending.wait(Duration::from_secs(2)).await;
    assert!(matches!(result, Err(Error::ConnectionClosed)));
    assert_eq!(client.pending_requests(), 0);
}
