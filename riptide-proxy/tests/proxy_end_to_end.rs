//! End-to-end tests running the full dispatch path against real origin
//! servers on ephemeral ports.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper::{body::Incoming, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};

use riptide_core::errors::DispatchError;
use riptide_core::health::NoHealthStatusMonitor;
use riptide_core::inventory::OriginsInventory;
use riptide_core::load_balancer::round_robin::RoundRobinStrategy;
use riptide_core::load_balancer::sticky::StickySessionStrategy;
use riptide_core::load_balancer::LoadBalancer;
use riptide_core::retry::RetryNTimes;
use riptide_core::service::{BackendService, StickySessionConfig};
use riptide_core::Origin;

use riptide_proxy::dispatch::{BackendServiceClient, PooledHostFactory};
use riptide_proxy::metrics::InProcessMetrics;
use riptide_proxy::routing::{RouteDatabase, RoutingObjectDefinition, StaticResponseFactory};
use riptide_proxy::server::start_server;

/// Serves HTTP/1.1 on an ephemeral port, answering every request with the
/// given marker body.
async fn start_origin(marker: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let service = service_fn(move |_req: Request<Incoming>| async move {
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from_static(
                        marker.as_bytes(),
                    ))))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    port
}

/// A port with nothing listening on it.
async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn origin(id: &str, port: u16) -> Origin {
    Origin::builder("webapp", id)
        .host("127.0.0.1")
        .port(port)
        .build()
        .unwrap()
}

struct Stack {
    client: Arc<BackendServiceClient>,
}

fn assemble(service: BackendService, sticky: bool, max_attempts: u32) -> Stack {
    let host_factory = Arc::new(PooledHostFactory::new(
        service.connection_pool_settings().clone(),
    ));
    let inventory = OriginsInventory::new(
        service.id().clone(),
        Arc::new(NoHealthStatusMonitor),
        host_factory,
    );
    inventory.set_origins(service.origins().to_vec());

    let strategy: Arc<dyn LoadBalancer> = Arc::new(RoundRobinStrategy::new(inventory));
    let strategy: Arc<dyn LoadBalancer> = if sticky {
        Arc::new(StickySessionStrategy::new(strategy))
    } else {
        strategy
    };

    let client = BackendServiceClient::new(
        service,
        strategy,
        Arc::new(RetryNTimes::with_interval(
            max_attempts,
            Duration::from_millis(1),
        )),
        Arc::new(InProcessMetrics::new()),
    );
    Stack { client }
}

fn get(path: &str) -> riptide_core::http::HttpRequest {
    Request::builder().uri(path).body(Bytes::new()).unwrap()
}

#[tokio::test]
async fn retries_past_an_unreachable_origin() {
    let dead = dead_port().await;
    let live = start_origin("live origin").await;
    let service = BackendService::builder("webapp")
        .origins(vec![origin("origin-a", dead), origin("origin-b", live)])
        .build()
        .unwrap();
    let stack = assemble(service, false, 2);

    let response = stack.client.send(get("/")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.into_body(), Bytes::from_static(b"live origin"));
}

#[tokio::test]
async fn fails_terminally_when_every_origin_is_unreachable() {
    let service = BackendService::builder("webapp")
        .origins(vec![
            origin("origin-a", dead_port().await),
            origin("origin-b", dead_port().await),
            origin("origin-c", dead_port().await),
        ])
        .build()
        .unwrap();
    let stack = assemble(service, false, 1);

    let error = stack.client.send(get("/")).await.unwrap_err();
    match error {
        DispatchError::Transport(transport) => assert!(transport.is_retryable()),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn sticky_cookie_pins_the_selection_to_one_origin() {
    let a = start_origin("origin a").await;
    let b = start_origin("origin b").await;
    let service = BackendService::builder("webapp")
        .origins(vec![origin("origin-a", a), origin("origin-b", b)])
        .sticky_session_config(StickySessionConfig {
            enabled: true,
            timeout_seconds: 600,
        })
        .build()
        .unwrap();
    let stack = assemble(service, true, 1);

    for _ in 0..4 {
        let request = Request::builder()
            .uri("/")
            .header("cookie", "styx_origin_webapp=origin-b")
            .body(Bytes::new())
            .unwrap();
        let response = stack.client.send(request).await.unwrap();
        assert_eq!(response.into_body(), Bytes::from_static(b"origin b"));
    }
}

#[tokio::test]
async fn sticky_responses_carry_the_pinning_cookie() {
    let a = start_origin("origin a").await;
    let service = BackendService::builder("webapp")
        .origins(vec![origin("origin-a", a)])
        .sticky_session_config(StickySessionConfig {
            enabled: true,
            timeout_seconds: 600,
        })
        .build()
        .unwrap();
    let stack = assemble(service, true, 1);

    let response = stack.client.send(get("/")).await.unwrap();
    let cookie = response.headers().get("set-cookie").unwrap();
    assert_eq!(
        cookie,
        "styx_origin_webapp=origin-a; Max-Age=600; Path=/; HttpOnly"
    );
}

#[tokio::test]
async fn listener_serves_the_route_database_root() {
    let database = RouteDatabase::new();
    database.add_factory("StaticResponse", Arc::new(StaticResponseFactory));
    database.insert(
        RoutingObjectDefinition::new("root", "StaticResponse")
            .with_config(serde_json::json!({ "status": 200, "content": "riptide up" })),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    tokio::spawn(async move {
        let _ = start_server(addr, None, database, "root").await;
    });
    // Give the listener a moment to bind.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });

    let request = Request::builder()
        .uri("/")
        .header("host", "localhost")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    assert_eq!(response.status(), 200);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, Bytes::from_static(b"riptide up"));
}
