//! Integration tests for the exchange client and server.
//!
//! Each test binds a provider on `127.0.0.1:0` and talks to it with a real
//! TCP client.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dubbo_proto::{
    Package, RequestPayload, ResponsePayload, ResponseStatus, ReturnType, Service, ServiceCall,
    Value,
};
use dubbo_remoting::{
    ClientConfig, DispatchError, ExchangeClient, ReconnectPolicy, RemotingError, RequestHandler,
    Server, ServerConfig,
};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

const ECHO: &str = "org.apache.dubbo.sample.EchoService";

#[derive(Default)]
struct EchoHandler {
    oneway_calls: AtomicUsize,
}

#[async_trait]
impl RequestHandler for EchoHandler {
    async fn handle(
        &self,
        service: Service,
        call: ServiceCall,
    ) -> Result<ResponsePayload, DispatchError> {
        if service.path != ECHO {
            return Err(DispatchError::service_not_found(&service.service_key()));
        }
        match service.method.as_str() {
            "echo" => {
                let mut payload =
                    ResponsePayload::value(call.args.into_iter().next().unwrap_or(Value::Null));
                payload
                    .attachments
                    .insert("served-by".to_owned(), "echo".to_owned());
                Ok(payload)
            }
            "versioned" => {
                let mut payload = ResponsePayload::value(Value::from("v"));
                payload
                    .attachments
                    .insert("dubbo".to_owned(), "1.0.0".to_owned());
                Ok(payload)
            }
            "slow" => {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(ResponsePayload::value(Value::from("late")))
            }
            "notify" => {
                self.oneway_calls.fetch_add(1, Ordering::SeqCst);
                Ok(ResponsePayload::default())
            }
            "boom" => panic!("boom"),
            other => Err(DispatchError::bad_request(format!("no method {other}"))),
        }
    }
}

fn call(path: &str, method: &str, args: Vec<Value>) -> Package {
    Package::request(
        Service {
            path: path.into(),
            interface: path.into(),
            method: method.into(),
            ..Service::default()
        },
        RequestPayload {
            args,
            ..RequestPayload::default()
        },
    )
}

fn test_config() -> ClientConfig {
    ClientConfig {
        heartbeat_period: Duration::ZERO,
        reconnect: ReconnectPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            max_fail_count: 5,
        },
        ..ClientConfig::default()
    }
}

async fn start_server(handler: Arc<EchoHandler>) -> (String, CancellationToken) {
    let server = Server::bind("127.0.0.1:0", handler, ServerConfig::default())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let shutdown = CancellationToken::new();
    tokio::spawn(server.serve(shutdown.clone()));
    (addr, shutdown)
}

#[tokio::test]
async fn request_response_over_tcp() {
    let (addr, shutdown) = start_server(Arc::default()).await;
    let client = ExchangeClient::connect(&addr, test_config()).await.unwrap();

    let payload = client
        .request(
            call(ECHO, "echo", vec![Value::Int(41)]),
            ReturnType::Long,
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    assert_eq!(payload.value, Some(Value::Long(41)));
    assert_eq!(payload.attachments["served-by"], "echo");
    assert_eq!(payload.attachments["dubbo"], "2.0.2");
    assert_eq!(client.pending_count(), 0);

    client.close();
    shutdown.cancel();
}

#[tokio::test]
async fn response_carries_the_callers_version() {
    let (addr, shutdown) = start_server(Arc::default()).await;
    let client = ExchangeClient::connect(&addr, test_config()).await.unwrap();

    let payload = client
        .request(
            call(ECHO, "versioned", vec![]),
            ReturnType::String,
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    assert_eq!(payload.value, Some(Value::from("v")));
    assert_eq!(payload.attachments["dubbo"], "2.0.2");

    client.close();
    shutdown.cancel();
}

#[tokio::test]
async fn concurrent_requests_are_matched_by_id() {
    let (addr, shutdown) = start_server(Arc::default()).await;
    let client = ExchangeClient::connect(&addr, test_config()).await.unwrap();

    let calls = (0..32).map(|i| {
        let client = client.clone();
        async move {
            let payload = client
                .request(
                    call(ECHO, "echo", vec![Value::Int(i)]),
                    ReturnType::Int,
                    Duration::from_secs(2),
                )
                .await
                .unwrap();
            assert_eq!(payload.value, Some(Value::Int(i)));
        }
    });
    futures_join_all(calls).await;

    client.close();
    shutdown.cancel();
}

async fn futures_join_all<F: std::future::Future<Output = ()> + Send + 'static>(
    futures: impl Iterator<Item = F>,
) {
    let handles: Vec<_> = futures.map(tokio::spawn).collect();
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn timeout_then_late_response_is_dropped() {
    let (addr, shutdown) = start_server(Arc::default()).await;
    let client = ExchangeClient::connect(&addr, test_config()).await.unwrap();

    let err = client
        .request(
            call(ECHO, "slow", vec![]),
            ReturnType::Any,
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RemotingError::Timeout { .. }));
    assert_eq!(client.pending_count(), 0);

    // Let the late response arrive; the connection must survive it.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let payload = client
        .request(
            call(ECHO, "echo", vec![Value::from("still here")]),
            ReturnType::String,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert_eq!(payload.value, Some(Value::from("still here")));

    client.close();
    shutdown.cancel();
}

#[tokio::test]
async fn async_request_runs_callback() {
    let (addr, shutdown) = start_server(Arc::default()).await;
    let client = ExchangeClient::connect(&addr, test_config()).await.unwrap();

    let (tx, rx) = oneshot::channel();
    client
        .request_async(
            call(ECHO, "echo", vec![Value::from("cb")]),
            ReturnType::String,
            Duration::from_secs(1),
            Box::new(move |rsp| {
                let _ = tx.send(rsp.result.map(|p| p.value));
            }),
        )
        .await
        .unwrap();

    let got = rx.await.unwrap().unwrap();
    assert_eq!(got, Some(Value::from("cb")));

    let (tx, rx) = oneshot::channel();
    client
        .request_async(
            call(ECHO, "slow", vec![]),
            ReturnType::Any,
            Duration::from_millis(30),
            Box::new(move |rsp| {
                let _ = tx.send(rsp.result.is_err());
            }),
        )
        .await
        .unwrap();
    assert!(rx.await.unwrap(), "slow call should time out");

    client.close();
    shutdown.cancel();
}

#[tokio::test]
async fn oneway_gets_no_response() {
    let handler = Arc::new(EchoHandler::default());
    let (addr, shutdown) = start_server(Arc::clone(&handler)).await;
    let client = ExchangeClient::connect(&addr, test_config()).await.unwrap();

    client
        .send_oneway(call(ECHO, "notify", vec![]))
        .await
        .unwrap();
    assert_eq!(client.pending_count(), 0);

    // A two-way call behind it proves the one-way frame was consumed.
    client
        .request(call(ECHO, "echo", vec![]), ReturnType::Any, Duration::from_secs(1))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(handler.oneway_calls.load(Ordering::SeqCst), 1);

    client.close();
    shutdown.cancel();
}

#[tokio::test]
async fn heartbeat_is_echoed() {
    let (addr, shutdown) = start_server(Arc::default()).await;
    let client = ExchangeClient::connect(&addr, test_config()).await.unwrap();

    let rtt = client.heartbeat().await.unwrap();
    assert!(rtt < Duration::from_secs(1));
    assert_eq!(client.pending_count(), 0);

    client.close();
    shutdown.cancel();
}

#[tokio::test]
async fn unknown_service_status() {
    let (addr, shutdown) = start_server(Arc::default()).await;
    let client = ExchangeClient::connect(&addr, test_config()).await.unwrap();

    let err = client
        .request(
            call("com.example.Missing", "echo", vec![]),
            ReturnType::Any,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
    match err {
        RemotingError::Status { status, message } => {
            assert_eq!(status, ResponseStatus::ServiceNotFound);
            assert!(message.contains("com.example.Missing"));
        }
        other => panic!("unexpected error: {other}"),
    }

    client.close();
    shutdown.cancel();
}

#[tokio::test]
async fn handler_panic_becomes_exception() {
    let (addr, shutdown) = start_server(Arc::default()).await;
    let client = ExchangeClient::connect(&addr, test_config()).await.unwrap();

    let payload = client
        .request(call(ECHO, "boom", vec![]), ReturnType::Any, Duration::from_secs(1))
        .await
        .unwrap();
    let exception = payload.exception.expect("panic should surface as exception");
    assert!(exception.message.contains("boom"));

    // The connection keeps serving.
    client
        .request(call(ECHO, "echo", vec![]), ReturnType::Any, Duration::from_secs(1))
        .await
        .unwrap();

    client.close();
    shutdown.cancel();
}

#[tokio::test]
async fn close_fails_pending_and_reconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (reaccepted_tx, reaccepted_rx) = oneshot::channel();

    tokio::spawn(async move {
        // First connection: read the request, then hang up without replying.
        let (mut first, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 16];
        first.read_exact(&mut buf).await.unwrap();
        drop(first);

        let (second, _) = listener.accept().await.unwrap();
        let _ = reaccepted_tx.send(());
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(second);
    });

    let client = ExchangeClient::connect(&addr, test_config()).await.unwrap();
    let err = client
        .request(call(ECHO, "echo", vec![]), ReturnType::Any, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, RemotingError::Closed(_)), "got {err}");
    assert!(err.is_transport());

    tokio::time::timeout(Duration::from_secs(2), reaccepted_rx)
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(client.is_available());

    client.close();
    assert!(!client.is_available());
}
