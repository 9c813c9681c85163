//! End-to-end pure-runner protocol tests over an in-process duplex
//! transport: no sockets, real tonic framing.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hyper_util::rt::TokioIo;
use tonic::transport::{Endpoint, Server, Uri};
use tower::service_fn;

use funcd_agent::LocalAgent;
use funcd_core::models::Call;
use funcd_core::Error;
use funcd_data::NopAccess;
use funcd_grpc::{PureRunner, RunnerClient};
use funcd_pool::mock::MockDriver;
use funcd_pool::{SlotPool, SlotPoolConfig};

async fn start_runner(memory_mb: u64, driver: MockDriver) -> RunnerClient {
    let pool = SlotPool::new(
        Arc::new(driver),
        SlotPoolConfig {
            memory_mb,
            ..Default::default()
        },
    );
    let agent = Arc::new(LocalAgent::new(
        Arc::new(NopAccess::new()),
        pool,
        Some(Duration::from_secs(1)),
    ));
    let service = PureRunner::new(agent).into_server();

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        Server::builder()
            .add_service(service)
            .serve_with_incoming(tokio_stream::iter(vec![Ok::<_, std::io::Error>(server_io)]))
            .await
            .unwrap();
    });

    let mut client_io = Some(client_io);
    let channel = Endpoint::try_from("http://runner.test:9190")
        .unwrap()
        .connect_with_connector(service_fn(move |_: Uri| {
            let io = client_io.take();
            async move {
                io.map(TokioIo::new).ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::Other, "connection already taken")
                })
            }
        }))
        .await
        .unwrap();

    RunnerClient::from_channel("runner.test:9190", channel)
}

fn call() -> Call {
    let mut c = Call::new("app1", "myapp");
    c.route = Some("/hello".into());
    c.image = "hello:v1".into();
    c.memory = 128;
    c.timeout = 5;
    c.idle_timeout = 30;
    c.method = "POST".into();
    c.request_url = "/r/myapp/hello".into();
    c
}

#[tokio::test]
async fn accepted_call_streams_the_response_back() {
    let client = start_runner(1024, MockDriver::new()).await;
    let resp = client
        .try_exec(&call(), Bytes::from_static(b"ping"))
        .await
        .unwrap()
        .expect("accepted");
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, Bytes::from_static(b"pong"));
    assert!(resp
        .headers
        .iter()
        .any(|(k, v)| k == "content-type" && v == "text/plain"));
}

#[tokio::test]
async fn runner_at_capacity_rejects_before_allocating() {
    let driver = MockDriver::new();
    // 64 MB node cannot admit a 128 MB call.
    let client = start_runner(64, driver.clone()).await;
    let placed = client
        .try_exec(&call(), Bytes::from_static(b"ping"))
        .await
        .unwrap();
    assert!(placed.is_none(), "rejection must be retryable");
    assert_eq!(driver.launches(), 0, "rejection must not allocate");
}

#[tokio::test]
async fn function_failure_surfaces_through_the_trailer() {
    let driver = MockDriver::new();
    driver.set_invoke_error(Some(Error::FunctionError {
        exit_code: 9,
        details: "oom".into(),
    }));
    let client = start_runner(1024, driver).await;
    let err = client
        .try_exec(&call(), Bytes::new())
        .await
        .expect_err("function failed");
    assert!(matches!(err, Error::FunctionError { .. }));
    assert!(!err.is_placement_retryable());
}
