// MIT License
// Copyright 2023--present exttool developers

//! Server and client talking over a real loopback socket.

#![cfg(feature = "rpc")]

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use exttool_core::engrad::FormatVariant;
use exttool_core::potential::{ModelInput, ModelOutput, NativeUnits, Potential};
use exttool_core::rpc::client::{run_client, RpcClient};
use exttool_core::rpc::server::ServerSession;
use exttool_core::rpc::{codec, decode, encode, Request, Response, ServerState};
use exttool_core::status::ErrorKind;
use exttool_core::runner::run_standalone;
use exttool_core::status::BackendError;
use exttool_core::types::{Atom, CalculationInput, Geometry};
use exttool_core::{
    backends, BackendConfig, BridgeError, Calculator, ClientConfig, Endpoint, ServerConfig, Status,
};

/// Test model: counts calls, tracks concurrency, and misbehaves on demand.
#[derive(Clone, Default)]
struct Scripted {
    calls: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    delay: Duration,
}

impl Potential for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    fn units(&self) -> NativeUnits {
        NativeUnits::HARTREE_BOHR
    }

    fn compute(&mut self, input: &ModelInput<'_>) -> Result<ModelOutput, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        thread::sleep(self.delay);
        self.running.fetch_sub(1, Ordering::SeqCst);

        match (input.charge, input.multiplicity) {
            (_, 3) => panic!("model asked to panic"),
            (-2, _) => return Err(BackendError::Execution("model asked to fail".into())),
            _ => {}
        }
        Ok(ModelOutput {
            energy: -0.5 * input.n_atoms() as f64,
            gradient: input
                .want_gradient
                .then(|| input.positions.iter().map(|x| 0.1 * x).collect()),
        })
    }
}

struct Harness {
    addr: SocketAddr,
    stop: Option<tokio::sync::oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Harness {
    fn start(calculator: Calculator, workers: usize) -> Self {
        Self::serve(ServerSession::from_calculator(loopback(workers), calculator))
    }

    fn serve(session: ServerSession) -> Self {
        let (addr_tx, addr_rx) = std::sync::mpsc::channel();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let thread = thread::spawn(move || {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            runtime.block_on(async move {
                let server = session.bind().await.unwrap();
                addr_tx.send(server.local_addr()).unwrap();
                server
                    .serve_until(async {
                        let _ = stopped.await;
                    })
                    .await;
            });
        });
        Self {
            addr: addr_rx.recv().unwrap(),
            stop: Some(stop),
            thread: Some(thread),
        }
    }

    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            endpoint: Endpoint::new("127.0.0.1", self.addr.port()),
            ..ClientConfig::default()
        }
    }

    fn client(&self) -> RpcClient {
        RpcClient::new(self.client_config()).unwrap()
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn loopback(workers: usize) -> ServerConfig {
    ServerConfig {
        endpoint: Endpoint::new("127.0.0.1", 0),
        workers,
        grace: Duration::from_secs(10),
        ..ServerConfig::default()
    }
}

fn h2(multiplicity: u32) -> CalculationInput {
    CalculationInput {
        geometry: Geometry::new(vec![
            Atom::new("H", 0.0, 0.0, 0.0),
            Atom::new("H", 0.0, 0.0, 0.74),
        ]),
        charge: 0,
        multiplicity,
        ncores: 1,
        gradient: true,
        point_charges: None,
    }
}

fn write_job(dir: &std::path::Path) -> PathBuf {
    fs::write(
        dir.join("h2o_EXT.xyz"),
        "3\n\nO 0.0 0.0 0.1173\nH 0.0 0.7572 -0.4692\nH 0.0 -0.7572 -0.4692\n",
    )
    .unwrap();
    let descriptor = dir.join("h2o_EXT.extinp.tmp");
    fs::write(&descriptor, "h2o_EXT.xyz\n0\n1\n4\n1\n").unwrap();
    descriptor
}

#[test]
fn model_is_loaded_once_for_many_requests() {
    let model = Scripted::default();
    let calls = model.calls.clone();
    let server = Harness::start(Calculator::new(Box::new(model)), 1);
    let client = server.client();

    for _ in 0..5 {
        let result = client.calculate(&h2(1)).unwrap();
        assert_eq!(result.energy, -1.0);
        assert_eq!(result.gradient.as_ref().map(Vec::len), Some(6));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    let status = client.status().unwrap();
    assert_eq!(status.served, 5);
    assert_eq!(status.failed, 0);
    assert_eq!(status.backend, "scripted");
    assert_eq!(status.state, ServerState::Idle);
}

#[test]
fn sequential_requests_do_not_reload_the_model() {
    let loads = Arc::new(AtomicUsize::new(0));
    let counter = loads.clone();
    let session = ServerSession::with_loader(loopback(1), move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Calculator::new(Box::new(Scripted::default())))
    })
    .unwrap();
    assert_eq!(session.status().model_loads, 1);

    let server = Harness::serve(session);
    let client = server.client();
    client.calculate(&h2(1)).unwrap();
    client.calculate(&h2(1)).unwrap();

    assert_eq!(loads.load(Ordering::SeqCst), 1);
    let status = client.status().unwrap();
    assert_eq!(status.model_loads, 1);
    assert_eq!(status.served, 2);
}

#[test]
fn failed_load_is_reported_before_binding() {
    let err = ServerSession::with_loader(loopback(1), || {
        Err(BridgeError::Backend(BackendError::ModelLoad {
            model: "missing.json".into(),
            reason: "no such file".into(),
        }))
    })
    .err()
    .unwrap();
    assert_eq!(err.status(), Status::BackendError);
}

#[test]
fn failures_do_not_end_the_session() {
    let server = Harness::start(Calculator::new(Box::new(Scripted::default())), 1);
    let client = server.client();

    let err = client.calculate(&h2(3)).unwrap_err();
    assert_eq!(err.status(), Status::InternalError);
    assert!(err.to_string().contains("model asked to panic"), "{err}");

    let mut failing = h2(1);
    failing.charge = -2;
    let err = client.calculate(&failing).unwrap_err();
    assert_eq!(err.status(), Status::BackendError);
    assert_eq!(err.to_string(), "backend execution failed: model asked to fail");

    // odd electron count for a singlet never reaches the model
    let mut bad = h2(1);
    bad.charge = 1;
    let err = client.calculate(&bad).unwrap_err();
    assert_eq!(err.status(), Status::MalformedRequest);

    assert!(client.calculate(&h2(1)).is_ok());
    let status = client.status().unwrap();
    assert_eq!((status.served, status.failed), (1, 3));
}

#[test]
fn non_replicable_model_is_serialized() {
    let model = Scripted {
        delay: Duration::from_millis(50),
        ..Scripted::default()
    };
    let peak = model.peak.clone();
    let server = Harness::start(Calculator::new(Box::new(model)), 4);
    let config = server.client_config();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let config = config.clone();
            thread::spawn(move || {
                let client = RpcClient::new(config).unwrap();
                let mut input = h2(1);
                input.ncores = 2;
                client.calculate(&input).unwrap()
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[test]
fn in_flight_request_survives_shutdown() {
    let model = Scripted {
        delay: Duration::from_millis(400),
        ..Scripted::default()
    };
    let mut server = Harness::start(Calculator::new(Box::new(model)), 1);
    let config = server.client_config();
    let pending = thread::spawn(move || RpcClient::new(config).unwrap().calculate(&h2(1)));

    thread::sleep(Duration::from_millis(100));
    server.shutdown();
    let result = pending.join().unwrap().unwrap();
    assert_eq!(result.energy, -1.0);

    // nothing listens any more
    let err = RpcClient::new(server.client_config())
        .unwrap()
        .status()
        .unwrap_err();
    assert!(matches!(err, BridgeError::ServerUnreachable { .. }));
}

#[test]
fn client_output_matches_standalone() {
    let config = BackendConfig::default();
    let server = Harness::start(backends::load(&config).unwrap(), 2);

    let remote = tempfile::tempdir().unwrap();
    let local = tempfile::tempdir().unwrap();
    let remote_file = run_client(
        &write_job(remote.path()),
        server.client_config(),
        FormatVariant::Strict,
    )
    .unwrap();
    let local_file =
        run_standalone(&write_job(local.path()), &config, FormatVariant::Strict).unwrap();
    assert_eq!(fs::read(remote_file).unwrap(), fs::read(local_file).unwrap());
}

#[tokio::test]
async fn occupied_port_is_bind_error() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();
    let config = ServerConfig {
        endpoint: Endpoint::new("127.0.0.1", port),
        ..ServerConfig::default()
    };
    let calculator = Calculator::new(Box::new(Scripted::default()));
    let session = ServerSession::from_calculator(config, calculator);
    let err = session.bind().await.err().unwrap();
    assert!(matches!(err, BridgeError::Bind { .. }));
    assert_eq!(err.status(), Status::BindError);
}

async fn connect(addr: SocketAddr) -> Framed<TcpStream, LengthDelimitedCodec> {
    let stream = TcpStream::connect(addr).await.unwrap();
    Framed::new(stream, codec(ServerConfig::default().max_frame_length))
}

#[tokio::test]
async fn pipelined_requests_are_answered_in_order() {
    let server = Harness::start(Calculator::new(Box::new(Scripted::default())), 2);
    let mut conn = connect(server.addr).await;

    let mut odd = h2(1);
    odd.charge = 1;
    let mut bigger = h2(1);
    bigger.geometry = Geometry::new(vec![
        Atom::new("H", 0.0, 0.0, 0.0),
        Atom::new("H", 0.0, 0.0, 0.74),
        Atom::new("H", 0.0, 0.0, 1.48),
        Atom::new("H", 0.0, 0.0, 2.22),
    ]);
    let frames = [
        encode(&Request::Calculate(h2(1))).unwrap(),
        encode(&Request::Calculate(odd)).unwrap(),
        encode(&Request::Calculate(bigger)).unwrap(),
        bytes::Bytes::from_static(b"{ not a request"),
        encode(&Request::Status).unwrap(),
    ];
    for frame in frames {
        conn.send(frame).await.unwrap();
    }

    let mut replies = Vec::new();
    for _ in 0..5 {
        let frame = conn.next().await.unwrap().unwrap();
        replies.push(decode::<Response>(&frame).unwrap());
    }
    match &replies[0] {
        Response::Result(result) => assert_eq!(result.energy, -1.0),
        other => panic!("expected a result, got {other:?}"),
    }
    match &replies[1] {
        Response::Error(payload) => assert_eq!(payload.kind, ErrorKind::MalformedRequest),
        other => panic!("expected an error, got {other:?}"),
    }
    match &replies[2] {
        Response::Result(result) => assert_eq!(result.energy, -2.0),
        other => panic!("expected a result, got {other:?}"),
    }
    match &replies[3] {
        Response::Error(payload) => assert_eq!(payload.kind, ErrorKind::Internal),
        other => panic!("expected an error, got {other:?}"),
    }
    match &replies[4] {
        Response::Status(status) => assert_eq!((status.served, status.failed), (2, 1)),
        other => panic!("expected a status, got {other:?}"),
    }
}

#[tokio::test]
async fn abandoned_request_is_discarded_and_serving_continues() {
    let model = Scripted {
        delay: Duration::from_millis(300),
        ..Scripted::default()
    };
    let calls = model.calls.clone();
    let server = Harness::start(Calculator::new(Box::new(model)), 1);

    let mut conn = connect(server.addr).await;
    conn.send(encode(&Request::Calculate(h2(1))).unwrap())
        .await
        .unwrap();
    while calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    drop(conn);

    let mut conn = connect(server.addr).await;
    let deadline = Instant::now() + Duration::from_secs(5);
    let status = loop {
        conn.send(encode(&Request::Status).unwrap()).await.unwrap();
        let frame = conn.next().await.unwrap().unwrap();
        let status = match decode::<Response>(&frame).unwrap() {
            Response::Status(status) => status,
            other => panic!("expected a status, got {other:?}"),
        };
        if status.in_flight == 0 {
            break status;
        }
        assert!(Instant::now() < deadline, "abandoned request never finished");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert_eq!(status.served, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    conn.send(encode(&Request::Calculate(h2(1))).unwrap())
        .await
        .unwrap();
    let frame = conn.next().await.unwrap().unwrap();
    assert!(matches!(decode::<Response>(&frame).unwrap(), Response::Result(_)));
}

#[test]
fn drain_gives_up_after_grace_period() {
    let model = Scripted {
        delay: Duration::from_secs(3),
        ..Scripted::default()
    };
    let calls = model.calls.clone();
    let config = ServerConfig {
        grace: Duration::from_millis(200),
        ..loopback(1)
    };
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let session = ServerSession::from_calculator(config, Calculator::new(Box::new(model)));
    let server = runtime.block_on(session.bind()).unwrap();
    let client_config = ClientConfig {
        endpoint: Endpoint::new("127.0.0.1", server.local_addr().port()),
        response_timeout: Some(Duration::from_secs(10)),
        ..ClientConfig::default()
    };
    let pending = thread::spawn(move || RpcClient::new(client_config).unwrap().calculate(&h2(1)));

    let started = Instant::now();
    runtime.block_on(server.serve_until(async {
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }));
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_secs(2), "drain took {elapsed:?}");

    // the model call is still sleeping; its connection goes away with the runtime
    runtime.shutdown_background();
    assert!(pending.join().unwrap().is_err());
}
