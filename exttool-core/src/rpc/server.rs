// MIT License
// Copyright 2023--present exttool developers

//! Long-lived calculation server.
//!
//! The model is loaded once per session. Each connection is served by its own
//! task and its requests are answered in order; model calls run on the
//! blocking pool.
//!
//! Two semaphores bound the work in progress:
//!
//! - the *core budget* (`workers` permits): a request holds
//!   `min(ncores, workers)` permits while it runs;
//! - the *model pool*: one permit per loaded model instance. Models that
//!   cannot replicate themselves get a pool of one, which serializes calls.

use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::Semaphore;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::{codec, decode, encode, ErrorPayload, Request, Response, ServerState, ServerStatus};
use crate::backends;
use crate::config::{BackendConfig, ServerConfig};
use crate::potential::Calculator;
use crate::status::{catch_unwind, BridgeError};
use crate::types::{CalculationInput, CalculationResult};

/// Extra time given to blocking model calls when the runtime shuts down.
const BLOCKING_SHUTDOWN: Duration = Duration::from_secs(1);

/// Loaded model instances, handed out one per running request.
struct ModelPool {
    size: usize,
    slots: Semaphore,
    idle: Mutex<Vec<Calculator>>,
}

impl ModelPool {
    /// Fill the pool with up to `size` instances, replicating `first` where
    /// the model allows it.
    fn new(first: Calculator, size: usize) -> Self {
        let mut instances = Vec::with_capacity(size);
        while instances.len() + 1 < size {
            match first.replicate() {
                Some(replica) => instances.push(replica),
                None => break,
            }
        }
        instances.push(first);
        Self {
            size: instances.len(),
            slots: Semaphore::new(instances.len()),
            idle: Mutex::new(instances),
        }
    }

    fn take(&self) -> Option<Calculator> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop()
    }

    fn give_back(&self, calculator: Calculator) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(calculator);
    }
}

/// State shared by every connection of a session.
struct Shared {
    backend: String,
    workers: usize,
    cores: Semaphore,
    pool: ModelPool,
    model_loads: AtomicU64,
    served: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicU64,
    draining: AtomicBool,
}

impl Shared {
    fn status(&self) -> ServerStatus {
        let in_flight = self.in_flight.load(Ordering::SeqCst);
        let state = if self.draining.load(Ordering::SeqCst) {
            ServerState::Draining
        } else if in_flight > 0 {
            ServerState::Serving
        } else {
            ServerState::Idle
        };
        ServerStatus {
            state,
            backend: self.backend.clone(),
            model_loads: self.model_loads.load(Ordering::SeqCst),
            workers: self.workers,
            served: self.served.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            in_flight,
        }
    }

    async fn respond(&self, frame: &[u8]) -> Response {
        let request = match decode::<Request>(frame) {
            Ok(request) => request,
            Err(e) => {
                warn!("{e}");
                return Response::Error(ErrorPayload::from(&e));
            }
        };
        match request {
            Request::Status => Response::Status(self.status()),
            Request::Calculate(input) => {
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                let outcome = self.calculate(input).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                match outcome {
                    Ok(result) => {
                        self.served.fetch_add(1, Ordering::SeqCst);
                        Response::Result(result)
                    }
                    Err(e) => {
                        self.failed.fetch_add(1, Ordering::SeqCst);
                        warn!(status = e.status().code(), "request failed: {e}");
                        Response::Error(ErrorPayload::from(&e))
                    }
                }
            }
        }
    }

    async fn calculate(
        &self,
        mut input: CalculationInput,
    ) -> Result<CalculationResult, BridgeError> {
        input.validate()?;
        let granted = input.ncores.min(self.workers);
        if granted < input.ncores {
            debug!(requested = input.ncores, granted, "core request clamped to worker budget");
        }
        input.ncores = granted;

        let closed = |_| BridgeError::Internal("server is shutting down".into());
        let permits = u32::try_from(granted).unwrap_or(u32::MAX);
        let _cores = self.cores.acquire_many(permits).await.map_err(closed)?;
        let slot = self.pool.slots.acquire().await.map_err(closed)?;
        let mut calculator = self
            .pool
            .take()
            .ok_or_else(|| BridgeError::Internal("model pool is empty".into()))?;

        let atoms = input.geometry.len();
        debug!(atoms, ncores = granted, gradient = input.gradient, "calculating");
        let joined = tokio::task::spawn_blocking(move || {
            let result = catch_unwind(AssertUnwindSafe(|| calculator.compute(&input)));
            (calculator, result)
        })
        .await;
        match joined {
            Ok((calculator, result)) => {
                self.pool.give_back(calculator);
                drop(slot);
                result
            }
            Err(e) => {
                // the instance went down with the task; shrink the pool
                slot.forget();
                error!("model task failed: {e}");
                Err(BridgeError::Internal(format!("model task failed: {e}")))
            }
        }
    }
}

/// A server session holding a loaded model, not yet bound.
pub struct ServerSession {
    config: ServerConfig,
    shared: Arc<Shared>,
}

impl ServerSession {
    /// Load the backend once and prepare the session.
    pub fn start(config: ServerConfig, backend: &BackendConfig) -> Result<Self, BridgeError> {
        info!(state = ?ServerState::Starting, backend = %backend.family, "starting server");
        Self::with_loader(config, || backends::load(backend))
    }

    /// Prepare a session around the model produced by `load`. The loader runs
    /// exactly once; it is the only place a session loads a model.
    pub fn with_loader<L>(config: ServerConfig, load: L) -> Result<Self, BridgeError>
    where
        L: FnOnce() -> Result<Calculator, BridgeError>,
    {
        let calculator = load()?;
        let session = Self::assemble(config, calculator);
        session.shared.model_loads.fetch_add(1, Ordering::SeqCst);
        Ok(session)
    }

    /// Build a session around an already loaded model.
    pub fn from_calculator(config: ServerConfig, calculator: Calculator) -> Self {
        let session = Self::assemble(config, calculator);
        session.shared.model_loads.fetch_add(1, Ordering::SeqCst);
        session
    }

    fn assemble(config: ServerConfig, calculator: Calculator) -> Self {
        let workers = config.workers.max(1);
        let backend = calculator.name().to_string();
        let pool = ModelPool::new(calculator, workers);
        info!(backend = %backend, workers, instances = pool.size, "model pool ready");
        Self {
            config,
            shared: Arc::new(Shared {
                backend,
                workers,
                cores: Semaphore::new(workers),
                pool,
                model_loads: AtomicU64::new(0),
                served: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                in_flight: AtomicU64::new(0),
                draining: AtomicBool::new(false),
            }),
        }
    }

    pub fn status(&self) -> ServerStatus {
        self.shared.status()
    }

    /// Claim the configured endpoint. Failure is final; no other port is
    /// tried.
    pub async fn bind(self) -> Result<BoundServer, BridgeError> {
        let endpoint = &self.config.endpoint;
        let listener = TcpListener::bind((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|source| BridgeError::Bind {
                addr: endpoint.to_string(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| BridgeError::Internal(format!("cannot read bound address: {e}")))?;
        info!(state = ?ServerState::Listening, addr = %local_addr, "server listening");
        Ok(BoundServer {
            listener,
            local_addr,
            config: self.config,
            shared: self.shared,
        })
    }

    /// Run the session on its own runtime until SIGINT or SIGTERM.
    ///
    /// This blocks the calling thread.
    pub fn run_blocking(self) -> Result<(), BridgeError> {
        let runtime = Runtime::new()
            .map_err(|e| BridgeError::Internal(format!("failed to create tokio runtime: {e}")))?;
        let outcome = runtime.block_on(async move {
            let server = self.bind().await?;
            server.serve_until(shutdown_signal()).await;
            Ok::<(), BridgeError>(())
        });
        runtime.shutdown_timeout(BLOCKING_SHUTDOWN);
        outcome
    }
}

/// A session bound to its endpoint.
pub struct BoundServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ServerConfig,
    shared: Arc<Shared>,
}

impl BoundServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn status(&self) -> ServerStatus {
        self.shared.status()
    }

    /// Accept connections until `shutdown` resolves, then drain: stop
    /// accepting, let in-flight requests finish, and return once they have
    /// or the grace period runs out.
    pub async fn serve_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let tracker = TaskTracker::new();
        let token = CancellationToken::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(%peer, "set_nodelay failed: {e}");
                        }
                        debug!(%peer, "connection accepted");
                        tracker.spawn(serve_connection(
                            self.shared.clone(),
                            stream,
                            peer,
                            self.config.max_frame_length,
                            token.clone(),
                        ));
                    }
                    Err(e) => warn!("accept failed: {e}"),
                },
            }
        }

        drop(self.listener);
        self.shared.draining.store(true, Ordering::SeqCst);
        let in_flight = self.shared.in_flight.load(Ordering::SeqCst);
        info!(state = ?ServerState::Draining, in_flight, "draining");
        token.cancel();
        tracker.close();
        if tokio::time::timeout(self.config.grace, tracker.wait())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.shared.in_flight.load(Ordering::SeqCst),
                "grace period elapsed; abandoning in-flight requests"
            );
        }
        let status = self.shared.status();
        info!(
            state = ?ServerState::Stopped,
            served = status.served,
            failed = status.failed,
            "server stopped"
        );
    }
}

async fn serve_connection(
    shared: Arc<Shared>,
    stream: TcpStream,
    peer: SocketAddr,
    max_frame_length: usize,
    token: CancellationToken,
) {
    let mut framed = Framed::new(stream, codec(max_frame_length));
    loop {
        let frame = tokio::select! {
            frame = framed.next() => frame,
            _ = token.cancelled() => break,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!(%peer, "dropping connection: {e}");
                break;
            }
            None => break,
        };
        let response = shared.respond(&frame).await;
        let bytes = match encode(&response) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(%peer, "{e}");
                break;
            }
        };
        if let Err(e) = framed.send(bytes).await {
            debug!(%peer, "peer went away, response discarded: {e}");
            break;
        }
    }
    debug!(%peer, "connection closed");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("cannot listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
