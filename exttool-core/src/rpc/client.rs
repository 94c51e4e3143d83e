// MIT License
// Copyright 2023--present exttool developers

//! Synchronous client for a calculation server.
//!
//! The client owns a single-threaded tokio runtime so that the short-lived
//! client process can drive async I/O from plain blocking code. Every call
//! opens a fresh connection; there is no retry and no local fallback.

use std::path::{Path, PathBuf};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::runtime::{Builder, Runtime};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::debug;

use super::{codec, decode, encode, Request, Response, ServerStatus};
use crate::config::ClientConfig;
use crate::engrad::FormatVariant;
use crate::runner;
use crate::status::BridgeError;
use crate::types::{CalculationInput, CalculationResult};

/// RPC client bound to one server endpoint.
pub struct RpcClient {
    runtime: Runtime,
    config: ClientConfig,
}

impl RpcClient {
    /// Create a client for `config.endpoint`.
    ///
    /// No connection is made until the first call.
    pub fn new(config: ClientConfig) -> Result<Self, BridgeError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| BridgeError::Internal(format!("failed to create tokio runtime: {e}")))?;
        Ok(Self { runtime, config })
    }

    /// Send one calculation and wait for its result.
    pub fn calculate(&self, input: &CalculationInput) -> Result<CalculationResult, BridgeError> {
        let response = self
            .runtime
            .block_on(self.exchange(Request::Calculate(input.clone())))?;
        match response {
            Response::Result(result) => {
                result.check(input.geometry.len(), input.gradient)?;
                Ok(result)
            }
            Response::Error(payload) => Err(payload.into_error()),
            Response::Status(_) => Err(BridgeError::Protocol(
                "expected a calculation result, got a status report".into(),
            )),
        }
    }

    /// Ask the server for its health report.
    pub fn status(&self) -> Result<ServerStatus, BridgeError> {
        match self.runtime.block_on(self.exchange(Request::Status))? {
            Response::Status(status) => Ok(status),
            Response::Error(payload) => Err(payload.into_error()),
            Response::Result(_) => Err(BridgeError::Protocol(
                "expected a status report, got a calculation result".into(),
            )),
        }
    }

    async fn exchange(&self, request: Request) -> Result<Response, BridgeError> {
        let endpoint = &self.config.endpoint;
        let unreachable = |reason: String| BridgeError::ServerUnreachable {
            addr: endpoint.to_string(),
            reason,
        };

        let connect = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
        let stream = match timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(unreachable(e.to_string())),
            Err(_) => {
                return Err(unreachable(format!(
                    "no connection within {:?}",
                    self.config.connect_timeout
                )))
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {e}");
        }
        debug!(%endpoint, "connected");

        let mut framed = Framed::new(stream, codec(self.config.max_frame_length));
        framed
            .send(encode(&request)?)
            .await
            .map_err(|e| BridgeError::Protocol(format!("send failed: {e}")))?;

        let frame = match self.config.response_timeout {
            Some(limit) => timeout(limit, framed.next())
                .await
                .map_err(|_| unreachable(format!("no response within {limit:?}")))?,
            None => framed.next().await,
        };
        let frame = frame
            .ok_or_else(|| {
                BridgeError::Protocol("server closed the connection without responding".into())
            })?
            .map_err(|e| BridgeError::Protocol(format!("receive failed: {e}")))?;
        decode(&frame)
    }
}

/// Handle one host-program step through a server.
pub fn run_client(
    descriptor: &Path,
    config: ClientConfig,
    variant: FormatVariant,
) -> Result<PathBuf, BridgeError> {
    let client = RpcClient::new(config)?;
    runner::execute(descriptor, variant, |input| client.calculate(input))
}
