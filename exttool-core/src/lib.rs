// MIT License
// Copyright 2023--present exttool developers

//! Bridge between the ORCA `ExtTool` interface and energy/gradient models.
//!
//! For every step, the host program writes a request descriptor and an XYZ
//! geometry, runs an external command, and expects a `.engrad` file in
//! return. This crate provides that command in three shapes:
//!
//! - a standalone runner that loads a model, computes and exits
//!   ([`runner::run_standalone`]);
//! - a long-lived server that loads the model once and serves many requests
//!   ([`rpc::server::ServerSession`]);
//! - a thin client that forwards a request to that server
//!   ([`rpc::client::run_client`]).
//!
//! ## Units
//!
//! Inputs are in Å, outputs in Hartree and Hartree/Bohr. Models work in their
//! own units; [`potential::Calculator`] converts at the boundary.
//!
//! ## Feature flags
//!
//! - `rpc` (default): the server and client, built on tokio.

pub mod backends;
pub mod config;
pub mod elements;
pub mod engrad;
pub mod potential;
pub mod request;
pub mod runner;
pub mod status;
pub mod types;

#[cfg(feature = "rpc")]
pub mod rpc;

pub use config::{BackendConfig, BackendFamily, ClientConfig, Endpoint, ServerConfig};
pub use engrad::FormatVariant;
pub use potential::{Calculator, Potential};
pub use status::{BackendError, BridgeError, Status};
pub use types::{CalculationInput, CalculationRequest, CalculationResult, Geometry};
