// MIT License
// Copyright 2023--present exttool developers

//! One host-program step: descriptor in, `.engrad` out.
//!
//! The standalone tool and the client share this flow and differ only in
//! where the energy comes from (an in-process
//! [`Calculator`](crate::potential::Calculator) or a server).

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::backends;
use crate::config::BackendConfig;
use crate::engrad::{self, FormatVariant};
use crate::request::{self, load_job};
use crate::status::BridgeError;
use crate::types::{CalculationInput, CalculationRequest, CalculationResult};

/// Parse `descriptor`, obtain a result from `compute` and write it next to
/// the geometry file. Returns the path written.
///
/// Once the result path is known, any failure removes an existing file at
/// that path before the error is returned.
pub fn execute<F>(
    descriptor: &Path,
    variant: FormatVariant,
    compute: F,
) -> Result<PathBuf, BridgeError>
where
    F: FnOnce(&CalculationInput) -> Result<CalculationResult, BridgeError>,
{
    let request = request::read_descriptor(descriptor)?;
    let result_path = request.result_path();
    match run_job(request, &result_path, variant, compute) {
        Ok(()) => Ok(result_path),
        Err(e) => {
            if let Err(cleanup) = engrad::remove_stale(&result_path) {
                warn!("{cleanup}");
            }
            Err(e)
        }
    }
}

fn run_job<F>(
    request: CalculationRequest,
    result_path: &Path,
    variant: FormatVariant,
    compute: F,
) -> Result<(), BridgeError>
where
    F: FnOnce(&CalculationInput) -> Result<CalculationResult, BridgeError>,
{
    let job = load_job(request)?;
    let input = job.input();
    let result = compute(&input)?;
    result.check(input.geometry.len(), input.gradient)?;
    engrad::write_result(result_path, &result, input.geometry.len(), variant)?;
    info!(
        atoms = input.geometry.len(),
        energy = result.energy,
        "wrote {}",
        result_path.display()
    );
    Ok(())
}

/// Load the backend, compute in-process, write the result, and return.
pub fn run_standalone(
    descriptor: &Path,
    config: &BackendConfig,
    variant: FormatVariant,
) -> Result<PathBuf, BridgeError> {
    execute(descriptor, variant, |input| {
        // loaded after parsing so a malformed request fails fast
        backends::load(config)?.compute(input)
    })
}
