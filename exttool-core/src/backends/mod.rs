// MIT License
// Copyright 2023--present exttool developers

//! Concrete model capabilities and the loader that picks one.
//!
//! | Family | Units | Parallel replicas | Point charges |
//! |--------|-------|-------------------|---------------|
//! | [`pairwise`] | eV, Å | yes | no |
//! | [`xtb`] | Hartree, Bohr | yes | no |

pub mod pairwise;
pub mod xtb;

use tracing::info;

use crate::config::{BackendConfig, BackendFamily, Device};
use crate::potential::Calculator;
use crate::status::{BackendError, BridgeError};

/// Load the model described by `config` and wrap it in a [`Calculator`].
///
/// Loading may be slow (parameter files, executable discovery); callers that
/// serve many requests do this once and keep the result.
pub fn load(config: &BackendConfig) -> Result<Calculator, BridgeError> {
    config.validate()?;
    let calculator = match config.family {
        BackendFamily::Pairwise => {
            Calculator::new(Box::new(pairwise::PairPotential::load(config)?))
        }
        BackendFamily::Xtb => Calculator::new(Box::new(xtb::XtbPotential::load(config)?)),
    };
    info!(
        backend = %config.family,
        model = calculator.name(),
        device = %config.device,
        "model loaded"
    );
    Ok(calculator)
}

/// One line describing `family`: what it is, the options it takes and, for
/// external programs, which executable would be used.
pub fn describe(family: BackendFamily) -> String {
    let mut line = format!(
        "{:<10}{}; options: {}",
        family.name(),
        family.summary(),
        family.recognized_options().join(", ")
    );
    if family == BackendFamily::Xtb {
        match xtb::locate() {
            Some(path) => line.push_str(&format!("; executable: {}", path.display())),
            None => line.push_str(&format!(
                "; executable: not found on PATH ({})",
                xtb::PROGRAM_NAMES.join(", ")
            )),
        }
    }
    line
}

/// Both families evaluate on the host; an explicit accelerator request is
/// refused instead of silently ignored.
pub(crate) fn require_cpu(device: Device) -> Result<(), BackendError> {
    match device {
        Device::Auto | Device::Cpu => Ok(()),
        Device::Cuda(_) => Err(BackendError::DeviceUnavailable {
            device: device.to_string(),
            reason: "this backend only evaluates on the CPU".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DispersionConfig, Precision};

    #[test]
    fn default_config_loads_builtin_pairwise() {
        let calc = load(&BackendConfig::default()).unwrap();
        assert_eq!(calc.name(), "builtin:default");
    }

    #[test]
    fn every_family_is_described() {
        let pairwise = describe(BackendFamily::Pairwise);
        assert!(pairwise.starts_with("pairwise  in-process pair potential"));
        assert!(pairwise.ends_with("options: model, precision, device, dispersion, head"));
        let xtb = describe(BackendFamily::Xtb);
        assert!(xtb.starts_with("xtb       GFN-xTB"));
        assert!(xtb.contains("; executable: "));
    }

    #[test]
    fn gpu_request_is_refused() {
        let mut config = BackendConfig::default();
        config.device = Device::Cuda(Some(0));
        let err = load(&config).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Backend(BackendError::DeviceUnavailable { .. })
        ));
        assert!(err.to_string().contains("cuda:0"));
    }

    #[test]
    fn foreign_option_is_refused_before_loading() {
        let mut config = BackendConfig::new(BackendFamily::Xtb);
        config.dispersion = Some(DispersionConfig::default());
        let err = load(&config).unwrap_err();
        assert!(matches!(err, BridgeError::Backend(BackendError::Config(_))));

        let mut config = BackendConfig::new(BackendFamily::Xtb);
        config.precision = Some(Precision::Float32);
        assert!(load(&config).is_err());
    }
}
