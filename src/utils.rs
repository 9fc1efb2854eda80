// A simple wrapper around File::open adding details about the
// problematic file.
use crate::error::LoadError;
use crate::weights::ModelKind;
use std::path::Path;
use tch::Device;

pub(crate) fn file_open<P: AsRef<Path>>(path: P) -> Result<std::fs::File, LoadError> {
    std::fs::File::open(path.as_ref())
        .map_err(|source| LoadError::Io { path: path.as_ref().to_path_buf(), source })
}

fn accelerator() -> Device {
    if tch::utils::has_mps() {
        Device::Mps
    } else {
        Device::cuda_if_available()
    }
}

/// Parses a device identifier: `cpu`, `cuda`, `cuda:N`, `mps` or `auto`.
///
/// Devices that exist as names but are not present on this machine are
/// rejected with [`LoadError::UnavailableDevice`].
pub fn parse_device(name: &str) -> Result<Device, LoadError> {
    let lowered = name.trim().to_ascii_lowercase();
    match lowered.as_str() {
        "cpu" => Ok(Device::Cpu),
        "auto" => Ok(accelerator()),
        "mps" => {
            if tch::utils::has_mps() {
                Ok(Device::Mps)
            } else {
                Err(LoadError::UnavailableDevice(name.to_string()))
            }
        }
        "cuda" | "gpu" => cuda_device(name, 0),
        other => match other.strip_prefix("cuda:") {
            Some(index) => {
                let index = index
                    .parse::<usize>()
                    .map_err(|_| LoadError::InvalidDevice(name.to_string()))?;
                cuda_device(name, index)
            }
            None => Err(LoadError::InvalidDevice(name.to_string())),
        },
    }
}

fn cuda_device(name: &str, index: usize) -> Result<Device, LoadError> {
    if i64::try_from(index).map_or(false, |index| index < tch::Cuda::device_count()) {
        Ok(Device::Cuda(index))
    } else {
        Err(LoadError::UnavailableDevice(name.to_string()))
    }
}

/// Device placement for the four models. Models listed in `cpu` (or all of
/// them when `cpu` contains "all") stay on the CPU, the others go to the
/// accelerator device.
#[derive(Debug, Clone)]
pub struct DeviceSetup {
    accelerator_device: Device,
    cpu: Vec<String>,
}

impl DeviceSetup {
    pub fn new(accelerator_device: &str, cpu: Vec<String>) -> Result<Self, LoadError> {
        let accelerator_device = parse_device(accelerator_device)?;
        Ok(Self { accelerator_device, cpu })
    }

    /// Places every model on the same device.
    pub fn uniform(device: Device) -> Self {
        Self { accelerator_device: device, cpu: vec![] }
    }

    pub fn get(&self, kind: ModelKind) -> Device {
        if self.cpu.iter().any(|c| c == "all" || c == kind.as_str()) {
            Device::Cpu
        } else {
            self.accelerator_device
        }
    }
}
