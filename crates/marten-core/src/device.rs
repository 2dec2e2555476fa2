// ComputeContext — scoped acquisition of a compute device
//
// The graph engine never manages device selection. The caller (usually
// a process-wide session object) acquires a ComputeContext once,
// threads it through the engine, and releases it by dropping it. There
// is no lazily-initialized global: ownership of the offload handle is
// explicit from acquire to drop.

use std::fmt;

use crate::error::{Error, Result};

/// The device a compute context is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    /// Host execution. Always available.
    #[default]
    Cpu,
    /// Compute-offload device by index. Requires an offload backend.
    Gpu(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Gpu(i) => write!(f, "gpu:{}", i),
        }
    }
}

/// A held compute device. Dropping the context releases the device.
#[derive(Debug)]
pub struct ComputeContext {
    device: Device,
}

impl ComputeContext {
    /// Acquire the given device.
    ///
    /// GPU devices are served by an external offload backend; without
    /// one compiled in, acquiring them fails here rather than deep
    /// inside a node's forward call.
    pub fn acquire(device: Device) -> Result<Self> {
        match device {
            Device::Cpu => Ok(ComputeContext { device }),
            Device::Gpu(i) => Err(Error::DeviceUnavailable(format!(
                "no offload backend registered for gpu:{}",
                i
            ))),
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }
}
