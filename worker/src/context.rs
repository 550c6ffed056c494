use std::thread;

use crate::error::{Result, WorkerErr};

/// Handle to the compute slot this process is pinned to.
///
/// There is a single host address space here, so placement is a validation
/// and bookkeeping concern: binding fails fast when the ordinal does not
/// exist, and [`place`] marks the loop points where tensors cross onto the
/// device.
///
/// [`place`]: Device::place
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Device {
    ordinal: usize,
}

impl Device {
    /// Binds to a device ordinal, failing fast when the host does not have
    /// that many compute slots.
    pub fn bind(ordinal: usize) -> Result<Self> {
        let available = thread::available_parallelism().map(usize::from).unwrap_or(1);
        Self::bind_with_limit(ordinal, available)
    }

    fn bind_with_limit(ordinal: usize, available: usize) -> Result<Self> {
        if ordinal >= available {
            return Err(WorkerErr::DeviceUnavailable { ordinal, available });
        }
        Ok(Self { ordinal })
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Moves a tensor onto this device.
    ///
    /// Identity on a single-address-space host; kept explicit so the loop's
    /// device boundary stays visible.
    #[inline]
    pub fn place<T>(&self, tensor: T) -> T {
        tensor
    }
}

/// Immutable per-process identity: rank, cohort size, bound device.
///
/// Created once at process start, before any tensor work; shared read-only
/// by everything else in the process.
#[derive(Debug, Clone, Copy)]
pub struct WorkerContext {
    rank: usize,
    world_size: usize,
    device: Device,
}

impl WorkerContext {
    /// Builds the context, binding this rank to the device with the same
    /// ordinal (the single-host cohort layout).
    ///
    /// # Errors
    /// `WorkerErr::Config` on an out-of-range rank,
    /// `WorkerErr::DeviceUnavailable` when the ordinal does not exist.
    pub fn bind(rank: usize, world_size: usize) -> Result<Self> {
        let device = Device::bind(rank)?;
        Self::with_device(rank, world_size, device)
    }

    /// Builds the context with an explicitly chosen device.
    pub fn with_device(rank: usize, world_size: usize, device: Device) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(WorkerErr::Config(format!(
                "rank {rank} out of range for world_size {world_size}"
            )));
        }
        Ok(Self {
            rank,
            world_size,
            device,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Whether this process is the designated coordinator (rank 0), the only
    /// rank allowed to log progress and write checkpoints.
    pub fn is_coordinator(&self) -> bool {
        self.rank == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_ordinal_fails_fast() {
        let err = Device::bind_with_limit(4, 2).unwrap_err();
        assert!(matches!(
            err,
            WorkerErr::DeviceUnavailable { ordinal: 4, available: 2 }
        ));

        assert!(Device::bind_with_limit(1, 2).is_ok());
    }

    #[test]
    fn coordinator_is_rank_zero() {
        let device = Device::bind(0).unwrap();
        let ctx = WorkerContext::with_device(0, 2, device).unwrap();
        assert!(ctx.is_coordinator());

        let ctx = WorkerContext::with_device(1, 2, device).unwrap();
        assert!(!ctx.is_coordinator());
    }

    #[test]
    fn rank_must_fit_the_cohort() {
        let device = Device::bind(0).unwrap();
        assert!(WorkerContext::with_device(2, 2, device).is_err());
        assert!(WorkerContext::with_device(0, 0, device).is_err());
    }
}
