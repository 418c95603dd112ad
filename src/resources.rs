use serde::{Deserialize, Serialize};

/// A quantity of schedulable resources: CPU count, memory in MiB and GPU count.
///
/// Comparisons are component-wise. A request fits on a node only when every
/// dimension fits at the same time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceVector {
    pub cpus: u32,
    pub memory_mb: u64,
    pub gpus: u32,
}

impl ResourceVector {
    pub const ZERO: ResourceVector = ResourceVector {
        cpus: 0,
        memory_mb: 0,
        gpus: 0,
    };

    pub fn new(cpus: u32, memory_mb: u64, gpus: u32) -> Self {
        Self {
            cpus,
            memory_mb,
            gpus,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// True when `self` is no larger than `available` in every dimension.
    pub fn fits_within(&self, available: &ResourceVector) -> bool {
        self.cpus <= available.cpus
            && self.memory_mb <= available.memory_mb
            && self.gpus <= available.gpus
    }

    pub fn checked_add(&self, other: &ResourceVector) -> Option<ResourceVector> {
        Some(ResourceVector {
            cpus: self.cpus.checked_add(other.cpus)?,
            memory_mb: self.memory_mb.checked_add(other.memory_mb)?,
            gpus: self.gpus.checked_add(other.gpus)?,
        })
    }

    pub fn saturating_sub(&self, other: &ResourceVector) -> ResourceVector {
        ResourceVector {
            cpus: self.cpus.saturating_sub(other.cpus),
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
            gpus: self.gpus.saturating_sub(other.gpus),
        }
    }

    /// Sum of the per-dimension leftover fractions if `request` were placed
    /// into `self`, relative to `capacity`. Dimensions with zero capacity are
    /// ignored. Lower means a tighter fit.
    pub fn slack_after(&self, request: &ResourceVector, capacity: &ResourceVector) -> f64 {
        let left = self.saturating_sub(request);
        let mut slack = 0.0;
        if capacity.cpus > 0 {
            slack += f64::from(left.cpus) / f64::from(capacity.cpus);
        }
        if capacity.memory_mb > 0 {
            slack += left.memory_mb as f64 / capacity.memory_mb as f64;
        }
        if capacity.gpus > 0 {
            slack += f64::from(left.gpus) / f64::from(capacity.gpus);
        }
        slack
    }

    /// Ordering key used when ranking nodes by free capacity: cpus, then
    /// memory, then gpus.
    pub fn magnitude_key(&self) -> (u32, u64, u32) {
        (self.cpus, self.memory_mb, self.gpus)
    }
}

impl std::fmt::Display for ResourceVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} cpu, {} MiB mem, {} gpu",
            self.cpus, self.memory_mb, self.gpus
        )
    }
}
