use crate::error::{Result, SegErr};

/// Linear warmup followed by polynomial decay to zero.
///
/// A pure function of the step count: multiple parameter groups may query the
/// same schedule redundantly without drift.
#[derive(Debug, Clone)]
pub struct LrSchedule {
    base_lr: f32,
    warmup_steps: usize,
    warmup_start_lr: f32,
    max_step: usize,
    power: f32,
}

impl LrSchedule {
    /// Creates a validated schedule.
    ///
    /// # Args
    /// * `base_lr` - Target rate reached at the end of warmup.
    /// * `warmup_steps` - Length of the linear ramp; 0 skips warmup entirely.
    /// * `warmup_start_lr` - Rate at step 0 when warmup is enabled.
    /// * `max_step` - Horizon after which the rate is clamped to 0.
    /// * `power` - Exponent of the decay curve.
    ///
    /// # Errors
    /// `SegErr::InvalidSchedule` when a bound is violated.
    pub fn new(
        base_lr: f32,
        warmup_steps: usize,
        warmup_start_lr: f32,
        max_step: usize,
        power: f32,
    ) -> Result<Self> {
        if max_step == 0 {
            return Err(SegErr::InvalidSchedule("max_step must be positive"));
        }
        if warmup_steps > max_step {
            return Err(SegErr::InvalidSchedule("warmup_steps exceeds max_step"));
        }
        if !(base_lr > 0.0) {
            return Err(SegErr::InvalidSchedule("base_lr must be positive"));
        }
        if !(warmup_start_lr >= 0.0) {
            return Err(SegErr::InvalidSchedule("warmup_start_lr must be non-negative"));
        }
        if !(power > 0.0) {
            return Err(SegErr::InvalidSchedule("power must be positive"));
        }

        Ok(Self {
            base_lr,
            warmup_steps,
            warmup_start_lr,
            max_step,
            power,
        })
    }

    /// The learning rate at `step`.
    ///
    /// Linear from `warmup_start_lr` to `base_lr` over `[0, warmup_steps)`,
    /// then `base_lr * (1 - progress)^power` over the remaining horizon.
    /// `step >= max_step` yields 0 rather than an error.
    pub fn learning_rate(&self, step: usize) -> f32 {
        if step < self.warmup_steps {
            let ratio = step as f32 / self.warmup_steps as f32;
            return self.warmup_start_lr + (self.base_lr - self.warmup_start_lr) * ratio;
        }

        if step >= self.max_step {
            return 0.0;
        }

        let horizon = (self.max_step - self.warmup_steps) as f32;
        let progress = (step - self.warmup_steps) as f32 / horizon;
        (self.base_lr * (1.0 - progress).powf(self.power)).max(0.0)
    }

    pub fn max_step(&self) -> usize {
        self.max_step
    }
}
