use log::warn;

use crate::{
    error::{Result, SegErr},
    schedule::LrSchedule,
};

/// Hyperparameters of one parameter group.
#[derive(Debug, Clone, Copy)]
pub struct GroupSettings {
    /// Scales the schedule's rate for this group.
    pub lr_multiplier: f32,
    pub weight_decay: f32,
    pub momentum: f32,
}

#[derive(Debug)]
struct GroupState {
    settings: GroupSettings,
    offset: usize,
    len: usize,
    velocity: Box<[f32]>,
}

/// Momentum SGD over independently scaled parameter groups, driven by an
/// [`LrSchedule`].
///
/// Owns the velocity buffers and one flat gradient buffer partitioned by
/// group; the flat buffer is what the backward pass fills and what the
/// cohort-wide all-reduce consumes, one collective per step.
///
/// Not safe to drive from multiple threads; each worker process runs a single
/// sequential loop. Cross-process coordination happens through the already
/// synchronized gradient values, never through this type.
#[derive(Debug)]
pub struct Optimizer {
    schedule: LrSchedule,
    groups: Vec<GroupState>,
    grads: Vec<f32>,
    current_step: usize,
    last_lr: f32,
    populated: bool,
    exhaustion_logged: bool,
}

impl Optimizer {
    /// Builds the optimizer from the model's group partition.
    ///
    /// # Args
    /// * `schedule` - The learning-rate schedule shared by all groups.
    /// * `groups` - `(parameter_count, settings)` per group, in the model's
    ///   flat parameter order.
    ///
    /// # Errors
    /// `SegErr::InvalidGroup` when a group is empty or a setting is out of
    /// its documented range.
    pub fn new(schedule: LrSchedule, groups: &[(usize, GroupSettings)]) -> Result<Self> {
        if groups.is_empty() {
            return Err(SegErr::InvalidGroup("at least one group is required"));
        }

        let mut states = Vec::with_capacity(groups.len());
        let mut offset = 0;
        for &(len, settings) in groups {
            if len == 0 {
                return Err(SegErr::InvalidGroup("group holds no parameters"));
            }
            if !(settings.lr_multiplier > 0.0) {
                return Err(SegErr::InvalidGroup("lr_multiplier must be positive"));
            }
            if !(settings.weight_decay >= 0.0) {
                return Err(SegErr::InvalidGroup("weight_decay must be non-negative"));
            }
            if !(0.0..1.0).contains(&settings.momentum) {
                return Err(SegErr::InvalidGroup("momentum must be in [0, 1)"));
            }

            states.push(GroupState {
                settings,
                offset,
                len,
                velocity: vec![0.0; len].into_boxed_slice(),
            });
            offset += len;
        }

        Ok(Self {
            schedule,
            groups: states,
            grads: vec![0.0; offset],
            current_step: 0,
            last_lr: 0.0,
            populated: false,
            exhaustion_logged: false,
        })
    }

    /// Clears the accumulated gradients; prior gradient contents are invalid
    /// after this call.
    pub fn zero_grad(&mut self) {
        self.grads.fill(0.0);
        self.populated = false;
    }

    /// The flat gradient buffer, all groups concatenated.
    ///
    /// Accessing it marks the gradients as populated for the next [`step`].
    ///
    /// [`step`]: Optimizer::step
    pub fn grads_mut(&mut self) -> &mut [f32] {
        self.populated = true;
        &mut self.grads
    }

    /// Applies one update to every group, then advances the step counter.
    ///
    /// The rate for a group is `learning_rate(current_step) * lr_multiplier`.
    /// Weight decay is folded into the gradient and momentum is applied to
    /// the combined value. Without a prior backward pass this is a no-op
    /// with a warning. Past the schedule horizon the update degenerates to
    /// `lr = 0` and training silently stalls; that clamp is logged once.
    ///
    /// # Args
    /// * `params` - One mutable slice per group, in construction order.
    ///
    /// # Errors
    /// `SegErr::ShapeMismatch` when the group count or a group length does
    /// not match the construction-time partition.
    pub fn step(&mut self, params: &mut [&mut [f32]]) -> Result<()> {
        if params.len() != self.groups.len() {
            return Err(SegErr::ShapeMismatch {
                what: "parameter groups",
                got: params.len(),
                expected: self.groups.len(),
            });
        }

        if !self.populated {
            warn!(step = self.current_step; "step() called without gradients, skipping update");
            return Ok(());
        }

        let lr = self.schedule.learning_rate(self.current_step);
        if self.current_step >= self.schedule.max_step() && !self.exhaustion_logged {
            warn!(
                step = self.current_step, max_step = self.schedule.max_step();
                "schedule exhausted, continuing with lr = 0"
            );
            self.exhaustion_logged = true;
        }

        for (group, slice) in self.groups.iter_mut().zip(params.iter_mut()) {
            if slice.len() != group.len {
                return Err(SegErr::ShapeMismatch {
                    what: "group parameters",
                    got: slice.len(),
                    expected: group.len,
                });
            }

            let GroupSettings {
                lr_multiplier,
                weight_decay,
                momentum,
            } = group.settings;
            let group_lr = lr * lr_multiplier;
            let grad = &self.grads[group.offset..group.offset + group.len];

            slice
                .iter_mut()
                .zip(grad)
                .zip(group.velocity.iter_mut())
                .for_each(|((p, g), v)| {
                    let d = g + weight_decay * *p;
                    *v = momentum * *v + d;
                    *p -= group_lr * *v;
                });
        }

        self.last_lr = lr;
        self.current_step += 1;
        Ok(())
    }

    /// The most recently applied scalar learning rate.
    pub fn lr(&self) -> f32 {
        self.last_lr
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn num_params(&self) -> usize {
        self.grads.len()
    }
}
